//! Binary trailer appended to the launcher image.
//!
//! ```text
//! [launcher image][DELIMITER][flag u8]
//!   flag != 0: [packer len i32 LE][packer bytes]
//! [main exe: string]
//! ([path: string][len i32 LE][bytes])* until end of stream
//! ```
//!
//! Strings are a 7-bit variable-length byte count followed by UTF-8 bytes.
//! There is no version field and no checksum.

use std::io::{ErrorKind::UnexpectedEof, Read, Seek, SeekFrom, Write};

use crate::{scan::{find_pattern, DELIMITER}, Error, Result};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackKit {
    /// Launcher image, bytes `[0, delimiter offset)` of the running file.
    pub launcher: Vec<u8>,
    pub packer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub repack: Option<RepackKit>,
    pub main_exe: String,
}

impl Header {
    pub fn is_self_repackable(&self) -> bool {
        self.repack.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub header: Header,
    pub entries: Vec<FileEntry>,
}

impl Bundle {
    pub fn read<R: Read + Seek>(reader: R, offset: u64) -> Result<Self> {
        let mut bundle_reader = BundleReader::new(reader, offset)?;
        let entries = bundle_reader.by_ref().collect::<Result<Vec<_>>>()?;
        Ok(Bundle { header: bundle_reader.header, entries })
    }

    /// Emits `launcher_image` followed by the trailer. The `launcher` bytes
    /// of a repack kit are not written: readers take them from the image.
    pub fn write<W: Write>(&self, launcher_image: &[u8], writer: &mut W) -> Result<()> {
        writer.write_all(launcher_image)?;
        writer.write_all(DELIMITER)?;
        match &self.header.repack {
            Some(kit) => {
                writer.write_all(&[1])?;
                write_blob(writer, &kit.packer)?;
            }
            None => writer.write_all(&[0])?,
        }
        write_string(writer, &self.header.main_exe)?;
        for entry in &self.entries {
            write_string(writer, &entry.path)?;
            write_blob(writer, &entry.data)?;
        }
        Ok(())
    }
}

/// Offset of the delimiter, scanning from `start`.
pub fn locate<R: Read + Seek>(reader: &mut R, start: u64) -> Result<u64> {
    find_pattern(reader, DELIMITER, start)?.ok_or(Error::DelimiterNotFound)
}

/// Streaming trailer parser. The header is decoded up front, file entries
/// are yielded one at a time.
#[derive(Debug)]
pub struct BundleReader<R> {
    reader: R,
    pos: u64,
    end: u64,
    header: Header,
}

impl<R: Read + Seek> BundleReader<R> {
    pub fn new(mut reader: R, offset: u64) -> Result<Self> {
        let end = reader.seek(SeekFrom::End(0))?;
        let flag_pos = offset + DELIMITER.len() as u64;
        let mut this = BundleReader {
            reader,
            pos: 0,
            end,
            header: Header { repack: None, main_exe: String::new() },
        };
        this.seek(flag_pos)?;
        let is_self_repackable = this.read_u8()? != 0;
        let repack = if is_self_repackable {
            this.seek(0)?;
            let launcher = this.read_bytes(offset)?;
            this.seek(flag_pos + 1)?;
            let packer_len = this.read_i32_len()?;
            let packer = this.read_bytes(packer_len)?;
            Some(RepackKit { launcher, packer })
        } else { None };
        let main_exe = this.read_string()?;
        this.header = Header { repack, main_exe };
        Ok(this)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Moves the repack blobs out so they can be written before extraction.
    pub fn take_repack(&mut self) -> Option<RepackKit> {
        self.header.repack.take()
    }

    pub fn next_entry(&mut self) -> Result<Option<FileEntry>> {
        if self.pos >= self.end {
            return Ok(None)
        }
        let path = self.read_string()?;
        let len = self.read_i32_len()?;
        let data = self.read_bytes(len)?;
        Ok(Some(FileEntry { path, data }))
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = self.reader.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.pos)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|err| {
            if err.kind() == UnexpectedEof {
                Error::Format("unexpected end of bundle".into())
            } else {
                Error::Io(err)
            }
        })?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(Error::Format(format!(
                "declared length {len} exceeds the {remaining} remaining bytes"
            )))
        }
        let mut data = vec![0; len as usize];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    fn read_i32_len(&mut self) -> Result<u64> {
        let mut raw = [0; 4];
        self.read_exact(&mut raw)?;
        let len = i32::from_le_bytes(raw);
        u64::try_from(len).map_err(|_| Error::Format(format!("negative length {len}")))
    }

    fn read_7bit_len(&mut self) -> Result<u64> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            if shift == 28 && byte > 0x0f {
                break
            }
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                if value > i32::MAX as u32 {
                    return Err(Error::Format(format!("negative string length {}", value as i32)))
                }
                return Ok(value as u64)
            }
        }
        Err(Error::Format("malformed string length prefix".into()))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_7bit_len()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|err| Error::Format(format!("string is not valid UTF-8: {err}")))
    }
}

impl<R: Read + Seek> Iterator for BundleReader<R> {
    type Item = Result<FileEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn write_7bit_len<W: Write>(writer: &mut W, len: usize) -> Result<()> {
    let mut value = u32::try_from(len)
        .ok()
        .filter(|&v| v <= i32::MAX as u32)
        .ok_or_else(|| Error::Format(format!("string of {len} bytes is too long")))?;
    let mut out = Vec::with_capacity(5);
    while value >= 0x80 {
        out.push(value as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    writer.write_all(&out)?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<()> {
    write_7bit_len(writer, value.len())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn write_blob<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = i32::try_from(data.len())
        .map_err(|_| Error::Format(format!("blob of {} bytes is too long", data.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}
