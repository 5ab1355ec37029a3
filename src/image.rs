use std::{
    path::Path,
    fs::File,
    io::{Read, Seek, SeekFrom},
};

use goblin::elf::{section_header::SHT_NOBITS, Elf};
use tracing::debug;

use crate::Result;


const ELF_MAGIC: &[u8] = b"\x7fELF";

/// End of the launcher's own ELF image, i.e. where its appended data starts.
///
/// The delimiter literal lives in the launcher's `.rodata`, so scanning has
/// to begin past the last section. Files that are not ELF start at 0.
pub fn launcher_image_end(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut elf_header_raw = [0; 64];
    if file_len < elf_header_raw.len() as u64 {
        return Ok(0)
    }
    file.read_exact(&mut elf_header_raw)?;
    if &elf_header_raw[..4] != ELF_MAGIC {
        return Ok(0)
    }
    let header = match Elf::parse_header(&elf_header_raw) {
        Ok(header) => header,
        Err(err) => {
            debug!("Not parsing launcher image as ELF: {err}");
            return Ok(0)
        }
    };
    let required_bytes = header.e_shoff
        .saturating_add(header.e_shentsize as u64 * header.e_shnum as u64);
    if required_bytes > file_len {
        return Ok(0)
    }
    let mut headers_bytes = vec![0; required_bytes as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut headers_bytes)?;
    let elf = match Elf::parse(&headers_bytes) {
        Ok(elf) => elf,
        Err(err) => {
            debug!("Not parsing launcher image as ELF: {err}");
            return Ok(0)
        }
    };
    let section_table_end = required_bytes;
    let last_section_end = elf
        .section_headers
        .iter()
        // .bss and friends occupy memory only
        .filter(|section| section.sh_type != SHT_NOBITS)
        .map(|section| section.sh_offset.saturating_add(section.sh_size))
        .max()
        .unwrap_or(0);
    Ok(section_table_end.max(last_section_end).min(file_len))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{env::current_exe, fs};
    use tempfile::tempdir;

    #[test]
    fn non_elf_files_scan_from_start() {
        let dir = tempdir().unwrap();
        let short = dir.path().join("short");
        fs::write(&short, b"<SerGreen>").unwrap();
        assert_eq!(launcher_image_end(&short).unwrap(), 0);

        let script = dir.path().join("script");
        fs::write(&script, vec![b'#'; 4096]).unwrap();
        assert_eq!(launcher_image_end(&script).unwrap(), 0);
    }

    /// ELF64 with a header, one 64-byte PROGBITS section, one NOBITS section
    /// of `bss_size` and the section table right after the data.
    fn synthetic_elf(bss_size: u64) -> Vec<u8> {
        let mut elf = Vec::new();
        elf.extend_from_slice(b"\x7fELF");
        elf.extend_from_slice(&[2, 1, 1, 0]);
        elf.extend_from_slice(&[0; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
        elf.extend_from_slice(&62u16.to_le_bytes()); // e_machine: x86_64
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&128u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes());
        for half in [64u16, 56, 0, 64, 3, 0] {
            elf.extend_from_slice(&half.to_le_bytes());
        }
        assert_eq!(elf.len(), 64);
        elf.extend_from_slice(&[0xaa; 64]);

        let section = |sh_type: u32, offset: u64, size: u64| {
            let mut raw = Vec::new();
            raw.extend_from_slice(&0u32.to_le_bytes());
            raw.extend_from_slice(&sh_type.to_le_bytes());
            for field in [0u64, 0, offset, size] {
                raw.extend_from_slice(&field.to_le_bytes());
            }
            raw.extend_from_slice(&0u32.to_le_bytes());
            raw.extend_from_slice(&0u32.to_le_bytes());
            raw.extend_from_slice(&1u64.to_le_bytes());
            raw.extend_from_slice(&0u64.to_le_bytes());
            raw
        };
        elf.extend(section(0, 0, 0));
        elf.extend(section(1, 64, 64));
        elf.extend(section(SHT_NOBITS, 128, bss_size));
        assert_eq!(elf.len(), 320);
        elf
    }

    #[test]
    fn nobits_sections_do_not_extend_image() {
        let dir = tempdir().unwrap();
        let launcher = dir.path().join("launcher");
        let mut data = synthetic_elf(64 * 1024);
        data.extend_from_slice(b"<SerGreen>appended payload");
        fs::write(&launcher, &data).unwrap();
        assert_eq!(launcher_image_end(&launcher).unwrap(), 320);
    }

    #[test]
    fn own_test_binary_ends_inside_file() {
        let exe = current_exe().unwrap();
        let len = fs::metadata(&exe).unwrap().len();
        let end = launcher_image_end(&exe).unwrap();
        assert!(end > 0);
        assert!(end <= len);
    }

    #[test]
    fn appended_bytes_start_at_image_end() {
        let dir = tempdir().unwrap();
        let exe = current_exe().unwrap();
        let mut data = fs::read(&exe).unwrap();
        let end = launcher_image_end(&exe).unwrap();
        data.truncate(end as usize);
        data.extend_from_slice(b"appended payload");
        let copy = dir.path().join("launcher");
        fs::write(&copy, &data).unwrap();
        assert_eq!(launcher_image_end(&copy).unwrap(), end);
    }
}
