use std::io::{ErrorKind::Interrupted, Read, Result, Seek, SeekFrom};


/// Marker written by the packer between the launcher image and the bundle.
pub const DELIMITER: &[u8] = b"<SerGreen>";

/// Finds the first occurrence of `pattern` at or after `start`.
///
/// The stream is read through a window as wide as the pattern. On a mismatch
/// the window is not discarded: the longest window suffix that is also a
/// pattern prefix is rewound and reused as the head of the next window.
/// Returns `None` if fewer than `pattern.len()` bytes remain or the pattern
/// never shows up.
pub fn find_pattern<R: Read + Seek>(reader: &mut R, pattern: &[u8], start: u64) -> Result<Option<u64>> {
    if pattern.is_empty() {
        return Ok(Some(start))
    }
    let len = pattern.len();
    let mut window = vec![0; len];
    let mut pos = start;
    reader.seek(SeekFrom::Start(start))?;
    while fill_window(reader, &mut window)? == len {
        if window == pattern {
            return Ok(Some(pos))
        }
        let shift = overlap_shift(&window, pattern);
        pos += shift as u64;
        if shift < len {
            reader.seek(SeekFrom::Current(-((len - shift) as i64)))?;
        }
    }
    Ok(None)
}

/// Smallest `i >= 1` such that `window[i..]` is a prefix of `pattern`,
/// or `window.len()` when no suffix overlaps.
pub fn overlap_shift(window: &[u8], pattern: &[u8]) -> usize {
    (1..window.len())
        .find(|&i| window[i..] == pattern[..window.len() - i])
        .unwrap_or(window.len())
}

fn fill_window<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
