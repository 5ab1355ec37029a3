use std::{
    fs::{self, ReadDir},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use cfg_if::cfg_if;
use tracing::debug;

use crate::Result;


pub const CHANGE_THRESHOLD: Duration = Duration::from_millis(500);

/// Depth-first walk over every regular file under a root. Files of a
/// directory come before the files of its subdirectories.
#[derive(Debug)]
pub struct Walk {
    dirs: Vec<PathBuf>,
    current: Option<ReadDir>,
    pending_dirs: Vec<PathBuf>,
}

pub fn walk(root: &Path) -> Walk {
    Walk {
        dirs: vec![root.to_path_buf()],
        current: None,
        pending_dirs: Vec::new(),
    }
}

impl Iterator for Walk {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(read_dir) = self.current.as_mut() {
                match read_dir.next() {
                    Some(Ok(entry)) => {
                        let file_type = match entry.file_type() {
                            Ok(file_type) => file_type,
                            Err(err) => return Some(Err(err.into())),
                        };
                        if file_type.is_dir() {
                            self.pending_dirs.push(entry.path())
                        } else if file_type.is_file() {
                            return Some(Ok(entry.path()))
                        }
                        continue
                    }
                    Some(Err(err)) => return Some(Err(err.into())),
                    None => {
                        self.current = None;
                        // keep sibling order: first pending dir is visited first
                        self.dirs.extend(self.pending_dirs.drain(..).rev());
                    }
                }
            }
            let dir = self.dirs.pop()?;
            match fs::read_dir(&dir) {
                Ok(read_dir) => self.current = Some(read_dir),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Whether a file written at `modified` counts as changed since `created`.
/// A gap of exactly `CHANGE_THRESHOLD` counts as a change.
pub fn is_changed(created: SystemTime, modified: SystemTime) -> bool {
    let Ok(elapsed) = modified.duration_since(created) else {
        return false
    };
    cfg_if! {
        if #[cfg(feature = "legacy-change-detect")] {
            // only the sub-second part of the difference is compared
            let elapsed = Duration::from_nanos(elapsed.subsec_nanos() as u64);
            let changed = elapsed > CHANGE_THRESHOLD;
        } else {
            let changed = elapsed >= CHANGE_THRESHOLD;
        }
    }
    changed
}

/// Whether any file under `root` was written after it was extracted.
///
/// The baseline is the file's birth time. Filesystems that do not report
/// one fall back to `extracted_at`.
pub fn any_changed(root: &Path, extracted_at: SystemTime) -> Result<bool> {
    for path in walk(root) {
        let path = path?;
        let metadata = fs::metadata(&path)?;
        let created = metadata.created().unwrap_or(extracted_at);
        if is_changed(created, metadata.modified()?) {
            debug!("Changed since extraction: {:?}", path);
            return Ok(true)
        }
    }
    Ok(false)
}
