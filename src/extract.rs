use std::{
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
    fs::{create_dir_all, set_permissions, write, Permissions},
};

use tracing::trace;

use crate::{bundle::FileEntry, Error, Result};


/// Resolves a bundle path under `root`. Both `/` and `\` separate
/// components; absolute paths and `..` are rejected.
pub fn resolve(root: &Path, rel_path: &str) -> Result<PathBuf> {
    let normalized = rel_path.replace('\\', "/");
    let mut resolved = root.to_path_buf();
    let mut is_empty = true;
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                is_empty = false
            }
            Component::CurDir => {}
            _ => return Err(Error::UnsafePath(rel_path.into())),
        }
    }
    if is_empty {
        return Err(Error::UnsafePath(rel_path.into()))
    }
    Ok(resolved)
}

pub fn make_executable(path: &Path) -> Result<()> {
    set_permissions(path, Permissions::from_mode(0o755))?;
    Ok(())
}

pub fn extract_entry(root: &Path, entry: &FileEntry) -> Result<PathBuf> {
    let path = resolve(root, &entry.path)?;
    if let Some(parent) = path.parent() {
        if !parent.is_dir() {
            create_dir_all(parent)?
        }
    }
    write(&path, &entry.data)?;
    trace!("Extracted {:?} ({} bytes)", path, entry.data.len());
    Ok(path)
}

/// Writes every entry under `root` in bundle order and marks `main_exe`
/// executable. Stops at the first failure, leaving what was written so far.
pub fn extract_all<I>(root: &Path, entries: I, main_exe: &str) -> Result<usize>
where
    I: IntoIterator<Item = Result<FileEntry>>,
{
    let mut count = 0;
    for entry in entries {
        extract_entry(root, &entry?)?;
        count += 1
    }
    let main_exe_path = resolve(root, main_exe)?;
    if main_exe_path.is_file() {
        make_executable(&main_exe_path)?
    }
    Ok(count)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn entry(path: &str, data: &[u8]) -> Result<FileEntry> {
        Ok(FileEntry { path: path.into(), data: data.to_vec() })
    }

    #[test]
    fn creates_parent_dirs_and_writes_bytes() {
        let root = tempdir().unwrap();
        let count = extract_all(root.path(), vec![
            entry("app/run.bin", &[7; 10]),
            entry("app/data/config.txt", b"a=b\n\0"),
            entry("top.txt", b""),
        ], "app/run.bin").unwrap();
        assert_eq!(count, 3);
        assert_eq!(fs::read(root.path().join("app/run.bin")).unwrap(), vec![7; 10]);
        assert_eq!(fs::read(root.path().join("app/data/config.txt")).unwrap(), b"a=b\n\0");
        assert_eq!(fs::read(root.path().join("top.txt")).unwrap(), b"");
    }

    #[test]
    fn main_exe_gets_execute_bit() {
        let root = tempdir().unwrap();
        extract_all(root.path(), vec![
            entry("bin/app", b"#!/bin/sh\n"),
            entry("bin/data", b"x"),
        ], "bin/app").unwrap();
        let mode = |p: &str| fs::metadata(root.path().join(p)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("bin/app"), 0o755);
        assert_ne!(mode("bin/data") & 0o111, 0o111);
    }

    #[test]
    fn overwrites_existing_file() {
        let root = tempdir().unwrap();
        extract_entry(root.path(), &entry("f", b"old contents").unwrap()).unwrap();
        extract_entry(root.path(), &entry("f", b"new").unwrap()).unwrap();
        assert_eq!(fs::read(root.path().join("f")).unwrap(), b"new");
    }

    #[test]
    fn backslash_paths_become_directories() {
        let root = tempdir().unwrap();
        extract_entry(root.path(), &entry("app\\lib\\core.so", b"so").unwrap()).unwrap();
        assert!(root.path().join("app").join("lib").join("core.so").is_file());
    }

    #[test]
    fn rejects_paths_escaping_root() {
        let root = tempdir().unwrap();
        for bad in ["../evil", "/etc/passwd", "a/../../b", "..\\x", "", "."] {
            let err = extract_entry(root.path(), &entry(bad, b"x").unwrap()).unwrap_err();
            assert!(matches!(err, Error::UnsafePath(_)), "{bad}");
        }
    }

    #[test]
    fn failure_leaves_partial_tree() {
        let root = tempdir().unwrap();
        let err = extract_all(root.path(), vec![
            entry("ok.txt", b"1"),
            Err(Error::Format("boom".into())),
            entry("never.txt", b"2"),
        ], "ok.txt").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(root.path().join("ok.txt").is_file());
        assert!(!root.path().join("never.txt").exists());
    }
}
