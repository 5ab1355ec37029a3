use std::{
    fs::{self, OpenOptions},
    path::Path,
    thread::sleep,
    time::{Duration, Instant},
};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, trace};

use crate::{session::remove_dir_if_exists, Result};


pub const KILLME_TIMEOUT: Duration = Duration::from_millis(5000);
pub const KILLME_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Waits for `target` to be released, then deletes its whole parent
/// directory. Returns `false` without deleting anything on timeout.
pub fn run(target: &Path, timeout: Duration, interval: Duration) -> Result<bool> {
    if !wait_for_file_access(target, timeout, interval) {
        debug!("Timed out waiting for {:?}", target);
        return Ok(false)
    }
    match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            debug!("Removing stale launcher dir {:?}", dir);
            remove_dir_if_exists(dir)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn wait_for_file_access(path: &Path, timeout: Duration, interval: Duration) -> bool {
    let start_time = Instant::now();
    while !is_file_ready(path) {
        if start_time.elapsed() >= timeout {
            return false
        }
        sleep(interval)
    }
    true
}

/// Whether nothing else holds `path`: it opens for writing (no ETXTBSY),
/// no process runs it, no one holds a `flock` on it, and it is not empty.
pub fn is_file_ready(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            trace!("Cannot open {:?} for writing: {err}", path);
            return false
        }
    };
    if is_executing(path) {
        return false
    }
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock.metadata().map(|metadata| metadata.len() > 0).unwrap_or(false),
        Err((_, errno)) => {
            trace!("{:?} is locked: {errno}", path);
            false
        }
    }
}

fn is_executing(path: &Path) -> bool {
    let Ok(target) = fs::canonicalize(path) else {
        return false
    };
    let Ok(processes) = procfs::process::all_processes() else {
        return false
    };
    processes
        .flatten()
        .any(|process| process.exe().is_ok_and(|exe| exe == target))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs::File, thread};
    use tempfile::tempdir;

    const FAST_POLL: Duration = Duration::from_millis(20);

    fn stale_launcher() -> (tempfile::TempDir, std::path::PathBuf) {
        let root = tempdir().unwrap();
        let kit = root.path().join("kit");
        fs::create_dir(&kit).unwrap();
        let launcher = kit.join("packer");
        fs::write(&launcher, b"stale launcher").unwrap();
        fs::write(kit.join("unpacker"), b"stale image").unwrap();
        (root, launcher)
    }

    #[test]
    fn unlocked_file_dir_is_deleted() {
        let (_root, launcher) = stale_launcher();
        assert!(run(&launcher, Duration::from_secs(2), FAST_POLL).unwrap());
        assert!(!launcher.parent().unwrap().exists());
    }

    #[test]
    fn locked_file_times_out_without_deleting() {
        let (_root, launcher) = stale_launcher();
        let holder = Flock::lock(File::open(&launcher).unwrap(), FlockArg::LockExclusive).unwrap();
        let started = Instant::now();
        assert!(!run(&launcher, Duration::from_millis(300), FAST_POLL).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(launcher.is_file());
        drop(holder);
    }

    #[test]
    fn released_lock_before_timeout_deletes_once() {
        let (_root, launcher) = stale_launcher();
        let holder = Flock::lock(File::open(&launcher).unwrap(), FlockArg::LockExclusive).unwrap();
        let release = thread::spawn(move || {
            sleep(Duration::from_millis(150));
            drop(holder);
        });
        assert!(run(&launcher, Duration::from_secs(5), FAST_POLL).unwrap());
        release.join().unwrap();
        assert!(!launcher.parent().unwrap().exists());
        // a second trampoline finds nothing to wait for
        assert!(!run(&launcher, Duration::from_millis(50), FAST_POLL).unwrap());
    }

    #[test]
    fn missing_or_empty_file_is_not_ready() {
        let (_root, launcher) = stale_launcher();
        let empty = launcher.with_file_name("empty");
        fs::write(&empty, b"").unwrap();
        assert!(!is_file_ready(&empty));
        assert!(!is_file_ready(&launcher.with_file_name("missing")));
        assert!(is_file_ready(&launcher));
    }
}
