//! One launcher invocation: extract, run, then repack or clean up.
//!
//! A [`Session`] owns its temp directories. Disposition (repack handoff or
//! deletion) happens exactly once, from [`Session::finish`] on the normal
//! path or from `Drop` when the session is abandoned by an error or panic.
//! [`launch`] catches termination signals for its whole lifetime. Before the
//! app runs they abort the session, which then disposes as usual. While the
//! app runs they are forwarded to it, so the launcher still reaches
//! disposition once the app exits.

use std::{
    env,
    ffi::OsStr,
    fs::{create_dir, remove_dir_all, write, File},
    io::{BufReader, ErrorKind::{AlreadyExists, NotFound}, Read, Seek},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
    sync::Arc,
    time::SystemTime,
};

use nix::{sys::signal::{kill, Signal}, unistd::Pid};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    bundle::{locate, BundleReader, RepackKit},
    changes::any_changed,
    extract::{extract_all, make_executable, resolve},
    image::launcher_image_end,
    repack::{spawn_packer, RepackArgs, LAUNCHER_BLOB_NAME, PACKER_BLOB_NAME},
    signals::{Interrupts, SignalState},
    Error, Result,
};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Extracting,
    Running,
    Deciding,
    RepackHandoff,
    Cleanup,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Repack,
    Cleanup,
}

#[derive(Debug)]
pub struct Session {
    tmp_root: PathBuf,
    temp_dir: PathBuf,
    repack_dir: Option<PathBuf>,
    self_exe: PathBuf,
    main_exe: Option<String>,
    is_self_repackable: bool,
    extracted_at: Option<SystemTime>,
    launched: bool,
    phase: Phase,
    signals: Arc<SignalState>,
}

impl Session {
    /// Allocates a fresh temp directory under `tmp_root`. `self_exe` is the
    /// launcher file that carries the bundle.
    pub fn init(tmp_root: &Path, self_exe: PathBuf) -> Result<Self> {
        let temp_dir = allocate_dir(tmp_root)?;
        debug!("Session temp dir: {:?}", temp_dir);
        Ok(Session {
            tmp_root: tmp_root.to_path_buf(),
            temp_dir,
            repack_dir: None,
            self_exe,
            main_exe: None,
            is_self_repackable: false,
            extracted_at: None,
            launched: false,
            phase: Phase::Init,
            signals: Arc::default(),
        })
    }

    /// Lets signals caught by `interrupts` abort extraction and reach the app.
    pub fn watch(&mut self, interrupts: &Interrupts) {
        self.signals = interrupts.state();
    }

    fn check_interrupted(&self) -> Result<()> {
        match self.signals.received() {
            Some(signal) => Err(Error::Interrupted(signal)),
            None => Ok(()),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn repack_dir(&self) -> Option<&Path> {
        self.repack_dir.as_deref()
    }

    pub fn main_exe(&self) -> Option<&str> {
        self.main_exe.as_deref()
    }

    pub fn is_self_repackable(&self) -> bool {
        self.is_self_repackable
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Extracts the bundle appended to the launcher file.
    pub fn extract(&mut self) -> Result<()> {
        let start = launcher_image_end(&self.self_exe)?;
        let file = File::open(&self.self_exe)?;
        self.extract_from(file, start)
    }

    /// Extracts a bundle read from `reader`, searching for the delimiter
    /// from `start` on.
    pub fn extract_from<R: Read + Seek>(&mut self, reader: R, start: u64) -> Result<()> {
        self.phase = Phase::Extracting;
        let mut reader = BufReader::new(reader);
        let offset = locate(&mut reader, start)?;
        debug!("Bundle delimiter at offset {offset}");
        let mut bundle = BundleReader::new(reader, offset)?;
        let main_exe = bundle.header().main_exe.clone();
        self.main_exe = Some(main_exe.clone());
        if let Some(kit) = bundle.take_repack() {
            self.is_self_repackable = true;
            self.write_repack_kit(kit)?;
        }
        let signals = self.signals.clone();
        let entries = bundle.map(move |entry| match signals.received() {
            Some(signal) => Err(Error::Interrupted(signal)),
            None => entry,
        });
        let count = extract_all(&self.temp_dir, entries, &main_exe)?;
        self.extracted_at = Some(SystemTime::now());
        debug!("Extracted {count} files to {:?}", self.temp_dir);
        Ok(())
    }

    fn write_repack_kit(&mut self, kit: RepackKit) -> Result<()> {
        let dir = allocate_dir(&self.tmp_root)?;
        self.repack_dir = Some(dir.clone());
        for (name, data) in [(LAUNCHER_BLOB_NAME, &kit.launcher), (PACKER_BLOB_NAME, &kit.packer)] {
            let path = dir.join(name);
            write(&path, data)?;
            make_executable(&path)?;
        }
        debug!("Repack kit written to {:?}", dir);
        Ok(())
    }

    /// Runs the main executable from the temp dir and blocks until it
    /// exits. Returns its exit code, or `128 + signal` if it was killed.
    pub fn run<I, S>(&mut self, args: I) -> Result<i32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let main_exe = self.main_exe.as_deref()
            .ok_or_else(|| Error::Format("no bundle has been extracted".into()))?;
        let run = resolve(&self.temp_dir, main_exe)?;
        self.check_interrupted()?;
        let mut child = Command::new(&run)
            .args(args)
            .current_dir(&self.temp_dir)
            .spawn()
            .map_err(|source| Error::Spawn { path: run.clone(), source })?;
        self.phase = Phase::Running;
        self.launched = true;
        debug!("Started {:?} (pid {})", run, child.id());

        self.signals.forward_to(child.id());
        if self.signals.received().is_some() {
            // caught between the last check and the spawn
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }
        let status = child.wait();
        self.signals.stop_forwarding();
        Ok(exit_code(status?))
    }

    /// Repack only when the app actually ran, the bundle is self-repackable
    /// and something under the temp dir was written after extraction.
    pub fn decide(&self) -> Result<Disposition> {
        if !self.launched || !self.is_self_repackable {
            return Ok(Disposition::Cleanup)
        }
        let extracted_at = self.extracted_at.unwrap_or_else(SystemTime::now);
        if any_changed(&self.temp_dir, extracted_at)? {
            Ok(Disposition::Repack)
        } else {
            Ok(Disposition::Cleanup)
        }
    }

    /// Decides and disposes of the temp directories. Consumes the session,
    /// so this can happen only once.
    pub fn finish(mut self) -> Result<Disposition> {
        self.dispose()
    }

    fn dispose(&mut self) -> Result<Disposition> {
        let result = self.dispose_inner();
        self.phase = Phase::Terminated;
        result
    }

    fn dispose_inner(&mut self) -> Result<Disposition> {
        self.phase = Phase::Deciding;
        let disposition = self.decide()?;
        match disposition {
            Disposition::Repack => {
                self.phase = Phase::RepackHandoff;
                self.hand_off()?
            }
            Disposition::Cleanup => {
                self.phase = Phase::Cleanup;
                remove_dir_if_exists(&self.temp_dir)?;
                if let Some(dir) = &self.repack_dir {
                    remove_dir_if_exists(dir)?
                }
                debug!("Removed {:?}", self.temp_dir);
            }
        }
        Ok(disposition)
    }

    fn hand_off(&self) -> Result<()> {
        let (Some(repack_dir), Some(main_exe)) = (&self.repack_dir, &self.main_exe) else {
            return Err(Error::Format("self-repackable bundle without repack kit".into()))
        };
        let args = RepackArgs {
            launcher_blob: repack_dir.join(LAUNCHER_BLOB_NAME),
            output: self.self_exe.clone(),
            main_exe: main_exe.clone(),
            app_dir: self.temp_dir.clone(),
            is_self_repackable: self.is_self_repackable,
        };
        spawn_packer(&repack_dir.join(PACKER_BLOB_NAME), &args)?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.phase == Phase::Terminated {
            return
        }
        debug!("Session ended early in phase {:?}", self.phase);
        if let Err(err) = self.dispose() {
            error!("Failed to dispose of {:?}: {err}", self.temp_dir);
        }
    }
}

/// Full lifecycle for the running launcher: extract the bundle appended to
/// `self_exe`, run it with `args`, then repack or clean up.
pub fn launch<I, S>(self_exe: PathBuf, args: I) -> Result<i32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let interrupts = Interrupts::install()?;
    let mut session = Session::init(&env::temp_dir(), self_exe)?;
    session.watch(&interrupts);
    session.extract()?;
    let exit_code = session.run(args)?;
    session.finish()?;
    Ok(exit_code)
}

/// Creates `tmp_root/<uuid>`, retrying until the name was not taken.
pub fn allocate_dir(tmp_root: &Path) -> Result<PathBuf> {
    loop {
        let dir = tmp_root.join(Uuid::new_v4().to_string());
        match create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Recursive delete. A directory that does not exist is not an error.
pub fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match remove_dir_all(dir) {
        Err(err) if err.kind() != NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}
