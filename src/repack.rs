use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    os::unix::process::CommandExt,
    process::{Command, Stdio},
};

use tracing::info;

use crate::{Error, Result};


pub const LAUNCHER_BLOB_NAME: &str = "unpacker";
pub const PACKER_BLOB_NAME: &str = "packer";
pub const REPACK_FLAG: &str = "-repack";

/// Positional arguments for the external packer, in contract order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackArgs {
    /// Launcher image to prepend to the new bundle.
    pub launcher_blob: PathBuf,
    /// File to overwrite, the launcher that is running right now.
    pub output: PathBuf,
    pub main_exe: String,
    pub app_dir: PathBuf,
    pub is_self_repackable: bool,
}

impl RepackArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            self.launcher_blob.clone().into(),
            self.output.clone().into(),
            self.main_exe.clone().into(),
            self.app_dir.clone().into(),
            if self.is_self_repackable { "True" } else { "False" }.into(),
            REPACK_FLAG.into(),
        ]
    }
}

/// Starts the packer and returns without waiting for it. The packer runs in
/// its own process group so it outlives the launcher.
pub fn spawn_packer(packer: &Path, args: &RepackArgs) -> Result<u32> {
    let child = Command::new(packer)
        .args(args.to_args())
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|source| Error::Spawn { path: packer.to_path_buf(), source })?;
    info!("Repacking {:?} with {:?} (pid {})", args.output, packer, child.id());
    Ok(child.id())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, thread::sleep, time::{Duration, Instant}};
    use tempfile::tempdir;

    fn sample_args() -> RepackArgs {
        RepackArgs {
            launcher_blob: "/tmp/kit/unpacker".into(),
            output: "/opt/app/launcher".into(),
            main_exe: "bin/app run".into(),
            app_dir: "/tmp/extracted".into(),
            is_self_repackable: true,
        }
    }

    #[test]
    fn args_follow_contract_order() {
        let args = sample_args().to_args();
        let expected: Vec<OsString> = [
            "/tmp/kit/unpacker", "/opt/app/launcher", "bin/app run",
            "/tmp/extracted", "True", "-repack",
        ].iter().map(OsString::from).collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn flag_renders_false() {
        let args = RepackArgs { is_self_repackable: false, ..sample_args() };
        assert_eq!(args.to_args()[4], OsString::from("False"));
    }

    #[test]
    fn packer_receives_arguments() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("argv");
        let packer = dir.path().join(PACKER_BLOB_NAME);
        fs::write(&packer, format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}.tmp' && mv '{0}.tmp' '{0}'\n",
            out.display()
        )).unwrap();
        fs::set_permissions(&packer, fs::Permissions::from_mode(0o755)).unwrap();

        spawn_packer(&packer, &sample_args()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !out.exists() && Instant::now() < deadline {
            sleep(Duration::from_millis(20));
        }
        let argv = fs::read_to_string(&out).unwrap();
        assert_eq!(argv.lines().collect::<Vec<_>>(), vec![
            "/tmp/kit/unpacker", "/opt/app/launcher", "bin/app run",
            "/tmp/extracted", "True", "-repack",
        ]);
    }

    #[test]
    fn missing_packer_is_spawn_error() {
        let dir = tempdir().unwrap();
        let err = spawn_packer(&dir.path().join("nope"), &sample_args()).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
