use std::{
    env,
    path::{Path, PathBuf},
    os::unix::fs::PermissionsExt,
    process::{exit, Command, Stdio},
    fs::{self, File, create_dir_all, rename, set_permissions, Permissions},
};

use sfxrun::{changes::walk, Bundle, FileEntry, Header, RepackKit};


const BIN_NAME: &str = "sfxrun";
const TARGET_X86_64: &str = "x86_64-unknown-linux-musl";
const TARGET_AARCH64: &str = "aarch64-unknown-linux-musl";

type DynError = Box<dyn std::error::Error>;

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{}", e);
        exit(-1);
    }
}

fn try_main() -> Result<(), DynError> {
    let all_bins = vec![
        "x86_64",
        "aarch64",
    ];
    let args: Vec<String> = env::args().skip(1).collect();
    let arg = args.first().map(String::as_str).unwrap_or_default();

    match arg {
        "all" => {
            for bin in &all_bins {
                build(bin)?
            }
        },
        bin if all_bins.contains(&bin) => build(bin)?,
        "pack" => pack(&args[1..])?,
        _ => print_help(),
    }
    Ok(())
}

fn print_help() {
    eprintln!("Tasks:
    x86_64                           build x86_64 launcher
    aarch64                          build aarch64 launcher
    all                              build all of the above

    pack LAUNCHER APP_DIR MAIN_EXE OUTPUT [--packer PACKER]
                                     append a bundle of APP_DIR to LAUNCHER
                                     --packer makes the bundle self-repackable")
}

fn create_dist_dir() -> Result<(), DynError> {
    create_dir_all(dist_dir())?;
    Ok(())
}

fn strip(path: &PathBuf) -> Result<(), DynError> {
    if Command::new("strip")
        .arg("--version")
        .stdout(Stdio::null())
        .status()
        .is_ok()
    {
        eprint!(" stripping: ");
        let status = Command::new("strip").args([
            "-s", "-R", ".comment", "-R", ".gnu.version",
            "--strip-unneeded"
        ]).arg(path).status()?;
        if !status.success() {
            Err("strip failed")?;
        }
        eprint!("OK");
    } else {
        Err("no `strip` utility found!")?;
    }
    Ok(())
}

fn build(bin: &str) -> Result<(), DynError> {
    create_dist_dir()?;

    let cargo: &str;
    let target: &str;
    let mut is_strip = true;

    if bin == "aarch64" {
        cargo = "cross";
        is_strip = false;
        target = TARGET_AARCH64;
    } else {
        cargo = "cargo";
        target = TARGET_X86_64;
    }

    let mut build_args = vec!["build", "--release", "--package", BIN_NAME, "--target", target];
    if env::args().any(|arg| arg == "--legacy-change-detect") {
        build_args.append(&mut vec!["--features", "legacy-change-detect"])
    }

    let status = Command::new(cargo)
        .current_dir(project_root())
        .args(build_args)
        .status()?;

    if !status.success() {
        Err("cargo build failed")?;
    }

    let src = project_root()
        .join("target")
        .join(target)
        .join("release")
        .join(BIN_NAME);

    let dst_bin_name = format!("{BIN_NAME}-{bin}");
    let dst = dist_dir().join(&dst_bin_name);

    rename(&src, &dst)?;
    eprint!("{dst_bin_name}: OK");

    if is_strip {
        strip(&dst)?;
    }

    eprintln!();
    Ok(())
}

fn pack(args: &[String]) -> Result<(), DynError> {
    let [launcher, app_dir, main_exe, output, rest @ ..] = args else {
        print_help();
        return Err("pack: missing arguments".into())
    };
    let packer = match rest {
        [flag, packer] if flag == "--packer" => Some(fs::read(packer)?),
        [] => None,
        _ => return Err("pack: unexpected arguments".into()),
    };
    let app_dir = Path::new(app_dir);
    if !app_dir.join(main_exe).is_file() {
        Err(format!("main executable not found: {main_exe}"))?;
    }

    let mut entries = Vec::new();
    for path in walk(app_dir) {
        let path = path?;
        let rel_path = path.strip_prefix(app_dir)?
            .to_str()
            .ok_or_else(|| format!("path is not valid UTF-8: {:?}", path))?
            .to_string();
        entries.push(FileEntry { path: rel_path, data: fs::read(&path)? });
    }

    let bundle = Bundle {
        header: Header {
            repack: packer.map(|packer| RepackKit { launcher: Vec::new(), packer }),
            main_exe: main_exe.clone(),
        },
        entries,
    };
    let image = fs::read(launcher)?;
    let mut file = File::create(output)?;
    bundle.write(&image, &mut file)?;
    set_permissions(output, Permissions::from_mode(0o755))?;
    eprintln!("{output}: {} files: OK", bundle.entries.len());
    Ok(())
}

fn project_root() -> PathBuf {
    Path::new(&env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(1)
        .unwrap()
        .to_path_buf()
}

fn dist_dir() -> PathBuf {
    project_root().join("dist")
}
