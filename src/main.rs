use std::{
    env::{self, current_exe},
    path::PathBuf,
    process::exit,
};

use sfxrun::{launch, trampoline::{self, KILLME_POLL_INTERVAL, KILLME_TIMEOUT}, Error};
use tracing::error;
use tracing_subscriber::EnvFilter;


const SFXRUN_VERSION: &str = env!("CARGO_PKG_VERSION");
const LOG_ENV: &str = "SFXRUN_LOG";

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

enum Mode {
    /// Remove a stale launcher left behind by a repack.
    Killme(Option<PathBuf>),
    Launch(Vec<String>),
}

fn parse_mode<I: IntoIterator<Item = String>>(argv: I) -> Mode {
    let exec_args: Vec<String> = argv.into_iter().skip(1).collect();
    match exec_args.first().map(String::as_str) {
        Some("killme" | "-killme") => Mode::Killme(exec_args.get(1).map(PathBuf::from)),
        _ => Mode::Launch(exec_args),
    }
}

fn main() {
    init_logging();

    let exec_args = match parse_mode(env::args()) {
        Mode::Killme(target) => {
            // nothing gets extracted
            if let Some(target) = target {
                if let Err(err) = trampoline::run(&target, KILLME_TIMEOUT, KILLME_POLL_INTERVAL) {
                    error!("Failed to remove stale launcher: {err}");
                }
            }
            return
        }
        Mode::Launch(exec_args) => exec_args,
    };

    let self_exe = current_exe().unwrap_or_else(|err| {
        eprintln!("Failed to locate launcher executable: {err}");
        exit(1)
    });
    tracing::debug!("sfxrun v{SFXRUN_VERSION}: {:?}", self_exe);

    match launch(self_exe, exec_args) {
        Ok(exit_code) => exit(exit_code),
        Err(Error::Interrupted(signal)) => exit(128 + signal),
        Err(err) => {
            eprintln!("Failed to launch bundled app: {err}");
            exit(1)
        }
    }
}
