use std::{io, path::PathBuf};

use thiserror::Error;


#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Bundle delimiter not found in launcher image")]
    DelimiterNotFound,
    #[error("Corrupt bundle: {0}")]
    Format(String),
    #[error("Refusing to extract outside of the temp directory: {0}")]
    UnsafePath(String),
    #[error("Failed to start {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Interrupted by signal {0}")]
    Interrupted(i32),
}

pub type Result<T> = std::result::Result<T, Error>;
