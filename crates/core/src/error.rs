use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid task descriptor {path}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    #[error("unknown build phase: {0}")]
    UnknownPhase(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BenchError>;
