//! Error types for the ReStyle pSp encoder.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} is not a valid encoder")]
    InvalidEncoder(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error(
        "Error(s) in loading state dict for {module}: missing keys {missing:?}, unexpected keys {unexpected:?}"
    )]
    StateDictMismatch {
        module: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Size mismatch for {key}: checkpoint has {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Checkpoint {path} holds no {prefix} weights")]
    MissingWeights { path: PathBuf, prefix: String },

    #[error("Latent average is required for the initial iteration but was not loaded")]
    MissingLatentAverage,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
