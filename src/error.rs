use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while training, flattening, saving or loading a tree model.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Blocks passed to a concatenation disagree on the shared dimension.
    #[error("dimension mismatch in block {block}: expected {expected} rows, found {found}")]
    DimensionMismatch {
        block: usize,
        expected: usize,
        found: usize,
    },

    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hyper-parameter: {0}")]
    InvalidHyperParam(String),

    /// Label and feature matrices passed to training disagree on the number of instances.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A saved model directory whose files are inconsistent with each other.
    #[error("invalid model: {0}")]
    InvalidModel(String),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }
    }
}
