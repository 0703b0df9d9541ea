use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid block size {0}, must be a positive power of two")]
    InvalidBlockSize(usize),

    #[error("operation not allowed while convolvers exist")]
    HasWorkers,

    #[error("{kind} index {index} out of range ({len} available)")]
    OutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
    },

    #[error("failed to load impulse responses: {0}")]
    IrLoadFailed(String),

    #[error("filter built for block size {got}, convolver expects {expected}")]
    FilterMismatch { expected: usize, got: usize },
}

impl From<hound::Error> for Error {
    fn from(err: hound::Error) -> Self {
        Error::IrLoadFailed(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IrLoadFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
