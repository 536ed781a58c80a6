use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a chunk could not be generated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("failed to load terrain library {path}: {message}")]
    LibraryLoad { path: PathBuf, message: String },
    #[error("terrain library has no symbol `{symbol}`: {message}")]
    MissingSymbol {
        symbol: &'static str,
        message: String,
    },
    #[error("terrain library speaks ABI {found}, expected {expected}")]
    AbiMismatch { expected: u32, found: u32 },
    #[error("no terrain library found in search path {0:?}")]
    NotFound(Vec<PathBuf>),
    #[error("native generator returned status {0}")]
    NativeStatus(i32),
    #[error("native generator returned a null buffer")]
    NullBuffer,
    #[error("generator produced {actual} bytes, expected {expected}")]
    WrongSize { expected: usize, actual: usize },
    #[error("generator panicked: {0}")]
    Panicked(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation queue is full")]
    QueueFull,
    #[error("generation pool is shut down")]
    PoolClosed,
    #[error("generation failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<GenerationError>,
    },
}
