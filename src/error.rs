//! The error taxonomy surfaced by every public entry point.
//!
//! The original C++ implementation this crate is descended from mixed
//! `errno`-style negative integers with `assert`-style invariant checks.
//! We collect both into one typed enum instead: invariant violations that
//! the allocator itself must maintain become debug assertions or
//! `contracts` checks, and everything a caller can actually provoke
//! (a bad basename, a corrupt resume, an oversized request) becomes a
//! `Result`.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("configuration error: {reason}")]
    Config { reason: &'static str },

    #[error("out of memory")]
    OutOfMemory,

    #[error("out of range: requested {requested}, limit {limit}")]
    OutOfRange { requested: usize, limit: usize },

    #[error("corruption detected: {reason}")]
    Corruption { reason: &'static str },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, AllocError>;

impl AllocError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> AllocError {
        AllocError::Io {
            path: path.into(),
            source,
        }
    }
}
