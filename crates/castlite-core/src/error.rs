//! Error types for castlite.

use std::io;

use thiserror::Error;

/// Main error type for castlite.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Engine is closed")]
    Closed,
}

/// Batch frame decoding errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid length prefix encoding")]
    InvalidLength,

    #[error("Truncated record: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
