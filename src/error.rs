// Copyright 2024 Permafrost Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

/// Classified failure modes of the storage engine.
///
/// Read-path corruption surfaces as [`ErrorKind::Malformed`] or
/// [`ErrorKind::Checksum`] and fails only the current reader; write-path
/// errors abort the writer, which removes any partial files.
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("malformed sstable: {0}")]
    Malformed(String),
    #[error("checksum mismatch: found {found:#010x}, expected {expected:#010x}")]
    Checksum { found: u32, expected: u32 },
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("truncated file: wanted {wanted} more bytes at offset {offset}")]
    Truncated { offset: u64, wanted: usize },
    #[error("unsupported {0}: {1}")]
    Unsupported(&'static str, String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("events out of order: {0}")]
    OutOfOrder(String),
    #[error("integer overflow narrowing {0}")]
    Overflow(&'static str),
    #[error("missing component: {0}")]
    MissingComponent(String),
    #[error("{0}")]
    Nested(#[from] Arc<Error>),
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(e: std::io::Error) -> Error {
        ErrorKind::Io(e.into()).into()
    }
}

impl From<Arc<Error>> for Error {
    #[inline]
    fn from(e: Arc<Error>) -> Error {
        ErrorKind::Nested(e).into()
    }
}

/// [`ErrorKind`] with a captured backtrace.
#[derive(Error)]
#[error("{kind:?}\n{backtrace}")]
pub struct Error {
    #[from]
    kind: ErrorKind,
    backtrace: Backtrace,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn malformed(message: impl ToString) -> Self {
        ErrorKind::Malformed(message.to_string()).into()
    }

    pub fn checksum(found: u32, expected: u32) -> Self {
        ErrorKind::Checksum { found, expected }.into()
    }

    pub fn truncated(offset: u64, wanted: usize) -> Self {
        ErrorKind::Truncated { offset, wanted }.into()
    }

    pub fn unsupported(what: &'static str, detail: impl ToString) -> Self {
        ErrorKind::Unsupported(what, detail.to_string()).into()
    }

    pub fn out_of_order(message: impl ToString) -> Self {
        ErrorKind::OutOfOrder(message.to_string()).into()
    }

    pub fn missing_component(name: impl ToString) -> Self {
        ErrorKind::MissingComponent(name.to_string()).into()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
