// SPDX-License-Identifier: MIT

use core::fmt;

pub use qflat_core::CoreError;

/// Errors surfaced by the stream writer and its pull/push bridge. Mirrors
/// the taxonomy `qflat_core::CoreError` already uses (the producer is a
/// thin shell over the chain reader, so the same failure modes apply) plus
/// the stream-local lifecycle variants.
#[derive(Debug, Clone)]
pub enum StreamError {
    Core(CoreError),
    /// The consumer dropped the stream (or the reader half of the bridge)
    /// before the writer finished; the writer thread unwinds silently.
    BridgeClosed,
    /// `open` named a format with no registered driver.
    DriverNotFound,
    /// `open` called on a stream that is already open.
    AlreadyOpen,
    /// `read` called on a stream that was never opened (or already closed).
    NotOpen,
}

impl StreamError {
    pub fn msg(&self) -> String {
        match self {
            StreamError::Core(e) => e.msg().to_string(),
            StreamError::BridgeClosed => "stream cancelled".to_string(),
            StreamError::DriverNotFound => "unknown output format".to_string(),
            StreamError::AlreadyOpen => "stream already open".to_string(),
            StreamError::NotOpen => "stream not open".to_string(),
        }
    }
}

impl From<CoreError> for StreamError {
    fn from(e: CoreError) -> Self {
        StreamError::Core(e)
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl std::error::Error for StreamError {}

pub type StreamResult<T = ()> = Result<T, StreamError>;
