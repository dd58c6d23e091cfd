// SPDX-License-Identifier: MIT

use core::fmt;

pub use qflat_io::BlockIOError;

/// Errors produced while parsing a QCOW2 chain or resolving guest addresses.
#[derive(Debug, Clone)]
pub enum CoreError {
    Io(BlockIOError),
    Parse(&'static str),
    Truncated(&'static str),
    Unsupported(&'static str),
    Misalignment(&'static str),
    BadChain(&'static str),
    OutOfMemory,
    State(&'static str),
}

impl CoreError {
    pub fn msg(&self) -> &'static str {
        match self {
            CoreError::Io(e) => e.msg(),
            CoreError::Parse(m) => m,
            CoreError::Truncated(m) => m,
            CoreError::Unsupported(m) => m,
            CoreError::Misalignment(m) => m,
            CoreError::BadChain(m) => m,
            CoreError::OutOfMemory => "out of memory",
            CoreError::State(m) => m,
        }
    }

    pub fn source(&self) -> Option<&CoreError> {
        None
    }
}

impl From<BlockIOError> for CoreError {
    fn from(e: BlockIOError) -> Self {
        CoreError::Io(e)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.into())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl std::error::Error for CoreError {}

pub type CoreResult<T = ()> = Result<T, CoreError>;
