// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for `BlockIO` operations.
pub type BlockIOResult<T = ()> = core::result::Result<T, BlockIOError>;

/// Error type for `BlockIO` operations.
#[derive(Debug, Clone)]
pub enum BlockIOError {
    /// Underlying device I/O error.
    Other(&'static str),
    /// Attempted to read or write out of bounds.
    OutOfBounds,
}

impl BlockIOError {
    pub fn msg(&self) -> &'static str {
        match self {
            BlockIOError::Other(msg) => msg,
            BlockIOError::OutOfBounds => "out of bounds",
        }
    }
}

impl fmt::Display for BlockIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl std::error::Error for BlockIOError {}

impl From<std::io::Error> for BlockIOError {
    #[cold]
    #[inline(never)]
    fn from(e: std::io::Error) -> Self {
        let leaked: &'static str = Box::leak(e.to_string().into_boxed_str());
        BlockIOError::Other(leaked)
    }
}
