// SPDX-License-Identifier: MIT

//! Positioned block I/O abstraction used by the QCOW2 chain reader and
//! stream writer.
//!
//! Mirrors the teacher's `rimio` crate: a small trait over "read/write at an
//! absolute offset", plus a `std::fs::File` backend for real images and an
//! in-memory backend for fast, allocation-free test fixtures.

pub mod error;
mod mem;
mod std_io;

pub use error::{BlockIOError, BlockIOResult};
pub use mem::MemBlockIO;
pub use std_io::StdBlockIO;

pub mod prelude {
    pub use super::error::*;
    pub use super::{BlockIO, BlockIOExt, BlockIOStructExt, MemBlockIO, StdBlockIO};
}

/// Block I/O abstraction: read/write at arbitrary absolute offsets.
///
/// Implementations may target a real file, a RAM buffer, or anything else
/// that supports random access.
pub trait BlockIO {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult;
    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult;
    fn flush(&mut self) -> BlockIOResult;
    fn len(&self) -> BlockIOResult<u64>;
}

/// Convenience helpers layered over `BlockIO`.
pub trait BlockIOExt: BlockIO {
    /// Fills a region with zero bytes.
    fn zero_fill(&mut self, offset: u64, len: usize) -> BlockIOResult {
        const ZERO_BUF_SIZE: usize = 8192;
        const ZERO_BUF: [u8; ZERO_BUF_SIZE] = [0u8; ZERO_BUF_SIZE];
        let mut remaining = len;
        let mut off = offset;
        while remaining > 0 {
            let chunk = remaining.min(ZERO_BUF_SIZE);
            self.write_at(off, &ZERO_BUF[..chunk])?;
            off += chunk as u64;
            remaining -= chunk;
        }
        Ok(())
    }
}

impl<T: BlockIO + ?Sized> BlockIOExt for T {}

/// Extension trait for reading and writing plain-old-data structs via
/// `zerocopy`, used for every fixed-size QCOW2 on-disk structure.
pub trait BlockIOStructExt: BlockIO {
    fn read_struct<T>(&mut self, offset: u64) -> BlockIOResult<T>
    where
        T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        let size = core::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        self.read_at(offset, &mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| BlockIOError::Other("read_struct: size mismatch"))
    }

    fn write_struct<T>(&mut self, offset: u64, val: &T) -> BlockIOResult
    where
        T: zerocopy::IntoBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        self.write_at(offset, val.as_bytes())
    }
}

impl<T: BlockIO + ?Sized> BlockIOStructExt for T {}
