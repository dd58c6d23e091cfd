// SPDX-License-Identifier: MIT

use crate::{BlockIO, BlockIOError, BlockIOResult};

/// In-memory `BlockIO`, growable on write. Used for fast test fixtures that
/// build a synthetic QCOW2 chain without touching disk.
#[derive(Debug, Default)]
pub struct MemBlockIO {
    buf: Vec<u8>,
}

impl MemBlockIO {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl BlockIO for MemBlockIO {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(BlockIOError::OutOfBounds)?;
        if end > self.buf.len() {
            return Err(BlockIOError::OutOfBounds);
        }
        buf.copy_from_slice(&self.buf[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .ok_or(BlockIOError::OutOfBounds)?;
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> BlockIOResult {
        Ok(())
    }

    fn len(&self) -> BlockIOResult<u64> {
        Ok(self.buf.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_grows_buffer() {
        let mut io = MemBlockIO::new();
        io.write_at(10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(io.len().unwrap(), 14);

        let mut out = [0u8; 4];
        io.read_at(10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn read_out_of_bounds_errors() {
        let mut io = MemBlockIO::new();
        io.write_at(0, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 8];
        assert!(matches!(
            io.read_at(0, &mut out),
            Err(BlockIOError::OutOfBounds)
        ));
    }
}
