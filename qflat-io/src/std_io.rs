// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::{BlockIO, BlockIOResult};

/// `BlockIO` backed by a real, seekable file handle.
#[derive(Debug)]
pub struct StdBlockIO {
    file: File,
}

impl StdBlockIO {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl BlockIO for StdBlockIO {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> BlockIOResult {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> BlockIOResult {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> BlockIOResult {
        self.file.flush()?;
        Ok(())
    }

    fn len(&self) -> BlockIOResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}
