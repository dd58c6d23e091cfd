// SPDX-License-Identifier: MIT

//! A single open QCOW2 file plus its recursively-opened backing chain.

use std::path::{Path, PathBuf};

use qflat_io::prelude::*;

use crate::error::{CoreError, CoreResult};
use crate::header::Header;
use crate::l2cache::L2Cache;

const MAX_BACKING_FILE_NAME: usize = 1024;

/// One open QCOW2 image: its file handle, parsed header, loaded L1 table,
/// private L2 cache, and (if it has a backing file) its parent image.
pub struct Image {
    path: PathBuf,
    io: StdBlockIO,
    header: Header,
    l1_table: Vec<u64>,
    l2_cache: L2Cache,
    backing_file_name: Option<String>,
    parent: Option<Box<Image>>,
    closed: bool,
}

impl Image {
    /// Opens `path`, validates it, loads its L1 table, and recursively opens
    /// its backing chain. On any failure at any recursion depth the
    /// partially-opened chain unwinds via `Drop` and a descriptive error is
    /// returned.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let file = std::fs::File::open(path)?;
        let mut io = StdBlockIO::new(file);
        let header = Header::parse(&mut io)?;

        let l1_table = Self::load_l1_table(&mut io, &header)?;
        let backing_file_name = Self::read_backing_file_name(&mut io, &header)?;
        let l2_cache = L2Cache::new(header.cluster_bits);

        let parent = match &backing_file_name {
            Some(name) => Some(Box::new(Self::open_parent(path, name)?)),
            None => None,
        };

        let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        Ok(Image {
            path: canonical_path,
            io,
            header,
            l1_table,
            l2_cache,
            backing_file_name,
            parent,
            closed: false,
        })
    }

    fn open_parent(child_path: &Path, backing_name: &str) -> CoreResult<Image> {
        let dir = child_path.parent().unwrap_or_else(|| Path::new("."));
        let joined = dir.join(backing_name);
        let resolved: PathBuf = joined
            .canonicalize()
            .map_err(|_| CoreError::BadChain("backing file cannot be located"))?;
        Image::open(&resolved)
    }

    fn load_l1_table(io: &mut StdBlockIO, header: &Header) -> CoreResult<Vec<u64>> {
        let count = header.l1_size as usize;
        let mut raw = vec![0u8; count * 8];
        io.read_at(header.l1_table_offset, &mut raw)?;
        let mut table = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(8) {
            table.push(u64::from_be_bytes(chunk.try_into().unwrap()));
        }
        Ok(table)
    }

    fn read_backing_file_name(io: &mut StdBlockIO, header: &Header) -> CoreResult<Option<String>> {
        if header.backing_file_offset == 0 || header.backing_file_size == 0 {
            return Ok(None);
        }
        let len = header.backing_file_size as usize;
        if len > MAX_BACKING_FILE_NAME {
            return Err(CoreError::Parse("backing file name exceeds 1024 bytes"));
        }
        let mut buf = vec![0u8; len];
        io.read_at(header.backing_file_offset, &mut buf)?;
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| CoreError::Parse("backing file name is not valid UTF-8"))
    }

    /// Closes the file handle, drops the L1 table and L2 cache, then
    /// recursively closes the parent chain. Idempotent: a second call is a
    /// no-op returning `Ok(())`.
    pub fn close(&mut self) -> CoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = self.io.flush().map_err(CoreError::from);
        if let Some(parent) = self.parent.as_deref_mut() {
            let parent_result = parent.close();
            if result.is_ok() {
                result = parent_result;
            }
        }
        result
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn cluster_size(&self) -> u64 {
        self.header.cluster_size()
    }

    #[inline]
    pub fn l2_bits(&self) -> u32 {
        self.header.l2_bits()
    }

    #[inline]
    pub fn l2_size(&self) -> u32 {
        self.header.l2_size()
    }

    #[inline]
    pub fn l1_table(&self) -> &[u64] {
        &self.l1_table
    }

    #[inline]
    pub fn backing_file_name(&self) -> Option<&str> {
        self.backing_file_name.as_deref()
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn parent(&self) -> Option<&Image> {
        self.parent.as_deref()
    }

    #[inline]
    pub fn parent_mut(&mut self) -> Option<&mut Image> {
        self.parent.as_deref_mut()
    }

    pub(crate) fn io_and_l2_cache_mut(&mut self) -> (&mut StdBlockIO, &mut L2Cache) {
        (&mut self.io, &mut self.l2_cache)
    }

    /// Reads `buf.len()` bytes at `offset` from the ancestor `depth` steps
    /// above this image (0 = this image itself).
    pub fn read_at_depth(&mut self, depth: usize, offset: u64, buf: &mut [u8]) -> CoreResult<()> {
        if depth == 0 {
            return self.io.read_at(offset, buf).map_err(CoreError::from);
        }
        let parent = self
            .parent_mut()
            .ok_or(CoreError::BadChain("depth exceeds chain length"))?;
        parent.read_at_depth(depth - 1, offset, buf)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
