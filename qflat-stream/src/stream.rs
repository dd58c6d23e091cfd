// SPDX-License-Identifier: MIT

//! Public streaming handle: open a chain, pull chunks, dump header info.
//! The lifecycle (`open`/`read`/`close`, idempotent close, a sticky last
//! error) mirrors spec.md's illustrative C-shaped API while staying
//! ordinary, ownership-checked Rust underneath.

use std::fmt::Write as _;
use std::path::Path;

use qflat_core::Chain;

use crate::bridge::Bridge;
use crate::error::{StreamError, StreamResult};
use crate::registry::Format;
use crate::writer;

/// A streaming handle over one flattening run. `open` sets up the chain
/// and spawns the producer; each `read` pulls the next chunk (empty vec =
/// EOF); `close` is idempotent and safe to call after an error.
pub struct Stream {
    bridge: Option<Bridge>,
    last_error: Option<String>,
}

impl Stream {
    pub fn new() -> Self {
        Stream {
            bridge: None,
            last_error: None,
        }
    }

    /// Opens `path` (optionally scoped to `base`) for streaming in the
    /// given output `format`.
    pub fn open(&mut self, format: &str, path: &Path, base: Option<&Path>) -> StreamResult<()> {
        if self.bridge.is_some() {
            return self.fail(StreamError::AlreadyOpen);
        }
        if Format::by_name(format).is_err() {
            return self.fail(StreamError::DriverNotFound);
        }
        let mut chain = match Chain::open(path, base) {
            Ok(c) => c,
            Err(e) => return self.fail(StreamError::from(e)),
        };
        self.bridge = Some(Bridge::spawn(move |w| writer::produce(&mut chain, w)));
        Ok(())
    }

    /// Pulls the next chunk. An empty vec means end of stream.
    pub fn read(&mut self) -> StreamResult<Vec<u8>> {
        let Some(bridge) = self.bridge.as_mut() else {
            return self.fail(StreamError::NotOpen);
        };
        match bridge.read() {
            Ok(chunk) => Ok(chunk),
            Err(e) => self.fail(e),
        }
    }

    /// Closes the stream, unblocking the producer thread if it is
    /// suspended mid-write. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.close();
        }
    }

    /// The last error observed by `open` or `read`, if any.
    pub fn error_string(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail<T>(&mut self, e: StreamError) -> StreamResult<T> {
        self.last_error = Some(e.msg());
        Err(e)
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the `dumpInfo` field list for `path`'s header, one field per
/// line in spec order.
pub fn dump_info(path: &Path) -> StreamResult<String> {
    let image = qflat_core::Image::open(path)?;
    let h = image.header();
    let cluster_size = h.cluster_size();
    let sectors_per_cluster = cluster_size / 512;
    let refcount_table_max_entries = h.refcount_table_clusters as u64 * cluster_size / 8;
    let refcount_block_entries = (cluster_size * 8) / (1u64 << h.refcount_order);

    let mut out = String::new();
    writeln!(out, "{}", h.version).ok();
    writeln!(out, "{}", h.header_length).ok();
    writeln!(out, "{}", h.size).ok();
    writeln!(out, "{}", image.backing_file_name().unwrap_or("")).ok();
    writeln!(out, "{}", h.crypt_method).ok();
    writeln!(out, "{cluster_size}").ok();
    writeln!(out, "{sectors_per_cluster}").ok();
    writeln!(out, "{refcount_table_max_entries}").ok();
    writeln!(out, "{refcount_block_entries}").ok();
    writeln!(out, "{}", h.l1_size).ok();
    writeln!(out, "{}", h.l2_size()).ok();
    writeln!(out, "{}", h.nb_snapshots).ok();
    writeln!(out, "{:#x}", h.incompatible_features).ok();
    writeln!(out, "{:#x}", h.compatible_features).ok();
    writeln!(out, "{:#x}", h.autoclear_features).ok();
    Ok(out)
}
