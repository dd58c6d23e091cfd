// SPDX-License-Identifier: MIT

//! Pull-based QCOW2 chain-flattening stream writer: given a head image and
//! an optional base ancestor, streams a byte-exact, self-contained
//! flattened copy in fixed-size chunks without materializing the whole
//! output in memory.

pub mod bridge;
pub mod error;
pub mod registry;
pub mod stream;
mod writer;

pub use bridge::{CHUNK_SIZE, CoWriter};
pub use error::{StreamError, StreamResult};
pub use registry::Format;
pub use stream::{Stream, dump_info};
