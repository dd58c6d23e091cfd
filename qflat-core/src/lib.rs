// SPDX-License-Identifier: MIT

//! QCOW2 chain reader: header parsing, L1/L2 lookup, L2 table cache, and
//! backing-file chain traversal.

pub mod chain;
pub mod error;
pub mod header;
pub mod image;
pub mod l2cache;
pub mod lookup;
pub mod types;

pub use chain::{Chain, ClusterRun};
pub use error::{CoreError, CoreResult};
pub use header::Header;
pub use image::Image;
pub use l2cache::L2Cache;
pub use lookup::{
    ChainLookupResult, LookupResult, chain_find_clusters_offset, find_clusters_offset,
};
pub use types::{ClusterType, HEADER_SIZE_V3};

/// Size of the emitted version-3 header, for callers that need it without
/// reaching into `types` directly.
#[inline]
pub fn header_size_v3() -> u64 {
    HEADER_SIZE_V3 as u64
}
