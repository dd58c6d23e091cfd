// SPDX-License-Identifier: MIT

use bitflags::bitflags;

/// QCOW2 magic: `"QFI\xfb"`.
pub const QCOW2_MAGIC: u32 = 0x5146_49fb;

pub const QCOW2_VERSION_2: u32 = 2;
pub const QCOW2_VERSION_3: u32 = 3;

/// Size of the version-2 on-disk header.
pub const HEADER_SIZE_V2: usize = 72;
/// Size of the in-memory/emitted version-3 header (no extensions beyond the
/// backing-file-name extension).
pub const HEADER_SIZE_V3: usize = 104;

/// `COPIED` flag: refcount == 1. Always set by this producer.
pub const QCOW_OFLAG_COPIED: u64 = 1 << 63;
/// `COMPRESSED` flag. Rejected wherever encountered (non-goal).
pub const QCOW_OFLAG_COMPRESSED: u64 = 1 << 62;
/// `ZERO` flag on a standard (non-compressed) cluster descriptor.
pub const QCOW_OFLAG_ZERO: u64 = 1 << 0;
/// Mask isolating the host cluster offset from a standard L1/L2 entry.
pub const L2E_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

/// Incompatible-feature bits recognized on open. Anything else is rejected.
pub const INCOMPAT_DIRTY: u64 = 1 << 0;
pub const INCOMPAT_CORRUPT: u64 = 1 << 1;
pub const INCOMPAT_EXT_FILE: u64 = 1 << 2;
pub const INCOMPAT_KNOWN_MASK: u64 = INCOMPAT_DIRTY | INCOMPAT_CORRUPT | INCOMPAT_EXT_FILE;

bitflags! {
    /// Cluster-type mask resolved from an L1/L2 lookup.
    ///
    /// `ALLOCATED` and `ZERO` are independent bits; the valid combinations a
    /// lookup ever returns are `UNALLOCATED`, `UNALLOCATED | ZERO`,
    /// `ALLOCATED`, `ALLOCATED | ZERO`, and `COMPRESSED` (always alone, and
    /// always rejected before the caller observes it).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClusterType: u8 {
        const UNALLOCATED = 0;
        const ALLOCATED   = 0b001;
        const ZERO        = 0b010;
        const COMPRESSED  = 0b100;
    }
}

impl ClusterType {
    #[inline]
    pub fn is_allocated(self) -> bool {
        self.contains(ClusterType::ALLOCATED)
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.contains(ClusterType::ZERO)
    }

    #[inline]
    pub fn is_unallocated(self) -> bool {
        !self.contains(ClusterType::ALLOCATED) && !self.contains(ClusterType::ZERO)
    }

    #[inline]
    pub fn has_data(self) -> bool {
        self.contains(ClusterType::ALLOCATED) && !self.contains(ClusterType::ZERO)
    }
}

/// Decodes a raw L2/L1-style entry into a cluster type + host offset pair.
/// The entry is assumed non-compressed; callers must check `COMPRESSED`
/// first since a compressed entry's bits mean something else entirely.
#[inline]
pub fn decode_standard_entry(entry: u64) -> (ClusterType, u64) {
    if entry & QCOW_OFLAG_COMPRESSED != 0 {
        return (ClusterType::COMPRESSED, 0);
    }
    let offset = entry & L2E_OFFSET_MASK;
    let zero = entry & QCOW_OFLAG_ZERO != 0;
    let mut ty = ClusterType::UNALLOCATED;
    if offset != 0 {
        ty |= ClusterType::ALLOCATED;
    }
    if zero {
        ty |= ClusterType::ZERO;
    }
    (ty, offset)
}
