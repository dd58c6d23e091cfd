// SPDX-License-Identifier: MIT

//! QCOW2 header parsing and emission.
//!
//! The on-disk structs here are written exactly the way the teacher's own
//! `Qcow2Header` (a fixed 64-bit-cluster, version-2-only header) is written
//! — `zerocopy` + `BigEndian` field wrappers — generalized to cover both the
//! version-2 (72-byte) and version-3 (104-byte) layouts and a variable
//! `cluster_bits`.

use qflat_io::prelude::*;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{CoreError, CoreResult};
use crate::types::*;

#[repr(C)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
struct HeaderV2Raw {
    magic: U32<BigEndian>,
    version: U32<BigEndian>,
    backing_file_offset: U64<BigEndian>,
    backing_file_size: U32<BigEndian>,
    cluster_bits: U32<BigEndian>,
    size: U64<BigEndian>,
    crypt_method: U32<BigEndian>,
    l1_size: U32<BigEndian>,
    l1_table_offset: U64<BigEndian>,
    refcount_table_offset: U64<BigEndian>,
    refcount_table_clusters: U32<BigEndian>,
    nb_snapshots: U32<BigEndian>,
    snapshots_offset: U64<BigEndian>,
}

const _: () = assert!(core::mem::size_of::<HeaderV2Raw>() == HEADER_SIZE_V2);

#[repr(C)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
struct HeaderV3ExtRaw {
    incompatible_features: U64<BigEndian>,
    compatible_features: U64<BigEndian>,
    autoclear_features: U64<BigEndian>,
    refcount_order: U32<BigEndian>,
    header_length: U32<BigEndian>,
}

const _: () = assert!(core::mem::size_of::<HeaderV3ExtRaw>() == HEADER_SIZE_V3 - HEADER_SIZE_V2);

/// Parsed QCOW2 header, converted to host byte order. Version-2 inputs get
/// the v3-style defaults spec'd in spec.md §3 (`incompatible = compatible =
/// autoclear = 0`, `refcount_order = 4`, `header_length = 72`).
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u32,
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: u32,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,
}

impl Header {
    /// Reads and validates the header at offset 0 of `io`.
    pub fn parse<IO: BlockIO + ?Sized>(io: &mut IO) -> CoreResult<Self> {
        let v2: HeaderV2Raw = io.read_struct(0)?;

        if v2.magic.get() != QCOW2_MAGIC {
            return Err(CoreError::Parse("not a QCOW2 image: bad magic"));
        }
        let version = v2.version.get();
        if version != QCOW2_VERSION_2 && version != QCOW2_VERSION_3 {
            return Err(CoreError::Parse("unsupported QCOW2 version"));
        }

        let header = if version == QCOW2_VERSION_2 {
            Header {
                version,
                backing_file_offset: v2.backing_file_offset.get(),
                backing_file_size: v2.backing_file_size.get(),
                cluster_bits: v2.cluster_bits.get(),
                size: v2.size.get(),
                crypt_method: v2.crypt_method.get(),
                l1_size: v2.l1_size.get(),
                l1_table_offset: v2.l1_table_offset.get(),
                refcount_table_offset: v2.refcount_table_offset.get(),
                refcount_table_clusters: v2.refcount_table_clusters.get(),
                nb_snapshots: v2.nb_snapshots.get(),
                snapshots_offset: v2.snapshots_offset.get(),
                incompatible_features: 0,
                compatible_features: 0,
                autoclear_features: 0,
                refcount_order: 4,
                header_length: HEADER_SIZE_V2 as u32,
            }
        } else {
            let ext: HeaderV3ExtRaw = io.read_struct(HEADER_SIZE_V2 as u64)?;
            if ext.refcount_order.get() > 6 {
                return Err(CoreError::Parse("refcount_order out of range"));
            }
            if ext.header_length.get() < HEADER_SIZE_V3 as u32 {
                return Err(CoreError::Truncated("v3 header_length shorter than 104"));
            }
            let incompatible = ext.incompatible_features.get();
            if incompatible & INCOMPAT_DIRTY != 0 {
                return Err(CoreError::Unsupported("image is dirty"));
            }
            if incompatible & INCOMPAT_CORRUPT != 0 {
                return Err(CoreError::Unsupported("image is corrupt"));
            }
            if incompatible & !INCOMPAT_KNOWN_MASK != 0 {
                return Err(CoreError::Unsupported(
                    "unknown incompatible feature bit set",
                ));
            }
            Header {
                version,
                backing_file_offset: v2.backing_file_offset.get(),
                backing_file_size: v2.backing_file_size.get(),
                cluster_bits: v2.cluster_bits.get(),
                size: v2.size.get(),
                crypt_method: v2.crypt_method.get(),
                l1_size: v2.l1_size.get(),
                l1_table_offset: v2.l1_table_offset.get(),
                refcount_table_offset: v2.refcount_table_offset.get(),
                refcount_table_clusters: v2.refcount_table_clusters.get(),
                nb_snapshots: v2.nb_snapshots.get(),
                snapshots_offset: v2.snapshots_offset.get(),
                incompatible_features: incompatible,
                compatible_features: ext.compatible_features.get(),
                autoclear_features: ext.autoclear_features.get(),
                refcount_order: ext.refcount_order.get(),
                header_length: ext.header_length.get(),
            }
        };

        header.validate_geometry()?;
        Ok(header)
    }

    fn validate_geometry(&self) -> CoreResult<()> {
        if !(9..=21).contains(&self.cluster_bits) {
            return Err(CoreError::Parse("cluster_bits out of range [9, 21]"));
        }
        let cluster_size = self.cluster_size();
        if self.header_length as u64 > cluster_size {
            return Err(CoreError::Parse("header_length exceeds cluster size"));
        }
        if self.refcount_table_clusters < 1 {
            return Err(CoreError::Parse("refcount_table_clusters must be >= 1"));
        }
        if self.backing_file_offset != 0
            && self.backing_file_offset + self.backing_file_size as u64 > cluster_size
        {
            return Err(CoreError::Parse(
                "backing file name does not fit in the first cluster",
            ));
        }
        let l2_size = self.l2_size();
        let min_l1 = self.size.div_ceil(cluster_size * l2_size as u64);
        if (self.l1_size as u64) < min_l1 {
            return Err(CoreError::Parse("l1_size too small for virtual size"));
        }
        if self.l1_size >= (1 << 22) {
            return Err(CoreError::Parse("l1_size exceeds 2^22"));
        }
        Ok(())
    }

    #[inline]
    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    /// `l2_bits`: each L2 entry is 8 bytes, so `l2_bits = cluster_bits - 3`.
    #[inline]
    pub fn l2_bits(&self) -> u32 {
        self.cluster_bits - 3
    }

    #[inline]
    pub fn l2_size(&self) -> u32 {
        1u32 << self.l2_bits()
    }

    #[inline]
    pub fn nb_sectors(&self) -> u64 {
        self.size.div_ceil(512)
    }

    /// Builds the header this producer emits for a given output geometry.
    /// Always a version-3-shaped header in memory (`header_length = 104`,
    /// `refcount_order = 4`); the on-disk `version` field mirrors the head
    /// image's own version, per spec.md §6.
    #[allow(clippy::too_many_arguments)]
    pub fn new_output(
        version: u32,
        cluster_bits: u32,
        virtual_size: u64,
        l1_size: u32,
        l1_table_offset: u64,
        refcount_table_offset: u64,
        refcount_table_clusters: u32,
        backing_file_size: u32,
    ) -> Self {
        let header_length = HEADER_SIZE_V3 as u32;
        let backing_file_offset = if backing_file_size > 0 {
            header_length as u64 + 8
        } else {
            0
        };
        Header {
            version,
            backing_file_offset,
            backing_file_size,
            cluster_bits,
            size: virtual_size,
            crypt_method: 0,
            l1_size,
            l1_table_offset,
            refcount_table_offset,
            refcount_table_clusters,
            nb_snapshots: 0,
            snapshots_offset: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            refcount_order: 4,
            header_length,
        }
    }

    /// Serializes the header (always as a full 104-byte v3-shaped record;
    /// spec.md §9 notes the emitted `header_length` is 104 even when the
    /// head was a v2 image and flags this as worth re-verifying against
    /// real consumers).
    pub fn to_bytes(&self) -> Vec<u8> {
        let v2 = HeaderV2Raw {
            magic: U32::new(QCOW2_MAGIC),
            version: U32::new(self.version),
            backing_file_offset: U64::new(self.backing_file_offset),
            backing_file_size: U32::new(self.backing_file_size),
            cluster_bits: U32::new(self.cluster_bits),
            size: U64::new(self.size),
            crypt_method: U32::new(self.crypt_method),
            l1_size: U32::new(self.l1_size),
            l1_table_offset: U64::new(self.l1_table_offset),
            refcount_table_offset: U64::new(self.refcount_table_offset),
            refcount_table_clusters: U32::new(self.refcount_table_clusters),
            nb_snapshots: U32::new(self.nb_snapshots),
            snapshots_offset: U64::new(self.snapshots_offset),
        };
        let ext = HeaderV3ExtRaw {
            incompatible_features: U64::new(self.incompatible_features),
            compatible_features: U64::new(self.compatible_features),
            autoclear_features: U64::new(self.autoclear_features),
            refcount_order: U32::new(self.refcount_order),
            header_length: U32::new(self.header_length),
        };
        let mut out = Vec::with_capacity(HEADER_SIZE_V3);
        out.extend_from_slice(v2.as_bytes());
        out.extend_from_slice(ext.as_bytes());
        out
    }

    /// Parses a header from an in-memory byte buffer (test/tooling
    /// convenience; production callers read through a `BlockIO`).
    pub fn parse_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let mut io = qflat_io::MemBlockIO::new();
        io.write_at(0, bytes)?;
        Self::parse(&mut io)
    }
}
