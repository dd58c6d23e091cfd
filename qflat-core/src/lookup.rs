// SPDX-License-Identifier: MIT

//! Guest-address resolution: image-level L1/L2 lookup and the chain-level
//! walk that consults ancestors until a definitive mapping is found.

use crate::error::{CoreError, CoreResult};
use crate::image::Image;
use crate::types::{ClusterType, L2E_OFFSET_MASK, decode_standard_entry};

/// Result of resolving a guest address span against one image: the host
/// offset backing the run (meaningless when the run is unallocated), the
/// number of contiguous bytes the run covers, and the run's cluster type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    pub host_offset: u64,
    pub n_available_bytes: u64,
    pub ty: ClusterType,
}

/// Resolves `vaddr..vaddr+n_bytes` (capped to a single L2 table's span)
/// against one image's own L1/L2 tables.
pub fn find_clusters_offset(
    image: &mut Image,
    vaddr: u64,
    n_bytes: u64,
) -> CoreResult<LookupResult> {
    let cluster_bits = image.header().cluster_bits;
    let cluster_size = image.cluster_size();
    let l2_size = image.l2_size() as u64;
    let l2_bits = image.l2_bits();

    let cluster_padding = vaddr % cluster_size;
    let requested = n_bytes + cluster_padding;
    let aligned_vaddr = vaddr - cluster_padding;

    let l2_index = (aligned_vaddr >> cluster_bits) & (l2_size - 1);
    let l2_cap = (l2_size - l2_index) << cluster_bits;
    let capped = requested.min(l2_cap);

    let l1_index = aligned_vaddr >> (cluster_bits + l2_bits);
    if l1_index as usize >= image.l1_table().len() {
        return Ok(LookupResult {
            host_offset: 0,
            n_available_bytes: capped - cluster_padding,
            ty: ClusterType::UNALLOCATED,
        });
    }
    let l1_entry = image.l1_table()[l1_index as usize];
    let l2_table_offset = l1_entry & L2E_OFFSET_MASK;
    if l2_table_offset == 0 {
        return Ok(LookupResult {
            host_offset: 0,
            n_available_bytes: capped - cluster_padding,
            ty: ClusterType::UNALLOCATED,
        });
    }
    if l2_table_offset % cluster_size != 0 {
        return Err(CoreError::Misalignment(
            "L2 table offset not cluster-aligned",
        ));
    }

    let n_entries_in_cap = (capped >> cluster_bits) as usize;
    let (io, l2_cache) = image.io_and_l2_cache_mut();
    let table = l2_cache.get(io, l2_table_offset)?;

    let entry_at = |idx: usize| -> u64 {
        let off = idx * 8;
        u64::from_be_bytes(table[off..off + 8].try_into().unwrap())
    };

    let first = entry_at(l2_index as usize);
    let (ty, host_offset) = decode_standard_entry(first);
    if ty == ClusterType::COMPRESSED {
        return Err(CoreError::Unsupported("compressed cluster encountered"));
    }
    if ty.is_allocated() && host_offset % cluster_size != 0 {
        return Err(CoreError::Misalignment(
            "allocated cluster offset not cluster-aligned",
        ));
    }

    let mut run_clusters = 1u64;
    let max_clusters = n_entries_in_cap.max(1) as u64;
    while run_clusters < max_clusters {
        let idx = l2_index as usize + run_clusters as usize;
        if idx >= l2_size as usize {
            break;
        }
        let entry = entry_at(idx);
        let (next_ty, next_offset) = decode_standard_entry(entry);
        if next_ty == ClusterType::COMPRESSED {
            break;
        }
        let matches = if ty.is_allocated() {
            next_ty == ty && next_offset == host_offset + run_clusters * cluster_size
        } else {
            next_ty == ty
        };
        if !matches {
            break;
        }
        run_clusters += 1;
    }

    let n_available_bytes = (run_clusters << cluster_bits).min(capped) - cluster_padding;
    Ok(LookupResult {
        host_offset,
        n_available_bytes,
        ty,
    })
}

/// Outcome of a chain-level lookup: which image (by chain depth from the
/// head, 0 = head) supplied the authoritative answer, plus the usual
/// image-level result fields.
#[derive(Debug, Clone, Copy)]
pub struct ChainLookupResult {
    pub host_offset: u64,
    pub n_available_bytes: u64,
    pub ty: ClusterType,
    pub depth: usize,
}

/// Walks from `head` toward parents, stopping before the image at `base`
/// depth (`None` if the chain has no base, i.e. flatten to the root).
/// `base_is_head` handles the degenerate "base is head" chain: the whole
/// request resolves to Unallocated within this L2 table's span.
pub fn chain_find_clusters_offset(
    head: &mut Image,
    base_is_head: bool,
    base_depth: Option<usize>,
    vaddr: u64,
    n_bytes: u64,
) -> CoreResult<ChainLookupResult> {
    if base_is_head {
        let probe = find_clusters_offset(head, vaddr, n_bytes)?;
        return Ok(ChainLookupResult {
            host_offset: 0,
            n_available_bytes: probe.n_available_bytes,
            ty: ClusterType::UNALLOCATED,
            depth: 0,
        });
    }
    walk_chain(head, base_depth, 0, vaddr, n_bytes)
}

fn walk_chain(
    image: &mut Image,
    base_depth: Option<usize>,
    depth: usize,
    vaddr: u64,
    n_bytes: u64,
) -> CoreResult<ChainLookupResult> {
    if base_depth == Some(depth) {
        return Ok(ChainLookupResult {
            host_offset: 0,
            n_available_bytes: n_bytes,
            ty: ClusterType::UNALLOCATED,
            depth,
        });
    }
    let result = find_clusters_offset(image, vaddr, n_bytes)?;
    if result.ty.is_allocated() || result.ty.is_zero() {
        return Ok(ChainLookupResult {
            host_offset: result.host_offset,
            n_available_bytes: result.n_available_bytes,
            ty: result.ty,
            depth,
        });
    }
    match image.parent_mut() {
        Some(parent) => walk_chain(
            parent,
            base_depth,
            depth + 1,
            vaddr,
            result.n_available_bytes,
        ),
        None => Ok(ChainLookupResult {
            host_offset: 0,
            n_available_bytes: result.n_available_bytes,
            ty: ClusterType::UNALLOCATED,
            depth,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_image_with_one_cluster(path: &std::path::Path, cluster_bits: u32, fill: u8) -> u64 {
        let cluster_size = 1u64 << cluster_bits;
        let l1_table_offset = cluster_size;
        let l2_table_offset = 2 * cluster_size;
        let data_offset = 3 * cluster_size;
        let header = crate::header::Header::new_output(
            3,
            cluster_bits,
            cluster_size * 16,
            1,
            l1_table_offset,
            4 * cluster_size,
            1,
            0,
        );
        let mut buf = vec![0u8; (data_offset + cluster_size) as usize];
        buf[..header.to_bytes().len()].copy_from_slice(&header.to_bytes());
        let l1_entry: u64 = (1u64 << 63) | l2_table_offset;
        buf[l1_table_offset as usize..l1_table_offset as usize + 8]
            .copy_from_slice(&l1_entry.to_be_bytes());
        let l2_entry: u64 = (1u64 << 63) | data_offset;
        buf[l2_table_offset as usize..l2_table_offset as usize + 8]
            .copy_from_slice(&l2_entry.to_be_bytes());
        for b in buf[data_offset as usize..(data_offset + cluster_size) as usize].iter_mut() {
            *b = fill;
        }
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&buf).unwrap();
        data_offset
    }

    #[test]
    fn resolves_allocated_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.qcow2");
        let data_offset = write_image_with_one_cluster(&path, 16, 0xAA);
        let mut image = Image::open(&path).unwrap();
        let r = find_clusters_offset(&mut image, 0, 1 << 16).unwrap();
        assert_eq!(r.host_offset, data_offset);
        assert!(r.ty.is_allocated());
        assert_eq!(r.n_available_bytes, 1 << 16);
    }

    #[test]
    fn unallocated_past_l1_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.qcow2");
        write_image_with_one_cluster(&path, 16, 0xAA);
        let mut image = Image::open(&path).unwrap();
        let r = find_clusters_offset(&mut image, 1 << 16, 1 << 16).unwrap();
        assert!(r.ty.is_unallocated());
    }
}
