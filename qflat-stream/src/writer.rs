// SPDX-License-Identifier: MIT

//! The QCOW2 producer: walks a [`Chain`] once to plan each output cluster's
//! type, then emits header, refcount placeholder, L1 table, L2 tables, and
//! cluster data to a [`CoWriter`] in that fixed on-disk order.
//!
//! The planning pass collects one [`ClusterType`] per output cluster before
//! any bytes are emitted, rather than re-deriving it live inside each of the
//! three table/data-writing passes. The three passes then read from that
//! plan instead of re-walking the chain's visitor callback three times with
//! independent accumulator state machines. This still streams cluster data
//! without holding any of it in memory — the plan only carries one type tag
//! per cluster, not cluster bytes — but it is a deliberate simplification
//! worth another look if this ever needs to flatten images with an
//! enormous cluster count (tiny clusters over a very large virtual size).

use qflat_core::{Chain, ClusterType, Header};

use crate::bridge::CoWriter;
use crate::error::StreamResult;

const QCOW_OFLAG_COPIED: u64 = 1 << 63;
const QCOW_OFLAG_ZERO: u64 = 1;

/// Produces a flattened, self-contained QCOW2 image from `chain` and feeds
/// it to `w` in the fixed six-phase order: header, refcount placeholder,
/// L1 table, L2 tables, cluster data, final flush.
pub fn produce(chain: &mut Chain, w: &mut CoWriter) -> StreamResult<()> {
    let head_header = chain.head().header().clone();
    let cluster_bits = head_header.cluster_bits;
    let cluster_size = head_header.cluster_size();
    let l2_size = head_header.l2_size() as u64;
    let virtual_size = head_header.size;

    let l1_size = virtual_size.div_ceil(cluster_size * l2_size).max(1);
    let total_clusters = (l1_size * l2_size) as usize;

    let plan = scan_output_clusters(chain, cluster_size, total_clusters)?;

    let mut has_data = vec![false; l1_size as usize];
    for (idx, ty) in plan.iter().enumerate() {
        if !ty.is_unallocated() {
            has_data[idx / l2_size as usize] = true;
        }
    }
    let l2_table_count = has_data.iter().filter(|&&b| b).count() as u64;

    let l1_table_offset = 2 * cluster_size;
    let refcount_table_offset = cluster_size;
    let refcount_table_clusters = 1u32;
    let l1_bytes = l1_size * 8;
    let l1_region_clusters = l1_bytes.div_ceil(cluster_size);
    let l2_tables_offset = l1_table_offset + l1_region_clusters * cluster_size;
    let data_offset = l2_tables_offset + l2_table_count * cluster_size;

    let backing_name = chain.base_name();
    let backing_file_size = backing_name.map(|s| s.len()).unwrap_or(0) as u32;

    let out_header = Header::new_output(
        head_header.version,
        cluster_bits,
        virtual_size,
        l1_size as u32,
        l1_table_offset,
        refcount_table_offset,
        refcount_table_clusters,
        backing_file_size,
    );

    // Phase 1: header, end-of-extensions marker, backing name, pad to the
    // end of the first cluster.
    let header_bytes = out_header.to_bytes();
    w.co_write(&header_bytes)?;
    w.co_write(&[0u8; 8])?;
    if let Some(name) = backing_name {
        w.co_write(name.as_bytes())?;
    }
    let written = header_bytes.len() as u64 + 8 + backing_file_size as u64;
    let pad_to_cluster = cluster_size - (written % cluster_size) % cluster_size;
    w.co_write_zeros(pad_to_cluster)?;

    // Phase 2: refcount table placeholder.
    w.co_write_zeros(refcount_table_clusters as u64 * cluster_size)?;

    // Phase 3: L1 table.
    let mut next_l2_offset = l2_tables_offset;
    for &covered in &has_data {
        let entry = if covered {
            let e = QCOW_OFLAG_COPIED | next_l2_offset;
            next_l2_offset += cluster_size;
            e
        } else {
            QCOW_OFLAG_COPIED
        };
        w.co_write(&entry.to_be_bytes())?;
    }
    w.co_write_zeros(l1_region_clusters * cluster_size - l1_bytes)?;
    debug_assert_eq!(next_l2_offset, data_offset);

    // Phase 4: L2 tables, one per L1 index that has data, COPIED-only
    // filler for every slot the scan didn't touch.
    let mut next_data_offset = data_offset;
    let mut cluster_idx = 0usize;
    for &covered in &has_data {
        if !covered {
            cluster_idx += l2_size as usize;
            continue;
        }
        for _ in 0..l2_size {
            let ty = plan[cluster_idx];
            let entry = if ty.has_data() {
                let e = QCOW_OFLAG_COPIED | next_data_offset;
                next_data_offset += cluster_size;
                e
            } else if ty.is_zero() {
                QCOW_OFLAG_COPIED | QCOW_OFLAG_ZERO
            } else {
                QCOW_OFLAG_COPIED
            };
            w.co_write(&entry.to_be_bytes())?;
            cluster_idx += 1;
        }
    }

    // Phase 5: cluster data, one full cluster per allocated entry above, in
    // the same order so offsets line up with what phase 4 just wrote.
    let mut cluster_idx = 0usize;
    for &covered in &has_data {
        if !covered {
            cluster_idx += l2_size as usize;
            continue;
        }
        for _ in 0..l2_size {
            if plan[cluster_idx].has_data() {
                let vaddr = cluster_idx as u64 * cluster_size;
                let bytes = read_full_cluster(chain, vaddr, cluster_size)?;
                w.co_write(&bytes)?;
            }
            cluster_idx += 1;
        }
    }

    // Phase 6: nothing left to buffer; CoWriter::finish (called by the
    // bridge once this producer returns) flushes the trailing partial
    // chunk.
    Ok(())
}

/// Walks the chain once, folding each maximal run it reports into
/// fixed-size output-cluster buckets and recording one [`ClusterType`] per
/// output cluster. A run can be smaller than an output cluster (an
/// ancestor with finer-grained clusters than the head) or larger (a single
/// uniform run spanning many); both are handled by accumulating sectors
/// into the current bucket and flushing whenever it fills.
fn scan_output_clusters(
    chain: &mut Chain,
    cluster_size: u64,
    total_clusters: usize,
) -> StreamResult<Vec<ClusterType>> {
    let mut plan = vec![ClusterType::UNALLOCATED; total_clusters];
    let sectors_per_cluster = cluster_size / 512;
    let mut acc_sectors = 0u64;
    let mut acc_type = ClusterType::UNALLOCATED;
    let mut cluster_idx = 0usize;

    chain.foreach_clusters(|run| {
        let mut sectors = run.len / 512;
        while sectors > 0 {
            let remaining = sectors_per_cluster - acc_sectors;
            let take = sectors.min(remaining);
            acc_type = merge_cluster_type(acc_sectors, acc_type, run.ty);
            acc_sectors += take;
            sectors -= take;
            if acc_sectors == sectors_per_cluster {
                if cluster_idx < plan.len() {
                    plan[cluster_idx] = acc_type;
                }
                cluster_idx += 1;
                acc_sectors = 0;
                acc_type = ClusterType::UNALLOCATED;
            }
        }
        Ok(())
    })?;

    if acc_sectors > 0 && cluster_idx < plan.len() {
        plan[cluster_idx] = acc_type;
    }
    Ok(plan)
}

/// Folds an incoming sub-cluster run's type into an in-progress output
/// cluster. Two same-typed pieces keep that type; any mismatch inside one
/// output cluster means the cluster holds a mix of real and absent data, so
/// it must be materialized as `ALLOCATED` rather than collapsed to
/// `UNALLOCATED` or `ZERO`.
fn merge_cluster_type(acc_sectors: u64, acc: ClusterType, incoming: ClusterType) -> ClusterType {
    if acc_sectors == 0 {
        return incoming;
    }
    if acc == incoming {
        return acc;
    }
    ClusterType::ALLOCATED
}

/// Materializes one full output cluster's bytes by resolving sub-runs
/// directly against the chain: allocated sub-runs are read from whichever
/// ancestor holds them, everything else is left zeroed.
fn read_full_cluster(chain: &mut Chain, vaddr: u64, cluster_size: u64) -> StreamResult<Vec<u8>> {
    let mut buf = vec![0u8; cluster_size as usize];
    let mut filled = 0u64;
    while filled < cluster_size {
        let remaining = cluster_size - filled;
        let result = chain.find_clusters_offset(vaddr + filled, remaining)?;
        let take = result.n_available_bytes.min(remaining).max(1);
        if result.ty.has_data() {
            let start = filled as usize;
            let end = (filled + take) as usize;
            chain.read_host_bytes(result.depth, result.host_offset, &mut buf[start..end])?;
        }
        filled += take;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use qflat_core::Image;
    use std::io::Write as _;
    use std::path::Path;

    fn write_image(
        path: &Path,
        cluster_bits: u32,
        virtual_size: u64,
        backing: Option<&str>,
        allocated: &[(u64, u8)],
    ) {
        let cluster_size = 1u64 << cluster_bits;
        let backing_name = backing.unwrap_or("");
        let backing_len = backing_name.len() as u32;
        let header_len = qflat_core::header_size_v3();
        let l1_table_offset = cluster_size;
        let l2_size = 1u64 << (cluster_bits - 3);
        let l1_size = virtual_size.div_ceil(cluster_size * l2_size).max(1);
        let l2_table_offset = l1_table_offset + cluster_size;
        let data_offset = l2_table_offset + l1_size * cluster_size;
        let total = data_offset + allocated.len() as u64 * cluster_size + cluster_size;

        let header = Header::new_output(
            3,
            cluster_bits,
            virtual_size,
            l1_size as u32,
            l1_table_offset,
            data_offset,
            1,
            backing_len,
        );
        let mut buf = vec![0u8; total as usize];
        buf[..header.to_bytes().len()].copy_from_slice(&header.to_bytes());
        if backing_len > 0 {
            let off = header_len as usize + 8;
            buf[off..off + backing_name.len()].copy_from_slice(backing_name.as_bytes());
        }

        for (i, (vaddr, fill)) in allocated.iter().enumerate() {
            let l1_index = (vaddr >> (cluster_bits + (cluster_bits - 3))) as usize;
            let l2_index = ((vaddr >> cluster_bits) & (l2_size - 1)) as usize;
            let this_l2_offset = l2_table_offset + l1_index as u64 * cluster_size;
            let this_data_offset = data_offset + i as u64 * cluster_size;

            let l1_entry: u64 = (1u64 << 63) | this_l2_offset;
            let l1_off = l1_table_offset as usize + l1_index * 8;
            buf[l1_off..l1_off + 8].copy_from_slice(&l1_entry.to_be_bytes());

            let l2_entry: u64 = (1u64 << 63) | this_data_offset;
            let l2_off = this_l2_offset as usize + l2_index * 8;
            buf[l2_off..l2_off + 8].copy_from_slice(&l2_entry.to_be_bytes());

            let data_start = this_data_offset as usize;
            for b in buf[data_start..data_start + cluster_size as usize].iter_mut() {
                *b = *fill;
            }
        }

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&buf).unwrap();
    }

    const QCOW_OFLAG_COPIED_TEST: u64 = 1 << 63;
    const QCOW_OFLAG_ZERO_TEST: u64 = 1;

    /// Builds an image with one guest cluster whose L2 entry carries both
    /// `COPIED` and `ZERO` plus a reserved (non-zero) host offset, and
    /// stamps that host offset's bytes with `stale_fill` instead of real
    /// zeros — mirroring a real QCOW2 writer that reserves a cluster for
    /// an explicit zero without bothering to clear its old contents.
    fn write_image_with_allocated_zero_cluster(
        path: &Path,
        cluster_bits: u32,
        virtual_size: u64,
        vaddr: u64,
        stale_fill: u8,
    ) {
        let cluster_size = 1u64 << cluster_bits;
        let l1_table_offset = cluster_size;
        let l2_size = 1u64 << (cluster_bits - 3);
        let l1_size = virtual_size.div_ceil(cluster_size * l2_size).max(1);
        let l2_table_offset = l1_table_offset + cluster_size;
        let data_offset = l2_table_offset + l1_size * cluster_size;
        let total = data_offset + cluster_size;

        let header = Header::new_output(
            3,
            cluster_bits,
            virtual_size,
            l1_size as u32,
            l1_table_offset,
            data_offset,
            1,
            0,
        );
        let mut buf = vec![0u8; total as usize];
        buf[..header.to_bytes().len()].copy_from_slice(&header.to_bytes());

        let l1_index = (vaddr >> (cluster_bits + (cluster_bits - 3))) as usize;
        let l2_index = ((vaddr >> cluster_bits) & (l2_size - 1)) as usize;
        let this_l2_offset = l2_table_offset + l1_index as u64 * cluster_size;

        let l1_entry: u64 = QCOW_OFLAG_COPIED_TEST | this_l2_offset;
        let l1_off = l1_table_offset as usize + l1_index * 8;
        buf[l1_off..l1_off + 8].copy_from_slice(&l1_entry.to_be_bytes());

        let l2_entry: u64 = QCOW_OFLAG_COPIED_TEST | QCOW_OFLAG_ZERO_TEST | data_offset;
        let l2_off = this_l2_offset as usize + l2_index * 8;
        buf[l2_off..l2_off + 8].copy_from_slice(&l2_entry.to_be_bytes());

        let data_start = data_offset as usize;
        for b in buf[data_start..data_start + cluster_size as usize].iter_mut() {
            *b = stale_fill;
        }

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&buf).unwrap();
    }

    fn stream_to_bytes(chain: Chain) -> Vec<u8> {
        let mut chain = chain;
        let mut bridge = Bridge::spawn(move |w| produce(&mut chain, w));
        let mut out = Vec::new();
        loop {
            let chunk = bridge.read().unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn read_guest(out_path: &Path, vaddr: u64, len: usize) -> Vec<u8> {
        let mut image = Image::open(out_path).unwrap();
        let mut result = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            let r = qflat_core::find_clusters_offset(
                &mut image,
                vaddr + filled as u64,
                (len - filled) as u64,
            )
            .unwrap();
            let take = (r.n_available_bytes as usize).min(len - filled);
            if r.ty.is_allocated() {
                image
                    .read_at_depth(0, r.host_offset, &mut result[filled..filled + take])
                    .unwrap();
            }
            filled += take;
        }
        result
    }

    #[test]
    fn single_cluster_image_reproduces_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let head_path = dir.path().join("head.qcow2");
        write_image(&head_path, 16, 1 << 20, None, &[(0, 0xAA)]);

        let chain = Chain::open(&head_path, None).unwrap();
        let out = stream_to_bytes(chain);
        let out_path = dir.path().join("out.qcow2");
        std::fs::write(&out_path, &out).unwrap();

        assert_eq!(read_guest(&out_path, 0, 1 << 16), vec![0xAAu8; 1 << 16]);
        assert_eq!(read_guest(&out_path, 1 << 16, 1 << 16), vec![0u8; 1 << 16]);
    }

    #[test]
    fn chain_with_base_null_merges_all_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_size = 1u64 << 16;
        let parent_path = dir.path().join("parent.qcow2");
        write_image(&parent_path, 16, cluster_size * 4, None, &[(0, 0xBB)]);
        let child_path = dir.path().join("child.qcow2");
        write_image(
            &child_path,
            16,
            cluster_size * 4,
            Some("parent.qcow2"),
            &[(cluster_size, 0xCC)],
        );

        let chain = Chain::open(&child_path, None).unwrap();
        let out = stream_to_bytes(chain);
        let out_path = dir.path().join("out.qcow2");
        std::fs::write(&out_path, &out).unwrap();

        assert_eq!(
            read_guest(&out_path, 0, cluster_size as usize),
            vec![0xBBu8; cluster_size as usize]
        );
        assert_eq!(
            read_guest(&out_path, cluster_size, cluster_size as usize),
            vec![0xCCu8; cluster_size as usize]
        );
    }

    #[test]
    fn base_parent_excludes_parent_data() {
        let dir = tempfile::tempdir().unwrap();
        let cluster_size = 1u64 << 16;
        let parent_path = dir.path().join("parent.qcow2");
        write_image(&parent_path, 16, cluster_size * 4, None, &[(0, 0xBB)]);
        let child_path = dir.path().join("child.qcow2");
        write_image(
            &child_path,
            16,
            cluster_size * 4,
            Some("parent.qcow2"),
            &[(cluster_size, 0xCC)],
        );

        let chain = Chain::open(&child_path, Some(&parent_path)).unwrap();
        let out = stream_to_bytes(chain);
        let out_path = dir.path().join("out.qcow2");
        std::fs::write(&out_path, &out).unwrap();

        assert_eq!(
            read_guest(&out_path, 0, cluster_size as usize),
            vec![0u8; cluster_size as usize]
        );
        assert_eq!(
            read_guest(&out_path, cluster_size, cluster_size as usize),
            vec![0xCCu8; cluster_size as usize]
        );
    }

    #[test]
    fn mixed_cluster_sizes_merge_partial_parent_data() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("parent.qcow2");
        // Parent has 4 KiB clusters; only the first half of the child's
        // single 64 KiB cluster (its first 8 parent clusters) is allocated.
        let parent_allocated: Vec<(u64, u8)> = (0..8).map(|i| (i * 4096, 0xBB)).collect();
        write_image(&parent_path, 12, 1 << 16, None, &parent_allocated);

        let child_path = dir.path().join("child.qcow2");
        write_image(&child_path, 16, 1 << 16, Some("parent.qcow2"), &[]);

        let chain = Chain::open(&child_path, None).unwrap();
        let out = stream_to_bytes(chain);
        let out_path = dir.path().join("out.qcow2");
        std::fs::write(&out_path, &out).unwrap();

        let whole = read_guest(&out_path, 0, 1 << 16);
        assert!(whole[..32768].iter().all(|&b| b == 0xBB));
        assert!(whole[32768..].iter().all(|&b| b == 0));
    }

    #[test]
    fn degenerate_base_is_head_has_no_allocated_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let head_path = dir.path().join("head.qcow2");
        write_image(&head_path, 16, 1 << 20, None, &[(0, 0xAA)]);

        let chain = Chain::open(&head_path, Some(&head_path)).unwrap();
        let out = stream_to_bytes(chain);
        let out_path = dir.path().join("out.qcow2");
        std::fs::write(&out_path, &out).unwrap();

        assert_eq!(read_guest(&out_path, 0, 1 << 16), vec![0u8; 1 << 16]);
    }

    #[test]
    fn backing_filename_is_preserved_verbatim() {
        let dir = tempfile::tempdir().unwrap();

        // Build a 300-byte *relative path* (not a single 300-byte filename
        // component, which would exceed the filesystem's own limit) out of
        // nested directories, matching spec.md's "base path of length 300".
        let seg = "a".repeat(40);
        let mut comps = Vec::new();
        let mut total = 0usize;
        while total + seg.len() + 1 < 300 {
            comps.push(seg.clone());
            total += seg.len() + 1;
        }
        comps.push("b".repeat(300 - total));
        let long_rel = comps.join("/");
        assert_eq!(long_rel.len(), 300);

        let parent_path = dir.path().join(&long_rel);
        std::fs::create_dir_all(parent_path.parent().unwrap()).unwrap();
        write_image(&parent_path, 16, 1 << 16, None, &[(0, 0x11)]);
        let child_path = dir.path().join("child.qcow2");
        write_image(&child_path, 16, 1 << 16, Some(&long_rel), &[]);

        // The output's backing-file name is the base path exactly as given
        // to `Chain::open`, which here is the long, filesystem-resolvable
        // absolute path (not the short relative pointer the child's own
        // on-disk header uses to find its parent).
        let expected_name = parent_path.to_string_lossy().into_owned();
        assert!(
            expected_name.len() > 255,
            "expected a name past the typical single-component filename limit"
        );

        let chain = Chain::open(&child_path, Some(&parent_path)).unwrap();
        let out = stream_to_bytes(chain);

        let header_len = qflat_core::header_size_v3() as usize;
        let name_start = header_len + 8;
        let name_len = expected_name.len();
        assert_eq!(
            &out[name_start..name_start + name_len],
            expected_name.as_bytes()
        );

        let parsed = Header::parse_bytes(&out).unwrap();
        assert_eq!(parsed.backing_file_offset, header_len as u64 + 8);
        assert_eq!(parsed.backing_file_size, name_len as u32);

        // Zero padding fills the rest of the first cluster.
        let cluster_size = 1usize << 16;
        assert!(
            out[name_start + name_len..cluster_size]
                .iter()
                .all(|&b| b == 0)
        );
    }

    #[test]
    fn allocated_zero_cluster_reads_as_zero_not_stale_host_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let head_path = dir.path().join("head.qcow2");
        write_image_with_allocated_zero_cluster(&head_path, 16, 1 << 16, 0, 0xFF);

        let chain = Chain::open(&head_path, None).unwrap();
        let out = stream_to_bytes(chain);
        let out_path = dir.path().join("out.qcow2");
        std::fs::write(&out_path, &out).unwrap();

        assert_eq!(read_guest(&out_path, 0, 1 << 16), vec![0u8; 1 << 16]);

        // The output's own L2 entry for this cluster must be COPIED|ZERO
        // with no allocated host offset, not a real data-offset entry
        // pointing at a copy of the stale bytes.
        let mut out_image = Image::open(&out_path).unwrap();
        let r = qflat_core::find_clusters_offset(&mut out_image, 0, 1 << 16).unwrap();
        assert!(r.ty.is_zero());
        assert!(!r.ty.has_data());
    }
}
