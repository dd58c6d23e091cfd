// SPDX-License-Identifier: MIT

//! A head image plus an optional "base" ancestor marking the flattening
//! boundary, and the visitor walk over the head's guest address space.

use std::path::Path;

use crate::error::CoreResult;
use crate::image::Image;
use crate::lookup::chain_find_clusters_offset;
use crate::types::ClusterType;

/// A contiguous run of like-typed clusters reported to a `foreach_clusters`
/// visitor.
#[derive(Debug, Clone, Copy)]
pub struct ClusterRun {
    /// Guest virtual address the run starts at.
    pub vaddr: u64,
    /// Host offset backing the run (meaningless when `ty` is unallocated).
    pub host_offset: u64,
    /// Length of the run in bytes.
    pub len: u64,
    pub ty: ClusterType,
}

/// Default per-request byte budget passed to the chain lookup while
/// stepping through the address space; bounded by a sector count so a
/// single call never claims an unbounded amount of work.
const STEP_BUDGET_SECTORS: u64 = 8192;

pub struct Chain {
    head: Image,
    /// Depth (ancestor distance from `head`) of the base image, or `None`
    /// if the chain has no base (flatten all the way to the root).
    base_depth: Option<usize>,
    base_is_head: bool,
    /// The base path exactly as given by the caller, carried through as the
    /// output's backing-file name. `None` means flatten with no backing
    /// file reference (merge the whole chain down to the root).
    base_name: Option<String>,
}

impl Chain {
    /// Opens `head_path` and, if given, resolves `base_path` to a depth
    /// within the head's backing chain. Fails with `BadChain` if `base_path`
    /// names a file not found among the head's ancestors.
    pub fn open(head_path: &Path, base_path: Option<&Path>) -> CoreResult<Self> {
        let head = Image::open(head_path)?;
        let (base_depth, base_is_head) = match base_path {
            None => (None, false),
            Some(base_path) => {
                let base_canon = base_path
                    .canonicalize()
                    .map_err(|_| crate::error::CoreError::BadChain("base path does not exist"))?;
                let head_canon = head_path.canonicalize().ok();
                if head_canon.as_deref() == Some(base_canon.as_path()) {
                    (None, true)
                } else {
                    (Self::find_base_depth(&head, &base_canon)?, false)
                }
            }
        };
        let base_name = base_path.map(|p| p.to_string_lossy().into_owned());
        Ok(Chain {
            head,
            base_depth,
            base_is_head,
            base_name,
        })
    }

    fn find_base_depth(head: &Image, base_canon: &Path) -> CoreResult<Option<usize>> {
        let mut depth = 0usize;
        let mut current = head.parent();
        // depth 0 here refers to the first ancestor (head's parent); the
        // caller's chain walk treats `base_depth` as "stop before this
        // depth", so the head itself can never be the base once we're in
        // this branch (that degenerate case is handled by the caller).
        loop {
            match current {
                None => {
                    return Err(crate::error::CoreError::BadChain(
                        "base not found among ancestors",
                    ));
                }
                Some(image) => {
                    if image.path() == base_canon {
                        return Ok(Some(depth + 1));
                    }
                    depth += 1;
                    current = image.parent();
                }
            }
        }
    }

    pub fn head(&self) -> &Image {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut Image {
        &mut self.head
    }

    #[inline]
    pub fn base_is_head(&self) -> bool {
        self.base_is_head
    }

    #[inline]
    pub fn base_depth(&self) -> Option<usize> {
        self.base_depth
    }

    /// The base path as given to `open`, if any; this becomes the
    /// flattened output's backing-file name.
    #[inline]
    pub fn base_name(&self) -> Option<&str> {
        self.base_name.as_deref()
    }

    /// Resolves `vaddr..vaddr+n_bytes` against the chain (same semantics as
    /// the module-level `chain_find_clusters_offset`), exposed so callers
    /// outside this crate can re-derive a run's type without re-walking the
    /// whole address space.
    pub fn find_clusters_offset(
        &mut self,
        vaddr: u64,
        n_bytes: u64,
    ) -> CoreResult<crate::lookup::ChainLookupResult> {
        chain_find_clusters_offset(
            &mut self.head,
            self.base_is_head,
            self.base_depth,
            vaddr,
            n_bytes,
        )
    }

    /// Reads `buf.len()` bytes at `offset` from the ancestor `depth` steps
    /// above the head (0 = head itself).
    pub fn read_host_bytes(&mut self, depth: usize, offset: u64, buf: &mut [u8]) -> CoreResult<()> {
        self.head.read_at_depth(depth, offset, buf)
    }

    /// Walks the entire guest address space of the head image, invoking
    /// `visitor` once per maximal contiguous run of like-typed clusters
    /// (as resolved by the chain-level lookup). The visitor may abort the
    /// walk by returning an error.
    pub fn foreach_clusters<F>(&mut self, mut visitor: F) -> CoreResult<()>
    where
        F: FnMut(ClusterRun) -> CoreResult<()>,
    {
        let size = self.head.header().size;
        let step_budget = STEP_BUDGET_SECTORS * 512;
        let mut vaddr = 0u64;
        while vaddr < size {
            let remaining = size - vaddr;
            let request = remaining.min(step_budget);
            let result = chain_find_clusters_offset(
                &mut self.head,
                self.base_is_head,
                self.base_depth,
                vaddr,
                request,
            )?;
            let len = result.n_available_bytes.min(remaining).max(1);
            visitor(ClusterRun {
                vaddr,
                host_offset: result.host_offset,
                len,
                ty: result.ty,
            })?;
            vaddr += len;
        }
        Ok(())
    }
}
