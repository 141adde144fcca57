//! Fru Resource Planner
//!
//! Computes, per disk position, the logical block range and scatter-gather
//! shape a sub-request will need, before any fruts exists or any I/O is
//! issued. The planner's output drives a single arena allocation sized for
//! the whole pass.
//!
//! Buffer counting has three modes:
//!
//! - **normal verify**: every position gets the full pass range (symmetric
//!   one-pass layout);
//! - **recovery verify, exact**: blocks the parent request already read are
//!   subtracted via interval intersection with the verify window, so those
//!   blocks are never double-buffered;
//! - **strip-mined recovery verify**: future passes are unknown, so the
//!   pessimistic maximum `width * region_size` is allocated up front.

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::geometry::{BlockCount, Lba, RaidGeometry};

/// Largest supported scatter-gather list length
pub const MAX_SG_ELEMENTS: usize = 1024;

/// Number of sg size buckets
pub const SG_BUCKET_COUNT: usize = 5;

/// Capacities of the sg size buckets, smallest first. Allocation requests
/// are stated as one count per bucket rather than per exact length.
pub static SG_BUCKET_CAPACITIES: Lazy<[usize; SG_BUCKET_COUNT]> =
    Lazy::new(|| [1, 8, 32, 128, MAX_SG_ELEMENTS]);

// =============================================================================
// Fru Info
// =============================================================================

/// Pre-allocation sizing record for one disk position.
///
/// Ephemeral: lives only through the allocate/size phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FruInfo {
    pub position: u32,
    pub lba: Lba,
    pub blocks: BlockCount,
    /// Index into [`SG_BUCKET_CAPACITIES`]
    pub sg_index: usize,
}

/// A block range the parent request has already read and buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRange {
    pub lba: Lba,
    pub blocks: BlockCount,
}

impl ParentRange {
    /// Blocks of this range that fall inside `[window_start, window_end]`
    /// (inclusive bounds). A range fully outside contributes zero; one
    /// straddling either boundary contributes its overlap length.
    fn overlap(&self, window_start: Lba, window_end: Lba) -> BlockCount {
        if self.blocks == 0 {
            return 0;
        }
        let end = self.lba + self.blocks - 1;
        if end < window_start || self.lba > window_end {
            return 0;
        }
        window_end.min(end) - window_start.max(self.lba) + 1
    }
}

// =============================================================================
// sg counting
// =============================================================================

/// Number of sg elements needed for a run of `blocks`, assuming fixed-size
/// pages of `blocks_per_page`. One extra slot is always added to tolerate
/// region-alignment boundary splits discovered after allocation.
pub fn count_sg_elements(blocks: BlockCount, blocks_per_page: u32) -> usize {
    debug_assert!(blocks_per_page > 0);
    let pages = blocks.div_ceil(blocks_per_page as BlockCount) as usize;
    pages + 1
}

/// Smallest sg bucket able to hold `elements`
pub fn sg_bucket_for(elements: usize) -> Result<usize> {
    for (index, capacity) in SG_BUCKET_CAPACITIES.iter().enumerate() {
        if elements <= *capacity {
            return Ok(index);
        }
    }
    Err(Error::ResourceInsufficient {
        required: elements,
        max: MAX_SG_ELEMENTS,
    })
}

// =============================================================================
// Buffer counting
// =============================================================================

/// Sum of the intersections of each parent range with the verify window
/// `[window_start, window_start + window_count)`.
pub fn buffered_overlap_blocks(
    window_start: Lba,
    window_count: BlockCount,
    parent_ranges: &[ParentRange],
) -> BlockCount {
    if window_count == 0 {
        return 0;
    }
    let window_end = window_start + window_count - 1;
    parent_ranges
        .iter()
        .map(|r| r.overlap(window_start, window_end))
        .sum()
}

// =============================================================================
// Resource Plan
// =============================================================================

/// Complete sizing output for one allocation: per-position fru infos, the
/// total buffer block count, and per-bucket sg list counts.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    pub infos: Vec<FruInfo>,
    /// Buffer blocks to request from the arena
    pub total_blocks: BlockCount,
    /// How many sg lists of each bucket size are needed
    pub sg_bucket_counts: [u32; SG_BUCKET_COUNT],
    pub blocks_per_page: u32,
}

impl ResourcePlan {
    fn layout(
        geometry: &RaidGeometry,
        lba: Lba,
        blocks: BlockCount,
        blocks_per_page: u32,
    ) -> Result<(Vec<FruInfo>, [u32; SG_BUCKET_COUNT])> {
        let mut infos = Vec::with_capacity(geometry.width() as usize);
        let mut bucket_counts = [0u32; SG_BUCKET_COUNT];
        for position in 0..geometry.width() {
            let elements = count_sg_elements(blocks, blocks_per_page);
            let sg_index = sg_bucket_for(elements)?;
            bucket_counts[sg_index] += 1;
            infos.push(FruInfo {
                position,
                lba,
                blocks,
                sg_index,
            });
        }
        Ok((infos, bucket_counts))
    }

    /// Symmetric one-pass layout for a normal verify: every position reads
    /// the full `parity_count` blocks at `parity_start`.
    pub fn for_verify(
        geometry: &RaidGeometry,
        parity_start: Lba,
        parity_count: BlockCount,
        blocks_per_page: u32,
    ) -> Result<Self> {
        let (infos, sg_bucket_counts) =
            Self::layout(geometry, parity_start, parity_count, blocks_per_page)?;
        Ok(Self {
            infos,
            total_blocks: parity_count * geometry.width() as BlockCount,
            sg_bucket_counts,
            blocks_per_page,
        })
    }

    /// Exact layout for a non-strip-mined recovery verify. Every position
    /// still covers the full window, but buffer blocks the parent already
    /// holds are not requested again.
    pub fn for_recovery_verify(
        geometry: &RaidGeometry,
        verify_start: Lba,
        verify_count: BlockCount,
        parent_ranges: &[ParentRange],
        blocks_per_page: u32,
    ) -> Result<Self> {
        let (infos, sg_bucket_counts) =
            Self::layout(geometry, verify_start, verify_count, blocks_per_page)?;
        let full = verify_count * (geometry.data_disks() + geometry.parity_count()) as BlockCount;
        let buffered = buffered_overlap_blocks(verify_start, verify_count, parent_ranges);
        if buffered > full {
            return Err(Error::InvariantViolation(format!(
                "parent overlap {} exceeds window total {}",
                buffered, full
            )));
        }
        Ok(Self {
            infos,
            total_blocks: full - buffered,
            sg_bucket_counts,
            blocks_per_page,
        })
    }

    /// Pessimistic layout for a strip-mined recovery verify: later passes
    /// are not yet known, so allocate the per-pass maximum for every
    /// position.
    pub fn for_strip_mine(
        geometry: &RaidGeometry,
        parity_start: Lba,
        blocks_per_page: u32,
    ) -> Result<Self> {
        let region = geometry.region_size();
        let (infos, sg_bucket_counts) =
            Self::layout(geometry, parity_start, region, blocks_per_page)?;
        Ok(Self {
            infos,
            total_blocks: region * geometry.width() as BlockCount,
            sg_bucket_counts,
            blocks_per_page,
        })
    }

    /// Total sg lists across all buckets
    pub fn sg_list_total(&self) -> u32 {
        self.sg_bucket_counts.iter().sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
