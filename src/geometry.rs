//! RAID geometry and position-set primitives
//!
//! A [`RaidGeometry`] describes one fixed-width parity array: how many disk
//! positions exist, which of them hold parity, the optimal block size every
//! verify pass must align to, and the region size used to bound strip-mined
//! passes. [`PositionBitmap`] is the set-of-positions type used throughout
//! the library instead of raw integer masks.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Logical block address
pub type Lba = u64;

/// Count of logical blocks
pub type BlockCount = u64;

/// Maximum number of disk positions in one array
pub const MAX_WIDTH: u32 = 16;

// =============================================================================
// Position Bitmap
// =============================================================================

/// A set of disk positions (0..width), backed by a fixed-size bitmask.
///
/// All membership math in the library goes through the named operations here
/// rather than raw bit-twiddling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct PositionBitmap(u16);

impl PositionBitmap {
    /// The empty set
    pub const EMPTY: PositionBitmap = PositionBitmap(0);

    /// Set containing a single position
    pub fn from_position(position: u32) -> Self {
        debug_assert!(position < MAX_WIDTH);
        PositionBitmap(1 << position)
    }

    /// Set containing every position below `width`
    pub fn all_below(width: u32) -> Self {
        debug_assert!(width <= MAX_WIDTH);
        PositionBitmap(((1u32 << width) - 1) as u16)
    }

    /// Build from a raw mask (test and aggregation plumbing)
    pub fn from_raw(mask: u16) -> Self {
        PositionBitmap(mask)
    }

    /// Raw mask value
    pub fn raw(self) -> u16 {
        self.0
    }

    /// True when no position is set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Membership test
    pub fn contains(self, position: u32) -> bool {
        position < MAX_WIDTH && (self.0 & (1 << position)) != 0
    }

    /// Add one position
    pub fn insert(&mut self, position: u32) {
        debug_assert!(position < MAX_WIDTH);
        self.0 |= 1 << position;
    }

    /// Remove one position
    pub fn remove(&mut self, position: u32) {
        debug_assert!(position < MAX_WIDTH);
        self.0 &= !(1 << position);
    }

    /// Set union
    pub fn union(self, other: PositionBitmap) -> PositionBitmap {
        PositionBitmap(self.0 | other.0)
    }

    /// Set intersection
    pub fn intersect(self, other: PositionBitmap) -> PositionBitmap {
        PositionBitmap(self.0 & other.0)
    }

    /// Positions in `self` but not in `other`
    pub fn difference(self, other: PositionBitmap) -> PositionBitmap {
        PositionBitmap(self.0 & !other.0)
    }

    /// Number of positions in the set
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate set positions in ascending order
    pub fn iter_positions(self) -> impl Iterator<Item = u32> {
        (0..MAX_WIDTH).filter(move |p| self.contains(*p))
    }

    /// Lowest set position, if any
    pub fn first(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }
}

impl std::fmt::Display for PositionBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// =============================================================================
// RAID Geometry
// =============================================================================

/// Static description of one parity RAID array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidGeometry {
    /// Total number of disk positions (data + parity)
    width: u32,
    /// Which positions hold parity; one bit for row parity, two for
    /// row + diagonal (RAID-6 variant)
    parity_positions: PositionBitmap,
    /// Every verify range must be a multiple of this block count
    /// (degraded verify excepted)
    optimal_block_size: u32,
    /// Maximum blocks per position in one strip-mined pass
    region_size: BlockCount,
}

impl RaidGeometry {
    /// Create a geometry, validating the width/parity relationship
    pub fn new(
        width: u32,
        parity_positions: PositionBitmap,
        optimal_block_size: u32,
        region_size: BlockCount,
    ) -> Result<Self> {
        if width < 3 || width > MAX_WIDTH {
            return Err(Error::InvalidGeometry(format!(
                "width {} out of range 3..={}",
                width, MAX_WIDTH
            )));
        }
        let parity_count = parity_positions.count();
        if parity_count == 0 || parity_count > 2 {
            return Err(Error::InvalidGeometry(format!(
                "parity position count {} not in 1..=2",
                parity_count
            )));
        }
        if let Some(highest) = parity_positions.iter_positions().last() {
            if highest >= width {
                return Err(Error::InvalidGeometry(format!(
                    "parity position {} outside width {}",
                    highest, width
                )));
            }
        }
        if optimal_block_size == 0 {
            return Err(Error::InvalidGeometry(
                "optimal_block_size must be nonzero".to_string(),
            ));
        }
        if region_size == 0 || region_size % optimal_block_size as BlockCount != 0 {
            return Err(Error::InvalidGeometry(format!(
                "region_size {} must be a nonzero multiple of optimal block size {}",
                region_size, optimal_block_size
            )));
        }
        Ok(Self {
            width,
            parity_positions,
            optimal_block_size,
            region_size,
        })
    }

    /// Single row-parity geometry with the last position as parity
    pub fn row_parity(width: u32, optimal_block_size: u32, region_size: BlockCount) -> Result<Self> {
        Self::new(
            width,
            PositionBitmap::from_position(width.saturating_sub(1)),
            optimal_block_size,
            region_size,
        )
    }

    /// Total number of disk positions
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Number of data positions
    pub fn data_disks(&self) -> u32 {
        self.width - self.parity_positions.count()
    }

    /// Number of parity positions (1 row, 2 row + diagonal)
    pub fn parity_count(&self) -> u32 {
        self.parity_positions.count()
    }

    /// The parity position set
    pub fn parity_positions(&self) -> PositionBitmap {
        self.parity_positions
    }

    /// Row parity position (lowest parity position)
    pub fn row_parity_position(&self) -> u32 {
        // new() guarantees at least one parity position
        self.parity_positions.first().unwrap_or(self.width - 1)
    }

    /// Diagonal parity position when this is a dual-parity array
    pub fn diagonal_parity_position(&self) -> Option<u32> {
        self.parity_positions.iter_positions().nth(1)
    }

    /// True for the dual-parity (row + diagonal) variant
    pub fn is_dual_parity(&self) -> bool {
        self.parity_positions.count() == 2
    }

    /// Membership test for parity positions
    pub fn is_parity(&self, position: u32) -> bool {
        self.parity_positions.contains(position)
    }

    /// The full position set of this array
    pub fn all_positions(&self) -> PositionBitmap {
        PositionBitmap::all_below(self.width)
    }

    /// Verify alignment unit
    pub fn optimal_block_size(&self) -> u32 {
        self.optimal_block_size
    }

    /// Per-position block bound for one strip-mined pass
    pub fn region_size(&self) -> BlockCount {
        self.region_size
    }
}

// =============================================================================
// Tests
// =============================================================================
