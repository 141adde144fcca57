//! XOR/Verify engine boundary
//!
//! The engine validates per-sector checksums and lba stamps, checks stripe
//! coherency, reconstructs or invalidates damaged sectors, and describes
//! what it found as a bounded list of [`ErrorRegion`]s. Everything the
//! reporting layer needs is in the regions plus the classified bitmaps of
//! [`VerifyCounts`]; the engine itself never logs events.

pub mod engine;

pub use engine::RowParityEngine;

use bytes::BytesMut;
use serde::Serialize;

use crate::error::Result;
use crate::geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};

/// Upper bound on error regions per verify pass
pub const MAX_ERROR_REGIONS: usize = 16;

// =============================================================================
// Error taxonomy
// =============================================================================

/// One physical cause class for a damaged block run.
///
/// Every classification site matches exhaustively on this enum, so adding
/// a kind forces each switch to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum XorErrorKind {
    /// Drive-recovered sector failure
    SoftMedia,
    /// Persistent sector failure
    HardMedia,
    /// Checksum mismatch of unknown shape
    Crc,
    /// Single-bit checksum mismatch
    SingleBitCrc,
    /// Multi-bit checksum mismatch
    MultiBitCrc,
    /// Checksum deliberately poisoned by a data-corrupting test op
    CorruptCrc,
    /// Data deliberately poisoned by a data-corrupting test op
    CorruptData,
    /// Sector checksum fine but its lba stamp names another block
    LbaStamp,
    /// Write stamp inconsistency
    WriteStamp,
    /// Time stamp inconsistency
    TimeStamp,
    /// Shed stamp inconsistency
    ShedStamp,
    /// Stripe-wide parity/data disagreement with all checksums intact
    Coherency,
    /// Parity-of-checksums disagreement
    ParityOfChecksumCoherency,
    /// A reconstruction attempt itself failed
    RebuildFailed,
    /// Sector carries the invalidated pattern from an earlier loss
    Invalidated,
}

impl XorErrorKind {
    /// Checksum-family kinds hand a small read off to read recovery
    pub fn is_checksum(self) -> bool {
        matches!(
            self,
            XorErrorKind::Crc
                | XorErrorKind::SingleBitCrc
                | XorErrorKind::MultiBitCrc
                | XorErrorKind::CorruptCrc
        )
    }
}

// =============================================================================
// Error regions
// =============================================================================

/// One contiguous run of blocks sharing the same classification on the
/// same position set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorRegion {
    pub lba: Lba,
    pub blocks: BlockCount,
    pub kind: XorErrorKind,
    /// Redundancy could not absorb the damage; data was invalidated
    pub uncorrectable: bool,
    pub positions: PositionBitmap,
}

/// Append-only bounded region list, cleared at verify-pass start
#[derive(Debug, Clone, Default)]
pub struct ErrorRegionList {
    regions: Vec<ErrorRegion>,
    overflowed: bool,
}

impl ErrorRegionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
        self.overflowed = false;
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// True when at least one region was discarded for lack of space
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRegion> {
        self.regions.iter()
    }

    pub fn as_slice(&self) -> &[ErrorRegion] {
        &self.regions
    }

    /// Record a damaged run. Adjacent runs with identical classification
    /// and position set are merged; past the bound, regions are dropped
    /// and the overflow flag is raised.
    pub fn push(&mut self, region: ErrorRegion) {
        if let Some(last) = self.regions.last_mut() {
            if last.kind == region.kind
                && last.uncorrectable == region.uncorrectable
                && last.positions == region.positions
                && last.lba + last.blocks == region.lba
            {
                last.blocks += region.blocks;
                return;
            }
        }
        if self.regions.len() >= MAX_ERROR_REGIONS {
            self.overflowed = true;
            return;
        }
        self.regions.push(region);
    }
}

// =============================================================================
// Engine status and classified bitmaps
// =============================================================================

/// Status tag returned by engine entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorStatus {
    NoError,
    /// At least one checksum-family error was seen
    ChecksumError,
}

/// Classified per-pass error bitmaps (the verify transfer state).
///
/// `modified` is the set of positions whose buffers the engine rewrote and
/// which therefore need writing back to media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyCounts {
    pub correctable_crc: PositionBitmap,
    pub uncorrectable_crc: PositionBitmap,
    pub correctable_lba_stamp: PositionBitmap,
    pub uncorrectable_lba_stamp: PositionBitmap,
    pub correctable_coherency: PositionBitmap,
    pub uncorrectable_coherency: PositionBitmap,
    pub correctable_media: PositionBitmap,
    /// Positions holding sectors that were already invalidated by an
    /// earlier loss (no new damage)
    pub previously_invalidated: PositionBitmap,
    pub modified: PositionBitmap,
}

impl VerifyCounts {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    pub fn any_correctable(&self) -> PositionBitmap {
        self.correctable_crc
            .union(self.correctable_lba_stamp)
            .union(self.correctable_coherency)
            .union(self.correctable_media)
    }

    pub fn any_uncorrectable(&self) -> PositionBitmap {
        self.uncorrectable_crc
            .union(self.uncorrectable_lba_stamp)
            .union(self.uncorrectable_coherency)
    }

    /// Fold another pass worth of counts into this accumulator
    pub fn merge(&mut self, other: &VerifyCounts) {
        self.correctable_crc = self.correctable_crc.union(other.correctable_crc);
        self.uncorrectable_crc = self.uncorrectable_crc.union(other.uncorrectable_crc);
        self.correctable_lba_stamp = self.correctable_lba_stamp.union(other.correctable_lba_stamp);
        self.uncorrectable_lba_stamp = self
            .uncorrectable_lba_stamp
            .union(other.uncorrectable_lba_stamp);
        self.correctable_coherency = self.correctable_coherency.union(other.correctable_coherency);
        self.uncorrectable_coherency = self
            .uncorrectable_coherency
            .union(other.uncorrectable_coherency);
        self.correctable_media = self.correctable_media.union(other.correctable_media);
        self.previously_invalidated = self
            .previously_invalidated
            .union(other.previously_invalidated);
        self.modified = self.modified.union(other.modified);
    }
}

/// Result of one full-strip verify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub status: XorStatus,
    pub counts: VerifyCounts,
}

// =============================================================================
// Sector and strip model
// =============================================================================

/// One logical block with its metadata as the engine sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sector {
    pub payload: BytesMut,
    pub crc: u16,
    pub lba_stamp: u16,
    /// Carries the invalidated pattern from an earlier uncorrectable loss
    pub invalidated: bool,
}

impl Sector {
    /// Build a well-formed data sector
    pub fn for_data(lba: Lba, payload: &[u8]) -> Self {
        let payload = BytesMut::from(payload);
        let crc = Self::compute_crc(&payload);
        Self {
            payload,
            crc,
            lba_stamp: Self::stamp_for(lba),
            invalidated: false,
        }
    }

    /// Zero-filled well-formed sector of `len` bytes
    pub fn zeroed(lba: Lba, len: usize) -> Self {
        Self::for_data(lba, &vec![0u8; len])
    }

    /// 16-bit fold of the payload
    pub fn compute_crc(payload: &[u8]) -> u16 {
        let mut crc: u16 = 0x5eed;
        for (i, b) in payload.iter().enumerate() {
            crc = crc.rotate_left(1) ^ ((*b as u16) << ((i & 1) * 8));
        }
        crc
    }

    /// Stamp derived from the block address
    pub fn stamp_for(lba: Lba) -> u16 {
        (lba ^ (lba >> 16) ^ (lba >> 32) ^ (lba >> 48)) as u16
    }

    pub fn crc_ok(&self) -> bool {
        self.crc == Self::compute_crc(&self.payload)
    }

    pub fn stamp_ok(&self, lba: Lba) -> bool {
        self.lba_stamp == Self::stamp_for(lba)
    }

    /// Overwrite with the invalidated pattern after an uncorrectable loss
    pub fn invalidate(&mut self) {
        self.payload.fill(0);
        self.crc = Self::compute_crc(&self.payload);
        self.lba_stamp = 0;
        self.invalidated = true;
    }
}

/// All live columns of one stripe range, indexed by position.
///
/// A `None` column is a dead or excluded position with no buffer.
#[derive(Debug, Clone)]
pub struct Strip {
    pub start_lba: Lba,
    pub columns: Vec<Option<Vec<Sector>>>,
}

impl Strip {
    pub fn new(start_lba: Lba, width: u32) -> Self {
        Self {
            start_lba,
            columns: vec![None; width as usize],
        }
    }

    /// Block depth of the strip (longest live column)
    pub fn depth(&self) -> usize {
        self.columns
            .iter()
            .flatten()
            .map(|c| c.len())
            .max()
            .unwrap_or(0)
    }

    pub fn column(&self, position: u32) -> Option<&Vec<Sector>> {
        self.columns.get(position as usize).and_then(|c| c.as_ref())
    }

    pub fn column_mut(&mut self, position: u32) -> Option<&mut Vec<Sector>> {
        self.columns
            .get_mut(position as usize)
            .and_then(|c| c.as_mut())
    }

    /// Positions with a live buffer
    pub fn live_positions(&self) -> PositionBitmap {
        let mut bm = PositionBitmap::EMPTY;
        for (pos, col) in self.columns.iter().enumerate() {
            if col.is_some() {
                bm.insert(pos as u32);
            }
        }
        bm
    }
}

// =============================================================================
// Engine trait
// =============================================================================

/// The checksum/reconstruction boundary consumed by the state machines
pub trait XorEngine {
    /// Validate checksums and lba stamps on the given positions without
    /// touching data; populates `regions` on mismatch.
    fn check_checksum(
        &self,
        strip: &Strip,
        positions: PositionBitmap,
        regions: &mut ErrorRegionList,
    ) -> Result<XorStatus>;

    /// Full verify of one strip: validate every live sector, check
    /// coherency, reconstruct what redundancy allows, invalidate what it
    /// does not, and describe everything in `regions`.
    ///
    /// `media_positions` marks the subset of `dead_positions` that failed
    /// with a persistent media error rather than device absence; their
    /// contents are rebuilt into the strip so a write-back can remap the
    /// bad sectors.
    fn verify_strip(
        &self,
        strip: &mut Strip,
        geometry: &RaidGeometry,
        dead_positions: PositionBitmap,
        media_positions: PositionBitmap,
        regions: &mut ErrorRegionList,
    ) -> Result<VerifyOutcome>;
}

// =============================================================================
// Tests
// =============================================================================
