//! Fru Transfer Unit: one per-disk-position I/O descriptor

use crate::geometry::{BlockCount, Lba, PositionBitmap};

// =============================================================================
// Opcode and completion results
// =============================================================================

/// Block operation carried by one fruts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Position is skipped this pass (degraded or not needed); always
    /// treated as success by aggregation
    Nop,
    Read,
    Write,
    /// Write with read-back verification, used when writing corrections
    WriteVerify,
    Zero,
    CheckZeroed,
}

impl Opcode {
    /// True for operations that modify media; these must decide for
    /// themselves whether to honor an abort mid-flight
    pub fn is_media_modify(self) -> bool {
        matches!(self, Opcode::Write | Opcode::WriteVerify | Opcode::Zero)
    }
}

/// Qualifier carried on a successful completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessQualifier {
    #[default]
    None,
    /// Drive recovered the sector itself; remap wanted (soft media error)
    RemapRequired,
    /// Check-zero response: the range is entirely zeroed
    Zeroed,
}

/// Completion of one fruts, status and qualifier folded into one tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrutsResult {
    Success {
        qualifier: SuccessQualifier,
    },
    /// Device failed the request; `retryable` distinguishes transient
    /// failures from device-absence
    Failed {
        retryable: bool,
    },
    /// Persistent sector failure. `no_remap` marks errors the drive could
    /// not remap; `blocks_transferred` is how far the request got before
    /// hitting the bad sector
    MediaError {
        no_remap: bool,
        blocks_transferred: BlockCount,
    },
    /// Optional request shed by the edge under load
    Dropped,
    /// Client abort observed by the edge
    Aborted,
    /// The request expired while outstanding
    Timeout,
    /// Malformed or rejected request; always unexpected here
    Invalid,
}

// =============================================================================
// Fruts
// =============================================================================

/// One pending or completed per-disk-position I/O.
///
/// Created during resource setup, dispatched once, evaluated once on
/// completion; a retry reuses the same structure for a new dispatch cycle.
#[derive(Debug, Clone)]
pub struct Fruts {
    pub position: u32,
    pub lba: Lba,
    pub blocks: BlockCount,
    pub opcode: Opcode,
    /// None while dispatched and not yet completed
    pub result: Option<FrutsResult>,
    /// Identifier of the scatter-gather list backing this transfer
    pub sg_id: u32,
    /// The block edge for this position has reported timeout errors;
    /// retryable failures on monitor ops get aliased to non-retryable so
    /// the monitor can run instead of retrying forever
    pub edge_timed_out: bool,
}

impl Fruts {
    pub fn new(position: u32, lba: Lba, blocks: BlockCount, opcode: Opcode) -> Self {
        Self {
            position,
            lba,
            blocks,
            opcode,
            result: None,
            sg_id: 0,
            edge_timed_out: false,
        }
    }

    /// True once a completion has been recorded
    pub fn is_complete(&self) -> bool {
        self.opcode == Opcode::Nop || self.result.is_some()
    }

    /// Clear completion state ahead of a retry dispatch
    pub fn reset_for_retry(&mut self) {
        self.result = None;
    }

    /// Media error lba for this fruts, valid only for MediaError results
    pub fn media_error_lba(&self) -> Option<Lba> {
        match self.result {
            Some(FrutsResult::MediaError {
                blocks_transferred, ..
            }) => Some(self.lba + blocks_transferred),
            _ => None,
        }
    }
}

// =============================================================================
// Chain
// =============================================================================

/// An ordered chain of fruts, one per participating disk position.
///
/// Insertion order is dispatch order; each position appears at most once.
#[derive(Debug, Clone, Default)]
pub struct FrutsChain {
    entries: Vec<Fruts>,
}

impl FrutsChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fruts: Fruts) {
        debug_assert!(
            self.get(fruts.position).is_none(),
            "position {} already chained",
            fruts.position
        );
        self.entries.push(fruts);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fruts> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Fruts> {
        self.entries.iter_mut()
    }

    pub fn get(&self, position: u32) -> Option<&Fruts> {
        self.entries.iter().find(|f| f.position == position)
    }

    pub fn get_mut(&mut self, position: u32) -> Option<&mut Fruts> {
        self.entries.iter_mut().find(|f| f.position == position)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Set of positions present in the chain (nops included)
    pub fn positions(&self) -> PositionBitmap {
        let mut bm = PositionBitmap::EMPTY;
        for f in &self.entries {
            bm.insert(f.position);
        }
        bm
    }

    /// Number of fruts that will actually be dispatched (non-nop)
    pub fn active_count(&self) -> u32 {
        self.entries.iter().filter(|f| f.opcode != Opcode::Nop).count() as u32
    }

    /// True once every non-nop fruts has a completion recorded
    pub fn all_complete(&self) -> bool {
        self.entries.iter().all(|f| f.is_complete())
    }

    /// Record a completion; returns false if the position is not chained
    /// or is a nop
    pub fn record_completion(&mut self, position: u32, result: FrutsResult) -> bool {
        match self.get_mut(position) {
            Some(f) if f.opcode != Opcode::Nop => {
                f.result = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Clear completions on the given positions for a retry cycle;
    /// returns how many fruts will be re-dispatched
    pub fn reset_positions_for_retry(&mut self, positions: PositionBitmap) -> u32 {
        let mut count = 0;
        for f in &mut self.entries {
            if positions.contains(f.position) && f.opcode != Opcode::Nop {
                f.reset_for_retry();
                count += 1;
            }
        }
        count
    }

    /// Demote the given positions to nop (degraded positions are not sent I/O)
    pub fn set_nop(&mut self, positions: PositionBitmap) {
        for f in &mut self.entries {
            if positions.contains(f.position) {
                f.opcode = Opcode::Nop;
                f.result = None;
            }
        }
    }

    /// Smallest media-error lba across the chain, if any fruts took one
    pub fn min_media_error_lba(&self) -> Option<Lba> {
        self.entries.iter().filter_map(|f| f.media_error_lba()).min()
    }
}

// =============================================================================
// Tests
// =============================================================================
