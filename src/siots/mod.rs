//! Sub-I/O Transfer State: the per-stripe-range recovery engine
//!
//! One [`Siots`] is the context of one stripe-range operation inside a
//! larger request. The state machines built on it follow a single model:
//!
//! ```text
//! owner ──new()──▶ machine ──step()──▶ Executing (step again)
//!                     ▲                Waiting   (park; resume on event)
//!                     │                Done      (read the completion)
//!        on_allocation/on_completion/grant_continue
//! ```
//!
//! A machine's state function is invoked at most once at a time and never
//! re-entered; parallelism comes from running many independent siots. Each
//! suspension point re-validates aborted and quiesced on resume before
//! touching anything else.

pub mod check_zeroed;
pub mod fru_error;
pub mod small_read;
pub mod verify;

pub use check_zeroed::{CheckZeroedCompletion, CheckZeroedMachine};
pub use fru_error::{get_fruts_error, handle_dead_error, FruErrorStatus};
pub use small_read::{RecoveryHandoff, SmallReadCompletion, SmallReadMachine};
pub use verify::{VerifyCompletion, VerifyMachine};

use tracing::debug;

use crate::arena::Arena;
use crate::eboard::FruEboard;
use crate::error::{Error, Result};
use crate::fru::info::ParentRange;
use crate::fru::{DiskEdge, FrutsChain, FrutsResult, SuccessQualifier};
use crate::geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};
use crate::report::EventSink;
use crate::xor::{ErrorRegionList, Sector, Strip, VerifyCounts, XorEngine};

// =============================================================================
// Scheduling primitives
// =============================================================================

/// Result of one step of a state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateStatus {
    /// More work immediately available; step again
    Executing,
    /// Parked on an allocation, I/O completion, continuation, or quiesce
    Waiting,
    /// Terminal state reached; the completion is available
    Done,
}

/// Borrowed collaborators handed to every step invocation
pub struct StepCtx<'a> {
    pub arena: &'a dyn Arena,
    pub edge: &'a mut dyn DiskEdge,
    pub xor: &'a dyn XorEngine,
    pub sink: &'a dyn EventSink,
}

// =============================================================================
// Algorithm / opcode tags
// =============================================================================

/// Which state-machine flavor owns this siots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    SmallRead,
    /// Foreground verify; corrections are written back with write-verify
    Verify,
    /// Background verify that must not touch media
    ReadOnlyVerify,
    /// Verify launched to chase a known error population
    ErrorVerify,
    /// Verify spawned from a failed read to recover its data
    RecoveryVerify,
    /// Verify running below a missing drive; exempt from the alignment
    /// invariant
    DegradedVerify,
    CheckZeroed,
}

impl Algorithm {
    pub fn is_verify_family(self) -> bool {
        matches!(
            self,
            Algorithm::Verify
                | Algorithm::ReadOnlyVerify
                | Algorithm::ErrorVerify
                | Algorithm::RecoveryVerify
                | Algorithm::DegradedVerify
        )
    }

    /// Families that never write corrections back
    pub fn is_read_only(self) -> bool {
        matches!(self, Algorithm::ReadOnlyVerify)
    }
}

/// The owning request's operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOpcode {
    Read,
    Verify,
    WriteVerify,
    Rebuild,
    CheckZero,
}

impl RequestOpcode {
    /// Media-modify requests must decide for themselves whether to honor
    /// an abort, to avoid a half-applied write leaving parity inconsistent
    pub fn is_media_modify(self) -> bool {
        matches!(self, RequestOpcode::WriteVerify | RequestOpcode::Rebuild)
    }
}

/// Which fruts chain a completion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
    Read,
    Read2,
    Write,
}

// =============================================================================
// Flags and owner-visible state
// =============================================================================

/// Cooperative control flags, polled at every resume point
#[derive(Debug, Clone, Copy, Default)]
pub struct SiotsFlags {
    /// Advisory abort; polled, never preemptive
    pub aborted: bool,
    /// External monitor asked for a cooperative checkpoint
    pub quiesce_requested: bool,
    /// Parked at a quiesce checkpoint
    pub quiesced: bool,
    /// At least one completion this cycle was not a plain success
    pub error_pending: bool,
    /// Re-read cycle after a checksum error is in progress
    pub single_error_recovery: bool,
    /// Region mining: passes clamped to the optimal block size
    pub single_region_mode: bool,
    /// At least one correction was written back to media
    pub wrote_corrections: bool,
}

/// State recorded for the owning request to read at terminal time
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerState {
    /// Correctable damage was found on a read path; the owner should
    /// schedule an out-of-band remap verify
    pub remap_needed: bool,
    /// A media-modify request died mid-flight; parity may be inconsistent
    pub incomplete_write: bool,
    /// Dead positions observed by a monitor op that could not wait
    pub dead_bitmap: PositionBitmap,
}

/// Verify-control transfer state: the XOR error-region list plus the
/// classified bitmaps accumulated across passes
#[derive(Debug, Clone, Default)]
pub struct Vcts {
    pub regions: ErrorRegionList,
    pub counts: VerifyCounts,
    /// Positions whose checksum errors vanished on a re-read
    pub retried_crc_bitmask: PositionBitmap,
    pub pass_count: u32,
}

/// Read-only view of a parent siots taken at construction time.
///
/// A recovery verify spawned from a failed read inherits geometry and the
/// parent's already-buffered ranges through this snapshot; there is no
/// live back-pointer.
#[derive(Debug, Clone, Default)]
pub struct ParentView {
    pub read_ranges: Vec<ParentRange>,
    pub degraded_bitmap: PositionBitmap,
}

// =============================================================================
// Siots
// =============================================================================

/// One stripe-range operation's state-machine context
#[derive(Debug, Clone)]
pub struct Siots {
    geometry: RaidGeometry,
    pub algorithm: Algorithm,
    pub opcode: RequestOpcode,
    /// Logical start of the whole operation
    pub start_lba: Lba,
    /// Total blocks the operation covers
    pub xfer_count: BlockCount,
    /// Start of the current pass
    pub parity_start: Lba,
    /// Blocks in the current pass
    pub parity_count: BlockCount,
    /// Positions confirmed absent and excluded from normal I/O
    pub degraded_bitmap: PositionBitmap,
    /// Positions under active reconstruction
    pub rebuild_logging_bitmap: PositionBitmap,
    /// Positions the monitor has granted continuation past
    pub continue_granted: PositionBitmap,
    /// Positions the monitor must resolve before this siots is re-driven
    pub needs_continue_bitmask: PositionBitmap,
    /// This siots is the owning monitor's own operation
    pub monitor_initiated: bool,
    /// Outstanding completions in the current dispatch cycle
    pub wait_count: u32,
    pub flags: SiotsFlags,
    pub owner: OwnerState,
    pub read_chain: FrutsChain,
    pub read2_chain: FrutsChain,
    pub write_chain: FrutsChain,
    pub eboard: FruEboard,
    pub vcts: Option<Vcts>,
    /// Buffer view of the current pass, filled by read completions
    pub strip: Option<Strip>,
    pub parent: Option<ParentView>,
    /// Dispatch cycles left for transient failures
    pub retries_remaining: u32,
}

/// Default retry budget per siots
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

impl Siots {
    pub fn new(
        geometry: RaidGeometry,
        algorithm: Algorithm,
        opcode: RequestOpcode,
        start_lba: Lba,
        xfer_count: BlockCount,
    ) -> Result<Self> {
        let siots = Self {
            geometry,
            algorithm,
            opcode,
            start_lba,
            xfer_count,
            parity_start: start_lba,
            parity_count: xfer_count,
            degraded_bitmap: PositionBitmap::EMPTY,
            rebuild_logging_bitmap: PositionBitmap::EMPTY,
            continue_granted: PositionBitmap::EMPTY,
            needs_continue_bitmask: PositionBitmap::EMPTY,
            monitor_initiated: false,
            wait_count: 0,
            flags: SiotsFlags::default(),
            owner: OwnerState::default(),
            read_chain: FrutsChain::new(),
            read2_chain: FrutsChain::new(),
            write_chain: FrutsChain::new(),
            eboard: FruEboard::new(),
            vcts: None,
            strip: None,
            parent: None,
            retries_remaining: DEFAULT_RETRY_BUDGET,
        };
        siots.validate()?;
        Ok(siots)
    }

    pub fn geometry(&self) -> &RaidGeometry {
        &self.geometry
    }

    /// Structural invariants checked at construction and pass boundaries
    pub fn validate(&self) -> Result<()> {
        if self.xfer_count == 0 {
            return Err(Error::InvariantViolation("zero-length transfer".to_string()));
        }
        if self.algorithm != Algorithm::DegradedVerify
            && self.algorithm.is_verify_family()
            && self.parity_count % self.geometry.optimal_block_size() as BlockCount != 0
        {
            return Err(Error::InvariantViolation(format!(
                "pass count {} not aligned to optimal block size {}",
                self.parity_count,
                self.geometry.optimal_block_size()
            )));
        }
        Ok(())
    }

    pub fn chain(&self, role: ChainRole) -> &FrutsChain {
        match role {
            ChainRole::Read => &self.read_chain,
            ChainRole::Read2 => &self.read2_chain,
            ChainRole::Write => &self.write_chain,
        }
    }

    pub fn chain_mut(&mut self, role: ChainRole) -> &mut FrutsChain {
        match role {
            ChainRole::Read => &mut self.read_chain,
            ChainRole::Read2 => &mut self.read2_chain,
            ChainRole::Write => &mut self.write_chain,
        }
    }

    /// Positions eligible for normal I/O this pass
    pub fn live_positions(&self) -> PositionBitmap {
        self.geometry.all_positions().difference(self.degraded_bitmap)
    }

    /// Record a completion from the edge. Read data, when supplied, lands
    /// in the strip column for that position. Returns false for a
    /// completion that matches no outstanding fruts.
    pub fn record_completion(
        &mut self,
        role: ChainRole,
        position: u32,
        result: FrutsResult,
        data: Option<Vec<Sector>>,
    ) -> bool {
        let accepted = self.chain_mut(role).record_completion(position, result);
        if !accepted {
            return false;
        }
        match result {
            FrutsResult::Success {
                qualifier: SuccessQualifier::None | SuccessQualifier::Zeroed,
            } => {}
            _ => self.flags.error_pending = true,
        }
        if let (Some(strip), Some(sectors)) = (self.strip.as_mut(), data) {
            if (position as usize) < strip.columns.len() {
                strip.columns[position as usize] = Some(sectors);
            }
        }
        if self.wait_count > 0 {
            self.wait_count -= 1;
        }
        debug!(
            ?role,
            position,
            wait_count = self.wait_count,
            "completion recorded"
        );
        true
    }

    /// Advisory abort; observed at the next resume point
    pub fn abort(&mut self) {
        self.flags.aborted = true;
    }

    /// Cooperative checkpoint request from the monitor
    pub fn request_quiesce(&mut self) {
        self.flags.quiesce_requested = true;
    }

    /// Clear a quiesce and let the machine be re-driven
    pub fn unquiesce(&mut self) {
        self.flags.quiesce_requested = false;
        self.flags.quiesced = false;
    }

    /// Monitor resolution of a dead-drive wait: continuation granted for
    /// `positions`, which are now confirmed degraded.
    pub fn grant_continue(&mut self, positions: PositionBitmap) {
        self.continue_granted = self.continue_granted.union(positions);
        self.needs_continue_bitmask = self.needs_continue_bitmask.difference(positions);
        self.degraded_bitmap = self.degraded_bitmap.union(positions);
    }

    pub fn add_degraded(&mut self, positions: PositionBitmap) {
        self.degraded_bitmap = self.degraded_bitmap.union(positions);
    }

    /// Lazily create the vcts for this siots
    pub fn vcts_mut(&mut self) -> &mut Vcts {
        self.vcts.get_or_insert_with(Vcts::default)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fru::{Fruts, Opcode};
    use assert_matches::assert_matches;

    fn geom() -> RaidGeometry {
        RaidGeometry::row_parity(5, 64, 1024).unwrap()
    }

    #[test]
    fn test_siots_alignment_invariant() {
        assert!(Siots::new(geom(), Algorithm::Verify, RequestOpcode::Verify, 0, 128).is_ok());
        assert_matches!(
            Siots::new(geom(), Algorithm::Verify, RequestOpcode::Verify, 0, 100),
            Err(Error::InvariantViolation(_))
        );
        // degraded verify is exempt from the alignment rule
        assert!(Siots::new(
            geom(),
            Algorithm::DegradedVerify,
            RequestOpcode::Verify,
            0,
            100
        )
        .is_ok());
    }

    #[test]
    fn test_completion_bookkeeping() {
        let mut siots =
            Siots::new(geom(), Algorithm::Verify, RequestOpcode::Verify, 0, 128).unwrap();
        siots
            .read_chain
            .push(Fruts::new(0, 0, 128, Opcode::Read));
        siots.wait_count = 1;
        assert!(siots.record_completion(
            ChainRole::Read,
            0,
            FrutsResult::Failed { retryable: true },
            None
        ));
        assert_eq!(siots.wait_count, 0);
        assert!(siots.flags.error_pending);
        // unknown position is refused and does not touch wait_count
        assert!(!siots.record_completion(ChainRole::Read, 9, FrutsResult::Aborted, None));
    }

    #[test]
    fn test_grant_continue_resolves_wait_state() {
        let mut siots =
            Siots::new(geom(), Algorithm::Verify, RequestOpcode::Verify, 0, 128).unwrap();
        siots.needs_continue_bitmask = PositionBitmap::from_raw(0b0110);
        siots.grant_continue(PositionBitmap::from_raw(0b0010));
        assert_eq!(siots.needs_continue_bitmask, PositionBitmap::from_raw(0b0100));
        assert!(siots.degraded_bitmap.contains(1));
        assert!(siots.continue_granted.contains(1));
    }
}
