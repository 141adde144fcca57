//! Small-read state machine
//!
//! The degenerate fast path: a read contained within a single data
//! position. It allocates, dispatches exactly one read, and validates the
//! checksums. Anything that goes wrong, a dead drive, a media error, a
//! checksum mismatch, hands off to a recovery verify; this machine never
//! retries or reconstructs on its own.

use tracing::{debug, instrument, warn};

use crate::arena::{AllocOutcome, BufferGrant};
use crate::error::{Error, Result};
use crate::fru::info::{sg_bucket_for, ParentRange};
use crate::fru::{Fruts, Opcode};
use crate::geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};
use crate::xor::{ErrorRegionList, Strip, XorStatus};

use super::{
    get_fruts_error, Algorithm, ChainRole, FruErrorStatus, ParentView, RequestOpcode, Siots,
    StateStatus, StepCtx,
};

use super::verify::DEFAULT_BLOCKS_PER_PAGE;

/// Everything a recovery verify needs to take over from a failed small
/// read. The owner builds a [`super::VerifyMachine`] from this snapshot;
/// the small read keeps no live link to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryHandoff {
    pub verify_start: Lba,
    pub verify_count: BlockCount,
    /// Ranges this read already holds buffers for, so the recovery does
    /// not allocate them twice
    pub parent_ranges: Vec<ParentRange>,
    pub degraded_bitmap: PositionBitmap,
}

/// Terminal result of a small read
#[derive(Debug, Clone, PartialEq)]
pub enum SmallReadCompletion {
    Success,
    Aborted,
    Shutdown,
    Unexpected,
    /// The read could not be satisfied directly; recover through verify
    RecoveryHandoff(RecoveryHandoff),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmallReadState {
    Allocate,
    AllocateWait,
    Dispatch,
    EvaluateRead,
    CheckChecksum,
    Done,
}

#[derive(Debug)]
pub struct SmallReadMachine {
    pub siots: Siots,
    state: SmallReadState,
    /// Data position the read lands on
    target_position: u32,
    grant: Option<BufferGrant>,
    pending_alloc: Option<Result<BufferGrant>>,
    completion: Option<SmallReadCompletion>,
}

impl SmallReadMachine {
    pub fn new(
        geometry: RaidGeometry,
        target_position: u32,
        start_lba: Lba,
        xfer_count: BlockCount,
    ) -> Result<Self> {
        if target_position >= geometry.width() || geometry.is_parity(target_position) {
            return Err(Error::InvalidGeometry(format!(
                "small read target {} is not a data position",
                target_position
            )));
        }
        // Fail early when even the largest sg bucket cannot describe the
        // transfer; the caller falls back to a striped read.
        let elements =
            crate::fru::info::count_sg_elements(xfer_count, DEFAULT_BLOCKS_PER_PAGE);
        sg_bucket_for(elements)?;
        let siots = Siots::new(
            geometry,
            Algorithm::SmallRead,
            RequestOpcode::Read,
            start_lba,
            xfer_count,
        )?;
        Ok(Self {
            siots,
            state: SmallReadState::Allocate,
            target_position,
            grant: None,
            pending_alloc: None,
            completion: None,
        })
    }

    pub fn completion(&self) -> Option<&SmallReadCompletion> {
        self.completion.as_ref()
    }

    pub fn on_allocation(&mut self, result: Result<BufferGrant>) {
        self.pending_alloc = Some(result);
    }

    fn handoff(&self) -> RecoveryHandoff {
        let geometry = self.siots.geometry();
        let optimal = geometry.optimal_block_size() as BlockCount;
        // Expand to optimal-block alignment so the verify that takes over
        // satisfies the pass alignment rule.
        let verify_start = (self.siots.start_lba / optimal) * optimal;
        let end = self.siots.start_lba + self.siots.xfer_count;
        let verify_count = end.div_ceil(optimal) * optimal - verify_start;
        RecoveryHandoff {
            verify_start,
            verify_count,
            parent_ranges: vec![ParentRange {
                lba: self.siots.start_lba,
                blocks: self.siots.xfer_count,
            }],
            degraded_bitmap: self.siots.degraded_bitmap,
        }
    }

    /// Build the parent view a recovery verify is constructed with
    pub fn parent_view(&self) -> ParentView {
        let handoff = self.handoff();
        ParentView {
            read_ranges: handoff.parent_ranges,
            degraded_bitmap: handoff.degraded_bitmap,
        }
    }

    fn complete(&mut self, ctx: &mut StepCtx<'_>, completion: SmallReadCompletion) -> StateStatus {
        if let Some(grant) = self.grant.take() {
            ctx.arena.release(grant);
        }
        debug!(?completion, "small read complete");
        self.completion = Some(completion);
        self.state = SmallReadState::Done;
        StateStatus::Done
    }

    #[instrument(skip_all, fields(state = ?self.state, position = self.target_position))]
    pub fn step(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        match self.state {
            SmallReadState::Allocate => self.state_allocate(ctx),
            SmallReadState::AllocateWait => self.state_allocate_wait(ctx),
            SmallReadState::Dispatch => self.state_dispatch(ctx),
            SmallReadState::EvaluateRead => self.state_evaluate_read(ctx),
            SmallReadState::CheckChecksum => self.state_check_checksum(ctx),
            SmallReadState::Done => StateStatus::Done,
        }
    }

    fn state_allocate(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, SmallReadCompletion::Aborted);
        }
        match ctx.arena.allocate(self.siots.xfer_count) {
            Err(e) => {
                warn!(error = %e, "small read allocation failed");
                self.complete(ctx, SmallReadCompletion::Unexpected)
            }
            Ok(AllocOutcome::Immediate(grant)) => {
                self.grant = Some(grant);
                self.state = SmallReadState::Dispatch;
                StateStatus::Executing
            }
            Ok(AllocOutcome::Pending(_)) => {
                self.state = SmallReadState::AllocateWait;
                StateStatus::Waiting
            }
        }
    }

    fn state_allocate_wait(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, SmallReadCompletion::Aborted);
        }
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        match self.pending_alloc.take() {
            None => StateStatus::Waiting,
            Some(Err(e)) => {
                warn!(error = %e, "deferred allocation failed");
                self.complete(ctx, SmallReadCompletion::Unexpected)
            }
            Some(Ok(grant)) => {
                self.grant = Some(grant);
                self.state = SmallReadState::Dispatch;
                StateStatus::Executing
            }
        }
    }

    fn state_dispatch(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        // A target that died while we waited goes straight to recovery.
        if self.siots.degraded_bitmap.contains(self.target_position) {
            let handoff = self.handoff();
            return self.complete(ctx, SmallReadCompletion::RecoveryHandoff(handoff));
        }
        let width = self.siots.geometry().width();
        self.siots.read_chain.clear();
        self.siots.read_chain.push(Fruts::new(
            self.target_position,
            self.siots.start_lba,
            self.siots.xfer_count,
            Opcode::Read,
        ));
        self.siots.strip = Some(Strip::new(self.siots.start_lba, width));
        self.siots.eboard.reset();
        self.siots.flags.error_pending = false;
        self.siots.wait_count = 1;
        let submit = {
            let fruts = self.siots.read_chain.iter().next();
            match fruts {
                Some(fruts) => ctx.edge.submit(fruts),
                None => Ok(()),
            }
        };
        if let Err(e) = submit {
            warn!(error = %e, "small read submit failed");
            return self.complete(ctx, SmallReadCompletion::Unexpected);
        }
        self.state = SmallReadState::EvaluateRead;
        StateStatus::Waiting
    }

    fn state_evaluate_read(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, SmallReadCompletion::Aborted);
        }
        if self.siots.wait_count > 0 {
            return StateStatus::Waiting;
        }
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        match get_fruts_error(&mut self.siots, ChainRole::Read) {
            FruErrorStatus::Success => {
                self.state = SmallReadState::CheckChecksum;
                StateStatus::Executing
            }
            FruErrorStatus::Waiting => StateStatus::Waiting,
            FruErrorStatus::Aborted => self.complete(ctx, SmallReadCompletion::Aborted),
            FruErrorStatus::Shutdown => self.complete(ctx, SmallReadCompletion::Shutdown),
            FruErrorStatus::Unexpected => self.complete(ctx, SmallReadCompletion::Unexpected),
            // Dead, retryable, and media errors all resolve the same way:
            // this machine does not recover in place.
            FruErrorStatus::Error | FruErrorStatus::Retry | FruErrorStatus::Dead => {
                let handoff = self.handoff();
                self.complete(ctx, SmallReadCompletion::RecoveryHandoff(handoff))
            }
        }
    }

    fn state_check_checksum(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        let positions = PositionBitmap::from_position(self.target_position);
        let mut regions = ErrorRegionList::new();
        let status = match self.siots.strip.as_ref() {
            None => return self.complete(ctx, SmallReadCompletion::Unexpected),
            Some(strip) => ctx.xor.check_checksum(strip, positions, &mut regions),
        };
        match status {
            Err(e) => {
                warn!(error = %e, "checksum check failed");
                self.complete(ctx, SmallReadCompletion::Unexpected)
            }
            Ok(XorStatus::NoError) => self.complete(ctx, SmallReadCompletion::Success),
            Ok(XorStatus::ChecksumError) => {
                debug!(regions = regions.len(), "checksum mismatch on small read");
                let handoff = self.handoff();
                self.complete(ctx, SmallReadCompletion::RecoveryHandoff(handoff))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
