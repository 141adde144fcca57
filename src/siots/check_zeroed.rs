//! Check-zeroed state machine
//!
//! Asks every live position whether a stripe range is still all-zero
//! before the owner commits to a full rebuild. Degraded and
//! rebuild-logging positions are excluded from the question; for a
//! rebuild request they are explicitly zeroed afterwards so the whole
//! stripe is consistent when `Zeroed` is returned. This machine performs
//! no retries of its own, any device error is forwarded as a terminal
//! status and the caller falls back to the full rebuild path.

use tracing::{debug, instrument, warn};

use crate::arena::{AllocOutcome, BufferGrant};
use crate::error::Result;
use crate::fru::info::ResourcePlan;
use crate::fru::{Fruts, Opcode};
use crate::geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};

use super::verify::DEFAULT_BLOCKS_PER_PAGE;
use super::{
    get_fruts_error, Algorithm, ChainRole, FruErrorStatus, RequestOpcode, Siots, StateStatus,
    StepCtx,
};

/// Terminal result of a check-zeroed machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckZeroedCompletion {
    /// Every live position is zeroed (and, for a rebuild request, the
    /// excluded positions have been zeroed to match)
    Zeroed,
    /// At least one position holds data; fall back to a full rebuild
    NotZeroed,
    /// A device error ended the question early
    Error,
    Aborted,
    Shutdown,
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckZeroedState {
    Init,
    AllocateWait,
    IssueCheckZero,
    EvaluateCheckZero,
    IssueZeroToDegraded,
    EvaluateZero,
    Done,
}

pub struct CheckZeroedMachine {
    pub siots: Siots,
    state: CheckZeroedState,
    grant: Option<BufferGrant>,
    pending_alloc: Option<Result<BufferGrant>>,
    completion: Option<CheckZeroedCompletion>,
    /// Positions the check-zero opcode was actually issued to
    issued: PositionBitmap,
    plan_blocks: BlockCount,
}

impl CheckZeroedMachine {
    pub fn new(
        geometry: RaidGeometry,
        opcode: RequestOpcode,
        start_lba: Lba,
        xfer_count: BlockCount,
    ) -> Result<Self> {
        let plan = ResourcePlan::for_verify(&geometry, start_lba, xfer_count, DEFAULT_BLOCKS_PER_PAGE)?;
        let siots = Siots::new(
            geometry,
            Algorithm::CheckZeroed,
            opcode,
            start_lba,
            xfer_count,
        )?;
        Ok(Self {
            siots,
            state: CheckZeroedState::Init,
            grant: None,
            pending_alloc: None,
            completion: None,
            issued: PositionBitmap::EMPTY,
            plan_blocks: plan.total_blocks,
        })
    }

    pub fn completion(&self) -> Option<CheckZeroedCompletion> {
        self.completion
    }

    pub fn on_allocation(&mut self, result: Result<BufferGrant>) {
        self.pending_alloc = Some(result);
    }

    fn complete(
        &mut self,
        ctx: &mut StepCtx<'_>,
        completion: CheckZeroedCompletion,
    ) -> StateStatus {
        if let Some(grant) = self.grant.take() {
            ctx.arena.release(grant);
        }
        debug!(?completion, "check zeroed complete");
        self.completion = Some(completion);
        self.state = CheckZeroedState::Done;
        StateStatus::Done
    }

    #[instrument(skip_all, fields(state = ?self.state, lba = self.siots.start_lba))]
    pub fn step(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        match self.state {
            CheckZeroedState::Init => self.state_init(ctx),
            CheckZeroedState::AllocateWait => self.state_allocate_wait(ctx),
            CheckZeroedState::IssueCheckZero => self.state_issue_check_zero(ctx),
            CheckZeroedState::EvaluateCheckZero => self.state_evaluate_check_zero(ctx),
            CheckZeroedState::IssueZeroToDegraded => self.state_issue_zero_to_degraded(ctx),
            CheckZeroedState::EvaluateZero => self.state_evaluate_zero(ctx),
            CheckZeroedState::Done => StateStatus::Done,
        }
    }

    fn state_init(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, CheckZeroedCompletion::Aborted);
        }
        match ctx.arena.allocate(self.plan_blocks) {
            Err(e) => {
                warn!(error = %e, "check zeroed allocation failed");
                self.complete(ctx, CheckZeroedCompletion::Unexpected)
            }
            Ok(AllocOutcome::Immediate(grant)) => {
                self.grant = Some(grant);
                self.state = CheckZeroedState::IssueCheckZero;
                StateStatus::Executing
            }
            Ok(AllocOutcome::Pending(_)) => {
                self.state = CheckZeroedState::AllocateWait;
                StateStatus::Waiting
            }
        }
    }

    fn state_allocate_wait(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, CheckZeroedCompletion::Aborted);
        }
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        match self.pending_alloc.take() {
            None => StateStatus::Waiting,
            Some(Err(e)) => {
                warn!(error = %e, "deferred allocation failed");
                self.complete(ctx, CheckZeroedCompletion::Unexpected)
            }
            Some(Ok(grant)) => {
                self.grant = Some(grant);
                self.state = CheckZeroedState::IssueCheckZero;
                StateStatus::Executing
            }
        }
    }

    /// The question only goes to positions that can answer it: degraded
    /// positions have no media, rebuild-logging positions are being
    /// rewritten underneath us.
    fn state_issue_check_zero(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        let geometry = self.siots.geometry().clone();
        let excluded = self
            .siots
            .degraded_bitmap
            .union(self.siots.rebuild_logging_bitmap);
        let (lba, blocks) = (self.siots.start_lba, self.siots.xfer_count);
        self.siots.read_chain.clear();
        self.issued = PositionBitmap::EMPTY;
        for position in 0..geometry.width() {
            let opcode = if excluded.contains(position) {
                Opcode::Nop
            } else {
                self.issued.insert(position);
                Opcode::CheckZeroed
            };
            self.siots
                .read_chain
                .push(Fruts::new(position, lba, blocks, opcode));
        }
        if self.issued.is_empty() {
            return self.complete(ctx, CheckZeroedCompletion::Shutdown);
        }
        self.siots.eboard.reset();
        self.siots.flags.error_pending = false;
        self.siots.wait_count = self.siots.read_chain.active_count();
        let mut submit_failed = false;
        for fruts in self.siots.read_chain.iter() {
            if fruts.opcode != Opcode::Nop {
                if ctx.edge.submit(fruts).is_err() {
                    submit_failed = true;
                    break;
                }
            }
        }
        if submit_failed {
            return self.complete(ctx, CheckZeroedCompletion::Unexpected);
        }
        debug!(issued = %self.issued, "check zero dispatched");
        self.state = CheckZeroedState::EvaluateCheckZero;
        StateStatus::Waiting
    }

    fn state_evaluate_check_zero(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, CheckZeroedCompletion::Aborted);
        }
        if self.siots.wait_count > 0 {
            return StateStatus::Waiting;
        }
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        // A zeroed qualifier is a success, so the eboard pass below only
        // runs when something actually failed.
        if self.siots.flags.error_pending {
            match get_fruts_error(&mut self.siots, ChainRole::Read) {
                FruErrorStatus::Success => {}
                FruErrorStatus::Waiting => return StateStatus::Waiting,
                FruErrorStatus::Aborted => {
                    return self.complete(ctx, CheckZeroedCompletion::Aborted)
                }
                FruErrorStatus::Dead | FruErrorStatus::Shutdown => {
                    return self.complete(ctx, CheckZeroedCompletion::Shutdown)
                }
                FruErrorStatus::Unexpected => {
                    return self.complete(ctx, CheckZeroedCompletion::Unexpected)
                }
                // no retries here; the caller falls back to a full rebuild
                FruErrorStatus::Error | FruErrorStatus::Retry => {
                    return self.complete(ctx, CheckZeroedCompletion::Error)
                }
            }
        } else {
            self.siots.eboard.reset();
            let monitor = self.siots.monitor_initiated;
            let Siots {
                eboard, read_chain, ..
            } = &mut self.siots;
            if !eboard.aggregate_chain(read_chain, monitor) {
                return self.complete(ctx, CheckZeroedCompletion::Unexpected);
            }
        }
        if self.siots.eboard.zeroed_bitmap != self.issued {
            debug!(
                zeroed = %self.siots.eboard.zeroed_bitmap,
                issued = %self.issued,
                "stripe holds data"
            );
            return self.complete(ctx, CheckZeroedCompletion::NotZeroed);
        }
        let excluded = self
            .siots
            .degraded_bitmap
            .union(self.siots.rebuild_logging_bitmap);
        if self.siots.opcode == RequestOpcode::Rebuild && !excluded.is_empty() {
            self.state = CheckZeroedState::IssueZeroToDegraded;
            StateStatus::Executing
        } else {
            self.complete(ctx, CheckZeroedCompletion::Zeroed)
        }
    }

    /// A rebuild request must leave the whole stripe zeroed, including the
    /// positions the question skipped.
    fn state_issue_zero_to_degraded(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        let excluded = self
            .siots
            .degraded_bitmap
            .union(self.siots.rebuild_logging_bitmap);
        let (lba, blocks) = (self.siots.start_lba, self.siots.xfer_count);
        self.siots.write_chain.clear();
        for position in excluded.iter_positions() {
            self.siots
                .write_chain
                .push(Fruts::new(position, lba, blocks, Opcode::Zero));
        }
        self.siots.eboard.reset();
        self.siots.flags.error_pending = false;
        self.siots.wait_count = self.siots.write_chain.active_count();
        let mut submit_failed = false;
        for fruts in self.siots.write_chain.iter() {
            if ctx.edge.submit(fruts).is_err() {
                submit_failed = true;
                break;
            }
        }
        if submit_failed {
            return self.complete(ctx, CheckZeroedCompletion::Unexpected);
        }
        self.state = CheckZeroedState::EvaluateZero;
        StateStatus::Waiting
    }

    fn state_evaluate_zero(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.wait_count > 0 {
            return StateStatus::Waiting;
        }
        match get_fruts_error(&mut self.siots, ChainRole::Write) {
            FruErrorStatus::Success => self.complete(ctx, CheckZeroedCompletion::Zeroed),
            FruErrorStatus::Waiting => StateStatus::Waiting,
            FruErrorStatus::Aborted => self.complete(ctx, CheckZeroedCompletion::Aborted),
            FruErrorStatus::Dead | FruErrorStatus::Shutdown => {
                self.complete(ctx, CheckZeroedCompletion::Shutdown)
            }
            FruErrorStatus::Unexpected => self.complete(ctx, CheckZeroedCompletion::Unexpected),
            FruErrorStatus::Error | FruErrorStatus::Retry => {
                self.complete(ctx, CheckZeroedCompletion::Error)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ImmediateArena;
    use crate::fru::{DiskEdge, FrutsResult, SuccessQualifier};
    use crate::report::RecordingSink;
    use crate::xor::RowParityEngine;
    use assert_matches::assert_matches;

    fn geom() -> RaidGeometry {
        RaidGeometry::row_parity(5, 8, 64).unwrap()
    }

    #[derive(Default)]
    struct CaptureEdge {
        submitted: Vec<Fruts>,
    }

    impl DiskEdge for CaptureEdge {
        fn submit(&mut self, fruts: &Fruts) -> Result<()> {
            self.submitted.push(fruts.clone());
            Ok(())
        }
    }

    fn drive(
        machine: &mut CheckZeroedMachine,
        edge: &mut CaptureEdge,
        arena: &ImmediateArena,
    ) -> StateStatus {
        let xor = RowParityEngine::new();
        let sink = RecordingSink::new();
        loop {
            let mut ctx = StepCtx {
                arena,
                edge,
                xor: &xor,
                sink: &sink,
            };
            match machine.step(&mut ctx) {
                StateStatus::Executing => continue,
                other => return other,
            }
        }
    }

    fn complete_all(machine: &mut CheckZeroedMachine, role: ChainRole, result: FrutsResult) {
        let positions: Vec<u32> = machine
            .siots
            .chain(role)
            .iter()
            .filter(|f| f.opcode != Opcode::Nop)
            .map(|f| f.position)
            .collect();
        for position in positions {
            machine.siots.record_completion(role, position, result, None);
        }
    }

    #[test]
    fn test_all_zeroed_without_degraded() {
        let mut machine =
            CheckZeroedMachine::new(geom(), RequestOpcode::CheckZero, 0, 64).unwrap();
        let mut edge = CaptureEdge::default();
        let arena = ImmediateArena::new();
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Waiting);
        assert_eq!(edge.submitted.len(), 5);
        complete_all(
            &mut machine,
            ChainRole::Read,
            FrutsResult::Success {
                qualifier: SuccessQualifier::Zeroed,
            },
        );
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Done);
        assert_matches!(machine.completion(), Some(CheckZeroedCompletion::Zeroed));
    }

    #[test]
    fn test_one_position_holds_data() {
        let mut machine =
            CheckZeroedMachine::new(geom(), RequestOpcode::CheckZero, 0, 64).unwrap();
        let mut edge = CaptureEdge::default();
        let arena = ImmediateArena::new();
        drive(&mut machine, &mut edge, &arena);
        // four zeroed, one plain success (has data)
        for position in 0..4 {
            machine.siots.record_completion(
                ChainRole::Read,
                position,
                FrutsResult::Success {
                    qualifier: SuccessQualifier::Zeroed,
                },
                None,
            );
        }
        machine.siots.record_completion(
            ChainRole::Read,
            4,
            FrutsResult::Success {
                qualifier: SuccessQualifier::None,
            },
            None,
        );
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Done);
        assert_matches!(machine.completion(), Some(CheckZeroedCompletion::NotZeroed));
    }

    #[test]
    fn test_rebuild_zeroes_excluded_positions() {
        let mut machine = CheckZeroedMachine::new(geom(), RequestOpcode::Rebuild, 0, 64).unwrap();
        machine.siots.add_degraded(PositionBitmap::from_position(1));
        let mut edge = CaptureEdge::default();
        let arena = ImmediateArena::new();
        drive(&mut machine, &mut edge, &arena);
        // the degraded position was never asked
        assert!(edge.submitted.iter().all(|f| f.position != 1));
        complete_all(
            &mut machine,
            ChainRole::Read,
            FrutsResult::Success {
                qualifier: SuccessQualifier::Zeroed,
            },
        );
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Waiting);
        // now an explicit zero goes to the degraded position
        let zero = edge.submitted.last().unwrap();
        assert_eq!(zero.position, 1);
        assert_eq!(zero.opcode, Opcode::Zero);
        complete_all(
            &mut machine,
            ChainRole::Write,
            FrutsResult::Success {
                qualifier: SuccessQualifier::None,
            },
        );
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Done);
        assert_matches!(machine.completion(), Some(CheckZeroedCompletion::Zeroed));
    }

    #[test]
    fn test_check_zero_request_skips_degraded_zeroing() {
        let mut machine =
            CheckZeroedMachine::new(geom(), RequestOpcode::CheckZero, 0, 64).unwrap();
        machine.siots.add_degraded(PositionBitmap::from_position(2));
        let mut edge = CaptureEdge::default();
        let arena = ImmediateArena::new();
        drive(&mut machine, &mut edge, &arena);
        complete_all(
            &mut machine,
            ChainRole::Read,
            FrutsResult::Success {
                qualifier: SuccessQualifier::Zeroed,
            },
        );
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Done);
        assert_matches!(machine.completion(), Some(CheckZeroedCompletion::Zeroed));
        assert!(edge.submitted.iter().all(|f| f.opcode != Opcode::Zero));
    }

    #[test]
    fn test_device_error_forwards_without_retry() {
        let mut machine =
            CheckZeroedMachine::new(geom(), RequestOpcode::CheckZero, 0, 64).unwrap();
        let mut edge = CaptureEdge::default();
        let arena = ImmediateArena::new();
        drive(&mut machine, &mut edge, &arena);
        for position in 0..4 {
            machine.siots.record_completion(
                ChainRole::Read,
                position,
                FrutsResult::Success {
                    qualifier: SuccessQualifier::Zeroed,
                },
                None,
            );
        }
        machine.siots.record_completion(
            ChainRole::Read,
            4,
            FrutsResult::MediaError {
                no_remap: false,
                blocks_transferred: 0,
            },
            None,
        );
        assert_eq!(drive(&mut machine, &mut edge, &arena), StateStatus::Done);
        assert_matches!(machine.completion(), Some(CheckZeroedCompletion::Error));
        // exactly one dispatch cycle, no retries
        assert_eq!(edge.submitted.len(), 5);
    }
}
