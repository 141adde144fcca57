//! Verify / recovery-verify state machine
//!
//! One pass reads every live position across the pass range, hands the
//! strip to the XOR engine, writes corrected positions back when the
//! request allows it, and advances to the next pass when strip mining.
//! Damage beyond redundancy drops the machine into region mining: passes
//! clamped to the optimal block size so one bad region cannot poison a
//! whole range's worth of buffers.
//!
//! ```text
//! Allocate ─▶ AllocateWait ─▶ SetupResources ─▶ DispatchReads ─▶ EvaluateReads
//!                                   ▲                                │
//!                                   │(mining / re-read / next pass)  ▼
//!            StripMineAdvance ◀─ EvaluateWrites ◀─ DispatchWrites ◀─ XorVerify
//!                    │                                                │
//!                    ▼                                                ▼
//!              ReportErrors ─▶ Done                             DecideWrites
//! ```

use tracing::{debug, info, instrument, warn};

use crate::arena::{AllocOutcome, BufferGrant};
use crate::error::Result;
use crate::fru::info::ResourcePlan;
use crate::fru::{Fruts, Opcode};
use crate::geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};
use crate::report::{report_errors, report_retried_errors, ReportContext};
use crate::xor::{Strip, VerifyCounts};

use super::{
    get_fruts_error, Algorithm, ChainRole, FruErrorStatus, ParentView, RequestOpcode, Siots,
    StateStatus, StepCtx, Vcts,
};

/// Default page granularity for scatter-gather planning
pub const DEFAULT_BLOCKS_PER_PAGE: u32 = 8;

/// Terminal result of a verify machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyCompletion {
    Success { wrote_corrections: bool },
    Aborted,
    Shutdown,
    Unexpected,
    /// The caller should retry with an expanded, aligned range
    MediaError { media_error_lba: Lba },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifyState {
    Allocate,
    AllocateWait,
    SetupResources,
    DispatchReads,
    EvaluateReads,
    XorVerify,
    DecideWrites,
    DispatchWrites,
    EvaluateWrites,
    StripMineAdvance,
    ReportErrors,
    Done,
}

/// The verify / recovery-verify engine over one siots
pub struct VerifyMachine {
    pub siots: Siots,
    state: VerifyState,
    grant: Option<BufferGrant>,
    pending_alloc: Option<Result<BufferGrant>>,
    completion: Option<VerifyCompletion>,
    /// Arena blocks needed up front, computed at construction so a
    /// resource-insufficient condition surfaces as a distinct error
    plan_blocks: BlockCount,
    strip_mining: bool,
    /// Classified bitmaps of the most recent XOR pass
    pass_counts: VerifyCounts,
    /// Checksum-error positions before the single-error-recovery re-read
    prior_crc_positions: PositionBitmap,
    pub is_metadata_op: bool,
    pub in_vault_zone: bool,
}

impl VerifyMachine {
    /// Plain, error, read-only, or degraded verify over one range
    pub fn new(
        geometry: RaidGeometry,
        algorithm: Algorithm,
        opcode: RequestOpcode,
        start_lba: Lba,
        xfer_count: BlockCount,
    ) -> Result<Self> {
        let siots = Siots::new(geometry, algorithm, opcode, start_lba, xfer_count)?;
        Self::build(siots)
    }

    /// Recovery verify spawned from a failed read. The parent view is a
    /// read-only snapshot: geometry inheritance and the already-buffered
    /// ranges, no live back-pointer.
    pub fn recovery(
        geometry: RaidGeometry,
        opcode: RequestOpcode,
        start_lba: Lba,
        xfer_count: BlockCount,
        parent: ParentView,
    ) -> Result<Self> {
        let mut siots = Siots::new(
            geometry,
            Algorithm::RecoveryVerify,
            opcode,
            start_lba,
            xfer_count,
        )?;
        siots.degraded_bitmap = parent.degraded_bitmap;
        siots.parent = Some(parent);
        Self::build(siots)
    }

    fn build(mut siots: Siots) -> Result<Self> {
        let geometry = siots.geometry().clone();
        let strip_mining = siots.xfer_count > geometry.region_size();
        if strip_mining {
            siots.parity_count = geometry.region_size();
        }
        let blocks_per_page = DEFAULT_BLOCKS_PER_PAGE;
        let plan = if strip_mining {
            ResourcePlan::for_strip_mine(&geometry, siots.parity_start, blocks_per_page)?
        } else if let Some(parent) = siots.parent.as_ref() {
            ResourcePlan::for_recovery_verify(
                &geometry,
                siots.parity_start,
                siots.parity_count,
                &parent.read_ranges,
                blocks_per_page,
            )?
        } else {
            ResourcePlan::for_verify(
                &geometry,
                siots.parity_start,
                siots.parity_count,
                blocks_per_page,
            )?
        };
        Ok(Self {
            siots,
            state: VerifyState::Allocate,
            grant: None,
            pending_alloc: None,
            completion: None,
            plan_blocks: plan.total_blocks,
            strip_mining,
            pass_counts: VerifyCounts::default(),
            prior_crc_positions: PositionBitmap::EMPTY,
            is_metadata_op: false,
            in_vault_zone: false,
        })
    }

    /// Terminal result once `step` has returned `Done`
    pub fn completion(&self) -> Option<VerifyCompletion> {
        self.completion
    }

    /// Deliver a pending allocation from the arena
    pub fn on_allocation(&mut self, result: Result<BufferGrant>) {
        self.pending_alloc = Some(result);
    }

    fn complete(&mut self, ctx: &mut StepCtx<'_>, completion: VerifyCompletion) -> StateStatus {
        if let Some(grant) = self.grant.take() {
            ctx.arena.release(grant);
        }
        info!(?completion, "verify complete");
        self.completion = Some(completion);
        self.state = VerifyState::Done;
        StateStatus::Done
    }

    /// Drive the machine one state forward
    #[instrument(skip_all, fields(state = ?self.state, lba = self.siots.parity_start))]
    pub fn step(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        match self.state {
            VerifyState::Allocate => self.state_allocate(ctx),
            VerifyState::AllocateWait => self.state_allocate_wait(ctx),
            VerifyState::SetupResources => self.state_setup_resources(),
            VerifyState::DispatchReads => self.state_dispatch_reads(ctx),
            VerifyState::EvaluateReads => self.state_evaluate_reads(ctx),
            VerifyState::XorVerify => self.state_xor_verify(ctx),
            VerifyState::DecideWrites => self.state_decide_writes(),
            VerifyState::DispatchWrites => self.state_dispatch_writes(ctx),
            VerifyState::EvaluateWrites => self.state_evaluate_writes(ctx),
            VerifyState::StripMineAdvance => self.state_strip_mine_advance(ctx),
            VerifyState::ReportErrors => self.state_report_errors(ctx),
            VerifyState::Done => StateStatus::Done,
        }
    }

    fn state_allocate(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted {
            return self.complete(ctx, VerifyCompletion::Aborted);
        }
        match ctx.arena.allocate(self.plan_blocks) {
            Err(e) => {
                warn!(error = %e, "verify allocation failed");
                self.complete(ctx, VerifyCompletion::Unexpected)
            }
            Ok(AllocOutcome::Immediate(grant)) => {
                self.grant = Some(grant);
                self.state = VerifyState::SetupResources;
                StateStatus::Executing
            }
            Ok(AllocOutcome::Pending(_)) => {
                self.state = VerifyState::AllocateWait;
                StateStatus::Waiting
            }
        }
    }

    fn state_allocate_wait(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        // Abort, then quiesce, then the allocation result. An aborted or
        // quiescing request must never touch memory the allocation may
        // have failed to deliver.
        if self.siots.flags.aborted {
            return self.complete(ctx, VerifyCompletion::Aborted);
        }
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        match self.pending_alloc.take() {
            None => StateStatus::Waiting,
            Some(Err(e)) => {
                warn!(error = %e, "deferred allocation failed");
                self.complete(ctx, VerifyCompletion::Unexpected)
            }
            Some(Ok(grant)) => {
                self.grant = Some(grant);
                self.state = VerifyState::SetupResources;
                StateStatus::Executing
            }
        }
    }

    fn state_setup_resources(&mut self) -> StateStatus {
        let geometry = self.siots.geometry().clone();
        let (lba, blocks) = (self.siots.parity_start, self.siots.parity_count);
        self.siots.read_chain.clear();
        for position in 0..geometry.width() {
            let opcode = if self.siots.degraded_bitmap.contains(position) {
                Opcode::Nop
            } else {
                Opcode::Read
            };
            self.siots
                .read_chain
                .push(Fruts::new(position, lba, blocks, opcode));
        }
        self.siots.write_chain.clear();
        self.siots.strip = Some(Strip::new(lba, geometry.width()));
        self.siots.eboard.reset();
        self.siots.flags.error_pending = false;
        self.state = VerifyState::DispatchReads;
        StateStatus::Executing
    }

    fn state_dispatch_reads(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        // A drive may have died while we waited for resources.
        let degraded = self.siots.degraded_bitmap;
        self.siots.read_chain.set_nop(degraded);
        if degraded.count() > self.siots.geometry().parity_count() {
            return self.complete(ctx, VerifyCompletion::Shutdown);
        }
        let active = self.siots.read_chain.active_count();
        if active == 0 {
            return self.complete(ctx, VerifyCompletion::Shutdown);
        }
        self.siots.wait_count = active;
        let mut failed_position = None;
        for fruts in self.siots.read_chain.iter() {
            if fruts.opcode == Opcode::Nop {
                continue;
            }
            if let Err(e) = ctx.edge.submit(fruts) {
                warn!(position = fruts.position, error = %e, "read submit failed");
                failed_position = Some(fruts.position);
                break;
            }
        }
        if failed_position.is_some() {
            return self.complete(ctx, VerifyCompletion::Unexpected);
        }
        debug!(active, "reads dispatched");
        self.state = VerifyState::EvaluateReads;
        StateStatus::Waiting
    }

    fn state_evaluate_reads(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.flags.aborted && !self.siots.opcode.is_media_modify() {
            return self.complete(ctx, VerifyCompletion::Aborted);
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
                self.state = VerifyState::XorVerify;
                StateStatus::Executing
            }
            FruErrorStatus::Retry => self.retry_chain(ctx, ChainRole::Read),
            FruErrorStatus::Waiting => StateStatus::Waiting,
            FruErrorStatus::Error => self.handle_read_error(ctx),
            FruErrorStatus::Aborted => self.complete(ctx, VerifyCompletion::Aborted),
            FruErrorStatus::Dead | FruErrorStatus::Shutdown => {
                self.complete(ctx, VerifyCompletion::Shutdown)
            }
            FruErrorStatus::Unexpected => self.complete(ctx, VerifyCompletion::Unexpected),
        }
    }

    /// Re-dispatch the positions in the retry bucket, or escalate them to
    /// degraded once the budget is spent.
    fn retry_chain(&mut self, ctx: &mut StepCtx<'_>, role: ChainRole) -> StateStatus {
        let retry = self.siots.eboard.retry_err_bitmap;
        if self.siots.retries_remaining == 0 {
            warn!(positions = %retry, "retry budget spent, escalating to degraded");
            self.siots.add_degraded(retry);
            if self.siots.degraded_bitmap.count() > self.siots.geometry().parity_count() {
                return self.complete(ctx, VerifyCompletion::Shutdown);
            }
            self.siots.chain_mut(role).set_nop(retry);
            self.state = match role {
                ChainRole::Write => VerifyState::StripMineAdvance,
                _ => VerifyState::XorVerify,
            };
            return StateStatus::Executing;
        }
        self.siots.retries_remaining -= 1;
        let count = self.siots.chain_mut(role).reset_positions_for_retry(retry);
        self.siots.wait_count = count;
        self.siots.flags.error_pending = false;
        let mut submit_failed = false;
        for fruts in self.siots.chain(role).iter() {
            if fruts.opcode != Opcode::Nop && !fruts.is_complete() {
                if ctx.edge.submit(fruts).is_err() {
                    submit_failed = true;
                    break;
                }
            }
        }
        if submit_failed {
            return self.complete(ctx, VerifyCompletion::Unexpected);
        }
        debug!(positions = %retry, remaining = self.siots.retries_remaining, "retry dispatched");
        StateStatus::Waiting
    }

    /// Hard-media or drop damage on the read pass
    fn handle_read_error(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        let geometry = self.siots.geometry().clone();
        let optimal = geometry.optimal_block_size() as BlockCount;
        if self.siots.algorithm == Algorithm::DegradedVerify
            && self.siots.parity_count % optimal != 0
        {
            // Unaligned degraded verify cannot region-mine; fail back so
            // the caller retries with an expanded, aligned range.
            let lba = self
                .siots
                .read_chain
                .min_media_error_lba()
                .unwrap_or(self.siots.parity_start);
            return self.complete(ctx, VerifyCompletion::MediaError { media_error_lba: lba });
        }
        if !self.siots.flags.single_region_mode && self.siots.parity_count > optimal {
            info!(
                hard_media = %self.siots.eboard.hard_media_err_bitmap,
                "entering region mining"
            );
            self.siots.flags.single_region_mode = true;
            self.siots.flags.single_error_recovery = true;
            self.strip_mining = true;
            self.siots.parity_count = optimal;
            self.state = VerifyState::SetupResources;
            return StateStatus::Executing;
        }
        // Region-sized pass already: treat the failed positions as missing
        // columns and let redundancy decide.
        self.state = VerifyState::XorVerify;
        StateStatus::Executing
    }

    fn state_xor_verify(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        let geometry = self.siots.geometry().clone();
        let dead = self
            .siots
            .degraded_bitmap
            .union(self.siots.eboard.hard_media_err_bitmap)
            .union(self.siots.eboard.drop_err_bitmap);
        if self.siots.vcts.is_none() {
            self.siots.vcts = Some(Vcts::default());
        }
        let media = self.siots.eboard.hard_media_err_bitmap;
        let outcome = match (&mut self.siots.strip, &mut self.siots.vcts) {
            (Some(strip), Some(vcts)) => {
                ctx.xor
                    .verify_strip(strip, &geometry, dead, media, &mut vcts.regions)
            }
            _ => return self.complete(ctx, VerifyCompletion::Unexpected),
        };
        let outcome = match outcome {
            Err(e) => {
                warn!(error = %e, "xor verify failed");
                return self.complete(ctx, VerifyCompletion::Unexpected);
            }
            Ok(outcome) => outcome,
        };

        if !self.siots.flags.single_error_recovery
            && !outcome.counts.correctable_crc.is_empty()
            && !self.siots.algorithm.is_read_only()
        {
            // One bounded re-read distinguishes transient checksum damage
            // from real sector damage before anything is written back.
            self.siots.flags.single_error_recovery = true;
            self.prior_crc_positions = outcome.counts.correctable_crc;
            self.siots.vcts_mut().regions.clear();
            debug!(positions = %self.prior_crc_positions, "re-reading after checksum errors");
            self.state = VerifyState::SetupResources;
            return StateStatus::Executing;
        }

        if self.siots.flags.single_error_recovery && !self.prior_crc_positions.is_empty() {
            let still_bad = outcome
                .counts
                .correctable_crc
                .union(outcome.counts.any_uncorrectable());
            let cleared = self.prior_crc_positions.difference(still_bad);
            let vcts = self.siots.vcts_mut();
            vcts.retried_crc_bitmask = vcts.retried_crc_bitmask.union(cleared);
            self.prior_crc_positions = PositionBitmap::EMPTY;
        }

        self.pass_counts = outcome.counts;
        let vcts = self.siots.vcts_mut();
        vcts.counts.merge(&outcome.counts);
        vcts.pass_count += 1;
        self.state = VerifyState::DecideWrites;
        StateStatus::Executing
    }

    fn state_decide_writes(&mut self) -> StateStatus {
        let modified = self
            .pass_counts
            .modified
            .difference(self.siots.degraded_bitmap);
        if self.siots.opcode == RequestOpcode::Read
            && !self.pass_counts.any_correctable().is_empty()
        {
            // Correctable damage found on a read path: the owner schedules
            // an out-of-band remap verify instead of us writing here.
            self.siots.owner.remap_needed = true;
        }
        let defer_for_media = self.siots.eboard.hard_media_err_count > 0
            && self.siots.algorithm == Algorithm::RecoveryVerify;
        let skip = modified.is_empty()
            || self.siots.algorithm.is_read_only()
            || self.siots.opcode == RequestOpcode::Read
            || defer_for_media;
        if skip {
            self.state = VerifyState::StripMineAdvance;
            return StateStatus::Executing;
        }
        let write_opcode = if self.siots.algorithm == Algorithm::Verify {
            Opcode::WriteVerify
        } else {
            Opcode::Write
        };
        let (lba, blocks) = (self.siots.parity_start, self.siots.parity_count);
        self.siots.write_chain.clear();
        for position in modified.iter_positions() {
            self.siots
                .write_chain
                .push(Fruts::new(position, lba, blocks, write_opcode));
        }
        self.state = VerifyState::DispatchWrites;
        StateStatus::Executing
    }

    fn state_dispatch_writes(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        // Quiesce is honored before the write-back becomes irreversible;
        // abort is not, a half-applied correction would leave parity
        // inconsistent.
        if self.siots.flags.quiesce_requested {
            self.siots.flags.quiesced = true;
            return StateStatus::Waiting;
        }
        self.siots.flags.error_pending = false;
        self.siots.wait_count = self.siots.write_chain.active_count();
        let mut submit_failed = false;
        for fruts in self.siots.write_chain.iter() {
            if fruts.opcode != Opcode::Nop {
                if ctx.edge.submit(fruts).is_err() {
                    submit_failed = true;
                    break;
                }
            }
        }
        if submit_failed {
            return self.complete(ctx, VerifyCompletion::Unexpected);
        }
        debug!(count = self.siots.wait_count, "correction writes dispatched");
        self.state = VerifyState::EvaluateWrites;
        StateStatus::Waiting
    }

    fn state_evaluate_writes(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.siots.wait_count > 0 {
            return StateStatus::Waiting;
        }
        match get_fruts_error(&mut self.siots, ChainRole::Write) {
            FruErrorStatus::Success => {
                self.siots.flags.wrote_corrections = true;
                self.state = VerifyState::StripMineAdvance;
                StateStatus::Executing
            }
            FruErrorStatus::Error => {
                if self.siots.eboard.hard_media_err_count > 0 {
                    let lba = self
                        .siots
                        .write_chain
                        .min_media_error_lba()
                        .unwrap_or(self.siots.parity_start);
                    self.complete(ctx, VerifyCompletion::MediaError { media_error_lba: lba })
                } else {
                    self.complete(ctx, VerifyCompletion::Unexpected)
                }
            }
            FruErrorStatus::Retry => self.retry_chain(ctx, ChainRole::Write),
            FruErrorStatus::Waiting => StateStatus::Waiting,
            FruErrorStatus::Aborted => self.complete(ctx, VerifyCompletion::Aborted),
            FruErrorStatus::Dead | FruErrorStatus::Shutdown => {
                self.complete(ctx, VerifyCompletion::Shutdown)
            }
            FruErrorStatus::Unexpected => self.complete(ctx, VerifyCompletion::Unexpected),
        }
    }

    /// True when the range is worked in more than one pass; such machines
    /// report at every pass boundary so the region list starts each pass
    /// empty instead of accumulating against its bound.
    fn multi_pass(&self) -> bool {
        self.strip_mining || self.siots.flags.single_region_mode
    }

    fn state_strip_mine_advance(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if self.multi_pass() {
            self.report_pass(ctx);
            if let Some(vcts) = self.siots.vcts.as_mut() {
                vcts.regions.clear();
            }
        }
        let next = self.siots.parity_start + self.siots.parity_count;
        let end = self.siots.start_lba + self.siots.xfer_count;
        if next >= end {
            self.state = VerifyState::ReportErrors;
            return StateStatus::Executing;
        }
        // only a mining machine has more than one pass
        debug_assert!(self.multi_pass());
        let optimal = self.siots.geometry().optimal_block_size() as BlockCount;
        let region = self.siots.geometry().region_size();
        let per_pass = if self.siots.flags.single_region_mode {
            optimal
        } else {
            region
        };
        self.siots.parity_start = next;
        self.siots.parity_count = (end - next).min(per_pass);
        self.siots.flags.single_error_recovery = false;
        self.siots.flags.error_pending = false;
        debug!(
            parity_start = self.siots.parity_start,
            parity_count = self.siots.parity_count,
            "advancing to next pass"
        );
        self.state = VerifyState::SetupResources;
        StateStatus::Executing
    }

    fn report_pass(&self, ctx: &mut StepCtx<'_>) {
        let Some(vcts) = self.siots.vcts.as_ref() else {
            return;
        };
        let geometry = self.siots.geometry();
        let report_ctx = ReportContext {
            geometry,
            parity_start: self.siots.parity_start,
            parity_count: self.siots.parity_count,
            is_metadata_op: self.is_metadata_op,
            incomplete_write: self.siots.owner.incomplete_write,
            is_background: self.siots.algorithm.is_read_only(),
            in_vault_zone: self.in_vault_zone,
        };
        // The accumulated counts would re-report earlier passes through
        // the eboard fallback on a clean pass; per-pass counts cannot.
        report_errors(&report_ctx, Some(&vcts.regions), &self.pass_counts, ctx.sink);
    }

    fn state_report_errors(&mut self, ctx: &mut StepCtx<'_>) -> StateStatus {
        if let Some(vcts) = self.siots.vcts.take() {
            let geometry = self.siots.geometry().clone();
            let report_ctx = ReportContext {
                geometry: &geometry,
                parity_start: self.siots.start_lba,
                parity_count: self.siots.xfer_count,
                is_metadata_op: self.is_metadata_op,
                incomplete_write: self.siots.owner.incomplete_write,
                is_background: self.siots.algorithm.is_read_only(),
                in_vault_zone: self.in_vault_zone,
            };
            if !self.multi_pass() {
                report_errors(&report_ctx, Some(&vcts.regions), &vcts.counts, ctx.sink);
            }
            report_retried_errors(&report_ctx, vcts.retried_crc_bitmask, ctx.sink);

            // When the only damage found was sectors already invalidated by
            // an earlier loss, the pending remap would be busywork.
            if self.siots.owner.remap_needed
                && vcts.counts.any_correctable().is_empty()
                && vcts.counts.any_uncorrectable().is_empty()
                && !vcts.counts.previously_invalidated.is_empty()
            {
                self.siots.owner.remap_needed = false;
            }
            self.siots.vcts = Some(vcts);
        }
        let wrote_corrections = self.siots.flags.wrote_corrections;
        self.complete(ctx, VerifyCompletion::Success { wrote_corrections })
    }
}

// =============================================================================
// Tests
// =============================================================================
