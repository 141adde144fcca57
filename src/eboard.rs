//! Error aggregation board
//!
//! Accumulates per-position error state from a completed fruts chain into
//! actionable categories. Each position lands in at most one primary
//! category per evaluation pass, though positions can move between retry
//! and dead across passes.

use tracing::{debug, warn};

use crate::fru::{FrutsChain, FrutsResult, Opcode, SuccessQualifier};
use crate::geometry::PositionBitmap;

/// Per-position error bitmaps and counts for one evaluation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FruEboard {
    /// Device absent, not retryable
    pub dead_err_bitmap: PositionBitmap,
    pub dead_err_count: u32,
    /// Transient failures worth another dispatch cycle
    pub retry_err_bitmap: PositionBitmap,
    pub retry_err_count: u32,
    /// Persistent sector failures
    pub hard_media_err_bitmap: PositionBitmap,
    pub hard_media_err_count: u32,
    /// Subset of hard media errors the drive could not remap
    pub menr_err_bitmap: PositionBitmap,
    pub menr_err_count: u32,
    /// Drive-recovered sector failures (remap wanted)
    pub soft_media_err_count: u32,
    /// Optional requests shed by the edge
    pub drop_err_bitmap: PositionBitmap,
    pub drop_err_count: u32,
    /// Client aborts observed below
    pub abort_err_count: u32,
    /// Check-zero responses reporting an all-zero range
    pub zeroed_bitmap: PositionBitmap,
    pub zeroed_count: u32,
    pub timeout_err_count: u32,
    pub unexpected_err_count: u32,
}

impl FruEboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything ahead of a new evaluation pass
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True when the pass recorded no error of any category
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }

    /// Classify every completed fruts in `chain` into this eboard.
    ///
    /// Nop fruts are skipped (assumed success). Returns false when an
    /// unexpected condition was encountered (unknown completion shape or a
    /// fruts without a completion); the unexpected count is bumped either
    /// way and the caller maps false to its unexpected-error path.
    ///
    /// `monitor_initiated` aliases retryable failures on a timed-out edge
    /// to non-retryable, so a monitor op stops retrying and the monitor
    /// gets to observe the edge state change.
    pub fn aggregate_chain(&mut self, chain: &FrutsChain, monitor_initiated: bool) -> bool {
        let mut ok = true;
        for fruts in chain.iter() {
            if fruts.opcode == Opcode::Nop {
                continue;
            }
            let position = fruts.position;
            let Some(result) = fruts.result else {
                warn!(position, "aggregating a fruts with no completion");
                self.unexpected_err_count += 1;
                ok = false;
                continue;
            };
            match result {
                FrutsResult::Failed { retryable } => {
                    let retryable = if retryable && monitor_initiated && fruts.edge_timed_out {
                        warn!(
                            position,
                            lba = fruts.lba,
                            blocks = fruts.blocks,
                            "retryable error on timed-out edge, aliasing to dead"
                        );
                        false
                    } else {
                        retryable
                    };
                    if retryable {
                        if !self.retry_err_bitmap.contains(position) {
                            self.retry_err_bitmap.insert(position);
                            self.retry_err_count += 1;
                        }
                        debug!(position, lba = fruts.lba, "retryable error");
                    } else {
                        if !self.dead_err_bitmap.contains(position) {
                            self.dead_err_bitmap.insert(position);
                            self.dead_err_count += 1;
                        }
                        warn!(position, lba = fruts.lba, "non-retryable error");
                    }
                }
                FrutsResult::MediaError { no_remap, .. } => {
                    if no_remap {
                        self.menr_err_bitmap.insert(position);
                        self.menr_err_count += 1;
                    }
                    self.hard_media_err_bitmap.insert(position);
                    self.hard_media_err_count += 1;
                }
                FrutsResult::Dropped => {
                    self.drop_err_bitmap.insert(position);
                    self.drop_err_count += 1;
                }
                FrutsResult::Aborted => {
                    self.abort_err_count += 1;
                }
                FrutsResult::Success { qualifier } => match qualifier {
                    SuccessQualifier::None => {}
                    SuccessQualifier::RemapRequired => {
                        self.soft_media_err_count += 1;
                    }
                    SuccessQualifier::Zeroed => {
                        self.zeroed_bitmap.insert(position);
                        self.zeroed_count += 1;
                    }
                },
                FrutsResult::Timeout => {
                    self.timeout_err_count += 1;
                }
                FrutsResult::Invalid => {
                    self.unexpected_err_count += 1;
                    warn!(position, "invalid completion status on fruts");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Positions that failed this pass in any device category
    pub fn failed_positions(&self) -> PositionBitmap {
        self.dead_err_bitmap
            .union(self.retry_err_bitmap)
            .union(self.hard_media_err_bitmap)
            .union(self.drop_err_bitmap)
    }

    /// Move a position from the retry bucket to the dead bucket; used when
    /// a retry turned out impossible because the position is now known
    /// degraded.
    pub fn retry_to_dead(&mut self, position: u32) {
        if self.retry_err_bitmap.contains(position) {
            self.retry_err_bitmap.remove(position);
            self.retry_err_count = self.retry_err_count.saturating_sub(1);
            if !self.dead_err_bitmap.contains(position) {
                self.dead_err_bitmap.insert(position);
                self.dead_err_count += 1;
            }
        }
    }

    /// Move a position from the dead bucket to the retry bucket; used when
    /// a dead drive came back before a continuation arrived.
    pub fn dead_to_retry(&mut self, position: u32) {
        if self.dead_err_bitmap.contains(position) {
            self.dead_err_bitmap.remove(position);
            self.dead_err_count = self.dead_err_count.saturating_sub(1);
            if !self.retry_err_bitmap.contains(position) {
                self.retry_err_bitmap.insert(position);
                self.retry_err_count += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
