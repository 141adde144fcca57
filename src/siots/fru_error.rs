//! Eboard classification: fru-error-status reduction and dead-drive policy
//!
//! [`get_fruts_error`] reduces a completed fruts chain to one actionable
//! status for the owning state machine. [`handle_dead_error`] decides what
//! to do about positions that disappeared mid-operation: wait for the
//! monitor's continuation, retry positions that came back, proceed
//! degraded, or fail immediately for monitor-initiated operations.

use tracing::{debug, info, warn};

use super::{ChainRole, Siots};

/// Actionable classification of one completed dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FruErrorStatus {
    Success,
    Aborted,
    /// Hard-media or drop damage; the machine proceeds to XOR recovery
    Error,
    /// Transient failures worth another dispatch cycle
    Retry,
    /// Parked on a continuation or a quiesce
    Waiting,
    /// Monitor op hit a dead drive and cannot wait
    Dead,
    /// Degradation exceeds redundancy; the array cannot serve this range
    Shutdown,
    Unexpected,
}

/// Decide the fate of dead positions recorded in the eboard.
///
/// Returns one of `Waiting`, `Retry`, `Error`, `Dead`, or `Shutdown`:
///
/// - positions not yet resolved by the monitor park the siots
///   (`needs_continue_bitmask` is extended; monitor ops cannot wait on
///   themselves and fail with `Dead` instead);
/// - once continuation is in hand, dead bits are intersected with the
///   known-degraded set: confirmed bits proceed degraded (`Error`, or
///   `Shutdown` past the redundancy budget), bits that came back move to
///   the retry bucket (`Retry`).
pub fn handle_dead_error(siots: &mut Siots) -> FruErrorStatus {
    let dead = siots.eboard.dead_err_bitmap;
    debug_assert!(!dead.is_empty());

    let resolved = siots.degraded_bitmap.union(siots.continue_granted);
    let unresolved = dead.difference(resolved);

    if !unresolved.is_empty() {
        if siots.monitor_initiated {
            // The monitor cannot both wait on itself and make progress.
            if siots.opcode.is_media_modify() {
                siots.owner.incomplete_write = true;
            }
            siots.owner.dead_bitmap = siots.owner.dead_bitmap.union(dead);
            warn!(dead = %dead, "monitor op failing immediately on dead drive");
            return FruErrorStatus::Dead;
        }
        siots.needs_continue_bitmask = siots.needs_continue_bitmask.union(unresolved);
        info!(
            needs_continue = %siots.needs_continue_bitmask,
            "waiting for continuation past dead positions"
        );
        return FruErrorStatus::Waiting;
    }

    // Continuation received: re-evaluate against the confirmed-degraded set.
    let confirmed = dead.intersect(siots.degraded_bitmap);
    let came_back = dead.difference(siots.degraded_bitmap);
    for position in came_back.iter_positions() {
        siots.eboard.dead_to_retry(position);
        debug!(position, "dead position came back, moved to retry");
    }
    if confirmed.is_empty() {
        return FruErrorStatus::Retry;
    }
    if siots.degraded_bitmap.count() > siots.geometry().parity_count() {
        warn!(
            degraded = %siots.degraded_bitmap,
            "degradation exceeds redundancy"
        );
        return FruErrorStatus::Shutdown;
    }
    FruErrorStatus::Error
}

/// Reduce a completed chain to one [`FruErrorStatus`].
///
/// The decision order short-circuits; every branch below the eboard
/// aggregation assumes the chain is fully evaluated.
pub fn get_fruts_error(siots: &mut Siots, role: ChainRole) -> FruErrorStatus {
    // Cheap path: no completion raised an error flag, no scan needed.
    if !siots.flags.error_pending {
        return FruErrorStatus::Success;
    }

    siots.eboard.reset();
    let monitor = siots.monitor_initiated;
    let aggregated = match role {
        ChainRole::Read => siots.eboard.aggregate_chain(&siots.read_chain, monitor),
        ChainRole::Read2 => siots.eboard.aggregate_chain(&siots.read2_chain, monitor),
        ChainRole::Write => siots.eboard.aggregate_chain(&siots.write_chain, monitor),
    };
    if !aggregated {
        return FruErrorStatus::Unexpected;
    }

    // An aborted request bails out here unless it is a media-modify op,
    // which must decide for itself to avoid a half-applied write.
    if siots.flags.aborted && !siots.opcode.is_media_modify() {
        return FruErrorStatus::Aborted;
    }

    let mut status = FruErrorStatus::Success;
    if siots.eboard.soft_media_err_count > 0 || siots.eboard.hard_media_err_count > 0 {
        // Verifies already remap as they go; flagging them again would
        // spawn redundant remap requests.
        if !siots.algorithm.is_verify_family() {
            siots.owner.remap_needed = true;
        }
    }
    if siots.eboard.hard_media_err_count > 0 || siots.eboard.drop_err_count > 0 {
        status = FruErrorStatus::Error;
    }
    if siots.eboard.abort_err_count > 0 {
        return FruErrorStatus::Aborted;
    }

    if siots.eboard.dead_err_count == 0 && siots.eboard.retry_err_count == 0 {
        return status;
    }

    // A granted continuation can turn a pending retry into a confirmed
    // dead position; reclassify before consulting the policy.
    if siots.eboard.retry_err_count > 0 {
        let known_degraded = siots
            .eboard
            .retry_err_bitmap
            .intersect(siots.degraded_bitmap.intersect(siots.continue_granted));
        for position in known_degraded.iter_positions() {
            siots.eboard.retry_to_dead(position);
            debug!(position, "retry position is known degraded, moved to dead");
        }
    }

    if siots.eboard.dead_err_count > 0 {
        let dead_status = handle_dead_error(siots);
        // Retries drain first; the dead path is re-examined next pass.
        if siots.eboard.retry_err_count > 0
            && matches!(dead_status, FruErrorStatus::Error | FruErrorStatus::Retry)
        {
            return FruErrorStatus::Retry;
        }
        return dead_status;
    }

    // Only retryable errors remain.
    if siots.flags.quiesce_requested {
        if siots.monitor_initiated && siots.opcode.is_media_modify() {
            siots.owner.incomplete_write = true;
            siots.owner.dead_bitmap = siots.owner.dead_bitmap.union(siots.eboard.retry_err_bitmap);
            return FruErrorStatus::Dead;
        }
        siots.flags.quiesced = true;
        return FruErrorStatus::Waiting;
    }
    FruErrorStatus::Retry
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fru::{Fruts, FrutsResult, Opcode, SuccessQualifier};
    use crate::geometry::{PositionBitmap, RaidGeometry};
    use crate::siots::{Algorithm, RequestOpcode};

    fn siots_with_results(results: &[(u32, FrutsResult)]) -> Siots {
        let geometry = RaidGeometry::row_parity(5, 64, 1024).unwrap();
        let mut siots =
            Siots::new(geometry, Algorithm::Verify, RequestOpcode::Verify, 0, 128).unwrap();
        for (pos, result) in results {
            let mut f = Fruts::new(*pos, 0, 128, Opcode::Read);
            f.result = Some(*result);
            siots.read_chain.push(f);
        }
        siots.flags.error_pending = true;
        siots
    }

    fn ok() -> FrutsResult {
        FrutsResult::Success {
            qualifier: SuccessQualifier::None,
        }
    }

    #[test]
    fn test_clean_chain_short_circuits() {
        let mut siots = siots_with_results(&[(0, ok())]);
        siots.flags.error_pending = false;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Success);
    }

    #[test]
    fn test_two_dead_positions_wait_for_continuation() {
        let mut siots = siots_with_results(&[
            (0, ok()),
            (1, FrutsResult::Failed { retryable: false }),
            (2, FrutsResult::Failed { retryable: false }),
            (3, ok()),
            (4, ok()),
        ]);
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Waiting);
        assert_eq!(siots.needs_continue_bitmask, PositionBitmap::from_raw(0b00110));
    }

    #[test]
    fn test_dead_policy_is_idempotent() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: false })]);
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Waiting);
        let first = siots.needs_continue_bitmask;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Waiting);
        assert_eq!(siots.needs_continue_bitmask, first);
    }

    #[test]
    fn test_continuation_confirms_degraded() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: false })]);
        siots.grant_continue(PositionBitmap::from_position(1));
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Error);
    }

    #[test]
    fn test_came_back_position_moves_to_retry() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: false })]);
        // continuation granted for a different position only
        siots.continue_granted = PositionBitmap::from_position(1);
        // position 1 is not in the degraded set, so it "came back"
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Retry);
        assert!(siots.eboard.retry_err_bitmap.contains(1));
        assert_eq!(siots.eboard.dead_err_count, 0);
    }

    #[test]
    fn test_retry_takes_priority_over_confirmed_dead() {
        let mut siots = siots_with_results(&[
            (1, FrutsResult::Failed { retryable: false }),
            (2, FrutsResult::Failed { retryable: true }),
        ]);
        siots.grant_continue(PositionBitmap::from_position(1));
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Retry);
    }

    #[test]
    fn test_monitor_op_fails_immediately() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: false })]);
        siots.monitor_initiated = true;
        siots.opcode = RequestOpcode::Rebuild;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Dead);
        assert!(siots.owner.incomplete_write);
        assert!(siots.owner.dead_bitmap.contains(1));
        assert!(siots.needs_continue_bitmask.is_empty());
    }

    #[test]
    fn test_degradation_beyond_redundancy_shuts_down() {
        let mut siots = siots_with_results(&[
            (1, FrutsResult::Failed { retryable: false }),
            (2, FrutsResult::Failed { retryable: false }),
        ]);
        siots.grant_continue(PositionBitmap::from_raw(0b00110));
        assert_eq!(
            get_fruts_error(&mut siots, ChainRole::Read),
            FruErrorStatus::Shutdown
        );
    }

    #[test]
    fn test_abort_honored_except_media_modify() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: true })]);
        siots.flags.aborted = true;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Aborted);

        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: true })]);
        siots.flags.aborted = true;
        siots.opcode = RequestOpcode::Rebuild;
        // media-modify decides for itself: plain retry path
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Retry);
    }

    #[test]
    fn test_media_error_marks_remap_for_non_verify() {
        let mut siots = siots_with_results(&[(
            1,
            FrutsResult::MediaError {
                no_remap: false,
                blocks_transferred: 0,
            },
        )]);
        siots.algorithm = Algorithm::SmallRead;
        siots.opcode = RequestOpcode::Read;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Error);
        assert!(siots.owner.remap_needed);

        // verify family suppresses the redundant remap request
        let mut siots = siots_with_results(&[(
            1,
            FrutsResult::MediaError {
                no_remap: false,
                blocks_transferred: 0,
            },
        )]);
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Error);
        assert!(!siots.owner.remap_needed);
    }

    #[test]
    fn test_quiesce_parks_retryable_errors() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: true })]);
        siots.flags.quiesce_requested = true;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Waiting);
        assert!(siots.flags.quiesced);
    }

    #[test]
    fn test_quiesce_on_monitor_media_modify_is_dead() {
        let mut siots = siots_with_results(&[(1, FrutsResult::Failed { retryable: true })]);
        siots.flags.quiesce_requested = true;
        siots.monitor_initiated = true;
        siots.opcode = RequestOpcode::WriteVerify;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Dead);
        assert!(siots.owner.incomplete_write);
    }

    #[test]
    fn test_soft_media_alone_is_success() {
        let mut siots = siots_with_results(&[(
            1,
            FrutsResult::Success {
                qualifier: SuccessQualifier::RemapRequired,
            },
        )]);
        siots.algorithm = Algorithm::SmallRead;
        siots.opcode = RequestOpcode::Read;
        assert_eq!(get_fruts_error(&mut siots, ChainRole::Read), FruErrorStatus::Success);
        assert!(siots.owner.remap_needed);
    }
}
