//! Error region / event reporting
//!
//! Translates XOR error regions and classified eboard state into
//! deduplicated, severity-tagged log events. Delivery through an
//! [`EventSink`] is fire-and-forget: a sink failure never fails the I/O.
//!
//! Two mutually exclusive strategies:
//!
//! - **region-based**, used whenever the XOR engine populated error
//!   regions: one event per (position, region) with a dedup rule so each
//!   physical cause is called home at most once, followed by a
//!   parity-invalidation sweep that unites region chains by LBA;
//! - **eboard-based fallback**, used only when no region list exists: one
//!   pass over positions driven by the classified bitmaps.

#[cfg(test)]
mod proptest;

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::geometry::{BlockCount, Lba, PositionBitmap, RaidGeometry};
use crate::xor::{ErrorRegionList, VerifyCounts, XorErrorKind};

// =============================================================================
// Events
// =============================================================================

/// How an event is surfaced to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// Triggers a call-home; persistent or data-loss conditions
    CallHome,
    Informational,
    /// Named exceptions that are intentionally not surfaced
    Suppressed,
}

/// What happened, from the operator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    CorrectableSectorError,
    UncorrectableSectorError,
    SectorReconstructed,
    SectorInvalidated,
    ParityReconstructed,
    /// A position that failed once but came clean on retry
    RetriedSectorError,
}

/// One emitted log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub kind: EventKind,
    pub severity: Severity,
    pub position: u32,
    pub lba: Lba,
    pub blocks: BlockCount,
    pub error: XorErrorKind,
    pub uncorrectable: bool,
}

/// Fire-and-forget event-log emission
pub trait EventSink {
    fn notify(&self, record: EventRecord);
}

/// Sink that forwards events to the tracing subscriber at a level derived
/// from severity
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, record: EventRecord) {
        match record.severity {
            Severity::CallHome => error!(
                kind = ?record.kind,
                position = record.position,
                lba = record.lba,
                blocks = record.blocks,
                error = ?record.error,
                "raid event"
            ),
            Severity::Informational => info!(
                kind = ?record.kind,
                position = record.position,
                lba = record.lba,
                blocks = record.blocks,
                error = ?record.error,
                "raid event"
            ),
            Severity::Suppressed => debug!(
                kind = ?record.kind,
                position = record.position,
                lba = record.lba,
                "suppressed raid event"
            ),
        }
    }
}

/// Sink that records every event, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.events.lock().clone()
    }

    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, record: EventRecord) {
        self.events.lock().push(record);
    }
}

// =============================================================================
// Report context and severity
// =============================================================================

/// Everything severity selection and the reporting walks need to know
/// about the operation being reported
#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub geometry: &'a RaidGeometry,
    /// Start of the reported pass (used when no region carries an lba)
    pub parity_start: Lba,
    pub parity_count: BlockCount,
    pub is_metadata_op: bool,
    /// A media-modify request died mid-flight; coherency errors are
    /// expected, not alarming
    pub incomplete_write: bool,
    /// Background (read-only) verify request
    pub is_background: bool,
    /// The range lies in the vault zone, where invalid-CRC damage is a
    /// known artifact and intentionally not surfaced
    pub in_vault_zone: bool,
}

/// Total severity function.
///
/// Every `(error kind, qualifiers)` combination maps to exactly one
/// severity; the vault-zone invalid-CRC suppression is the one named
/// exception that short-circuits the rest.
pub fn severity_for(ctx: &ReportContext<'_>, kind: XorErrorKind, uncorrectable: bool) -> Severity {
    if ctx.in_vault_zone && matches!(kind, XorErrorKind::CorruptCrc | XorErrorKind::Invalidated) {
        return Severity::Suppressed;
    }
    if uncorrectable {
        return Severity::CallHome;
    }
    match kind {
        // lba-stamp and unexpected checksum damage call home even when
        // redundancy absorbed them
        XorErrorKind::LbaStamp => Severity::CallHome,
        XorErrorKind::Crc | XorErrorKind::SingleBitCrc | XorErrorKind::MultiBitCrc => {
            Severity::CallHome
        }
        // deliberate error injection is never a drive fault
        XorErrorKind::CorruptCrc | XorErrorKind::CorruptData => Severity::Informational,
        XorErrorKind::SoftMedia => {
            if ctx.is_background {
                Severity::Suppressed
            } else {
                Severity::Informational
            }
        }
        XorErrorKind::HardMedia => Severity::Informational,
        XorErrorKind::Coherency
        | XorErrorKind::ParityOfChecksumCoherency
        | XorErrorKind::WriteStamp
        | XorErrorKind::TimeStamp
        | XorErrorKind::ShedStamp => {
            if ctx.incomplete_write || ctx.is_metadata_op {
                // expected while a half-applied write is being resolved
                Severity::Informational
            } else {
                Severity::CallHome
            }
        }
        XorErrorKind::RebuildFailed => Severity::CallHome,
        XorErrorKind::Invalidated => Severity::Informational,
    }
}

// =============================================================================
// Reporting entry points
// =============================================================================

/// Report everything one verify pass found. Selects the region-based
/// strategy when `regions` is populated, the eboard fallback otherwise.
pub fn report_errors(
    ctx: &ReportContext<'_>,
    regions: Option<&ErrorRegionList>,
    counts: &VerifyCounts,
    sink: &dyn EventSink,
) {
    match regions {
        Some(list) if !list.is_empty() => report_from_regions(ctx, list, sink),
        _ => report_from_counts(ctx, counts, sink),
    }
}

/// Positions that failed once but came clean on retry get one
/// informational event each; the bad-region table depends on these.
pub fn report_retried_errors(
    ctx: &ReportContext<'_>,
    retried: PositionBitmap,
    sink: &dyn EventSink,
) {
    for position in retried.iter_positions() {
        sink.notify(EventRecord {
            kind: EventKind::RetriedSectorError,
            severity: Severity::Informational,
            position,
            lba: ctx.parity_start,
            blocks: ctx.parity_count,
            error: XorErrorKind::Crc,
            uncorrectable: false,
        });
    }
}

/// Region-based reporting: every position crossed with every region
/// touching it, then the parity-invalidation sweep.
fn report_from_regions(ctx: &ReportContext<'_>, regions: &ErrorRegionList, sink: &dyn EventSink) {
    // Positions implicated by any uncorrectable region; correctable
    // events for these are skipped so one physical cause cannot call home
    // twice for the same position.
    let mut uncorrectable_positions = PositionBitmap::EMPTY;
    for region in regions.iter() {
        if region.uncorrectable {
            uncorrectable_positions = uncorrectable_positions.union(region.positions);
        }
    }

    let mut logged: HashSet<(u32, Lba)> = HashSet::new();
    let mut any_uncorrectable = false;
    for position in 0..ctx.geometry.width() {
        for region in regions.iter() {
            if !region.positions.contains(position) {
                continue;
            }
            if region.uncorrectable {
                if !logged.insert((position, region.lba)) {
                    continue;
                }
                any_uncorrectable = true;
                sink.notify(EventRecord {
                    kind: EventKind::UncorrectableSectorError,
                    severity: severity_for(ctx, region.kind, true),
                    position,
                    lba: region.lba,
                    blocks: region.blocks,
                    error: region.kind,
                    uncorrectable: true,
                });
                sink.notify(EventRecord {
                    kind: EventKind::SectorInvalidated,
                    severity: Severity::Informational,
                    position,
                    lba: region.lba,
                    blocks: region.blocks,
                    error: region.kind,
                    uncorrectable: true,
                });
            } else {
                if uncorrectable_positions.contains(position) {
                    // secondary-position dedup
                    continue;
                }
                let severity = severity_for(ctx, region.kind, false);
                if severity == Severity::Suppressed {
                    continue;
                }
                sink.notify(EventRecord {
                    kind: EventKind::CorrectableSectorError,
                    severity,
                    position,
                    lba: region.lba,
                    blocks: region.blocks,
                    error: region.kind,
                    uncorrectable: false,
                });
            }
        }
    }

    if any_uncorrectable {
        report_parity_invalidation(ctx, regions, sink);
    }
}

/// Unite chains of regions sharing an LBA to find the true uncorrectable
/// position set per stripe, and log a parity-reconstructed event for each
/// parity drive not already covered by its chain.
fn report_parity_invalidation(
    ctx: &ReportContext<'_>,
    regions: &ErrorRegionList,
    sink: &dyn EventSink,
) {
    let slice = regions.as_slice();
    let mut traversed = vec![false; slice.len()];
    for i in 0..slice.len() {
        if traversed[i] || !slice[i].uncorrectable {
            continue;
        }
        traversed[i] = true;
        let lba = slice[i].lba;
        let mut union = slice[i].positions;
        for (j, other) in slice.iter().enumerate() {
            if j != i && !traversed[j] && other.lba == lba {
                union = union.union(other.positions);
                traversed[j] = true;
            }
        }
        let mut parity_targets = vec![ctx.geometry.row_parity_position()];
        if let Some(diag) = ctx.geometry.diagonal_parity_position() {
            parity_targets.push(diag);
        }
        for parity_pos in parity_targets {
            if !union.contains(parity_pos) {
                sink.notify(EventRecord {
                    kind: EventKind::ParityReconstructed,
                    severity: Severity::Informational,
                    position: parity_pos,
                    lba,
                    blocks: slice[i].blocks,
                    error: XorErrorKind::Invalidated,
                    uncorrectable: false,
                });
            }
        }
    }
}

/// Eboard-based fallback: one walk over positions, driven by the
/// classified bitmaps.
fn report_from_counts(ctx: &ReportContext<'_>, counts: &VerifyCounts, sink: &dyn EventSink) {
    let uncorrectable = counts.any_uncorrectable();
    let correctable = counts.any_correctable();
    let mut parity_logged = false;

    for position in 0..ctx.geometry.width() {
        if uncorrectable.contains(position) {
            let kind = if counts.uncorrectable_lba_stamp.contains(position) {
                XorErrorKind::LbaStamp
            } else if counts.uncorrectable_coherency.contains(position) {
                XorErrorKind::Coherency
            } else {
                XorErrorKind::Crc
            };
            sink.notify(EventRecord {
                kind: EventKind::UncorrectableSectorError,
                severity: severity_for(ctx, kind, true),
                position,
                lba: ctx.parity_start,
                blocks: ctx.parity_count,
                error: kind,
                uncorrectable: true,
            });
            if ctx.geometry.is_parity(position) {
                // one combined parity event per stripe, even when both
                // parity drives are implicated
                if !parity_logged {
                    parity_logged = true;
                    sink.notify(EventRecord {
                        kind: EventKind::ParityReconstructed,
                        severity: Severity::Informational,
                        position,
                        lba: ctx.parity_start,
                        blocks: ctx.parity_count,
                        error: kind,
                        uncorrectable: true,
                    });
                }
            } else {
                sink.notify(EventRecord {
                    kind: EventKind::SectorInvalidated,
                    severity: Severity::Informational,
                    position,
                    lba: ctx.parity_start,
                    blocks: ctx.parity_count,
                    error: kind,
                    uncorrectable: true,
                });
            }
        } else if correctable.contains(position) {
            let kind = if counts.correctable_lba_stamp.contains(position) {
                XorErrorKind::LbaStamp
            } else if counts.correctable_coherency.contains(position) {
                XorErrorKind::Coherency
            } else if counts.correctable_media.contains(position) {
                XorErrorKind::SoftMedia
            } else {
                XorErrorKind::Crc
            };
            let severity = severity_for(ctx, kind, false);
            if severity == Severity::Suppressed {
                continue;
            }
            sink.notify(EventRecord {
                kind: EventKind::CorrectableSectorError,
                severity,
                position,
                lba: ctx.parity_start,
                blocks: ctx.parity_count,
                error: kind,
                uncorrectable: false,
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
