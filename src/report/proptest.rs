//! Property-Based Tests for Error Region Reporting
//!
//! Uses proptest to drive the region-based reporting walk with randomly
//! generated region lists and check its dedup guarantees.
//!
//! # Test Properties
//!
//! 1. **Call-home dedup**: at most one uncorrectable event per
//!    (position, lba) pair, however the regions overlap
//! 2. **Pairing**: every uncorrectable event is accompanied by exactly
//!    one sector-invalidated event for the same (position, lba)
//! 3. **Secondary-position dedup**: a position implicated by any
//!    uncorrectable region never also logs a correctable event
//! 4. **Containment**: every emitted event names a position that some
//!    region actually carries

#![cfg(test)]

use std::collections::HashSet;

use proptest::prelude::*;

use super::{report_errors, EventKind, RecordingSink, ReportContext};
use crate::geometry::{Lba, PositionBitmap, RaidGeometry};
use crate::xor::{ErrorRegion, ErrorRegionList, VerifyCounts, XorErrorKind};

// =============================================================================
// Property Strategies
// =============================================================================

const WIDTH: u32 = 6;

fn kind_strategy() -> impl Strategy<Value = XorErrorKind> {
    prop_oneof![
        Just(XorErrorKind::Crc),
        Just(XorErrorKind::LbaStamp),
        Just(XorErrorKind::Coherency),
        Just(XorErrorKind::SoftMedia),
        Just(XorErrorKind::Invalidated),
    ]
}

/// Strategy for one region over a small lba window and position universe,
/// so collisions between regions are common rather than rare.
fn region_strategy() -> impl Strategy<Value = ErrorRegion> {
    (0u64..8, 1u64..=4, kind_strategy(), any::<bool>(), 1u16..(1 << WIDTH)).prop_map(
        |(lba, blocks, kind, uncorrectable, raw)| ErrorRegion {
            lba,
            blocks,
            kind,
            uncorrectable,
            positions: PositionBitmap::from_raw(raw),
        },
    )
}

fn region_list_strategy() -> impl Strategy<Value = ErrorRegionList> {
    prop::collection::vec(region_strategy(), 1..10).prop_map(|regions| {
        let mut list = ErrorRegionList::new();
        for region in regions {
            list.push(region);
        }
        list
    })
}

fn report(regions: &ErrorRegionList) -> Vec<super::EventRecord> {
    let geometry = RaidGeometry::row_parity(WIDTH, 2, 4).unwrap();
    let ctx = ReportContext {
        geometry: &geometry,
        parity_start: 0,
        parity_count: 8,
        is_metadata_op: false,
        incomplete_write: false,
        is_background: false,
        in_vault_zone: false,
    };
    let sink = RecordingSink::new();
    report_errors(&ctx, Some(regions), &VerifyCounts::default(), &sink);
    sink.records()
}

// =============================================================================
// Dedup Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_one_uncorrectable_event_per_position_and_lba(
        regions in region_list_strategy(),
    ) {
        let records = report(&regions);
        let mut seen: HashSet<(u32, Lba)> = HashSet::new();
        for record in records
            .iter()
            .filter(|r| r.kind == EventKind::UncorrectableSectorError)
        {
            prop_assert!(
                seen.insert((record.position, record.lba)),
                "duplicate call-home for position {} lba {}",
                record.position,
                record.lba
            );
        }
    }

    #[test]
    fn prop_uncorrectable_pairs_with_invalidated(
        regions in region_list_strategy(),
    ) {
        let records = report(&regions);
        let uncorrectable: Vec<(u32, Lba)> = records
            .iter()
            .filter(|r| r.kind == EventKind::UncorrectableSectorError)
            .map(|r| (r.position, r.lba))
            .collect();
        let invalidated: Vec<(u32, Lba)> = records
            .iter()
            .filter(|r| r.kind == EventKind::SectorInvalidated)
            .map(|r| (r.position, r.lba))
            .collect();
        prop_assert_eq!(uncorrectable, invalidated);
    }

    #[test]
    fn prop_secondary_positions_never_log_correctable(
        regions in region_list_strategy(),
    ) {
        let mut implicated = PositionBitmap::EMPTY;
        for region in regions.iter() {
            if region.uncorrectable {
                implicated = implicated.union(region.positions);
            }
        }
        let records = report(&regions);
        for record in records
            .iter()
            .filter(|r| r.kind == EventKind::CorrectableSectorError)
        {
            prop_assert!(
                !implicated.contains(record.position),
                "correctable event for position {} already implicated",
                record.position
            );
        }
    }

    #[test]
    fn prop_events_only_name_carried_positions(
        regions in region_list_strategy(),
    ) {
        let mut carried = PositionBitmap::EMPTY;
        for region in regions.iter() {
            carried = carried.union(region.positions);
        }
        let records = report(&regions);
        for record in records {
            if record.kind == EventKind::ParityReconstructed {
                // the sweep deliberately names parity positions no region
                // carries
                continue;
            }
            prop_assert!(carried.contains(record.position));
        }
    }
}
