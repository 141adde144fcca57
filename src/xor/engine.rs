//! Software row-parity verify engine
//!
//! Reference implementation of [`XorEngine`] for single-parity geometries:
//! parity is the byte-wise XOR of all data columns. Damage within the
//! redundancy budget is reconstructed in place; damage beyond it is
//! invalidated and reported as uncorrectable.

use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::geometry::{Lba, PositionBitmap, RaidGeometry};

use super::{
    ErrorRegion, ErrorRegionList, Sector, Strip, VerifyCounts, VerifyOutcome, XorEngine,
    XorErrorKind, XorStatus,
};

/// Software XOR engine for row-parity arrays
#[derive(Debug, Default)]
pub struct RowParityEngine;

impl RowParityEngine {
    pub fn new() -> Self {
        Self
    }

    /// Classify one damaged sector in isolation
    fn classify_sector(sector: &Sector, lba: Lba) -> Option<XorErrorKind> {
        if sector.invalidated {
            return Some(XorErrorKind::Invalidated);
        }
        if !sector.crc_ok() {
            return Some(XorErrorKind::Crc);
        }
        if !sector.stamp_ok(lba) {
            return Some(XorErrorKind::LbaStamp);
        }
        None
    }

    /// XOR-fold the payloads of every position in `from` at row `row`
    fn xor_row(strip: &Strip, from: PositionBitmap, row: usize) -> Option<Vec<u8>> {
        let mut acc: Option<Vec<u8>> = None;
        for pos in from.iter_positions() {
            let sector = strip.column(pos)?.get(row)?;
            match &mut acc {
                None => acc = Some(sector.payload.to_vec()),
                Some(acc) => {
                    if acc.len() != sector.payload.len() {
                        return None;
                    }
                    for (a, b) in acc.iter_mut().zip(sector.payload.iter()) {
                        *a ^= *b;
                    }
                }
            }
        }
        acc
    }
}

impl XorEngine for RowParityEngine {
    #[instrument(skip_all, fields(start_lba = strip.start_lba))]
    fn check_checksum(
        &self,
        strip: &Strip,
        positions: PositionBitmap,
        regions: &mut ErrorRegionList,
    ) -> Result<XorStatus> {
        let mut status = XorStatus::NoError;
        for pos in positions.iter_positions() {
            let Some(column) = strip.column(pos) else {
                return Err(Error::InvariantViolation(format!(
                    "checksum check on position {} with no buffer",
                    pos
                )));
            };
            for (row, sector) in column.iter().enumerate() {
                let lba = strip.start_lba + row as Lba;
                if let Some(kind) = Self::classify_sector(sector, lba) {
                    regions.push(ErrorRegion {
                        lba,
                        blocks: 1,
                        kind,
                        uncorrectable: false,
                        positions: PositionBitmap::from_position(pos),
                    });
                    status = XorStatus::ChecksumError;
                    debug!(position = pos, lba, ?kind, "checksum validation failed");
                }
            }
        }
        Ok(status)
    }

    #[instrument(skip_all, fields(start_lba = strip.start_lba, dead = %dead_positions, media = %media_positions))]
    fn verify_strip(
        &self,
        strip: &mut Strip,
        geometry: &RaidGeometry,
        dead_positions: PositionBitmap,
        media_positions: PositionBitmap,
        regions: &mut ErrorRegionList,
    ) -> Result<VerifyOutcome> {
        if geometry.parity_count() != 1 {
            return Err(Error::InvalidGeometry(
                "row-parity engine handles single-parity geometries only".to_string(),
            ));
        }
        let parity_pos = geometry.row_parity_position();
        let live = strip.live_positions();
        let mut counts = VerifyCounts::default();
        let mut status = XorStatus::NoError;

        for row in 0..strip.depth() {
            let lba = strip.start_lba + row as Lba;

            // Pass 1: classify every live sector on this row.
            let mut bad = PositionBitmap::EMPTY;
            let mut kinds: Vec<(u32, XorErrorKind)> = Vec::new();
            for pos in live.iter_positions() {
                let Some(sector) = strip.column(pos).and_then(|c| c.get(row)) else {
                    continue;
                };
                match Self::classify_sector(sector, lba) {
                    Some(XorErrorKind::Invalidated) => {
                        counts.previously_invalidated.insert(pos);
                        regions.push(ErrorRegion {
                            lba,
                            blocks: 1,
                            kind: XorErrorKind::Invalidated,
                            uncorrectable: false,
                            positions: PositionBitmap::from_position(pos),
                        });
                    }
                    Some(kind) => {
                        bad.insert(pos);
                        kinds.push((pos, kind));
                        if kind.is_checksum() {
                            status = XorStatus::ChecksumError;
                        }
                    }
                    None => {}
                }
            }

            let need = bad.union(
                dead_positions
                    .union(media_positions)
                    .intersect(geometry.all_positions()),
            );
            match need.count() {
                0 => {
                    // Fully intact row: coherency holds only when every
                    // position is live.
                    if dead_positions.is_empty() && live == geometry.all_positions() {
                        let data = geometry.all_positions().difference(
                            PositionBitmap::from_position(parity_pos),
                        );
                        let Some(expected) = Self::xor_row(strip, data, row) else {
                            return Err(Error::InvariantViolation(
                                "ragged strip payload lengths".to_string(),
                            ));
                        };
                        let parity_sector = strip
                            .column(parity_pos)
                            .and_then(|c| c.get(row))
                            .ok_or_else(|| {
                                Error::InvariantViolation("parity column missing".to_string())
                            })?;
                        if parity_sector.payload[..] != expected[..] {
                            warn!(lba, "parity incoherent with data, rewriting parity");
                            let rebuilt = Sector::for_data(lba, &expected);
                            if let Some(col) = strip.column_mut(parity_pos) {
                                col[row] = rebuilt;
                            }
                            counts.correctable_coherency.insert(parity_pos);
                            counts.modified.insert(parity_pos);
                            regions.push(ErrorRegion {
                                lba,
                                blocks: 1,
                                kind: XorErrorKind::Coherency,
                                uncorrectable: false,
                                positions: PositionBitmap::from_position(parity_pos),
                            });
                        }
                    }
                }
                1 => {
                    // One missing or damaged column: redundancy absorbs it.
                    let target = need.first().unwrap_or(parity_pos);
                    if bad.contains(target) {
                        let survivors = geometry
                            .all_positions()
                            .difference(PositionBitmap::from_position(target));
                        let Some(rebuilt) = Self::xor_row(strip, survivors, row) else {
                            return Err(Error::InvariantViolation(
                                "reconstruction source missing a buffer".to_string(),
                            ));
                        };
                        if let Some(col) = strip.column_mut(target) {
                            col[row] = Sector::for_data(lba, &rebuilt);
                        }
                        let kind = kinds
                            .iter()
                            .find(|(p, _)| *p == target)
                            .map(|(_, k)| *k)
                            .unwrap_or(XorErrorKind::Crc);
                        match kind {
                            XorErrorKind::LbaStamp => counts.correctable_lba_stamp.insert(target),
                            _ => counts.correctable_crc.insert(target),
                        }
                        counts.modified.insert(target);
                        regions.push(ErrorRegion {
                            lba,
                            blocks: 1,
                            kind,
                            uncorrectable: false,
                            positions: PositionBitmap::from_position(target),
                        });
                        debug!(position = target, lba, ?kind, "sector reconstructed");
                    } else if media_positions.contains(target) {
                        // Persistent media failure with an intact remainder:
                        // rebuild the lost sector into the strip so the
                        // write-back remaps it on the drive.
                        let survivors = geometry
                            .all_positions()
                            .difference(PositionBitmap::from_position(target));
                        let Some(rebuilt) = Self::xor_row(strip, survivors, row) else {
                            return Err(Error::InvariantViolation(
                                "reconstruction source missing a buffer".to_string(),
                            ));
                        };
                        let depth = strip.depth();
                        let start_lba = strip.start_lba;
                        let payload_len = rebuilt.len();
                        let Some(slot) = strip.columns.get_mut(target as usize) else {
                            return Err(Error::InvariantViolation(
                                "strip narrower than geometry".to_string(),
                            ));
                        };
                        let column = slot.get_or_insert_with(Vec::new);
                        while column.len() < depth {
                            let r = column.len();
                            column.push(Sector::zeroed(start_lba + r as Lba, payload_len));
                        }
                        column[row] = Sector::for_data(lba, &rebuilt);
                        counts.correctable_media.insert(target);
                        counts.modified.insert(target);
                        regions.push(ErrorRegion {
                            lba,
                            blocks: 1,
                            kind: XorErrorKind::HardMedia,
                            uncorrectable: false,
                            positions: PositionBitmap::from_position(target),
                        });
                        debug!(position = target, lba, "media-lost sector rebuilt");
                    }
                    // A dead position with an intact remainder needs no
                    // buffer work on this path.
                }
                _ => {
                    // Damage beyond redundancy: invalidate what is damaged
                    // and live, then restore parity coherence over the
                    // invalidated contents.
                    for (pos, kind) in &kinds {
                        if let Some(col) = strip.column_mut(*pos) {
                            col[row].invalidate();
                        }
                        match kind {
                            XorErrorKind::LbaStamp => counts.uncorrectable_lba_stamp.insert(*pos),
                            XorErrorKind::Coherency => counts.uncorrectable_coherency.insert(*pos),
                            _ => counts.uncorrectable_crc.insert(*pos),
                        }
                        counts.modified.insert(*pos);
                    }
                    if live.contains(parity_pos) {
                        let data = live.difference(PositionBitmap::from_position(parity_pos));
                        if let Some(rebuilt) = Self::xor_row(strip, data, row) {
                            if let Some(col) = strip.column_mut(parity_pos) {
                                col[row] = Sector::for_data(lba, &rebuilt);
                            }
                            counts.modified.insert(parity_pos);
                        }
                    }
                    regions.push(ErrorRegion {
                        lba,
                        blocks: 1,
                        kind: kinds.first().map(|(_, k)| *k).unwrap_or(XorErrorKind::Crc),
                        uncorrectable: true,
                        positions: need,
                    });
                    warn!(lba, positions = %need, "damage exceeds redundancy, invalidating");
                }
            }
        }

        Ok(VerifyOutcome { status, counts })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const PAYLOAD_LEN: usize = 32;

    fn geom() -> RaidGeometry {
        RaidGeometry::row_parity(5, 64, 1024).unwrap()
    }

    /// Strip of `depth` rows with deterministic data and correct parity
    fn make_strip(geometry: &RaidGeometry, start_lba: Lba, depth: usize) -> Strip {
        let parity_pos = geometry.row_parity_position();
        let mut strip = Strip::new(start_lba, geometry.width());
        for pos in 0..geometry.width() {
            let mut sectors = Vec::with_capacity(depth);
            for row in 0..depth {
                let lba = start_lba + row as Lba;
                if pos == parity_pos {
                    // placeholder, fixed up below
                    sectors.push(Sector::zeroed(lba, PAYLOAD_LEN));
                } else {
                    let payload: Vec<u8> = (0..PAYLOAD_LEN)
                        .map(|i| (pos as u8) ^ (row as u8) ^ (i as u8))
                        .collect();
                    sectors.push(Sector::for_data(lba, &payload));
                }
            }
            strip.columns[pos as usize] = Some(sectors);
        }
        for row in 0..depth {
            let lba = start_lba + row as Lba;
            let data = geometry
                .all_positions()
                .difference(PositionBitmap::from_position(parity_pos));
            let parity = RowParityEngine::xor_row(&strip, data, row).unwrap();
            strip.columns[parity_pos as usize].as_mut().unwrap()[row] =
                Sector::for_data(lba, &parity);
        }
        strip
    }

    #[test]
    fn test_clean_strip_verifies_clean() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 4);
        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();
        assert_eq!(outcome.status, XorStatus::NoError);
        assert!(outcome.counts.is_clean());
        assert!(regions.is_empty());
    }

    #[test]
    fn test_single_crc_error_is_reconstructed() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 4);
        let original = strip.column(1).unwrap()[2].clone();
        strip.column_mut(1).unwrap()[2].payload[0] ^= 0xff;

        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();

        assert_eq!(outcome.status, XorStatus::ChecksumError);
        assert!(outcome.counts.correctable_crc.contains(1));
        assert!(outcome.counts.modified.contains(1));
        assert!(outcome.counts.any_uncorrectable().is_empty());
        assert_eq!(strip.column(1).unwrap()[2].payload, original.payload);
        assert_eq!(regions.len(), 1);
        assert!(!regions.as_slice()[0].uncorrectable);
        assert_eq!(regions.as_slice()[0].lba, 102);
    }

    #[test]
    fn test_lba_stamp_error_is_reconstructed() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 2);
        strip.column_mut(0).unwrap()[0].lba_stamp ^= 0x1;

        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();

        assert!(outcome.counts.correctable_lba_stamp.contains(0));
        assert_eq!(regions.as_slice()[0].kind, XorErrorKind::LbaStamp);
        assert!(strip.column(0).unwrap()[0].stamp_ok(100));
    }

    #[test]
    fn test_two_errors_exceed_redundancy() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 2);
        strip.column_mut(0).unwrap()[1].payload[3] ^= 0x55;
        strip.column_mut(2).unwrap()[1].payload[7] ^= 0xaa;

        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();

        let uncorrectable = outcome.counts.any_uncorrectable();
        assert!(uncorrectable.contains(0));
        assert!(uncorrectable.contains(2));
        assert!(strip.column(0).unwrap()[1].invalidated);
        assert!(strip.column(2).unwrap()[1].invalidated);
        // parity was rewritten to cohere with the invalidated contents
        assert!(outcome.counts.modified.contains(4));
        let region = regions
            .iter()
            .find(|r| r.uncorrectable)
            .expect("uncorrectable region");
        assert!(region.positions.contains(0) && region.positions.contains(2));
    }

    #[test]
    fn test_dead_position_plus_error_is_uncorrectable() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 2);
        strip.columns[3] = None;
        strip.column_mut(1).unwrap()[0].payload[0] ^= 0x01;

        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::from_position(3),
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();

        assert!(outcome.counts.uncorrectable_crc.contains(1));
        assert!(strip.column(1).unwrap()[0].invalidated);
        let region = regions.iter().find(|r| r.uncorrectable).unwrap();
        // the dead position is implicated in the uncorrectable set
        assert!(region.positions.contains(3));
    }

    #[test]
    fn test_media_lost_column_rebuilt_for_write_back() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 4);
        let expected = strip.column(2).unwrap().clone();
        // the read against position 2 took a persistent media error, so
        // no buffer was ever delivered
        strip.columns[2] = None;

        let mut regions = ErrorRegionList::new();
        let media = PositionBitmap::from_position(2);
        let outcome = RowParityEngine::new()
            .verify_strip(&mut strip, &geometry, media, media, &mut regions)
            .unwrap();

        assert!(outcome.counts.correctable_media.contains(2));
        assert!(outcome.counts.modified.contains(2));
        assert!(outcome.counts.any_uncorrectable().is_empty());
        assert_eq!(*strip.column(2).expect("column rebuilt"), expected);
        assert_eq!(regions.len(), 1);
        let region = &regions.as_slice()[0];
        assert_eq!(region.kind, XorErrorKind::HardMedia);
        assert!(!region.uncorrectable);
        assert_eq!(region.lba, 100);
        assert_eq!(region.blocks, 4);
    }

    #[test]
    fn test_coherency_error_rebuilds_parity() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 2);
        // damage parity payload but keep its own checksum consistent
        let parity_pos = geometry.row_parity_position();
        let mut wrong = strip.column(parity_pos).unwrap()[0].payload.to_vec();
        wrong[0] ^= 0x10;
        strip.column_mut(parity_pos).unwrap()[0] = Sector::for_data(100, &wrong);

        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();

        assert_eq!(outcome.status, XorStatus::NoError);
        assert!(outcome.counts.correctable_coherency.contains(parity_pos));
        assert_eq!(regions.as_slice()[0].kind, XorErrorKind::Coherency);
    }

    #[test]
    fn test_previously_invalidated_raises_no_new_damage() {
        let geometry = geom();
        let mut strip = make_strip(&geometry, 100, 2);
        strip.column_mut(2).unwrap()[0].invalidate();
        // keep parity coherent with the invalidated payload
        let parity_pos = geometry.row_parity_position();
        let data = geometry
            .all_positions()
            .difference(PositionBitmap::from_position(parity_pos));
        let parity = RowParityEngine::xor_row(&strip, data, 0).unwrap();
        strip.column_mut(parity_pos).unwrap()[0] = Sector::for_data(100, &parity);

        let mut regions = ErrorRegionList::new();
        let outcome = RowParityEngine::new()
            .verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions,
            )
            .unwrap();

        assert!(outcome.counts.previously_invalidated.contains(2));
        assert!(outcome.counts.any_uncorrectable().is_empty());
        assert!(outcome.counts.modified.is_empty());
        assert_eq!(regions.as_slice()[0].kind, XorErrorKind::Invalidated);
    }

    #[test]
    fn test_check_checksum_paths() {
        let geometry = geom();
        let engine = RowParityEngine::new();
        let strip = make_strip(&geometry, 100, 2);
        let mut regions = ErrorRegionList::new();
        assert_matches!(
            engine.check_checksum(&strip, PositionBitmap::from_position(0), &mut regions),
            Ok(XorStatus::NoError)
        );

        let mut strip = strip;
        strip.column_mut(0).unwrap()[1].payload[0] ^= 0x80;
        assert_matches!(
            engine.check_checksum(&strip, PositionBitmap::from_position(0), &mut regions),
            Ok(XorStatus::ChecksumError)
        );
        assert_eq!(regions.len(), 1);

        // missing buffer is an invariant violation, not a silent pass
        assert_matches!(
            engine.check_checksum(&strip, PositionBitmap::from_position(9), &mut regions),
            Err(Error::InvariantViolation(_))
        );
    }

    #[test]
    fn test_dual_parity_rejected() {
        let mut parity = PositionBitmap::EMPTY;
        parity.insert(4);
        parity.insert(5);
        let geometry = RaidGeometry::new(6, parity, 64, 512).unwrap();
        let mut strip = Strip::new(0, 6);
        let mut regions = ErrorRegionList::new();
        assert_matches!(
            RowParityEngine::new().verify_strip(
                &mut strip,
                &geometry,
                PositionBitmap::EMPTY,
                PositionBitmap::EMPTY,
                &mut regions
            ),
            Err(Error::InvalidGeometry(_))
        );
    }
}
