//! Drop-threshold stamping: per-feature minimum zoom.
//!
//! As the sorted record stream is emitted, each droppable feature is
//! assigned the lowest zoom at which it survives. Per zoom there is an
//! accumulator that counts features inside the current tile and subtracts a
//! drop interval; once the balance goes negative the feature is pushed up
//! one zoom. The counter resets at every tile boundary, which makes the
//! per-tile feature count come out close to what dropping during tiling
//! would produce, at the cost of slightly heavy low zooms.
//!
//! The stamping loop always runs on a single thread over the sorted
//! stream, so none of this state is synchronized.
//!
//! This module also owns the statistics passes that resolve "auto" zoom
//! parameters from the sorted index: maxzoom from the spacing of Morton
//! keys, basezoom and droprate from per-zoom peak tile counts.

use crate::config::{BasezoomSpec, DroprateSpec, FULL_DETAIL, MAX_ZOOM};
use crate::error::{PipelineError, Result};
use crate::mapping::{advise, advise_mut, Advice};
use crate::morton::{self, tile_at};
use crate::record::{GeomType, IndexRecord, RECORD_WIRE_SIZE};
use memmap2::{Mmap, MmapMut};
use std::fs::File;
use tracing::{info, warn};

/// Per-zoom drop accumulator. Lives from the start of the merge until the
/// last (re-)stamp pass.
#[derive(Debug, Clone, Default)]
pub struct DropState {
    pub interval: f64,
    pub scale: f64,
    pub gap: f64,
    pub seq: f64,
    pub previndex: u64,
    pub included: u64,
    pub tile_x: u32,
    pub tile_y: u32,
}

/// Which geometry types participate in dropping.
#[derive(Debug, Clone, Copy)]
pub struct DropPolicy {
    pub gamma: f64,
    pub drop_lines: bool,
    pub drop_polygons: bool,
}

impl DropPolicy {
    fn droppable(&self, kind: u8) -> bool {
        kind == GeomType::Point.as_u8()
            || (self.drop_lines && kind == GeomType::Line.as_u8())
            || (self.drop_polygons && kind == GeomType::Polygon.as_u8())
    }
}

/// Fresh drop states for zooms `0..=maxzoom`.
///
/// `interval[z] = droprate^(basezoom - z)` below basezoom, 0 at or above
/// it. `scale[z]` is the Morton-key span of one tile-pixel-ish cell at
/// that zoom, used by the gap gate.
pub fn prep_drop_states(maxzoom: u8, basezoom: u8, droprate: f64) -> Vec<DropState> {
    (0..=maxzoom as i32)
        .map(|z| {
            let interval = if z < basezoom as i32 {
                (droprate.ln() * (basezoom as i32 - z) as f64).exp()
            } else {
                0.0
            };
            DropState {
                interval,
                scale: 2f64.powi(64 - 2 * (z + 8)),
                ..DropState::default()
            }
        })
        .collect()
}

/// Compute one feature's minzoom and advance the accumulators.
///
/// Must be called exactly once per record, in sorted `(morton, seq)` order.
pub fn feature_minzoom(
    record: &IndexRecord,
    states: &mut [DropState],
    maxzoom: u8,
    policy: &DropPolicy,
) -> u8 {
    if policy.gamma < 0.0 || !policy.droppable(record.kind) {
        return 0;
    }

    let (xx, yy) = morton::decode(record.morton);
    for z in (0..=maxzoom as usize).rev() {
        let (xxx, yyy) = tile_at(xx, yy, z as u8);
        let ds = &mut states[z];
        if ds.tile_x != xxx || ds.tile_y != yyy {
            ds.seq = 0.0;
            ds.gap = 0.0;
            ds.previndex = 0;
            ds.tile_x = xxx;
            ds.tile_y = yyy;
        }
        ds.seq += 1.0;
    }
    for z in (0..=maxzoom as usize).rev() {
        let ds = &mut states[z];
        if ds.seq >= 0.0 {
            ds.seq -= ds.interval;
            ds.included += 1;
        } else {
            return z as u8 + 1;
        }
    }
    0
}

/// Gap gate: should a feature be skipped as a near-duplicate of its
/// predecessor in Morton order?
///
/// `scale` normalizes the key delta to the zoom being considered; `gamma`
/// sharpens how much farther a feature must land to clear an open gap.
pub fn manage_gap(index: u64, previndex: &mut u64, scale: f64, gamma: f64, gap: &mut f64) -> bool {
    if gamma > 0.0 {
        if *gap > 0.0 {
            if index == *previndex {
                return true; // exact duplicate can never fulfil the gap
            }
            if ((index - *previndex) as f64 / scale).powf(gamma) >= *gap {
                // Cleared the gap; choose a new one at the next point.
                *gap = 0.0;
            } else {
                return true;
            }
        } else if index >= *previndex {
            *gap = (index - *previndex) as f64 / scale;
            if *gap < 1.0 {
                return true; // too close to the previous dot
            }
            *gap = 0.0;
        }
        *previndex = index;
    }
    false
}

// ============================================================================
// Auto maxzoom
// ============================================================================

/// Guess a maxzoom from the spacing of features in the sorted index.
///
/// The geometric mean of successive Morton-key deltas is the right average
/// because feature spacing is typically lognormally distributed. The mean
/// delta converts to an approximate ground distance, and the zoom is the
/// one where a tile of `FULL_DETAIL` bits still separates features a
/// factor of 8 closer than that.
pub fn guess_maxzoom(index_map: &[u8]) -> Result<u8> {
    let mut sum = 0.0f64;
    let mut count = 0u64;

    let mut prev: Option<u64> = None;
    for chunk in index_map.chunks_exact(RECORD_WIRE_SIZE) {
        let key = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
        if let Some(p) = prev {
            if key != p {
                count += 1;
                sum += ((key - p) as f64).ln();
            }
        }
        prev = Some(key);
    }

    if count == 0 {
        return Err(PipelineError::CannotGuessMaxzoom);
    }

    let avg = (sum / count as f64).exp();
    // Approximate conversion from grid units to feet.
    let dist_ft = avg.sqrt() / 33.0;
    // Factor of 8 (3 zooms) beyond the minimum needed to separate features.
    let want = dist_ft / 8.0;

    let z = ((360.0 / (0.000_002_74 * want)).log2() - FULL_DETAIL as f64).ceil();
    let maxzoom = z.clamp(0.0, MAX_ZOOM as f64) as u8;
    info!(
        maxzoom,
        feet_apart = dist_ft.ceil() as u64,
        "chose maxzoom from feature spacing"
    );
    Ok(maxzoom)
}

// ============================================================================
// Auto basezoom / droprate
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct TileAccum {
    x: u32,
    y: u32,
    count: u64,
    fullcount: u64,
    gap: f64,
    previndex: u64,
}

/// Resolved zoom parameters after the statistics scan.
#[derive(Debug, Clone, Copy)]
pub struct ZoomChoice {
    pub basezoom: u8,
    pub droprate: f64,
}

/// Scan the sorted index once and resolve auto basezoom and/or droprate.
///
/// Maintains a per-zoom `(tile, count, fullcount)` accumulator with the
/// gap gate deciding whether each feature counts, and remembers the peak
/// count per zoom. Basezoom is the lowest zoom whose peak stays under the
/// feature cap; when no zoom ≤ maxzoom qualifies, the droprate is derived
/// from the peak-count ratio between zoom 0 and maxzoom and basezoom is
/// recomputed to satisfy the cap.
pub fn choose_basezoom_droprate(
    index_map: &[u8],
    maxzoom: u8,
    basezoom_spec: BasezoomSpec,
    droprate_spec: DroprateSpec,
    gamma: f64,
    marker_width: f64,
) -> ZoomChoice {
    let zooms = MAX_ZOOM as usize + 1;
    let mut tile = vec![TileAccum::default(); zooms];
    let mut max = vec![TileAccum::default(); zooms];

    for chunk in index_map.chunks_exact(RECORD_WIRE_SIZE) {
        let key = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
        let (xx, yy) = morton::decode(key);

        for z in 0..zooms {
            let (xxx, yyy) = tile_at(xx, yy, z as u8);
            let scale = 2f64.powi(64 - 2 * (z as i32 + 8));

            let t = &mut tile[z];
            if t.x != xxx || t.y != yyy {
                if t.count > max[z].count {
                    max[z] = *t;
                }
                *t = TileAccum {
                    x: xxx,
                    y: yyy,
                    ..TileAccum::default()
                };
            }

            t.fullcount += 1;
            if manage_gap(key, &mut t.previndex, scale, gamma, &mut t.gap) {
                continue;
            }
            t.count += 1;
        }
    }
    for z in 0..zooms {
        if tile[z].count > max[z].count {
            max[z] = tile[z];
        }
    }

    let max_features = (50_000.0 / (marker_width * marker_width)) as u64;

    let mut basezoom = match basezoom_spec {
        BasezoomSpec::Value(z) => z,
        BasezoomSpec::FollowMaxzoom => maxzoom,
        BasezoomSpec::Guess => {
            let mut bz = MAX_ZOOM;
            for z in (0..zooms).rev() {
                if max[z].count < max_features {
                    bz = z as u8;
                }
            }
            info!(
                basezoom = bz,
                kept = max[bz as usize].count,
                tile_x = max[bz as usize].x,
                tile_y = max[bz as usize].y,
                "chose basezoom to keep the fullest tile under the cap"
            );
            bz
        }
    };

    let mut droprate = match droprate_spec {
        DroprateSpec::Value(r) => r,
        DroprateSpec::Guess => -1.0, // resolved below
    };

    if matches!(basezoom_spec, BasezoomSpec::Guess) && basezoom > maxzoom {
        warn!("could not find a suitable basezoom; working from the other direction");
        if gamma == 0.0 {
            warn!("consider gamma 1 to limit near-duplicates");
        }

        if droprate < 0.0 {
            droprate = if maxzoom == 0 {
                2.5
            } else {
                let rate = ((max[0].count as f64 / max[maxzoom as usize].count as f64).ln()
                    / maxzoom as f64)
                    .exp();
                info!(
                    droprate = rate,
                    from = max[maxzoom as usize].count,
                    to = max[0].count,
                    zooms = maxzoom,
                    "derived droprate from the tile-count ratio"
                );
                rate
            };
        }

        basezoom = 0;
        for z in 0..=maxzoom {
            let zoomdiff = (max[z as usize].count as f64 / max_features as f64).ln() / droprate.ln();
            if zoomdiff + z as f64 > basezoom as f64 {
                basezoom = (zoomdiff + z as f64).ceil().min(MAX_ZOOM as f64) as u8;
            }
        }
        info!(
            basezoom,
            kept = max[maxzoom as usize].count as f64
                * (droprate.ln() * (maxzoom as f64 - basezoom as f64)).exp(),
            "recomputed basezoom to satisfy the feature cap"
        );
    } else if droprate < 0.0 {
        droprate = 1.0;
        for z in (0..basezoom).rev() {
            let interval = (droprate.ln() * (basezoom - z) as f64).exp();
            if max[z as usize].count as f64 / interval >= max_features as f64 {
                let interval = max[z as usize].count as f64 / max_features as f64;
                droprate = (interval.ln() / (basezoom - z) as f64).exp();
                info!(
                    droprate,
                    kept = max[z as usize].count as f64
                        / (droprate.ln() * (basezoom - z) as f64).exp(),
                    zoom = z,
                    "raised droprate to keep the fullest tile under the cap"
                );
            }
        }
    }

    if gamma > 0.0 {
        log_effective_gamma(&max, maxzoom, basezoom, droprate);
    }

    ZoomChoice { basezoom, droprate }
}

/// Diagnostics: how much dropping the gap gate is already doing.
fn log_effective_gamma(max: &[TileAccum], maxzoom: u8, basezoom: u8, droprate: f64) {
    let mut effective = 0u8;
    for z in 0..maxzoom {
        if max[z as usize].count < max[z as usize].fullcount {
            effective = z + 1;
        }
    }

    if effective == 0 {
        info!("with gamma, effective basezoom is 0, so no effective droprate");
        return;
    }

    let interval_0 = (droprate.ln() * basezoom as f64).exp();
    let interval_eff = if effective > basezoom {
        1.0
    } else {
        (droprate.ln() * (basezoom - effective) as f64).exp()
    };

    let scaled_0 = max[0].count as f64 / interval_0;
    let scaled_eff = max[effective as usize].count as f64 / interval_eff;
    let rate_at_0 = scaled_0 / max[0].fullcount as f64;
    let rate_at_eff = scaled_eff / max[effective as usize].fullcount as f64;
    let eff_drop = ((rate_at_eff / rate_at_0).ln() / effective as f64).exp();

    info!(
        effective_basezoom = effective,
        effective_droprate = eff_drop,
        "gamma dropping statistics"
    );
}

// ============================================================================
// Re-stamp pass
// ============================================================================

/// Re-run the stamper over the sorted stream, writing the minzoom byte of
/// each feature in place through a shared mapping of the merged geometry.
///
/// Needed whenever maxzoom, basezoom, or droprate were resolved after the
/// merge already stamped provisional values. Each byte position is written
/// at most once from this single thread.
pub fn restamp(
    index_file: &File,
    geom_file: &File,
    maxzoom: u8,
    basezoom: u8,
    droprate: f64,
    policy: &DropPolicy,
) -> Result<Vec<DropState>> {
    let index_len = index_file.metadata()?.len();
    let mut states = prep_drop_states(maxzoom, basezoom, droprate);
    if index_len == 0 {
        return Ok(states);
    }

    let index_map = unsafe { Mmap::map(index_file)? };
    advise(&index_map, Advice::Sequential);
    advise(&index_map, Advice::WillNeed);
    let mut geom_map = unsafe { MmapMut::map_mut(geom_file)? };
    advise_mut(&geom_map, Advice::Sequential);
    advise_mut(&geom_map, Advice::WillNeed);

    let mut prev_end: Option<u64> = None;
    for (i, chunk) in index_map.chunks_exact(RECORD_WIRE_SIZE).enumerate() {
        let record = IndexRecord::read_le(chunk);
        if let Some(end) = prev_end {
            if record.start != end {
                warn!(
                    position = i,
                    start = record.start,
                    prev_end = end,
                    "mismatched index into sorted geometry"
                );
            }
        }
        prev_end = Some(record.end);

        let mz = feature_minzoom(&record, &mut states, maxzoom, policy);
        geom_map[record.end as usize - 1] = mz;
    }

    geom_map.flush()?;
    advise(&index_map, Advice::DontNeed);
    drop(geom_map);
    drop(index_map);
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_record(x: u32, y: u32, seq: u64) -> IndexRecord {
        IndexRecord {
            morton: morton::encode(x, y),
            start: seq * 10,
            end: seq * 10 + 10,
            seq,
            segment: 0,
            kind: GeomType::Point.as_u8(),
            minzoom: 0,
        }
    }

    fn policy() -> DropPolicy {
        DropPolicy {
            gamma: 0.0,
            drop_lines: false,
            drop_polygons: false,
        }
    }

    #[test]
    fn test_intervals() {
        let states = prep_drop_states(14, 14, 2.5);
        assert_eq!(states.len(), 15);
        assert_eq!(states[14].interval, 0.0);
        assert!((states[13].interval - 2.5).abs() < 1e-12);
        assert!((states[12].interval - 6.25).abs() < 1e-12);
        assert!(states[0].interval > states[1].interval);
    }

    #[test]
    fn test_scale_defined_at_deep_zooms() {
        let states = prep_drop_states(MAX_ZOOM, MAX_ZOOM, 2.5);
        // Below z=24 the span is fractional but must stay positive.
        assert!(states[MAX_ZOOM as usize].scale > 0.0);
        assert!(states[MAX_ZOOM as usize].scale < 1.0);
        assert_eq!(states[24].scale, 1.0);
    }

    #[test]
    fn test_negative_gamma_disables_dropping() {
        let mut states = prep_drop_states(10, 10, 2.5);
        let p = DropPolicy {
            gamma: -1.0,
            ..policy()
        };
        for seq in 0..100 {
            let mz = feature_minzoom(&point_record(5, 5, seq), &mut states, 10, &p);
            assert_eq!(mz, 0);
        }
        assert_eq!(states[0].included, 0);
    }

    #[test]
    fn test_lines_kept_unless_enabled() {
        let mut states = prep_drop_states(10, 10, 2.5);
        let mut rec = point_record(5, 5, 0);
        rec.kind = GeomType::Line.as_u8();
        assert_eq!(feature_minzoom(&rec, &mut states, 10, &policy()), 0);
        assert_eq!(states[0].included, 0);

        let p = DropPolicy {
            drop_lines: true,
            ..policy()
        };
        assert_eq!(feature_minzoom(&rec, &mut states, 10, &p), 0);
        assert_eq!(states[0].included, 1);
    }

    #[test]
    fn test_second_duplicate_pushed_up() {
        let maxzoom = 14u8;
        let mut states = prep_drop_states(maxzoom, maxzoom, 2.5);
        let p = policy();

        let first = feature_minzoom(&point_record(7, 7, 0), &mut states, maxzoom, &p);
        let second = feature_minzoom(&point_record(7, 7, 1), &mut states, maxzoom, &p);
        assert_eq!(first, 0);
        assert!(second > first);
    }

    #[test]
    fn test_tile_change_resets_counter() {
        let maxzoom = 4u8;
        let mut states = prep_drop_states(maxzoom, maxzoom, 2.5);
        let p = policy();

        // Several features in one deep tile push minzooms up.
        for seq in 0..10 {
            feature_minzoom(&point_record(100, 100, seq), &mut states, maxzoom, &p);
        }
        // A feature far away lands in fresh tiles at every zoom except 0,
        // where the counter has accumulated.
        let far = feature_minzoom(
            &point_record(0xF000_0000, 0xF000_0000, 10),
            &mut states,
            maxzoom,
            &p,
        );
        assert!(far <= 1, "got {far}");
    }

    #[test]
    fn test_included_decreases_with_zoom() {
        let maxzoom = 6u8;
        let mut states = prep_drop_states(maxzoom, maxzoom, 2.0);
        let p = policy();
        // Spread points across distinct tiles of one quadrant.
        for i in 0u64..512 {
            let x = ((i * 0x0073_9231) as u32) & 0x3FFF_FFFF;
            let y = ((i * 0x019_3755) as u32) & 0x3FFF_FFFF;
            feature_minzoom(&point_record(x, y, i), &mut states, maxzoom, &p);
        }
        assert_eq!(states[maxzoom as usize].included, 512);
        for z in 0..maxzoom as usize {
            assert!(
                states[z].included <= states[z + 1].included,
                "included not monotone at z={z}"
            );
        }
        assert!(states[0].included < 512);
    }

    #[test]
    fn test_manage_gap_zero_gamma_never_skips() {
        let mut prev = 0u64;
        let mut gap = 0.0f64;
        for key in [5u64, 5, 6, 100] {
            assert!(!manage_gap(key, &mut prev, 1.0, 0.0, &mut gap));
        }
    }

    #[test]
    fn test_manage_gap_skips_exact_duplicates() {
        let mut prev = 0u64;
        let mut gap = 0.0f64;
        // First point opens a gap (delta/scale >= 1 clears immediately).
        assert!(!manage_gap(1000, &mut prev, 1.0, 1.0, &mut gap));
        // Identical key while a gap is pending.
        let mut gap = 5.0f64;
        assert!(manage_gap(1000, &mut prev, 1.0, 1.0, &mut gap));
    }

    #[test]
    fn test_guess_maxzoom_requires_two_locations() {
        let rec = point_record(5, 5, 0);
        let mut buf = vec![0u8; RECORD_WIRE_SIZE * 2];
        let mut wire = [0u8; RECORD_WIRE_SIZE];
        rec.write_le(&mut wire);
        buf[..RECORD_WIRE_SIZE].copy_from_slice(&wire);
        point_record(5, 5, 1).write_le(&mut wire);
        buf[RECORD_WIRE_SIZE..].copy_from_slice(&wire);

        assert!(matches!(
            guess_maxzoom(&buf),
            Err(PipelineError::CannotGuessMaxzoom)
        ));
    }

    #[test]
    fn test_guess_maxzoom_monotone_in_spacing() {
        // Denser features should never pick a shallower maxzoom.
        let make_index = |step: u64| -> Vec<u8> {
            let mut buf = Vec::new();
            let mut wire = [0u8; RECORD_WIRE_SIZE];
            for i in 0..256u64 {
                let mut rec = point_record(0, 0, i);
                rec.morton = 0x1000_0000_0000_0000 + i * step;
                rec.write_le(&mut wire);
                buf.extend_from_slice(&wire);
            }
            buf
        };
        let sparse = guess_maxzoom(&make_index(1 << 40)).unwrap();
        let dense = guess_maxzoom(&make_index(1 << 30)).unwrap();
        assert!(dense >= sparse, "dense {dense} < sparse {sparse}");
    }

    #[test]
    fn test_choose_basezoom_under_cap() {
        // 2000 features in the same deep tile, cap lowered via marker width.
        let mut buf = Vec::new();
        let mut wire = [0u8; RECORD_WIRE_SIZE];
        for i in 0..2000u64 {
            // Cluster tightly so every zoom sees one hot tile.
            let rec = point_record(0x4000_0000 + i as u32, 0x4000_0000, i);
            rec.write_le(&mut wire);
            buf.extend_from_slice(&wire);
        }
        // cap = 50000 / 10^2 = 500 < 2000
        let choice = choose_basezoom_droprate(
            &buf,
            14,
            BasezoomSpec::Guess,
            DroprateSpec::Value(2.5),
            0.0,
            10.0,
        );
        assert!(choice.basezoom > 0);
        assert_eq!(choice.droprate, 2.5);
    }

    #[test]
    fn test_choose_basezoom_spread_points_stay_low() {
        let mut buf = Vec::new();
        let mut wire = [0u8; RECORD_WIRE_SIZE];
        let mut keys = Vec::new();
        for i in 0u64..300 {
            let x = (i as u32).wrapping_mul(0x0BAD_C0DE) | 1;
            let y = (i as u32).wrapping_mul(0x0055_5555) | 1;
            keys.push(morton::encode(x, y));
        }
        keys.sort_unstable();
        for (i, key) in keys.iter().enumerate() {
            let mut rec = point_record(0, 0, i as u64);
            rec.morton = *key;
            rec.write_le(&mut wire);
            buf.extend_from_slice(&wire);
        }
        // 300 features, cap 50000: zoom 0 already qualifies.
        let choice = choose_basezoom_droprate(
            &buf,
            14,
            BasezoomSpec::Guess,
            DroprateSpec::Value(2.5),
            0.0,
            1.0,
        );
        assert_eq!(choice.basezoom, 0);
    }
}
