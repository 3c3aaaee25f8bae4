//! Byte-region algebra over sorted, non-overlapping half-open intervals.
//!
//! A region set is a plain `Vec<Region>` kept in ascending order with no two
//! entries overlapping or touching. [`merge_regions`] is the only mutator
//! that needs to uphold that; [`split_big_regions`] deliberately produces
//! touching pieces for request sizing and its output is not a canonical set.

use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Portions of `[start, end)` not covered by `cached`.
///
/// Returns `[start, end)` unchanged when nothing in `cached` overlaps it, and
/// an empty set when `start >= end`.
pub fn missing_regions_in(start: u64, end: u64, cached: &[Region]) -> Vec<Region> {
    let mut missing = Vec::new();
    if start >= end {
        return missing;
    }
    let mut cursor = start;
    for region in cached {
        if region.end <= cursor {
            continue;
        }
        if region.start >= end {
            break;
        }
        if region.start > cursor {
            missing.push(Region::new(cursor, region.start));
        }
        cursor = region.end;
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        missing.push(Region::new(cursor, end));
    }
    missing
}

/// Insert `new_region`, replacing every region it overlaps or touches with
/// their union.
pub fn merge_regions(set: &mut Vec<Region>, new_region: Region) {
    if new_region.is_empty() {
        return;
    }
    // Ends are ascending too, so both bounds are binary-searchable.
    let lo = set.partition_point(|r| r.end < new_region.start);
    let hi = set.partition_point(|r| r.start <= new_region.end);
    let mut merged = new_region;
    if lo < hi {
        merged.start = merged.start.min(set[lo].start);
        merged.end = merged.end.max(set[hi - 1].end);
    }
    set.splice(lo..hi, std::iter::once(merged));
}

/// Split, in place, every region longer than `max_size`.
///
/// A region shorter than one and a half `max_size` is cut into two roughly
/// equal halves; longer ones have `max_size` pieces peeled off their start
/// until the remainder fits.
pub fn split_big_regions(set: &mut Vec<Region>, max_size: u64) {
    if max_size == 0 {
        return;
    }
    let mut out = Vec::with_capacity(set.len());
    for region in set.drain(..) {
        let mut rest = region;
        while rest.len() > max_size {
            let len = rest.len();
            let piece = if 2 * len < 3 * max_size {
                len / 2
            } else {
                max_size
            };
            out.push(Region::new(rest.start, rest.start + piece));
            rest.start += piece;
        }
        out.push(rest);
    }
    *set = out;
}

/// True when `set` is exactly the single region `[0, size)`.
pub fn covers_whole(set: &[Region], size: u64) -> bool {
    match set {
        [only] => only.start == 0 && only.end >= size,
        [] => size == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> Region {
        Region::new(start, end)
    }

    #[test]
    fn missing_with_empty_cache_is_whole_request() {
        assert_eq!(missing_regions_in(10, 20, &[]), vec![r(10, 20)]);
        assert_eq!(missing_regions_in(10, 20, &[r(30, 40)]), vec![r(10, 20)]);
        assert_eq!(missing_regions_in(10, 20, &[r(0, 5)]), vec![r(10, 20)]);
        assert!(missing_regions_in(5, 5, &[]).is_empty());
    }

    #[test]
    fn missing_collects_gaps_and_clips_tail() {
        let cached = vec![r(0, 5), r(8, 12), r(15, 30)];
        assert_eq!(missing_regions_in(3, 20, &cached), vec![r(5, 8), r(12, 15)]);
        assert_eq!(missing_regions_in(0, 40, &cached), vec![r(5, 8), r(12, 15), r(30, 40)]);
        assert!(missing_regions_in(16, 29, &cached).is_empty());
    }

    #[test]
    fn merge_joins_touching_and_overlapping() {
        let mut set = vec![r(0, 5), r(10, 15), r(20, 25)];
        merge_regions(&mut set, r(5, 10));
        assert_eq!(set, vec![r(0, 15), r(20, 25)]);

        merge_regions(&mut set, r(12, 22));
        assert_eq!(set, vec![r(0, 25)]);

        merge_regions(&mut set, r(30, 31));
        merge_regions(&mut set, r(27, 28));
        assert_eq!(set, vec![r(0, 25), r(27, 28), r(30, 31)]);
    }

    #[test]
    fn merge_touching_on_both_sides_applies_once() {
        let mut set = vec![r(0, 4), r(6, 9)];
        merge_regions(&mut set, r(4, 6));
        assert_eq!(set, vec![r(0, 9)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let base = vec![r(0, 3), r(7, 9), r(20, 21)];
        for new in [r(3, 7), r(1, 2), r(9, 20), r(25, 30), r(0, 100)] {
            let mut once = base.clone();
            merge_regions(&mut once, new);
            let mut twice = once.clone();
            merge_regions(&mut twice, new);
            assert_eq!(once, twice, "merging {new:?} twice changed the set");
        }
    }

    #[test]
    fn missing_plus_cached_covers_request_exactly() {
        let cached = vec![r(2, 4), r(6, 11), r(13, 14), r(40, 50)];
        for start in 0..20 {
            for end in (start + 1)..22 {
                let mut covered = vec![0u8; 22];
                for m in missing_regions_in(start, end, &cached) {
                    for i in m.start..m.end {
                        covered[i as usize] += 1;
                    }
                }
                for c in &cached {
                    for i in c.start.max(start)..c.end.min(end) {
                        covered[i as usize] += 1;
                    }
                }
                for i in start..end {
                    assert_eq!(covered[i as usize], 1, "byte {i} of [{start},{end})");
                }
            }
        }
    }

    #[test]
    fn split_prefers_halves_below_one_and_a_half() {
        let mut set = vec![r(0, 14)];
        split_big_regions(&mut set, 10);
        assert_eq!(set, vec![r(0, 7), r(7, 14)]);
    }

    #[test]
    fn split_peels_max_size_from_long_regions() {
        let mut set = vec![r(100, 134), r(200, 205)];
        split_big_regions(&mut set, 10);
        assert_eq!(
            set,
            vec![r(100, 110), r(110, 120), r(120, 127), r(127, 134), r(200, 205)]
        );
        assert!(set.iter().all(|piece| piece.len() <= 10));
    }

    #[test]
    fn split_then_merge_restores_original() {
        for len in [1u64, 9, 10, 11, 15, 16, 29, 100, 1234] {
            let original = r(7, 7 + len);
            let mut pieces = vec![original];
            split_big_regions(&mut pieces, 10);
            let mut merged = Vec::new();
            for piece in pieces {
                merge_regions(&mut merged, piece);
            }
            assert_eq!(merged, vec![original]);
        }
    }

    #[test]
    fn covers_whole_checks_single_region() {
        assert!(covers_whole(&[r(0, 10)], 10));
        assert!(!covers_whole(&[r(1, 10)], 10));
        assert!(!covers_whole(&[r(0, 4), r(5, 10)], 10));
        assert!(covers_whole(&[], 0));
    }
}
