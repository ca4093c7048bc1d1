//! Overlap detection and dynamic adjustment.
//!
//! Two reads are synchronised by finding a run of identical samples long
//! enough that a coincidence is implausible. This module holds the run
//! measurement, the sort-assisted search for a run near a given position,
//! and the statistics that tune the search radius and drift compensation
//! from the offsets observed along the way.

use crate::{
    constants::{MAX_DYNOVERLAP, MIN_SECTOR_EPSILON, MIN_WORDS_SEARCH},
    isort::SortInfo,
    types::SampleFlags,
};

/// Number of new offsets between recalibrations.
const RECALIBRATE_INTERVAL: i64 = 10;

/// Which stage an offset was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Block against block
    One,
    /// Fragment against root
    Two,
}

/// Statistics for jitter/drift offset tracking.
#[derive(Debug, Clone, Default)]
pub struct OffsetStats {
    /// Offsets recorded since the last reset
    pub offpoints: i64,
    /// Offsets recorded since the last recalibration
    pub newpoints: i64,
    /// Sum of offsets
    pub offaccum: i64,
    /// Sum of absolute offsets
    pub offdiff: i64,
    pub offmin: i64,
    pub offmax: i64,
    /// A frozen tracker ignores new offsets
    pub frozen: bool,
}

impl OffsetStats {
    /// Add a new offset measurement.
    ///
    /// Returns `true` once enough new points have arrived to recalibrate.
    pub fn add(&mut self, offset: i64) -> bool {
        if self.frozen {
            return false;
        }
        self.offdiff += offset.abs();
        self.offpoints += 1;
        self.newpoints += 1;
        self.offaccum += offset;
        self.offmin = self.offmin.min(offset);
        self.offmax = self.offmax.max(offset);
        self.newpoints >= RECALIBRATE_INTERVAL
    }

    /// Get the mean offset.
    pub fn mean(&self) -> i64 {
        if self.offpoints == 0 {
            return 0;
        }
        self.offaccum / self.offpoints
    }

    /// Clear all statistics.
    pub fn clear(&mut self) {
        *self = OffsetStats {
            frozen: self.frozen,
            ..OffsetStats::default()
        };
    }
}

/// Settings changed by a recalibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adjustment {
    /// Drift step just added to the running compensation
    pub drift: Option<i64>,
    /// New search radius
    pub overlap: Option<i64>,
}

/// Dynamic overlap settings that adapt to drive behavior.
#[derive(Debug, Clone)]
pub struct DynamicOverlap {
    /// Current search radius in words
    pub overlap: i64,
    /// Cumulative drift compensation in words
    pub drift: i64,
    /// Stage 1 offset statistics (block matching)
    pub stage1: OffsetStats,
    /// Stage 2 offset statistics (root merging)
    pub stage2: OffsetStats,
}

impl DynamicOverlap {
    /// Create a tracker starting from the widest search radius.
    pub fn new() -> Self {
        Self {
            overlap: MAX_DYNOVERLAP,
            drift: 0,
            stage1: OffsetStats::default(),
            stage2: OffsetStats::default(),
        }
    }

    /// Record an offset and recalibrate when enough have accumulated.
    pub fn record(&mut self, stage: Stage, offset: i64) -> Adjustment {
        let due = match stage {
            Stage::One => self.stage1.add(offset),
            Stage::Two => self.stage2.add(offset),
        };
        if due {
            self.recalibrate()
        } else {
            Adjustment::default()
        }
    }

    /// Recalibrate drift and search radius from the statistics.
    fn recalibrate(&mut self) -> Adjustment {
        let mut adjustment = Adjustment::default();

        if self.stage2.offpoints >= RECALIBRATE_INTERVAL {
            let av = self.stage2.mean();
            if av.abs() > self.overlap / 4 {
                let step = (av / MIN_SECTOR_EPSILON) * MIN_SECTOR_EPSILON;
                self.drift += step;
                self.stage2.clear();
                adjustment.drift = Some(step);
            }
        }

        let s1 = &mut self.stage1;
        if s1.offpoints >= RECALIBRATE_INTERVAL {
            // Cover three times the average jitter, and half again the worst seen.
            let mut overlap = s1.offdiff / s1.offpoints * 3;
            let low = (-(s1.offmin as f64) * 1.5) as i64;
            let high = (s1.offmax as f64 * 1.5) as i64;
            overlap = overlap.max(low).max(high);
            self.overlap = overlap.clamp(MIN_SECTOR_EPSILON, MAX_DYNOVERLAP);
            adjustment.overlap = Some(self.overlap);

            if s1.offpoints > 600 {
                s1.offpoints = (s1.offpoints as f64 / 1.2) as i64;
                s1.offaccum = (s1.offaccum as f64 / 1.2) as i64;
                s1.offdiff = (s1.offdiff as f64 / 1.2) as i64;
            }
            s1.offmin = 0;
            s1.offmax = 0;
            s1.newpoints = 0;
        }

        adjustment
    }

    /// Pin the search radius; offsets stop retuning it.
    pub fn set_fixed(&mut self, words: i64) {
        self.overlap = words.clamp(MIN_SECTOR_EPSILON, MAX_DYNOVERLAP);
        self.stage1.frozen = true;
    }

    /// Whether the search radius is pinned.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.stage1.frozen
    }

    /// Whether the search radius is already as wide as it can get.
    #[inline]
    pub fn is_maxed(&self) -> bool {
        self.overlap >= MAX_DYNOVERLAP
    }

    /// Grow the search radius by half, unless it is pinned.
    pub fn widen(&mut self) -> Option<i64> {
        if self.is_fixed() {
            return None;
        }
        self.overlap = (self.overlap * 3 / 2).min(MAX_DYNOVERLAP);
        Some(self.overlap)
    }

    /// Get the current overlap in whole sectors, rounded up.
    pub fn overlap_sectors(&self) -> i64 {
        let fw = crate::constants::CD_FRAMEWORDS as i64;
        (self.overlap + fw - 1) / fw
    }
}

impl Default for DynamicOverlap {
    fn default() -> Self {
        Self::new()
    }
}

/// One side of a synchronisation attempt.
#[derive(Debug, Clone, Copy)]
pub struct SyncSide<'a> {
    pub vector: &'a [i16],
    /// Per-sample flags; `None` for data with no read history
    pub flags: Option<&'a [SampleFlags]>,
    /// Absolute position of `vector[0]`
    pub begin: i64,
}

/// A run of samples two sides agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMatch {
    /// Absolute start of the run on the scanned side
    pub begin: i64,
    /// Absolute end (exclusive) of the run on the scanned side
    pub end: i64,
    /// Scanned-side position minus sorted-side position of the same sample
    pub offset: i64,
}

#[inline]
fn flag_at(flags: &[SampleFlags], idx: i64) -> SampleFlags {
    usize::try_from(idx)
        .ok()
        .and_then(|i| flags.get(i).copied())
        .unwrap_or(SampleFlags::NONE)
}

/// Extend a match at `pos_a` / `pos_b` in both directions.
///
/// Returns the matching span `[begin, end)` as indices into `a`.
pub fn overlap_span(a: &[i16], b: &[i16], pos_a: i64, pos_b: i64) -> (i64, i64) {
    let (mut begin_a, mut begin_b) = (pos_a, pos_b);
    while begin_a >= 0
        && begin_b >= 0
        && (begin_a as usize) < a.len()
        && (begin_b as usize) < b.len()
        && a[begin_a as usize] == b[begin_b as usize]
    {
        begin_a -= 1;
        begin_b -= 1;
    }
    begin_a += 1;

    let (mut end_a, mut end_b) = (pos_a.max(0), pos_b.max(0));
    while (end_a as usize) < a.len()
        && (end_b as usize) < b.len()
        && a[end_a as usize] == b[end_b as usize]
    {
        end_a += 1;
        end_b += 1;
    }
    (begin_a, end_a)
}

/// Like [`overlap_span`], but honours read history.
///
/// The span never crosses a sample either side never received, and it
/// stops at a read boundary both sides share, so two reads are not trusted
/// across the same seam.
pub fn overlap_span_flagged(
    a: &[i16],
    b: &[i16],
    flags_a: &[SampleFlags],
    flags_b: &[SampleFlags],
    pos_a: i64,
    pos_b: i64,
) -> (i64, i64) {
    let (mut begin_a, mut begin_b) = (pos_a, pos_b);
    while begin_a >= 0
        && begin_b >= 0
        && (begin_a as usize) < a.len()
        && (begin_b as usize) < b.len()
    {
        if a[begin_a as usize] != b[begin_b as usize] {
            break;
        }
        let fa = flag_at(flags_a, begin_a);
        let fb = flag_at(flags_b, begin_b);
        if (fa & fb).is_edge() {
            begin_a -= 1;
            break;
        }
        if (fa | fb).is_unread() {
            break;
        }
        begin_a -= 1;
        begin_b -= 1;
    }
    begin_a += 1;

    let (mut end_a, mut end_b) = (pos_a.max(0), pos_b.max(0));
    while (end_a as usize) < a.len() && (end_b as usize) < b.len() {
        if a[end_a as usize] != b[end_b as usize] {
            break;
        }
        let fa = flag_at(flags_a, end_a);
        let fb = flag_at(flags_b, end_b);
        if (fa & fb).is_edge() && end_a != begin_a {
            break;
        }
        if (fa | fb).is_unread() {
            break;
        }
        end_a += 1;
        end_b += 1;
    }
    (begin_a, end_a)
}

/// Measure the run through `pos_a` / `pos_b` and accept it if long enough.
fn const_sync(a: SyncSide<'_>, b: SyncSide<'_>, pos_a: i64, pos_b: i64) -> Option<SyncMatch> {
    let (begin, end) = match (a.flags, b.flags) {
        (Some(fa), Some(fb)) => {
            if flag_at(fb, pos_b).is_unread() {
                return None;
            }
            overlap_span_flagged(a.vector, b.vector, fa, fb, pos_a, pos_b)
        }
        _ => overlap_span(a.vector, b.vector, pos_a, pos_b),
    };
    (end - begin > MIN_WORDS_SEARCH).then(|| SyncMatch {
        begin: begin + a.begin,
        end: end + a.begin,
        offset: (pos_a + a.begin) - (pos_b + b.begin),
    })
}

/// Look for a run through absolute position `post` of `scanned` that also
/// appears in `sorted` within `overlap` words of the same position.
///
/// `sort` must index `sorted.vector`. The zero-offset alignment is tried
/// first, then every indexed occurrence of the sample value in turn.
pub fn try_sort_sync(
    sort: &mut SortInfo,
    sorted: SyncSide<'_>,
    scanned: SyncSide<'_>,
    post: i64,
    overlap: i64,
) -> Option<SyncMatch> {
    let post_idx = post - scanned.begin;
    let value = *scanned.vector.get(usize::try_from(post_idx).ok()?)?;
    if scanned.flags.is_some_and(|f| flag_at(f, post_idx).is_unread()) {
        return None;
    }

    let zeropos = post - sorted.begin;
    let aligned = usize::try_from(zeropos)
        .ok()
        .and_then(|i| sorted.vector.get(i).copied());
    if aligned == Some(value) {
        if let Some(m) = const_sync(scanned, sorted, post_idx, zeropos) {
            return Some(m);
        }
    }

    sort.matches(sorted.vector, zeropos, overlap, value)
        .find_map(|idx| const_sync(scanned, sorted, post_idx, idx as i64))
}
