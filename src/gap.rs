//! Gap and rift analysis algorithms.
//!
//! A rift is the point where two otherwise matching runs of samples stop
//! agreeing. Rifts can occur due to:
//!
//! - Dropped samples (one side is missing data the other has)
//! - Stuttering (one side repeats samples it already delivered)
//! - Garbage (both sides carry the same length of disagreeing data)
//!
//! The analysis here classifies a rift by probing for the smallest shift
//! after which the two sides agree again for at least `MIN_WORDS_RIFT`
//! samples. All positions are indices into the slices passed in.

use crate::constants::MIN_WORDS_RIFT;

/// Result of rift analysis between two blocks.
///
/// `A` is the first slice passed to the analysis, `B` the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiftType {
    /// A lacks this many samples that B carries; insert them into A
    DroppedFromA(i64),
    /// A repeats this many samples; remove them from A
    StutterInA(i64),
    /// B lacks this many samples that A carries; insert them into B
    DroppedFromB(i64),
    /// B repeats this many samples; remove them from B
    StutterInB(i64),
    /// This many samples disagree on both sides before they resync
    Garbage(i64),
    /// No resync within reach
    Unknown,
}

#[inline]
fn at(buf: &[i16], idx: i64) -> Option<i16> {
    usize::try_from(idx).ok().and_then(|i| buf.get(i).copied())
}

/// Count matching samples walking forward from `pos_a` / `pos_b`.
pub fn overlap_forward(block_a: &[i16], pos_a: i64, block_b: &[i16], pos_b: i64) -> i64 {
    if pos_a < 0 || pos_b < 0 {
        return 0;
    }
    let (a, b) = (pos_a as usize, pos_b as usize);
    if a >= block_a.len() || b >= block_b.len() {
        return 0;
    }
    block_a[a..]
        .iter()
        .zip(&block_b[b..])
        .take_while(|(x, y)| x == y)
        .count() as i64
}

/// Count matching samples walking backward from `pos_a` / `pos_b`,
/// the starting pair included.
pub fn overlap_backward(block_a: &[i16], pos_a: i64, block_b: &[i16], pos_b: i64) -> i64 {
    let mut count = 0;
    let (mut a, mut b) = (pos_a, pos_b);
    while let (Some(x), Some(y)) = (at(block_a, a), at(block_b, b)) {
        if x != y {
            break;
        }
        count += 1;
        a -= 1;
        b -= 1;
    }
    count
}

/// Decide whether `gap` extra samples are a gap or a stutter.
///
/// Compares `gap` samples of A starting at `off_a` with B starting at
/// `off_b`. Identical samples mean the extra data repeats what was already
/// there (a stutter); anything else is genuine missing data (a gap). A
/// window reaching past either slice counts as a gap.
///
/// Returns `true` for a gap.
pub fn stutter_or_gap(block_a: &[i16], off_a: i64, block_b: &[i16], off_b: i64, gap: i64) -> bool {
    let (mut a1, mut b1, mut gap) = (off_a, off_b, gap);
    if a1 < 0 {
        b1 -= a1;
        gap += a1;
        a1 = 0;
    }
    if gap <= 0 {
        return false;
    }
    let window = |buf: &[i16], start: i64| -> Option<Vec<i16>> {
        let start = usize::try_from(start).ok()?;
        buf.get(start..start + gap as usize).map(<[i16]>::to_vec)
    };
    match (window(block_a, a1), window(block_b, b1)) {
        (Some(x), Some(y)) => x != y,
        _ => true,
    }
}

/// Classify a forward rift: A and B agree up to (not including) `pos_a` /
/// `pos_b` and disagree there.
pub fn analyze_rift_forward(block_a: &[i16], pos_a: i64, block_b: &[i16], pos_b: i64) -> RiftType {
    let apast = block_a.len() as i64 - pos_a;
    let bpast = block_b.len() as i64 - pos_b;
    let (mut match_a, mut match_b, mut match_c) = (0, 0, 0);

    let mut i = 0;
    loop {
        if i < bpast && overlap_forward(block_a, pos_a, block_b, pos_b + i) >= MIN_WORDS_RIFT {
            match_a = i;
            break;
        }
        if i < apast {
            if overlap_forward(block_a, pos_a + i, block_b, pos_b) >= MIN_WORDS_RIFT {
                match_b = i;
                break;
            }
            if i < bpast
                && overlap_forward(block_a, pos_a + i, block_b, pos_b + i) >= MIN_WORDS_RIFT
            {
                match_c = i;
                break;
            }
        } else if i >= bpast {
            break;
        }
        i += 1;
    }

    if match_c != 0 {
        return RiftType::Garbage(match_c);
    }
    if match_a != 0 {
        // B carries extra samples: dropped by A, or stuttered by B.
        return if stutter_or_gap(block_a, pos_a - match_a, block_b, pos_b, match_a) {
            RiftType::DroppedFromA(match_a)
        } else {
            RiftType::StutterInB(match_a)
        };
    }
    if match_b != 0 {
        return if stutter_or_gap(block_b, pos_b - match_b, block_a, pos_a, match_b) {
            RiftType::DroppedFromB(match_b)
        } else {
            RiftType::StutterInA(match_b)
        };
    }
    RiftType::Unknown
}

/// Classify a backward rift: A and B agree from `pos_a + 1` / `pos_b + 1`
/// onward and disagree at `pos_a` / `pos_b`.
pub fn analyze_rift_reverse(block_a: &[i16], pos_a: i64, block_b: &[i16], pos_b: i64) -> RiftType {
    let apast = pos_a + 1;
    let bpast = pos_b + 1;
    let (mut match_a, mut match_b, mut match_c) = (0, 0, 0);

    let mut i = 0;
    loop {
        if i < bpast && overlap_backward(block_a, pos_a, block_b, pos_b - i) >= MIN_WORDS_RIFT {
            match_a = i;
            break;
        }
        if i < apast {
            if overlap_backward(block_a, pos_a - i, block_b, pos_b) >= MIN_WORDS_RIFT {
                match_b = i;
                break;
            }
            if i < bpast
                && overlap_backward(block_a, pos_a - i, block_b, pos_b - i) >= MIN_WORDS_RIFT
            {
                match_c = i;
                break;
            }
        } else if i >= bpast {
            break;
        }
        i += 1;
    }

    if match_c != 0 {
        return RiftType::Garbage(match_c);
    }
    if match_a != 0 {
        return if stutter_or_gap(block_a, pos_a + 1, block_b, pos_b - match_a + 1, match_a) {
            RiftType::DroppedFromA(match_a)
        } else {
            RiftType::StutterInB(match_a)
        };
    }
    if match_b != 0 {
        return if stutter_or_gap(block_b, pos_b + 1, block_a, pos_a - match_b + 1, match_b) {
            RiftType::DroppedFromB(match_b)
        } else {
            RiftType::StutterInA(match_b)
        };
    }
    RiftType::Unknown
}

/// After an unresolvable forward rift, report which side goes flat.
///
/// Returns `(a_silent, b_silent)`: a side counts as silent when its next
/// `MIN_WORDS_RIFT` samples (or what is left of it) hold a single value.
pub fn analyze_rift_silence_forward(
    block_a: &[i16],
    pos_a: i64,
    block_b: &[i16],
    pos_b: i64,
) -> (bool, bool) {
    let flat = |buf: &[i16], pos: i64| -> bool {
        let end = (buf.len() as i64).min(pos + MIN_WORDS_RIFT);
        let mut i = pos + 1;
        while i < end {
            if at(buf, i) != at(buf, i - 1) {
                return false;
            }
            i += 1;
        }
        true
    };
    (flat(block_a, pos_a), flat(block_b, pos_b))
}
