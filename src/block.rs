//! Data block structures for caching and verification.
//!
//! A [`CBlock`] holds one batch of raw reads together with per-sample
//! flags. A [`VFragment`] names a verified span inside a cached block
//! without copying it, and the [`RootBlock`] is the single growing
//! reconstruction that sectors are handed out from.

use crate::constants::{MIN_SILENCE_BOUNDARY, CD_FRAMEWORDS};
use crate::types::SampleFlags;

/// Identity of a block in the read cache.
pub type BlockId = u64;

/// Raw CD read cache block.
///
/// Stores audio samples read from the CD along with per-sample metadata
/// for verification status. `flags` always has the same length as
/// `vector`; the editing operations keep them in step.
#[derive(Debug, Clone, Default)]
pub struct CBlock {
    /// Raw 16-bit audio samples
    pub vector: Vec<i16>,
    /// Per-sample flags (edge, unread, verified)
    pub flags: Vec<SampleFlags>,
    /// Absolute position in words of `vector[0]`
    pub begin: i64,
    /// Whether this block reaches the last sector of the audio range
    pub lastsector: bool,
}

impl CBlock {
    /// Create a block from samples with all flags clear.
    pub fn new(vector: Vec<i16>, begin: i64) -> Self {
        let flags = vec![SampleFlags::NONE; vector.len()];
        Self {
            vector,
            flags,
            begin,
            lastsector: false,
        }
    }

    /// Create a block from samples and matching flags.
    pub fn with_flags(vector: Vec<i16>, flags: Vec<SampleFlags>, begin: i64) -> Self {
        debug_assert_eq!(vector.len(), flags.len());
        Self {
            vector,
            flags,
            begin,
            lastsector: false,
        }
    }

    /// Get the number of samples in this block.
    #[inline]
    pub fn len(&self) -> usize {
        self.vector.len()
    }

    /// Check if the block is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }

    /// Get the ending position (exclusive) of this block.
    #[inline]
    pub fn end(&self) -> i64 {
        self.begin + self.vector.len() as i64
    }

    /// Check if a position falls within this block.
    #[inline]
    pub fn contains(&self, pos: i64) -> bool {
        pos >= self.begin && pos < self.end()
    }

    /// Get a sample at an absolute position.
    pub fn get(&self, pos: i64) -> Option<i16> {
        self.index_of(pos).map(|i| self.vector[i])
    }

    /// Get flags at an absolute position.
    pub fn get_flags(&self, pos: i64) -> Option<SampleFlags> {
        self.index_of(pos).map(|i| self.flags[i])
    }

    /// Convert an absolute position to an index into `vector`.
    #[inline]
    pub fn index_of(&self, pos: i64) -> Option<usize> {
        self.contains(pos).then(|| (pos - self.begin) as usize)
    }

    /// Set `flag` on every sample in the absolute range `[start, end)`.
    pub fn mark(&mut self, start: i64, end: i64, flag: SampleFlags) {
        let lo = (start - self.begin).clamp(0, self.len() as i64) as usize;
        let hi = (end - self.begin).clamp(0, self.len() as i64) as usize;
        if lo < hi {
            for f in &mut self.flags[lo..hi] {
                *f |= flag;
            }
        }
    }

    /// Insert samples before index `at`.
    pub fn insert(&mut self, at: usize, samples: &[i16]) {
        let at = at.min(self.len());
        self.vector.splice(at..at, samples.iter().copied());
        self.flags
            .splice(at..at, std::iter::repeat_n(SampleFlags::NONE, samples.len()));
    }

    /// Remove up to `count` samples starting at index `at`.
    pub fn remove(&mut self, at: usize, count: usize) {
        let at = at.min(self.len());
        let end = at.saturating_add(count).min(self.len());
        self.vector.drain(at..end);
        self.flags.drain(at..end);
    }

    /// Drop everything from index `at` onward.
    pub fn truncate(&mut self, at: usize) {
        self.vector.truncate(at);
        self.flags.truncate(at);
    }

    /// Remove `count` samples from the front, advancing `begin`.
    pub fn remove_front(&mut self, count: usize) {
        let count = count.min(self.len());
        self.vector.drain(..count);
        self.flags.drain(..count);
        self.begin += count as i64;
    }

    /// Overwrite samples starting at index `at`, clipped to the block.
    pub fn overwrite(&mut self, at: usize, samples: &[i16]) {
        if at >= self.len() {
            return;
        }
        let n = samples.len().min(self.len() - at);
        self.vector[at..at + n].copy_from_slice(&samples[..n]);
    }

    /// Append samples at the end.
    pub fn append(&mut self, samples: &[i16]) {
        self.vector.extend_from_slice(samples);
        self.flags
            .extend(std::iter::repeat_n(SampleFlags::NONE, samples.len()));
    }
}

/// A block in the read cache, tagged with its identity.
#[derive(Debug, Clone)]
pub struct CachedBlock {
    pub id: BlockId,
    pub block: CBlock,
}

/// Verified data fragment.
///
/// A span of one cached block whose samples matched another read. The
/// fragment borrows its samples from the block; dropping the block drops
/// the fragment with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VFragment {
    /// Block the samples live in
    pub source: BlockId,
    /// Absolute position in words
    pub begin: i64,
    /// Absolute end position (exclusive)
    pub end: i64,
    /// Whether the fragment carries the final samples of the disc
    pub lastsector: bool,
}

impl VFragment {
    /// Get the number of samples.
    #[inline]
    pub fn len(&self) -> i64 {
        self.end - self.begin
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Resolve the fragment's samples inside its source block.
    pub fn samples<'a>(&self, block: &'a CBlock) -> Option<&'a [i16]> {
        let lo = self.begin - block.begin;
        let hi = self.end - block.begin;
        if lo < 0 || hi > block.len() as i64 || lo > hi {
            return None;
        }
        Some(&block.vector[lo as usize..hi as usize])
    }
}

/// Root block containing the verified output data.
#[derive(Debug, Default)]
pub struct RootBlock {
    /// Reconstructed samples, absent until the first fragment lands
    pub vector: Option<CBlock>,
    /// Everything before this absolute position has been handed out
    pub returnedlimit: i64,
    /// Root reaches the last sector of the audio range
    pub lastsector: bool,
    /// Root currently ends in a run of silence
    pub silenceflag: bool,
    /// Absolute position where that trailing silence starts
    pub silencebegin: i64,
}

impl RootBlock {
    /// Absolute start of the reconstruction.
    #[inline]
    pub fn begin(&self) -> Option<i64> {
        self.vector.as_ref().map(|v| v.begin)
    }

    /// Absolute end (exclusive) of the reconstruction.
    #[inline]
    pub fn end(&self) -> Option<i64> {
        self.vector.as_ref().map(CBlock::end)
    }

    /// Whether `[begin, end)` lies entirely inside the reconstruction.
    pub fn covers(&self, begin: i64, end: i64) -> bool {
        self.vector
            .as_ref()
            .is_some_and(|v| v.begin <= begin && v.end() >= end)
    }

    /// Borrow the samples in the absolute range `[begin, end)`.
    pub fn samples(&self, begin: i64, end: i64) -> Option<&[i16]> {
        let v = self.vector.as_ref()?;
        if begin < v.begin || end > v.end() || begin > end {
            return None;
        }
        let lo = (begin - v.begin) as usize;
        let hi = (end - v.begin) as usize;
        Some(&v.vector[lo..hi])
    }

    /// Extract the sector of audio starting at absolute word `pos`.
    pub fn sector(&self, pos: i64) -> Option<&[i16]> {
        self.samples(pos, pos + CD_FRAMEWORDS as i64)
    }

    /// Re-evaluate whether the reconstruction ends in silence.
    ///
    /// The trailing run counts as silence when it is all zero, or when it
    /// is longer than `MIN_SILENCE_BOUNDARY`. The silence start never moves
    /// back before `returnedlimit`.
    pub fn silence_test(&mut self) {
        self.silenceflag = false;
        let Some(v) = self.vector.as_ref() else {
            return;
        };
        let end = v.len() as i64 - 1;
        let mut j = end - 1;
        while j >= 0 && v.vector[j as usize] == 0 {
            j -= 1;
        }
        if j < 0 || end - j > MIN_SILENCE_BOUNDARY {
            self.silenceflag = true;
            self.silencebegin = (j.max(0) + v.begin).max(self.returnedlimit);
        }
    }

    /// Discard the reconstruction, keeping the delivery boundary.
    pub fn clear(&mut self) {
        self.vector = None;
        self.lastsector = false;
        self.silenceflag = false;
        self.silencebegin = 0;
    }

    /// Discard the reconstruction and forget everything delivered.
    pub fn reset(&mut self) {
        self.clear();
        self.returnedlimit = 0;
    }
}
