//! Fast sample value lookup using hash table indexing.
//!
//! This module implements a 65536-bucket table for O(1) average-case
//! lookup of sample values in audio data. Each bucket corresponds to one
//! possible 16-bit sample value; a chain per bucket lists the positions
//! holding that value in ascending order.
//!
//! The index does not own the samples. [`SortInfo::setup`] declares which
//! slice of a vector is indexed, and the chains are only built on the first
//! query, so a setup that is never queried costs nothing.

/// Number of buckets in the hash table (one per possible 16-bit value)
const NUM_BUCKETS: usize = 65536;

/// Chain terminator
const NONE: usize = usize::MAX;

/// Fast sample value lookup structure.
#[derive(Debug)]
pub struct SortInfo {
    /// Head index for each bucket (65536 buckets)
    heads: Vec<usize>,
    /// Next position in the same bucket, per indexed position
    links: Vec<usize>,
    /// Buckets touched by the last build, so a reset does not sweep all 65536
    used_buckets: Vec<usize>,
    /// Length of the vector being indexed
    size: usize,
    /// Indexed range `[lo, hi)`
    lo: usize,
    hi: usize,
    /// Whether the chains reflect the current setup
    sorted: bool,
}

impl SortInfo {
    /// Create a new empty sort index.
    pub fn new() -> Self {
        Self {
            heads: vec![NONE; NUM_BUCKETS],
            links: Vec::new(),
            used_buckets: Vec::new(),
            size: 0,
            lo: 0,
            hi: 0,
            sorted: false,
        }
    }

    /// Prepare to index positions `[lo, hi)` of a vector of length `size`.
    pub fn setup(&mut self, size: usize, lo: usize, hi: usize) {
        for &bucket in &self.used_buckets {
            self.heads[bucket] = NONE;
        }
        self.used_buckets.clear();
        self.size = size;
        self.hi = hi.min(size);
        self.lo = lo.min(self.hi);
        self.sorted = false;
    }

    fn build(&mut self, vector: &[i16]) {
        self.links.clear();
        self.links.resize(self.size, NONE);
        let hi = self.hi.min(vector.len());
        // Insert back to front so every chain ends up in ascending order.
        for idx in (self.lo..hi).rev() {
            let bucket = sample_to_bucket(vector[idx]);
            if self.heads[bucket] == NONE {
                self.used_buckets.push(bucket);
            }
            self.links[idx] = self.heads[bucket];
            self.heads[bucket] = idx;
        }
        self.sorted = true;
    }

    /// Iterate indexed positions holding `value` within `overlap` of `post`.
    ///
    /// `vector` must be the vector named in the last [`SortInfo::setup`].
    /// Positions come out in ascending order.
    pub fn matches(
        &mut self,
        vector: &[i16],
        post: i64,
        overlap: i64,
        value: i16,
    ) -> MatchIterator<'_> {
        if !self.sorted {
            self.build(vector);
        }
        let size = self.size as i64;
        let post = post.clamp(0, size);
        let lo = (post - overlap).max(0) as usize;
        let hi = (post + overlap).min(size).max(0) as usize;
        MatchIterator {
            links: &self.links,
            current: self.heads[sample_to_bucket(value)],
            lo,
            hi,
        }
    }
}

impl Default for SortInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a 16-bit sample value to a bucket index (0-65535).
#[inline]
fn sample_to_bucket(sample: i16) -> usize {
    (sample as i32 + 32768) as usize
}

/// Iterator over positions matching a sample value.
pub struct MatchIterator<'a> {
    links: &'a [usize],
    current: usize,
    lo: usize,
    hi: usize,
}

impl Iterator for MatchIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current != NONE {
            let idx = self.current;
            if idx >= self.hi {
                self.current = NONE;
                return None;
            }
            self.current = self.links[idx];
            if idx >= self.lo {
                return Some(idx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(data: &[i16]) -> SortInfo {
        let mut sort = SortInfo::new();
        sort.setup(data.len(), 0, data.len());
        sort
    }

    #[test]
    fn test_matches_ascending() {
        let data = vec![100i16, 200, 100, 300, 100];
        let mut sort = indexed(&data);
        let found: Vec<usize> = sort.matches(&data, 2, 10, 100).collect();
        assert_eq!(found, vec![0, 2, 4]);
        assert_eq!(sort.matches(&data, 2, 10, 200).collect::<Vec<_>>(), vec![1]);
        assert_eq!(sort.matches(&data, 2, 10, 999).count(), 0);
    }

    #[test]
    fn test_matches_window() {
        let data = vec![100i16, 200, 100, 300, 100];
        let mut sort = indexed(&data);
        // post 2, overlap 1 searches [1, 3)
        let found: Vec<usize> = sort.matches(&data, 2, 1, 100).collect();
        assert_eq!(found, vec![2]);
        // window clipped to the vector
        let found: Vec<usize> = sort.matches(&data, 10, 2, 100).collect();
        assert_eq!(found, vec![4]);
    }

    #[test]
    fn test_setup_limits_indexed_range() {
        let data = vec![7i16, 7, 7, 7, 7, 7];
        let mut sort = SortInfo::new();
        sort.setup(data.len(), 2, 4);
        let found: Vec<usize> = sort.matches(&data, 3, 10, 7).collect();
        assert_eq!(found, vec![2, 3]);
    }

    #[test]
    fn test_setup_resets_previous_index() {
        let first = vec![1i16, 2, 3];
        let mut sort = indexed(&first);
        assert_eq!(sort.matches(&first, 0, 5, 3).count(), 1);

        let second = vec![4i16, 5, 6, 3];
        sort.setup(second.len(), 0, second.len());
        let found: Vec<usize> = sort.matches(&second, 0, 10, 3).collect();
        assert_eq!(found, vec![3]);
        assert_eq!(sort.matches(&second, 0, 10, 1).count(), 0);
    }

    #[test]
    fn test_sample_to_bucket() {
        assert_eq!(sample_to_bucket(-32768), 0);
        assert_eq!(sample_to_bucket(0), 32768);
        assert_eq!(sample_to_bucket(32767), 65535);
    }
}
