//! Stage 1: block against block.
//!
//! A freshly read block is compared with every block still in the cache.
//! Runs that two independent reads agree on are marked verified in both,
//! and the verified runs of the new block become fragments for stage 2.

use tracing::trace;

use crate::{
    block::{BlockId, CBlock, VFragment},
    cdda::SectorReader,
    constants::OVERLAP_ADJ,
    isort::SortInfo,
    overlap::{try_sort_sync, Stage, SyncMatch, SyncSide},
    paranoia::Paranoia,
    types::{ParanoiaCallback, SampleFlags},
};

/// Scan stride through the common range of two blocks.
const STAGE1_STRIDE: i64 = 23;

impl<R: SectorReader> Paranoia<R> {
    /// Cross-check the newest cached block against every older one.
    pub(crate) fn stage1(&mut self, cb: &mut dyn FnMut(i64, ParanoiaCallback)) {
        let overlap = self.overlap.overlap;
        let Some((newest, older)) = self.cache.split_last_mut() else {
            return;
        };

        let mut offsets = Vec::new();
        if !older.is_empty() {
            let size = newest.block.len();
            self.sortcache.setup(size, 0, size);
            for old in older.iter_mut() {
                cb(newest.block.begin, ParanoiaCallback::Verify);
                offsets.extend(match_blocks(
                    &mut self.sortcache,
                    &mut old.block,
                    &mut newest.block,
                    overlap,
                    cb,
                ));
            }
        }

        let fragments = verified_fragments(newest.id, &newest.block);
        trace!(
            block = newest.id,
            matches = offsets.len(),
            fragments = fragments.len(),
            "stage 1"
        );
        self.fragments.extend(fragments);

        for offset in offsets {
            self.record_offset(Stage::One, offset, cb);
        }
    }
}

/// Find every run `new` shares with `old` and mark it verified in both.
///
/// Returns the offset of each match (old position minus new position).
fn match_blocks(
    sort: &mut SortInfo,
    old: &mut CBlock,
    new: &mut CBlock,
    overlap: i64,
    cb: &mut dyn FnMut(i64, ParanoiaCallback),
) -> Vec<i64> {
    let search_begin = old.begin.max(new.begin);
    let search_end = old.end().min(new.end());
    let mut offsets = Vec::new();

    let mut j = search_begin;
    while j < search_end {
        let open = new
            .get_flags(j)
            .is_some_and(|f| !f.intersects(SampleFlags::VERIFIED | SampleFlags::UNREAD));
        if open {
            let found = try_sort_sync(
                sort,
                SyncSide {
                    vector: &new.vector,
                    flags: Some(&new.flags),
                    begin: new.begin,
                },
                SyncSide {
                    vector: &old.vector,
                    flags: Some(&old.flags),
                    begin: old.begin,
                },
                j,
                overlap,
            );
            if let Some(m) = found {
                // runs of silence agree at any offset; keep them quiet
                let lo = (m.begin - old.begin) as usize;
                let hi = (m.end - old.begin) as usize;
                if old.vector[lo..hi].iter().any(|&s| s != 0) {
                    report_fixups(old, new, m, cb);
                }
                new.mark(
                    m.begin - m.offset + OVERLAP_ADJ,
                    m.end - m.offset - OVERLAP_ADJ,
                    SampleFlags::VERIFIED,
                );
                old.mark(m.begin + OVERLAP_ADJ, m.end - OVERLAP_ADJ, SampleFlags::VERIFIED);
                offsets.push(m.offset);
                j = j.max(m.end - 1);
            }
        }
        j += STAGE1_STRIDE;
    }
    offsets
}

/// Report how each end of a match was repaired.
///
/// An end at a read seam or at either block's edge is an edge fixup, and
/// only worth reporting when the blocks were offset; anything else means
/// the run was found inside a read.
fn report_fixups(
    old: &CBlock,
    new: &CBlock,
    m: SyncMatch,
    cb: &mut dyn FnMut(i64, ParanoiaCallback),
) {
    let edge_at = |block: &CBlock, pos: i64| block.get_flags(pos).is_some_and(SampleFlags::is_edge);

    let begin_edge = m.begin - m.offset <= new.begin
        || m.begin <= old.begin
        || edge_at(new, m.begin - m.offset)
        || edge_at(old, m.begin);
    if !begin_edge {
        cb(m.begin, ParanoiaCallback::FixupAtom);
    } else if m.offset != 0 {
        cb(m.begin, ParanoiaCallback::FixupEdge);
    }

    let end_edge = m.end - m.offset >= new.end()
        || edge_at(new, m.end - m.offset)
        || m.end >= old.end()
        || edge_at(old, m.end);
    if !end_edge {
        cb(m.end, ParanoiaCallback::FixupAtom);
    } else if m.offset != 0 {
        cb(m.end, ParanoiaCallback::FixupEdge);
    }
}

/// One fragment per maximal verified run of `block`, widened back by the
/// margin the marking trimmed off.
pub(crate) fn verified_fragments(source: BlockId, block: &CBlock) -> Vec<VFragment> {
    let size = block.len() as i64;
    let verified = |i: i64| block.flags[i as usize].is_verified();
    let mut fragments = Vec::new();

    let mut begin = 0;
    while begin < size {
        while begin < size && !verified(begin) {
            begin += 1;
        }
        if begin >= size {
            break;
        }
        let mut end = begin;
        while end < size && verified(end) {
            end += 1;
        }
        fragments.push(VFragment {
            source,
            begin: block.begin + (begin - OVERLAP_ADJ).max(0),
            end: block.begin + (end + OVERLAP_ADJ).min(size),
            lastsector: end + OVERLAP_ADJ >= size && block.lastsector,
        });
        begin = end;
    }
    fragments
}

/// One fragment per stretch between read seams, for overlap-only mode.
pub(crate) fn edge_fragments(source: BlockId, block: &CBlock) -> Vec<VFragment> {
    let size = block.len() as i64;
    let edge = |i: i64| block.flags[i as usize].is_edge();
    let mut fragments = Vec::new();

    let mut begin = 0;
    while begin < size {
        while begin < size && edge(begin) {
            begin += 1;
        }
        if begin >= size {
            break;
        }
        let mut end = begin + 1;
        while end < size && !edge(end) {
            end += 1;
        }
        fragments.push(VFragment {
            source,
            begin: block.begin + begin,
            end: block.begin + end,
            lastsector: block.lastsector && end == size,
        });
        begin = end;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cdda::MemoryDrive, constants::CD_FRAMEWORDS};

    fn signal(len: usize, seed: i64) -> Vec<i16> {
        (0..len as i64)
            .map(|i| (((i + seed) * 7919 + 13) % 65521 - 32000) as i16)
            .collect()
    }

    fn session() -> Paranoia<MemoryDrive> {
        Paranoia::new(MemoryDrive::new(0, vec![0; CD_FRAMEWORDS]))
    }

    fn run_stage1(p: &mut Paranoia<MemoryDrive>) -> Vec<(i64, ParanoiaCallback)> {
        let mut events = Vec::new();
        p.stage1(&mut |pos, ev| events.push((pos, ev)));
        events
    }

    #[test]
    fn test_identical_blocks_verify() {
        let truth = signal(3000, 0);
        let mut p = session();
        p.push_cache(CBlock::new(truth.clone(), 1000));
        let id = p.push_cache(CBlock::new(truth, 1000));

        let events = run_stage1(&mut p);
        assert_eq!(events, vec![(1000, ParanoiaCallback::Verify)]);
        assert_eq!(
            p.fragments,
            vec![VFragment {
                source: id,
                begin: 1000,
                end: 4000,
                lastsector: false,
            }]
        );
        let old = &p.cache[0].block;
        assert!(!old.flags[30].is_verified());
        assert!(old.flags[31].is_verified());
        assert!(old.flags[2968].is_verified());
        assert!(!old.flags[2969].is_verified());
    }

    #[test]
    fn test_first_block_makes_no_fragments() {
        let mut p = session();
        p.push_cache(CBlock::new(signal(3000, 0), 0));
        assert!(run_stage1(&mut p).is_empty());
        assert_eq!(p.fragment_count(), 0);
    }

    #[test]
    fn test_shifted_read_reports_edge_fixup() {
        let truth = signal(4000, 0);
        let mut p = session();
        p.push_cache(CBlock::new(truth.clone(), 0));
        // claims to start at 0 but really starts 10 samples in
        p.push_cache(CBlock::new(truth[10..].to_vec(), 0));

        let events = run_stage1(&mut p);
        assert!(events.contains(&(10, ParanoiaCallback::FixupEdge)));
        assert_eq!(p.fragment_count(), 1);
        assert_eq!(p.fragments[0].begin, 0);
        assert_eq!(p.fragments[0].end, 3990);
    }

    #[test]
    fn test_run_must_exceed_minimum() {
        let old = signal(3000, 0);
        let mut short = signal(3000, 40000);
        short[1000..1050].copy_from_slice(&old[1000..1050]);
        let mut long = signal(3000, 40000);
        long[1000..1100].copy_from_slice(&old[1000..1100]);

        let mut p = session();
        p.push_cache(CBlock::new(old.clone(), 0));
        p.push_cache(CBlock::new(short, 0));
        run_stage1(&mut p);
        assert_eq!(p.fragment_count(), 0);
        assert!(p.cache[1].block.flags.iter().all(|f| !f.is_verified()));

        let mut p = session();
        p.push_cache(CBlock::new(old, 0));
        p.push_cache(CBlock::new(long, 0));
        run_stage1(&mut p);
        let flags = &p.cache[1].block.flags;
        let verified: Vec<usize> = (0..flags.len()).filter(|&i| flags[i].is_verified()).collect();
        assert_eq!(verified.first(), Some(&1031));
        assert_eq!(verified.last(), Some(&1068));
        assert_eq!(p.fragments[0].begin, 1000);
        assert_eq!(p.fragments[0].end, 1100);
    }

    #[test]
    fn test_unread_samples_never_verify() {
        let truth = signal(3000, 0);
        let mut p = session();
        p.push_cache(CBlock::new(truth.clone(), 0));
        let mut block = CBlock::new(truth, 0);
        block.mark(1000, 1200, SampleFlags::UNREAD);
        p.push_cache(block);

        run_stage1(&mut p);
        let flags = &p.cache[1].block.flags;
        assert!((1000..1200).all(|i| !flags[i].is_verified()));
        let spans: Vec<(i64, i64)> = p.fragments.iter().map(|f| (f.begin, f.end)).collect();
        assert_eq!(spans, vec![(0, 1000), (1200, 3000)]);
    }

    #[test]
    fn test_silent_match_is_quiet() {
        let mut p = session();
        p.push_cache(CBlock::new(vec![0; 2000], 0));
        p.push_cache(CBlock::new(vec![0; 2000], 0));
        let events = run_stage1(&mut p);
        assert_eq!(events, vec![(0, ParanoiaCallback::Verify)]);
        assert_eq!(p.fragment_count(), 1);
    }

    #[test]
    fn test_lastsector_fragment() {
        let mut block = CBlock::new(vec![1; 500], 0);
        block.lastsector = true;
        block.mark(100, 300, SampleFlags::VERIFIED);
        block.mark(350, 480, SampleFlags::VERIFIED);
        let fragments = verified_fragments(7, &block);
        assert_eq!(fragments.len(), 2);
        assert!(!fragments[0].lastsector);
        assert!(fragments[1].lastsector);
        assert_eq!((fragments[1].begin, fragments[1].end), (319, 500));
    }

    #[test]
    fn test_edge_fragments() {
        let mut block = CBlock::new(vec![1; 300], 100);
        block.lastsector = true;
        block.mark(100 + 90, 100 + 110, SampleFlags::EDGE);
        block.mark(100 + 200, 100 + 220, SampleFlags::EDGE);
        let spans: Vec<(i64, i64, bool)> = edge_fragments(1, &block)
            .iter()
            .map(|f| (f.begin, f.end, f.lastsector))
            .collect();
        assert_eq!(
            spans,
            vec![(100, 190, false), (210, 300, false), (320, 400, true)]
        );
    }
}
