//! Stage 2: fragment against root.
//!
//! Verified fragments are positioned by content against the root, the
//! single reconstruction sectors are handed out from. Once a fragment is
//! anchored, the merge walks outward from the anchor in both directions,
//! classifying every disagreement with rift analysis and repairing
//! whichever side lost or repeated samples. A fragment that reaches past
//! the root's end then extends it.
//!
//! Nothing at or before the root's `returnedlimit` is ever rewritten.

use tracing::{debug, trace};

use crate::{
    block::{CBlock, RootBlock, VFragment},
    cdda::SectorReader,
    constants::MIN_SILENCE_BOUNDARY,
    gap::{analyze_rift_forward, analyze_rift_reverse, analyze_rift_silence_forward, RiftType},
    isort::SortInfo,
    overlap::{overlap_span, try_sort_sync, Stage, SyncMatch, SyncSide},
    paranoia::Paranoia,
    types::ParanoiaCallback,
};

/// Longest stretch of a fragment used to anchor it.
const ANCHOR_WINDOW: i64 = 256;

/// Scan stride through the root when anchoring.
const STAGE2_STRIDE: i64 = 23;

/// What a chase made of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chase {
    /// Root updated; carries the fragment's position error if it extended
    /// the root
    Merged(Option<i64>),
    /// The fragment goes silent where the root does not
    FragmentSilent,
}

impl<R: SectorReader> Paranoia<R> {
    /// Merge fragments into the root until a pass changes nothing.
    pub(crate) fn stage2(&mut self, beginword: i64, cb: &mut dyn FnMut(i64, ParanoiaCallback)) {
        loop {
            self.fragments.sort_by_key(|f| f.begin);
            let pass = self.fragments.clone();
            let mut progress = false;

            for fragment in &pass {
                if !self.fragments.contains(fragment) {
                    continue;
                }
                let merged = if self.root.vector.is_none() {
                    self.init_root(fragment, beginword)
                } else {
                    self.merge_fragment(fragment, cb)
                };
                progress |= merged;
            }

            if !progress && self.root.silenceflag && self.root.vector.is_some() {
                for fragment in &pass {
                    if self.fragments.contains(fragment) && self.silence_match(fragment, cb) {
                        progress = true;
                    }
                }
            }

            if !progress {
                break;
            }
        }
    }

    /// Start the root from the first fragment covering `beginword`.
    fn init_root(&mut self, fragment: &VFragment, beginword: i64) -> bool {
        if !(fragment.begin <= beginword && fragment.end > beginword) {
            return false;
        }
        let Some(samples) = self.fragment_samples(fragment).map(<[i16]>::to_vec) else {
            self.remove_fragment(fragment);
            return false;
        };

        self.root.vector = Some(CBlock::new(samples, fragment.begin));
        self.root.lastsector = fragment.lastsector;
        self.root.returnedlimit = self.root.returnedlimit.max(beginword);
        self.root.silence_test();
        self.remove_fragment(fragment);
        debug!(begin = fragment.begin, end = fragment.end, "root started");
        true
    }

    fn fragment_samples(&self, fragment: &VFragment) -> Option<&[i16]> {
        self.cache
            .iter()
            .find(|c| c.id == fragment.source)
            .and_then(|c| fragment.samples(&c.block))
    }

    /// Anchor one fragment against the root and merge it.
    ///
    /// Returns `true` if the fragment was used up.
    fn merge_fragment(
        &mut self,
        fragment: &VFragment,
        cb: &mut dyn FnMut(i64, ParanoiaCallback),
    ) -> bool {
        let dynoverlap = self.overlap.overlap;
        let Some(samples) = self
            .cache
            .iter()
            .find(|c| c.id == fragment.source)
            .and_then(|c| fragment.samples(&c.block))
        else {
            self.remove_fragment(fragment);
            return false;
        };
        let Some(root) = self.root.vector.as_ref() else {
            return false;
        };

        let anchor = sync_with_root(
            &mut self.sortcache,
            root,
            fragment.begin,
            samples,
            dynoverlap,
            cb,
        );
        let Some(anchor) = anchor else {
            // it should have matched by now; give up on it
            if fragment.end + dynoverlap / 2 * 2 < root.end() && !self.root.silenceflag {
                trace!(begin = fragment.begin, end = fragment.end, "dropping stale fragment");
                self.remove_fragment(fragment);
            }
            return false;
        };

        let mut working = CBlock::new(samples.to_vec(), fragment.begin);
        let outcome = chase(&mut self.root, &mut working, anchor, fragment.lastsector, cb);
        self.remove_fragment(fragment);

        self.record_offset(Stage::One, anchor.offset, cb);
        match outcome {
            Chase::Merged(Some(offset)) => self.record_offset(Stage::Two, offset, cb),
            Chase::Merged(None) => {}
            Chase::FragmentSilent => {
                trace!(begin = fragment.begin, "fragment lost to silence");
            }
        }
        true
    }

    /// Merge a fragment that opens with silence at zero assumed offset.
    ///
    /// Returns `true` if the fragment was used up.
    fn silence_match(
        &mut self,
        fragment: &VFragment,
        cb: &mut dyn FnMut(i64, ParanoiaCallback),
    ) -> bool {
        let dynoverlap = self.overlap.overlap;
        let silencebegin = self.root.silencebegin.max(self.root.returnedlimit);
        let Some(samples) = self
            .cache
            .iter()
            .find(|c| c.id == fragment.source)
            .and_then(|c| fragment.samples(&c.block))
        else {
            return false;
        };
        let size = samples.len() as i64;
        if size < MIN_SILENCE_BOUNDARY {
            return false;
        }
        let lead = samples.iter().take_while(|&&s| s == 0).count() as i64;
        if lead < MIN_SILENCE_BOUNDARY {
            return false;
        }
        let quiet_end = fragment.begin + lead;

        let Some(root) = self.root.vector.as_mut() else {
            return false;
        };
        // close a small gap between the root and the fragment with silence
        if fragment.begin >= root.end() && fragment.begin - dynoverlap < root.end() {
            let pad = fragment.begin + MIN_SILENCE_BOUNDARY - root.end();
            root.append(&vec![0; pad as usize]);
        }

        let begin = fragment.begin.max(silencebegin);
        let end = quiet_end.min(root.end());
        let offset = if begin < end {
            if fragment.end > root.end() {
                let voff = (begin - fragment.begin) as usize;
                root.truncate(usize::try_from(begin - root.begin).unwrap_or(0));
                root.append(&samples[voff..]);
            }
            0
        } else if quiet_end < begin {
            // the root is jittered forward; force the fragment in
            let voff = (quiet_end - fragment.begin) as usize;
            if begin + size - voff as i64 > root.end() {
                root.truncate(usize::try_from(silencebegin - root.begin).unwrap_or(0));
                root.append(&samples[voff..]);
            }
            end - begin
        } else {
            return false;
        };

        self.root.silence_test();
        if fragment.lastsector {
            self.root.lastsector = true;
        }
        self.remove_fragment(fragment);
        debug!(begin = fragment.begin, offset, "merged across silence");
        self.record_offset(Stage::Two, offset, cb);
        true
    }
}

/// Find a run the fragment shares with the root near the root's range.
///
/// Only a short, non-silent window at the start of the fragment is indexed;
/// root positions are scanned within `dynoverlap` of it.
fn sync_with_root(
    sort: &mut SortInfo,
    root: &CBlock,
    frag_begin: i64,
    frag: &[i16],
    dynoverlap: i64,
    cb: &mut dyn FnMut(i64, ParanoiaCallback),
) -> Option<SyncMatch> {
    let frag_end = frag_begin + frag.len() as i64;
    let (rb, re) = (root.begin, root.end());
    if (frag_end + dynoverlap).min(re) - (frag_begin - dynoverlap).max(rb) <= 0 {
        return None;
    }
    cb(frag_begin, ParanoiaCallback::Verify);

    let mut fbv = frag_begin.max(rb - dynoverlap);
    while fbv < frag_end && frag[(fbv - frag_begin) as usize] == 0 {
        fbv += 1;
    }
    if fbv >= frag_end {
        return None;
    }
    let fev = (fbv + ANCHOR_WINDOW).min(re + dynoverlap).min(frag_end);

    let search_end = (fev + dynoverlap).min(re);
    let search_begin = (fbv - dynoverlap).max(rb);
    sort.setup(
        frag.len(),
        (fbv - frag_begin) as usize,
        (fev - frag_begin).max(0) as usize,
    );

    let mut j = search_begin;
    while j < search_end {
        while j < search_end && root.vector[(j - rb) as usize] == 0 {
            j += 1;
        }
        if j >= search_end {
            break;
        }
        let found = try_sort_sync(
            sort,
            SyncSide {
                vector: frag,
                flags: None,
                begin: frag_begin,
            },
            SyncSide {
                vector: &root.vector,
                flags: None,
                begin: rb,
            },
            j,
            dynoverlap,
        );
        if let Some(m) = found {
            if m.offset != 0 {
                cb(m.begin, ParanoiaCallback::FixupEdge);
            }
            return Some(m);
        }
        j += STAGE2_STRIDE;
    }
    None
}

fn slice(vector: &[i16], lo: i64, hi: i64) -> Option<&[i16]> {
    let lo = usize::try_from(lo).ok()?;
    let hi = usize::try_from(hi).ok()?;
    vector.get(lo..hi)
}

/// Walk outward from an anchored run, repairing rifts, then extend the
/// root with whatever the fragment carries past its end.
///
/// `l` is a private copy of the fragment; repairs to the fragment side are
/// made there.
fn chase(
    root_block: &mut RootBlock,
    l: &mut CBlock,
    anchor: SyncMatch,
    lastsector: bool,
    cb: &mut dyn FnMut(i64, ParanoiaCallback),
) -> Chase {
    let returnedlimit = root_block.returnedlimit;
    let Some(root) = root_block.vector.as_mut() else {
        return Chase::Merged(None);
    };
    let rb = root.begin;

    // root indices of the run, and fragment index minus root index
    let mut begin = anchor.begin - rb;
    let mut end = anchor.end - rb;
    let mut offset = rb - anchor.offset - l.begin;

    // backward
    while begin + offset > 0 && begin > 0 {
        let begin_l = begin + offset;
        match analyze_rift_reverse(&root.vector, begin - 1, &l.vector, begin_l - 1) {
            RiftType::DroppedFromA(n) => {
                cb(begin + rb - 1, ParanoiaCallback::FixupDropped);
                if rb + begin < returnedlimit {
                    break;
                }
                let Some(missing) = slice(&l.vector, begin_l - n, begin_l) else {
                    break;
                };
                root.insert(begin as usize, missing);
                offset -= n;
                begin += n;
                end += n;
            }
            RiftType::StutterInA(n) => {
                cb(begin + rb - 1, ParanoiaCallback::FixupDuplicated);
                if rb + begin - n < returnedlimit {
                    break;
                }
                root.remove((begin - n) as usize, n as usize);
                offset += n;
                begin -= n;
                end -= n;
            }
            RiftType::DroppedFromB(n) => {
                cb(begin + rb - 1, ParanoiaCallback::FixupDropped);
                let Some(missing) = slice(&root.vector, begin - n, begin) else {
                    break;
                };
                l.insert(begin_l as usize, missing);
                offset += n;
            }
            RiftType::StutterInB(n) => {
                cb(begin + rb - 1, ParanoiaCallback::FixupDuplicated);
                l.remove((begin_l - n) as usize, n as usize);
                offset -= n;
            }
            RiftType::Garbage(n) => {
                if rb + begin - n < returnedlimit {
                    break;
                }
                let Some(fix) = slice(&l.vector, begin_l - n, begin_l) else {
                    break;
                };
                root.overwrite((begin - n) as usize, fix);
            }
            RiftType::Unknown => break,
        }
        let stuck = begin;
        let (new_begin, new_end) = overlap_span(&root.vector, &l.vector, begin, begin + offset);
        if new_begin >= stuck {
            break;
        }
        begin = new_begin;
        end = new_end.max(end);
    }

    // forward
    while end + offset < l.len() as i64 && end < root.len() as i64 {
        let end_l = end + offset;
        match analyze_rift_forward(&root.vector, end, &l.vector, end_l) {
            RiftType::DroppedFromA(n) => {
                cb(end + rb, ParanoiaCallback::FixupDropped);
                if end + rb < returnedlimit {
                    break;
                }
                let Some(missing) = slice(&l.vector, end_l, end_l + n) else {
                    break;
                };
                root.insert(end as usize, missing);
            }
            RiftType::StutterInA(n) => {
                cb(end + rb, ParanoiaCallback::FixupDuplicated);
                if end + rb < returnedlimit {
                    break;
                }
                root.remove(end as usize, n as usize);
            }
            RiftType::DroppedFromB(n) => {
                cb(end + rb, ParanoiaCallback::FixupDropped);
                let Some(missing) = slice(&root.vector, end, end + n) else {
                    break;
                };
                l.insert(end_l as usize, missing);
            }
            RiftType::StutterInB(n) => {
                cb(end + rb, ParanoiaCallback::FixupDuplicated);
                l.remove(end_l as usize, n as usize);
            }
            RiftType::Garbage(n) => {
                if end + rb < returnedlimit {
                    break;
                }
                let Some(fix) = slice(&l.vector, end_l, end_l + n) else {
                    break;
                };
                root.overwrite(end as usize, fix);
            }
            RiftType::Unknown => {
                let (root_silent, frag_silent) =
                    analyze_rift_silence_forward(&root.vector, end, &l.vector, end_l);
                if root_silent {
                    if end + rb >= returnedlimit {
                        root.truncate(end as usize);
                    }
                } else if frag_silent {
                    return Chase::FragmentSilent;
                }
                break;
            }
        }
        let stuck = end;
        let (_, new_end) = overlap_span(&root.vector, &l.vector, begin, begin + offset);
        if new_end <= stuck {
            break;
        }
        end = new_end;
    }

    // extend the root if the fragment reaches further
    let size_root = root.len() as i64;
    let size_l = l.len() as i64;
    if size_l - offset <= size_root && !lastsector {
        return Chase::Merged(None);
    }
    if end < size_root && rb + end < returnedlimit {
        return Chase::Merged(None);
    }
    if end < size_root {
        root.truncate(end as usize);
    }
    if let Some(tail) = slice(&l.vector, end + offset, size_l) {
        root.append(tail);
    }
    if lastsector {
        root_block.lastsector = true;
    }
    root_block.silence_test();
    Chase::Merged(Some(offset + l.begin - rb))
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

    /// A session whose root holds `root` at `begin`, with one fragment
    /// covering all of `fragment` at `frag_begin`.
    fn setup(
        root: Vec<i16>,
        begin: i64,
        fragment: Vec<i16>,
        frag_begin: i64,
    ) -> Paranoia<MemoryDrive> {
        let mut p = Paranoia::new(MemoryDrive::new(0, vec![0; CD_FRAMEWORDS]));
        p.root.vector = Some(CBlock::new(root, begin));
        p.root.returnedlimit = begin;
        p.root.silence_test();
        let end = frag_begin + fragment.len() as i64;
        let id = p.push_cache(CBlock::new(fragment, frag_begin));
        p.fragments.push(VFragment {
            source: id,
            begin: frag_begin,
            end,
            lastsector: false,
        });
        p
    }

    fn run(p: &mut Paranoia<MemoryDrive>, beginword: i64) -> Vec<(i64, ParanoiaCallback)> {
        let mut events = Vec::new();
        p.stage2(beginword, &mut |pos, ev| events.push((pos, ev)));
        events
    }

    fn root_of(p: &Paranoia<MemoryDrive>) -> Vec<i16> {
        p.root.vector.as_ref().map(|v| v.vector.clone()).unwrap_or_default()
    }

    #[test]
    fn test_extends_root() {
        let t = signal(6000, 0);
        let mut p = setup(t[..4000].to_vec(), 0, t[1000..].to_vec(), 1000);
        run(&mut p, 0);
        assert_eq!(root_of(&p), t);
        assert_eq!(p.fragment_count(), 0);
    }

    #[test]
    fn test_fragment_dropped_samples() {
        let t = signal(6000, 0);
        for n in [1usize, 5, 12] {
            let mut frag = t[1000..].to_vec();
            frag.drain(1000..1000 + n);
            let mut p = setup(t[..4000].to_vec(), 0, frag, 1000);
            let events = run(&mut p, 0);
            assert!(events.contains(&(2000, ParanoiaCallback::FixupDropped)), "n={n}");
            assert_eq!(root_of(&p), t, "n={n}");
        }
    }

    #[test]
    fn test_fragment_duplicated_samples() {
        let t = signal(6000, 0);
        for n in [1usize, 4, 9] {
            let mut frag = t[1000..2000].to_vec();
            frag.extend_from_slice(&t[2000 - n..2000]);
            frag.extend_from_slice(&t[2000..]);
            let mut p = setup(t[..4000].to_vec(), 0, frag, 1000);
            let events = run(&mut p, 0);
            assert!(events.contains(&(2000, ParanoiaCallback::FixupDuplicated)), "n={n}");
            assert_eq!(root_of(&p), t, "n={n}");
        }
    }

    #[test]
    fn test_root_dropped_samples_repaired() {
        let t = signal(6000, 0);
        let n = 3;
        let mut root = t[..4000].to_vec();
        root.drain(2000..2000 + n);
        let mut p = setup(root, 0, t[1000..].to_vec(), 1000);
        let events = run(&mut p, 0);
        assert!(events.contains(&(2000, ParanoiaCallback::FixupDropped)));
        assert_eq!(root_of(&p), t);
    }

    #[test]
    fn test_root_duplicated_samples_repaired() {
        let t = signal(6000, 0);
        let mut root = t[..2000].to_vec();
        root.extend_from_slice(&t[1995..2000]);
        root.extend_from_slice(&t[2000..4000]);
        let mut p = setup(root, 0, t[1000..].to_vec(), 1000);
        let events = run(&mut p, 0);
        assert!(events.contains(&(2000, ParanoiaCallback::FixupDuplicated)));
        assert_eq!(root_of(&p), t);
    }

    #[test]
    fn test_delivered_root_is_never_rewritten() {
        let t = signal(6000, 0);
        let mut root = t[..4000].to_vec();
        root.drain(2000..2003);
        let before = root.clone();
        let mut p = setup(root, 0, t[1000..].to_vec(), 1000);
        p.root.returnedlimit = 3000;

        let events = run(&mut p, 0);
        assert!(events.contains(&(2000, ParanoiaCallback::FixupDropped)));
        assert_eq!(root_of(&p), before);
        assert_eq!(p.returned_limit(), 3000);
    }

    #[test]
    fn test_dropped_sample_within_sectors() {
        // root holds sectors [100, 108); a later read lost one sample
        let fw = CD_FRAMEWORDS as i64;
        let truth = signal(8 * CD_FRAMEWORDS, 7);
        let rb = 100 * fw;
        let mut frag = truth.clone();
        frag.remove(500);
        let mut p = setup(truth.clone(), rb, frag, rb);

        let events = run(&mut p, rb);
        assert!(events.contains(&(rb + 500, ParanoiaCallback::FixupDropped)));
        assert_eq!(p.root_samples(rb + 500, rb + 501), Some(&truth[500..501]));
        assert_eq!(root_of(&p), truth);
        assert_eq!(p.fragment_count(), 0);
    }

    #[test]
    fn test_init_root_needs_cover() {
        let t = signal(3000, 0);
        let mut p = Paranoia::new(MemoryDrive::new(0, vec![0; CD_FRAMEWORDS]));
        let id = p.push_cache(CBlock::new(t.clone(), 1000));
        p.fragments.push(VFragment {
            source: id,
            begin: 1000,
            end: 4000,
            lastsector: true,
        });

        run(&mut p, 500);
        assert_eq!(p.root_range(), None);
        assert_eq!(p.fragment_count(), 1);

        run(&mut p, 1500);
        assert_eq!(p.root_range(), Some((1000, 4000)));
        assert_eq!(p.returned_limit(), 1500);
        assert!(p.root.lastsector);
        assert_eq!(p.fragment_count(), 0);
    }

    #[test]
    fn test_unmatched_stale_fragment_dropped() {
        let t = signal(3000, 0);
        let other = signal(500, 30000);
        let mut p = setup(t, 0, other, 100);
        p.overlap.set_fixed(128);
        run(&mut p, 0);
        assert_eq!(p.fragment_count(), 0);
        assert_eq!(p.root_range(), Some((0, 3000)));
    }

    #[test]
    fn test_unmatched_fragment_ahead_is_kept() {
        let t = signal(3000, 0);
        let ahead = signal(500, 30000);
        let mut p = setup(t, 0, ahead, 2900);
        run(&mut p, 0);
        assert_eq!(p.fragment_count(), 1);
    }

    #[test]
    fn test_silence_merge() {
        let mut root = signal(2000, 0);
        root.extend(std::iter::repeat_n(0, 2000));
        let tail = signal(1000, 30000);
        let mut frag = vec![0i16; 1500];
        frag.extend_from_slice(&tail);

        let mut p = setup(root, 0, frag, 3000);
        assert!(p.root.silenceflag);
        run(&mut p, 0);

        let merged = root_of(&p);
        assert_eq!(merged.len(), 5500);
        assert!(merged[2000..4500].iter().all(|&s| s == 0));
        assert_eq!(&merged[4500..], &tail[..]);
        assert_eq!(p.fragment_count(), 0);
        assert!(!p.root.silenceflag);
    }

    #[test]
    fn test_silence_merge_pads_gap() {
        let mut root = signal(1000, 0);
        root.extend(std::iter::repeat_n(0, 1500));
        let tail = signal(800, 30000);
        let mut frag = vec![0i16; 1200];
        frag.extend_from_slice(&tail);

        // fragment starts 100 samples past the root's end
        let mut p = setup(root, 0, frag, 2600);
        run(&mut p, 0);

        let merged = root_of(&p);
        assert_eq!(merged.len(), 2600 + 2000);
        assert_eq!(&merged[3800..], &tail[..]);
    }
}
