//! The verification session.
//!
//! [`Paranoia`] owns a [`SectorReader`] and turns its unreliable reads into
//! a verified stream, one sector at a time. Every request loops: merge the
//! fragments already verified into the root, and if the root still falls
//! short of the sector plus a safety margin, read another overlapping block,
//! cross-check it against the cache and try again. Stalls climb the retry
//! ladder in [`crate::backoff`] until the sector verifies or is skipped.

use std::io::SeekFrom;

use tracing::{debug, trace, warn};

use crate::{
    backoff::{BackoffAction, BackoffStrategy},
    block::{BlockId, CBlock, CachedBlock, RootBlock, VFragment},
    cdda::{decode_samples, DiscGeometry, SectorReader},
    config::ParanoiaConfig,
    constants::{
        CDIO_CD_FRAMESIZE_RAW, CD_FRAMEWORDS, DEFAULT_CACHE_LIMIT, DEFAULT_MAX_RETRIES,
        DEFAULT_READAHEAD, JIGGLE_MODULO, MAX_DYNOVERLAP, MIN_SECTOR_BACKUP, MIN_WORDS_OVERLAP,
        OVERLAP_ADJ,
    },
    error::{Error, Result},
    isort::SortInfo,
    overlap::{DynamicOverlap, Stage},
    types::{Lsn, ParanoiaCallback, ParanoiaMode, SampleFlags},
};

/// Callback function type for progress reporting.
pub type CallbackFn = Box<dyn FnMut(i64, ParanoiaCallback) + Send>;

const FW: i64 = CD_FRAMEWORDS as i64;

/// A verified-read session over one drive.
pub struct Paranoia<R: SectorReader> {
    pub(crate) reader: R,
    pub(crate) mode: ParanoiaMode,
    /// Sectors per cache block
    pub(crate) readahead: usize,
    pub(crate) cache_limit: usize,
    pub(crate) max_retries: u32,
    /// Audio range reads are clipped to
    pub(crate) geometry: DiscGeometry,
    /// Next sector to deliver
    pub(crate) cursor: i64,
    /// Sector just past the last drive read
    pub(crate) lastread: i64,
    /// Rotating read-start perturbation, `0..JIGGLE_MODULO`
    pub(crate) jitter: i64,
    /// Cached blocks, oldest first
    pub(crate) cache: Vec<CachedBlock>,
    pub(crate) next_block_id: BlockId,
    pub(crate) fragments: Vec<VFragment>,
    pub(crate) root: RootBlock,
    pub(crate) sortcache: SortInfo,
    pub(crate) overlap: DynamicOverlap,
    callback: Option<CallbackFn>,
}

impl<R: SectorReader> std::fmt::Debug for Paranoia<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paranoia")
            .field("mode", &self.mode)
            .field("cursor", &self.cursor)
            .field("geometry", &self.geometry)
            .field("cached_blocks", &self.cache.len())
            .field("fragments", &self.fragments.len())
            .field("root", &self.root_range())
            .field("overlap", &self.overlap.overlap)
            .field("drift", &self.overlap.drift)
            .finish_non_exhaustive()
    }
}

impl<R: SectorReader> Paranoia<R> {
    /// Start a session at the first audio sector with default settings.
    pub fn new(reader: R) -> Self {
        let geometry = reader.geometry();
        Self {
            reader,
            mode: ParanoiaMode::FULL,
            readahead: DEFAULT_READAHEAD,
            cache_limit: DEFAULT_CACHE_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            geometry,
            cursor: i64::from(geometry.first_sector),
            lastread: i64::MAX,
            jitter: 0,
            cache: Vec::new(),
            next_block_id: 0,
            fragments: Vec::new(),
            root: RootBlock::default(),
            sortcache: SortInfo::new(),
            overlap: DynamicOverlap::new(),
            callback: None,
        }
    }

    /// Start a session with explicit settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not validate.
    pub fn with_config(reader: R, config: ParanoiaConfig) -> Result<Self> {
        config.validate()?;
        let mut paranoia = Self::new(reader);
        paranoia.mode = config.mode;
        paranoia.readahead = config.readahead;
        paranoia.cache_limit = config.cache_limit;
        paranoia.max_retries = config.max_retries;
        if let Some(sectors) = config.overlap_sectors {
            paranoia.set_overlap(sectors);
        }
        Ok(paranoia)
    }

    /// Set the paranoia mode.
    pub fn set_mode(&mut self, mode: ParanoiaMode) {
        self.mode = mode;
    }

    /// Get the current paranoia mode.
    #[must_use]
    pub fn mode(&self) -> ParanoiaMode {
        self.mode
    }

    /// Pin the search radius to `sectors` sectors.
    ///
    /// Stage 1 offsets stop retuning it; the retry ladder no longer widens
    /// it either.
    pub fn set_overlap(&mut self, sectors: i64) {
        self.overlap.set_fixed(sectors * FW);
    }

    /// Set the cache limit in blocks, returning the previous limit.
    ///
    /// Pass `None` to query without changing it.
    pub fn cache_model_size(&mut self, blocks: Option<usize>) -> usize {
        let previous = self.cache_limit;
        if let Some(blocks) = blocks {
            self.cache_limit = blocks.max(1);
        }
        previous
    }

    /// Set a callback used by [`Paranoia::read`] and the iterator.
    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: FnMut(i64, ParanoiaCallback) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
    }

    /// Clear the callback.
    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Read the next verified sector using the stored callback and retry
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnaddressableSector`] once the cursor has passed the
    /// last audio sector.
    pub fn read(&mut self) -> Result<&[i16]> {
        let max_retries = self.max_retries;
        let mut callback = self.callback.take();
        let outcome = match callback.as_mut() {
            Some(cb) => self.advance(&mut **cb, max_retries),
            None => self.advance(&mut |_, _| {}, max_retries),
        };
        self.callback = callback;
        let beginword = outcome?;
        self.root.sector(beginword).ok_or(Error::NoDataRead)
    }

    /// Read the next verified sector, reporting progress to `callback`.
    ///
    /// Returns `CD_FRAMEWORDS` interleaved samples. The slice stays valid
    /// until the session is next used mutably.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnaddressableSector`] once the cursor has passed the
    /// last audio sector.
    pub fn read_sector<F>(&mut self, mut callback: F, max_retries: u32) -> Result<&[i16]>
    where
        F: FnMut(i64, ParanoiaCallback),
    {
        let beginword = self.advance(&mut callback, max_retries)?;
        self.root.sector(beginword).ok_or(Error::NoDataRead)
    }

    /// Move the cursor.
    ///
    /// `Start` is an absolute sector, `End` is relative to the last audio
    /// sector. Verified data is discarded; the next read starts from
    /// scratch. Returns the previous cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSeek`] if the target lies outside the audio
    /// range. Nothing changes in that case.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<Lsn> {
        let geometry = self.reader.geometry();
        let target = match pos {
            SeekFrom::Start(sector) => i64::try_from(sector).unwrap_or(i64::MAX),
            SeekFrom::Current(delta) => self.cursor.saturating_add(delta),
            SeekFrom::End(delta) => i64::from(geometry.last_sector).saturating_add(delta),
        };
        if !geometry.contains(target) {
            return Err(Error::InvalidSeek {
                target,
                first: geometry.first_sector,
                last: geometry.last_sector,
            });
        }

        let previous = self.cursor;
        self.geometry = geometry;
        self.cursor = target;
        self.root.reset();
        self.clear_cache();
        debug!(from = previous, to = target, "seek");
        Lsn::try_from(previous).map_err(|_| Error::UnaddressableSector(previous))
    }

    /// Create an iterator over the remaining sectors.
    pub fn iter(&mut self) -> ParanoiaIter<'_, R> {
        ParanoiaIter { paranoia: self }
    }

    /// Get the next sector to be delivered.
    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Get the audio range reads are clipped to.
    #[must_use]
    pub fn geometry(&self) -> DiscGeometry {
        self.geometry
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// End the session and hand the reader back.
    pub fn into_reader(self) -> R {
        self.reader
    }

    /// Get the number of fragments waiting to be merged.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Get the number of cached blocks.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Everything before this word position has been handed out.
    #[must_use]
    pub fn returned_limit(&self) -> i64 {
        self.root.returnedlimit
    }

    /// Absolute word range of the verified root, if any.
    #[must_use]
    pub fn root_range(&self) -> Option<(i64, i64)> {
        self.root.begin().zip(self.root.end())
    }

    /// Borrow verified root samples in the absolute range `[begin, end)`.
    #[must_use]
    pub fn root_samples(&self, begin: i64, end: i64) -> Option<&[i16]> {
        self.root.samples(begin, end)
    }

    /// Current search radius in words.
    #[must_use]
    pub fn overlap_words(&self) -> i64 {
        self.overlap.overlap
    }

    /// Drift compensation in effect, in words.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.overlap.drift
    }

    /// Build the root until it holds the cursor's sector, then step the
    /// cursor. Returns the word position of the sector.
    fn advance(
        &mut self,
        cb: &mut dyn FnMut(i64, ParanoiaCallback),
        max_retries: u32,
    ) -> Result<i64> {
        if self.cursor > i64::from(self.geometry.last_sector) {
            return Err(Error::UnaddressableSector(self.cursor));
        }
        let beginword = self.cursor * FW;
        let endword = beginword + FW;
        let horizon = endword + MAX_DYNOVERLAP;
        let checks = self.mode.checks_reads();

        self.root.returnedlimit = self.root.returnedlimit.max(beginword);
        let mut backoff = BackoffStrategy::new(self.root.end());

        while !self.satisfied(beginword, endword, horizon) {
            if checks {
                self.trim(beginword);
                self.recover_cache();
                if self.root.vector.is_some() && self.root.lastsector {
                    self.end_case(horizon);
                } else {
                    self.stage2(beginword, cb);
                }
            } else {
                self.end_case(horizon);
            }
            if self.root.covers(beginword, horizon) {
                break;
            }

            if let Some(block) = self.read_c_block(beginword, cb) {
                if checks {
                    let id = self.push_cache(block);
                    if self.mode.contains(ParanoiaMode::VERIFY) {
                        self.stage1(cb);
                    } else {
                        self.segment_reads(id);
                    }
                } else {
                    self.root.lastsector = block.lastsector;
                    self.root.vector = Some(block);
                    self.end_case(horizon);
                }
            }

            match backoff.record_pass(self.root.end(), self.overlap.is_maxed(), max_retries) {
                BackoffAction::Continue => {}
                BackoffAction::Widen => {
                    cb(self.root.end().unwrap_or(beginword), ParanoiaCallback::Backoff);
                    if let Some(words) = self.overlap.widen() {
                        debug!(
                            words,
                            sector = self.cursor,
                            stalls = backoff.retry_count(),
                            "widening search radius"
                        );
                        cb(words, ParanoiaCallback::Overlap);
                    }
                }
                BackoffAction::GiveUp => {
                    cb(self.root.end().unwrap_or(beginword), ParanoiaCallback::Backoff);
                    if self.mode.contains(ParanoiaMode::NEVERSKIP) {
                        debug!(
                            sector = self.cursor,
                            rungs = backoff.backoff_count(),
                            "retries exhausted, skipping disabled"
                        );
                    } else {
                        self.skip(beginword, cb);
                    }
                }
            }
        }

        self.cursor += 1;
        Ok(beginword)
    }

    /// Whether the root already answers the request.
    fn satisfied(&self, beginword: i64, endword: i64, horizon: i64) -> bool {
        self.root.vector.as_ref().is_some_and(|root| {
            root.begin <= beginword
                && root.end() >= endword
                && (!self.mode.checks_reads() || root.end() >= horizon)
        })
    }

    /// Read one cache block of `readahead` sectors around the cursor.
    ///
    /// Returns `None` when the drive delivered nothing at all.
    pub(crate) fn read_c_block(
        &mut self,
        beginword: i64,
        cb: &mut dyn FnMut(i64, ParanoiaCallback),
    ) -> Option<CBlock> {
        let first = i64::from(self.geometry.first_sector);
        let last = i64::from(self.geometry.last_sector);
        let total = self.readahead as i64;
        let sectatonce = self.reader.sectors_per_read().max(1) as i64;

        let mut readat = if self.mode.checks_reads() {
            let back = self.overlap.overlap_sectors();
            let mut target = match self.root.vector.as_ref() {
                Some(root) if root.begin <= beginword => root.end() / FW - back,
                _ => self.cursor - back,
            };
            // never restart just short of the previous read
            if target + MIN_SECTOR_BACKUP > self.lastread && target <= self.lastread {
                target = self.lastread - MIN_SECTOR_BACKUP;
            }
            let mut readat = (target & !(JIGGLE_MODULO - 1)) + self.jitter;
            if readat > target {
                readat -= JIGGLE_MODULO;
            }
            self.jitter = (self.jitter + 1) % JIGGLE_MODULO;
            readat
        } else {
            self.reset_all();
            self.cursor
        };
        readat += (self.overlap.drift as f64 / FW as f64).round() as i64;

        let mut vector = vec![0i16; (total * FW) as usize];
        let mut flags = vec![SampleFlags::NONE; vector.len()];
        let mut raw = vec![0u8; sectatonce as usize * CDIO_CD_FRAMESIZE_RAW];
        let mut firstread = None;
        let mut anyread = false;
        let mut lastsector = false;
        let mut sofar = 0i64;

        while sofar < total {
            let mut secread = sectatonce;
            let mut adjread = readat;
            if adjread < first {
                secread -= first - adjread;
                adjread = first;
            }
            if adjread + secread - 1 > last {
                secread = last - adjread + 1;
            }
            if sofar + secread > total {
                secread = total - sofar;
            }

            if secread > 0 {
                firstread.get_or_insert(adjread);
                let bytes = &mut raw[..secread as usize * CDIO_CD_FRAMESIZE_RAW];
                let got = match Lsn::try_from(adjread) {
                    Ok(lsn) => match self.reader.read_raw_sectors(lsn, bytes) {
                        Ok(n) => (n as i64).min(secread),
                        Err(err) => {
                            debug!(sector = adjread, %err, "drive read failed");
                            0
                        }
                    },
                    Err(_) => 0,
                };

                let lo = (sofar * FW) as usize;
                let good = lo + (got * FW) as usize;
                let hi = lo + (secread * FW) as usize;
                decode_samples(
                    &bytes[..got as usize * CDIO_CD_FRAMESIZE_RAW],
                    &mut vector[lo..good],
                );
                if got < secread {
                    debug!(sector = adjread + got, missing = secread - got, "short read");
                    cb((adjread + got) * FW, ParanoiaCallback::ReadError);
                    vector[good..hi].fill(0);
                    flags[good..hi].fill(SampleFlags::UNREAD);
                }
                anyread |= got > 0;

                if sofar != 0 {
                    let half = (MIN_WORDS_OVERLAP / 2) as usize;
                    for flag in &mut flags[lo - half..lo + half] {
                        *flag |= SampleFlags::EDGE;
                    }
                }

                self.lastread = adjread + secread;
                if adjread + secread - 1 == last {
                    lastsector = true;
                }
                cb((adjread + secread - 1) * FW, ParanoiaCallback::Read);
                sofar += secread;
                readat = adjread + secread;
            } else if readat < first {
                readat += sectatonce;
            } else {
                break;
            }
        }

        let firstread = firstread.filter(|_| anyread)?;
        let size = (sofar * FW) as usize;
        vector.truncate(size);
        flags.truncate(size);
        let mut block = CBlock::with_flags(vector, flags, firstread * FW - self.overlap.drift);
        block.lastsector = lastsector;
        trace!(
            begin = block.begin,
            sectors = sofar,
            lastsector,
            "read block"
        );
        Some(block)
    }

    /// Add a block to the cache.
    pub(crate) fn push_cache(&mut self, block: CBlock) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.cache.push(CachedBlock { id, block });
        id
    }

    /// Without stage 1, treat every stretch between read seams as verified.
    fn segment_reads(&mut self, id: BlockId) {
        if let Some(cached) = self.cache.iter().find(|c| c.id == id) {
            let runs = crate::stage1::edge_fragments(id, &cached.block);
            self.fragments.extend(runs);
        }
    }

    /// Drop a block together with the fragments that live in it.
    fn evict(&mut self, index: usize) {
        let evicted = self.cache.remove(index);
        self.fragments.retain(|f| f.source != evicted.id);
        trace!(id = evicted.id, begin = evicted.block.begin, "evicted block");
    }

    pub(crate) fn remove_fragment(&mut self, fragment: &VFragment) {
        if let Some(pos) = self.fragments.iter().position(|f| f == fragment) {
            self.fragments.remove(pos);
        }
    }

    pub(crate) fn clear_cache(&mut self) {
        self.cache.clear();
        self.fragments.clear();
    }

    fn reset_all(&mut self) {
        self.root.reset();
        self.overlap.drift = 0;
        self.clear_cache();
    }

    /// Bound memory: keep the root within `MAX_SECTOR_OVERLAP` sectors
    /// behind the cursor and drop blocks that end before it.
    fn trim(&mut self, beginword: i64) {
        let Some(root) = self.root.vector.as_mut() else {
            return;
        };
        let target = beginword - MAX_DYNOVERLAP;
        if root.begin < target {
            root.remove_front((target - root.begin) as usize);
        }
        let rb = root.begin;
        while let Some(index) = self.cache.iter().position(|c| c.block.end() < rb) {
            self.evict(index);
        }
    }

    /// Evict the oldest blocks above the cache limit.
    fn recover_cache(&mut self) {
        while self.cache.len() > self.cache_limit {
            self.evict(0);
        }
    }

    /// Once the root holds the last sector, pad it with silence up to
    /// `horizon`; nothing more can be read.
    fn end_case(&mut self, horizon: i64) {
        if !self.root.lastsector {
            return;
        }
        let Some(root) = self.root.vector.as_mut() else {
            return;
        };
        if horizon < root.end() {
            return;
        }
        let pad = (horizon - root.end()) as usize;
        root.append(&vec![0; pad]);
        trace!(pad, "padded root past the last sector");
        self.clear_cache();
    }

    /// Give up on verification and push the root past the stall.
    ///
    /// Grafts the longest verified stretch of a cached block that covers
    /// the root's end, else the shortest unverified one, else a sector of
    /// silence. Whatever was added counts as delivered.
    fn skip(&mut self, beginword: i64, cb: &mut dyn FnMut(i64, ParanoiaCallback)) {
        let post = self.root.end().unwrap_or(beginword);
        warn!(position = post, sector = self.cursor, "skipping unverifiable data");
        cb(post, ParanoiaCallback::Skip);

        // (cache index, run end, run verified)
        let mut graft: Option<(usize, i64, bool)> = None;
        for (index, cached) in self.cache.iter().enumerate().rev() {
            let block = &cached.block;
            let Some(flags) = block.get_flags(post) else {
                continue;
            };
            let verified = flags.is_verified();
            let mut vend = post;
            while block
                .get_flags(vend)
                .is_some_and(|f| f.is_verified() == verified)
            {
                vend += 1;
            }
            let better = match graft {
                None => true,
                Some((_, end, true)) => verified && vend > end,
                Some((_, end, false)) => verified || vend < end,
            };
            if better {
                graft = Some((index, vend, verified));
            }
        }

        let mut lastsector = false;
        let samples = match graft {
            Some((index, mut gend, _)) => {
                let block = &self.cache[index].block;
                while block.get_flags(gend).is_some_and(SampleFlags::is_verified) {
                    gend += 1;
                }
                gend = (gend + OVERLAP_ADJ).min(block.end());
                lastsector = block.lastsector && gend == block.end();
                let lo = (post - block.begin) as usize;
                let hi = (gend - block.begin) as usize;
                block.vector[lo..hi].to_vec()
            }
            None => vec![0; CD_FRAMEWORDS],
        };
        let grafted = samples.len();

        match self.root.vector.as_mut() {
            Some(root) => root.append(&samples),
            None => self.root.vector = Some(CBlock::new(samples, post)),
        }
        let end = self.root.end().unwrap_or(post);
        if graft.is_none() && end >= (i64::from(self.geometry.last_sector) + 1) * FW {
            lastsector = true;
        }
        if lastsector {
            self.root.lastsector = true;
        }
        self.root.returnedlimit = end;
        debug!(grafted, from_cache = graft.is_some(), "skip filled root");
    }

    /// Feed an observed offset to the tuning statistics and apply whatever
    /// they decide.
    pub(crate) fn record_offset(
        &mut self,
        stage: Stage,
        offset: i64,
        cb: &mut dyn FnMut(i64, ParanoiaCallback),
    ) {
        let adjustment = self.overlap.record(stage, offset);
        if let Some(step) = adjustment.drift {
            debug!(step, total = self.overlap.drift, "drift compensated");
            cb(self.root.end().unwrap_or(0), ParanoiaCallback::Drift);
            self.shift_cache(step);
        }
        if let Some(words) = adjustment.overlap {
            trace!(words, "search radius retuned");
            cb(words, ParanoiaCallback::Overlap);
        }
    }

    /// Move cached data back by a drift step so it lines up with new reads.
    fn shift_cache(&mut self, step: i64) {
        let cache = &self.cache;
        self.fragments.retain(|f| {
            f.begin >= step
                && cache
                    .iter()
                    .find(|c| c.id == f.source)
                    .is_some_and(|c| c.block.begin >= step)
        });
        for fragment in &mut self.fragments {
            fragment.begin -= step;
            fragment.end -= step;
        }
        for cached in &mut self.cache {
            let adj = step.min(cached.block.begin);
            cached.block.begin -= adj;
        }
    }
}

/// Iterator over paranoia-read sectors.
pub struct ParanoiaIter<'a, R: SectorReader> {
    paranoia: &'a mut Paranoia<R>,
}

impl<R: SectorReader> Iterator for ParanoiaIter<'_, R> {
    type Item = Result<Vec<i16>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.paranoia.cursor > i64::from(self.paranoia.geometry.last_sector) {
            return None;
        }
        Some(self.paranoia.read().map(<[i16]>::to_vec))
    }
}
