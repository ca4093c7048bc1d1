//! Constants used throughout the library.
//!
//! The tuning values match the long-standing cdparanoia defaults; changing
//! them changes how aggressively reads are cross-checked.

/// CD frame size in bytes (2352 bytes per sector)
pub const CDIO_CD_FRAMESIZE_RAW: usize = 2352;

/// Number of 16-bit samples per CD frame (2352 / 2 = 1176)
pub const CD_FRAMEWORDS: usize = CDIO_CD_FRAMESIZE_RAW / 2;

/// Number of stereo samples per frame (2352 / 4 = 588)
pub const CD_FRAMESAMPLES: usize = CDIO_CD_FRAMESIZE_RAW / 4;

/// Minimum overlap in 16-bit words (~1.5ms at 44.1kHz)
pub const MIN_WORDS_OVERLAP: i64 = 64;

/// Minimum length of a matching run in 16-bit words
pub const MIN_WORDS_SEARCH: i64 = 64;

/// Minimum run that confirms a resync past a rift (~0.4ms)
pub const MIN_WORDS_RIFT: i64 = 16;

/// Maximum sector overlap (32 sectors, ~835ms)
pub const MAX_SECTOR_OVERLAP: i64 = 32;

/// Minimum sector epsilon in words (~2.9ms)
pub const MIN_SECTOR_EPSILON: i64 = 128;

/// Minimum silence boundary in words (~23ms)
pub const MIN_SILENCE_BOUNDARY: i64 = 1024;

/// Verified runs are trimmed by this many words on each side, so adjacent
/// runs must re-overlap by a full `MIN_WORDS_OVERLAP` to merge.
pub const OVERLAP_ADJ: i64 = MIN_WORDS_OVERLAP / 2 - 1;

/// Period of the read-start jiggle, in sectors
pub const JIGGLE_MODULO: i64 = 15;

/// Minimum distance, in sectors, a new read backs up behind the last one
pub const MIN_SECTOR_BACKUP: i64 = 16;

/// Default number of sectors in one cache block
pub const DEFAULT_READAHEAD: usize = 150;

/// Smallest usable cache block, in sectors.
///
/// A block can start as far back as the search radius plus the backup plus a
/// full jiggle period behind the root's end, and must still reach past it.
pub const MIN_READAHEAD: usize =
    (MAX_SECTOR_OVERLAP + MIN_SECTOR_BACKUP + JIGGLE_MODULO + 1) as usize;

/// Default number of cache blocks kept for cross-read matching
pub const DEFAULT_CACHE_LIMIT: usize = JIGGLE_MODULO as usize;

/// Default number of verification retries per sector
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Default number of sectors a driver reads per request
pub const DEFAULT_SECTORS_PER_READ: usize = 13;

/// Largest search radius the retry ladder may grow to, in words
pub const MAX_DYNOVERLAP: i64 = MAX_SECTOR_OVERLAP * CD_FRAMEWORDS as i64;
