//! Session configuration.

use crate::{
    constants::{
        DEFAULT_CACHE_LIMIT, DEFAULT_MAX_RETRIES, DEFAULT_READAHEAD, MAX_SECTOR_OVERLAP,
        MIN_READAHEAD,
    },
    error::{Error, Result},
    types::ParanoiaMode,
};

/// Tunables for a [`crate::Paranoia`] session.
///
/// With the `serde` feature enabled the struct can be loaded from any serde
/// format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ParanoiaConfig {
    /// Which checks run on every read
    pub mode: ParanoiaMode,
    /// Sectors per cache block, at least [`MIN_READAHEAD`]
    pub readahead: usize,
    /// Cache blocks kept for cross-read matching
    pub cache_limit: usize,
    /// Stalled passes tolerated per sector before skipping
    pub max_retries: u32,
    /// Pin the search radius to this many sectors instead of tuning it
    pub overlap_sectors: Option<i64>,
}

impl Default for ParanoiaConfig {
    fn default() -> Self {
        Self {
            mode: ParanoiaMode::FULL,
            readahead: DEFAULT_READAHEAD,
            cache_limit: DEFAULT_CACHE_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            overlap_sectors: None,
        }
    }
}

impl ParanoiaConfig {
    #[must_use]
    pub fn with_mode(mut self, mode: ParanoiaMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_readahead(mut self, sectors: usize) -> Self {
        self.readahead = sectors;
        self
    }

    #[must_use]
    pub fn with_cache_limit(mut self, blocks: usize) -> Self {
        self.cache_limit = blocks;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn with_overlap_sectors(mut self, sectors: i64) -> Self {
        self.overlap_sectors = Some(sectors);
        self
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.readahead < MIN_READAHEAD {
            return Err(Error::InvalidConfig(format!(
                "readahead must be at least {MIN_READAHEAD} sectors, got {}",
                self.readahead
            )));
        }
        if self.cache_limit == 0 {
            return Err(Error::InvalidConfig("cache_limit must be at least one block".into()));
        }
        if let Some(sectors) = self.overlap_sectors {
            if !(1..=MAX_SECTOR_OVERLAP).contains(&sectors) {
                return Err(Error::InvalidConfig(format!(
                    "overlap_sectors must be within 1..={MAX_SECTOR_OVERLAP}, got {sectors}"
                )));
            }
        }
        Ok(())
    }
}
