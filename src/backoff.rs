//! Retry ladder for sectors that will not verify.
//!
//! Each pass of the read loop that fails to grow the reconstruction by at
//! least a frame counts as a stall. Every `BACKOFF_INTERVAL` stalls the
//! ladder moves up a rung: first the search radius widens, and once it
//! cannot widen further (or the retry budget is spent) the caller is told
//! to give up and accept unverified data.

use crate::constants::CD_FRAMESAMPLES;

/// Number of stalls between rungs.
pub const BACKOFF_INTERVAL: u32 = 5;

/// Growth, in words, that counts as progress.
pub const MIN_PROGRESS_WORDS: i64 = CD_FRAMESAMPLES as i64;

/// What the read loop should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Keep reading.
    Continue,
    /// Widen the search radius and keep reading.
    Widen,
    /// Stop verifying this stretch and fill it from the cache.
    GiveUp,
}

/// Stall tracking for one sector request.
#[derive(Debug, Clone, Default)]
pub struct BackoffStrategy {
    /// Stalls since the last rung or the last progress
    retry_count: u32,
    /// Root end when progress was last seen
    last_end: Option<i64>,
    /// Rungs climbed
    backoffs: u32,
}

impl BackoffStrategy {
    /// Start tracking from the current end of the reconstruction.
    pub fn new(root_end: Option<i64>) -> Self {
        Self {
            retry_count: 0,
            last_end: root_end,
            backoffs: 0,
        }
    }

    /// Record the outcome of one pass.
    ///
    /// `overlap_maxed` tells whether the search radius is already at its
    /// ceiling; `max_retries` bounds the stalls tolerated before giving up.
    pub fn record_pass(
        &mut self,
        root_end: Option<i64>,
        overlap_maxed: bool,
        max_retries: u32,
    ) -> BackoffAction {
        if let Some(end) = root_end {
            if self
                .last_end
                .is_none_or(|last| last + MIN_PROGRESS_WORDS < end)
            {
                self.last_end = Some(end);
                self.retry_count = 0;
                return BackoffAction::Continue;
            }
        }

        self.retry_count += 1;
        if self.retry_count % BACKOFF_INTERVAL != 0 {
            return BackoffAction::Continue;
        }
        self.backoffs += 1;
        if overlap_maxed || self.retry_count >= max_retries {
            self.retry_count = 0;
            BackoffAction::GiveUp
        } else {
            BackoffAction::Widen
        }
    }

    /// Get the current stall count.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Get the number of rungs climbed.
    pub fn backoff_count(&self) -> u32 {
        self.backoffs
    }
}
