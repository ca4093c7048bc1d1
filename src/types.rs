//! Core type definitions.

use std::fmt;

use bitflags::bitflags;

/// Logical Sector Number - absolute sector position on disc
pub type Lsn = i32;

bitflags! {
    /// Paranoia mode flags controlling error correction behavior.
    ///
    /// Bit values are the ones cdparanoia front ends have always passed
    /// around, so stored settings stay interchangeable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct ParanoiaMode: i32 {
        /// No fixups - every read goes straight to the caller
        const DISABLE = 0x00;
        /// Cross-check every sample against another read
        const VERIFY = 0x01;
        /// Perform overlapped reads and stitch them by content
        const OVERLAP = 0x04;
        /// Never give up on a sector; retry until it verifies
        const NEVERSKIP = 0x20;
        /// Verification plus overlap, skipping after retries run out
        const FULL = Self::VERIFY.bits() | Self::OVERLAP.bits();
    }
}

impl ParanoiaMode {
    /// Whether reads go through the verification pipeline at all.
    #[inline]
    #[must_use]
    pub fn checks_reads(self) -> bool {
        self.intersects(ParanoiaMode::VERIFY | ParanoiaMode::OVERLAP)
    }
}

impl Default for ParanoiaMode {
    fn default() -> Self {
        ParanoiaMode::FULL
    }
}

/// Callback event types reported during reading.
///
/// Every event carries an absolute position in 16-bit words, except
/// [`ParanoiaCallback::Overlap`] which carries the new search radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum ParanoiaCallback {
    /// A batch of sectors came back from the drive
    Read = 0,
    /// A block is being cross-checked
    Verify = 1,
    /// Jitter corrected at a read boundary
    FixupEdge = 2,
    /// Jitter corrected inside a read
    FixupAtom = 3,
    /// Scratch detected; no detector currently emits this
    Scratch = 4,
    /// Scratch repaired; reserved alongside `Scratch`
    Repair = 5,
    /// Retries ran out and unverified data was accepted
    Skip = 6,
    /// Systematic drift detected and compensated
    Drift = 7,
    /// Verification stalled and the retry ladder moved up a rung
    Backoff = 8,
    /// Search radius adjusted
    Overlap = 9,
    /// Missing samples restored
    FixupDropped = 10,
    /// Repeated samples removed
    FixupDuplicated = 11,
    /// The drive returned fewer sectors than requested
    ReadError = 12,
}

impl ParanoiaCallback {
    /// Convert to string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ParanoiaCallback::Read => "read",
            ParanoiaCallback::Verify => "verify",
            ParanoiaCallback::FixupEdge => "fixup_edge",
            ParanoiaCallback::FixupAtom => "fixup_atom",
            ParanoiaCallback::Scratch => "scratch",
            ParanoiaCallback::Repair => "repair",
            ParanoiaCallback::Skip => "skip",
            ParanoiaCallback::Drift => "drift",
            ParanoiaCallback::Backoff => "backoff",
            ParanoiaCallback::Overlap => "overlap",
            ParanoiaCallback::FixupDropped => "fixup_dropped",
            ParanoiaCallback::FixupDuplicated => "fixup_duplicated",
            ParanoiaCallback::ReadError => "read_error",
        }
    }

    /// Whether the event reports a repair made to the audio stream.
    #[must_use]
    pub fn is_fixup(&self) -> bool {
        matches!(
            self,
            ParanoiaCallback::FixupEdge
                | ParanoiaCallback::FixupAtom
                | ParanoiaCallback::FixupDropped
                | ParanoiaCallback::FixupDuplicated
        )
    }
}

impl fmt::Display for ParanoiaCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Per-sample flags used in verification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct SampleFlags: u8 {
        /// Sample lies near a boundary between two drive reads
        const EDGE = 0x01;
        /// The drive never delivered this sample
        const UNREAD = 0x02;
        /// Sample agreed with another independent read
        const VERIFIED = 0x04;
    }
}

impl SampleFlags {
    /// No flags set
    pub const NONE: SampleFlags = SampleFlags::empty();

    #[inline]
    pub fn is_edge(self) -> bool {
        self.contains(Self::EDGE)
    }

    #[inline]
    pub fn is_unread(self) -> bool {
        self.contains(Self::UNREAD)
    }

    #[inline]
    pub fn is_verified(self) -> bool {
        self.contains(Self::VERIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mode_excludes_neverskip() {
        let mode = ParanoiaMode::FULL;
        assert!(mode.contains(ParanoiaMode::VERIFY));
        assert!(mode.contains(ParanoiaMode::OVERLAP));
        assert!(!mode.contains(ParanoiaMode::NEVERSKIP));
        assert_eq!(mode.bits(), 0x05);
    }

    #[test]
    fn test_checks_reads() {
        assert!(!ParanoiaMode::DISABLE.checks_reads());
        assert!(!ParanoiaMode::NEVERSKIP.checks_reads());
        assert!(ParanoiaMode::OVERLAP.checks_reads());
        assert!(ParanoiaMode::VERIFY.checks_reads());
    }

    #[test]
    fn test_callback_names() {
        assert_eq!(ParanoiaCallback::FixupDropped.as_str(), "fixup_dropped");
        assert_eq!(ParanoiaCallback::ReadError.to_string(), "read_error");
        assert!(ParanoiaCallback::FixupDuplicated.is_fixup());
        assert!(!ParanoiaCallback::Skip.is_fixup());
    }

    #[test]
    fn test_sample_flags() {
        let mut flags = SampleFlags::NONE;
        assert!(!flags.is_verified());
        flags |= SampleFlags::VERIFIED | SampleFlags::EDGE;
        assert!(flags.is_verified());
        assert!(flags.is_edge());
        assert!(!flags.is_unread());
    }
}
