//! # cdda-paranoia
//!
//! Verified CD audio extraction. Audio CD drives drop, repeat and misplace
//! samples, and they rarely say so. This library reads every stretch of the
//! disc more than once, keeps only what independent reads agree on, and
//! stitches the agreed pieces into a single reconstruction that sectors are
//! handed out from.
//!
//! ## Features
//!
//! - Two-stage verification: read against read, then piece against the
//!   reconstruction
//! - Jitter correction by content, at read seams and inside reads
//! - Detection and repair of dropped and duplicated samples
//! - A search radius that tunes itself to the drive's jitter, and drift
//!   compensation for drives that consistently land off target
//! - Progress events through a callback
//! - Any [`SectorReader`] as the data source: [`MemoryDrive`] for disc
//!   images and tests, `CdromDrive` for real hardware (`libcdio` feature)
//!
//! ## Example
//!
//! ```no_run
//! use cdda_paranoia::{MemoryDrive, Paranoia, ParanoiaCallback, ParanoiaMode};
//!
//! let image = vec![0i16; 1176 * 300];
//! let mut paranoia = Paranoia::new(MemoryDrive::new(0, image));
//! paranoia.set_mode(ParanoiaMode::FULL);
//! paranoia.set_callback(|pos, event| {
//!     if event.is_fixup() {
//!         eprintln!("{event} at word {pos}");
//!     }
//! });
//!
//! for sector in paranoia.iter() {
//!     let samples = sector.expect("read failed");
//!     assert_eq!(samples.len(), 1176);
//! }
//! ```

pub mod constants;
pub mod error;
pub mod types;

mod backoff;
mod block;
mod cdda;
mod config;
mod gap;
mod isort;
mod overlap;
mod paranoia;
mod stage1;
mod stage2;

pub use block::{CBlock, VFragment};
#[cfg(feature = "libcdio")]
pub use cdda::CdromDrive;
pub use cdda::{DiscGeometry, MemoryDrive, RawRead, ReadFilter, SectorReader};
pub use config::ParanoiaConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use paranoia::{CallbackFn, Paranoia, ParanoiaIter};
pub use types::*;
