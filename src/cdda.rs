//! CDDA drive interface abstraction.
//!
//! The verification engine only ever talks to a [`SectorReader`]: something
//! that knows the playable audio range and can fill a buffer with raw
//! 2352-byte frames. [`MemoryDrive`] serves an in-memory disc image and can
//! misbehave on purpose, which is what the test suites drive the engine
//! with. A real drive backed by libcdio is available as `CdromDrive` when the
//! `libcdio` feature is enabled.

use tracing::trace;

use crate::{
    constants::{CDIO_CD_FRAMESIZE_RAW, CD_FRAMEWORDS, DEFAULT_SECTORS_PER_READ},
    error::{Error, Result},
    types::Lsn,
};

#[cfg(feature = "libcdio")]
use std::{ffi::CString, ptr};

#[cfg(feature = "libcdio")]
use crate::error::TransportError;

#[cfg(feature = "libcdio")]
use libcdio_sys::{
    cdio_destroy, cdio_get_first_track_num, cdio_get_num_tracks, cdio_get_track_format,
    cdio_get_track_last_lsn, cdio_get_track_lsn, cdio_open, cdio_read_audio_sectors,
    driver_id_t_DRIVER_UNKNOWN, driver_return_code_t_DRIVER_OP_SUCCESS,
    track_format_t_TRACK_FORMAT_AUDIO, CdIo_t, CDIO_INVALID_LSN,
};

/// Playable audio range of a disc, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscGeometry {
    /// First audio sector
    pub first_sector: Lsn,
    /// Last audio sector
    pub last_sector: Lsn,
}

impl DiscGeometry {
    /// Check if a sector is inside the audio range.
    #[inline]
    pub fn contains(&self, lsn: i64) -> bool {
        lsn >= i64::from(self.first_sector) && lsn <= i64::from(self.last_sector)
    }

    /// Number of audio sectors.
    #[inline]
    pub fn sectors(&self) -> i64 {
        (i64::from(self.last_sector) - i64::from(self.first_sector) + 1).max(0)
    }
}

/// Source of raw audio frames.
pub trait SectorReader {
    /// The playable audio range.
    fn geometry(&self) -> DiscGeometry;

    /// How many sectors to ask for in one request.
    fn sectors_per_read(&self) -> usize {
        DEFAULT_SECTORS_PER_READ
    }

    /// Read raw frames starting at `begin` into `buffer`.
    ///
    /// `buffer` holds a whole number of 2352-byte frames. Samples are
    /// little-endian signed 16-bit, interleaved left/right.
    ///
    /// Returns the number of sectors actually delivered, which may be fewer
    /// than requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails outright.
    fn read_raw_sectors(&mut self, begin: Lsn, buffer: &mut [u8]) -> Result<usize>;
}

impl<R: SectorReader + ?Sized> SectorReader for &mut R {
    fn geometry(&self) -> DiscGeometry {
        (**self).geometry()
    }

    fn sectors_per_read(&self) -> usize {
        (**self).sectors_per_read()
    }

    fn read_raw_sectors(&mut self, begin: Lsn, buffer: &mut [u8]) -> Result<usize> {
        (**self).read_raw_sectors(begin, buffer)
    }
}

impl<R: SectorReader + ?Sized> SectorReader for Box<R> {
    fn geometry(&self) -> DiscGeometry {
        (**self).geometry()
    }

    fn sectors_per_read(&self) -> usize {
        (**self).sectors_per_read()
    }

    fn read_raw_sectors(&mut self, begin: Lsn, buffer: &mut [u8]) -> Result<usize> {
        (**self).read_raw_sectors(begin, buffer)
    }
}

/// Convert little-endian raw bytes to samples.
pub(crate) fn decode_samples(bytes: &[u8], out: &mut [i16]) {
    for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
}

/// Convert samples to little-endian raw bytes.
fn encode_samples(samples: &[i16], out: &mut [u8]) {
    for (chunk, sample) in out.chunks_exact_mut(2).zip(samples) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}

/// One request seen by a [`MemoryDrive`] filter.
#[derive(Debug, Clone, Copy)]
pub struct RawRead<'a> {
    /// Zero-based count of requests served so far
    pub index: u64,
    /// First sector requested
    pub begin: Lsn,
    /// Number of sectors requested
    pub sectors: usize,
    first: Lsn,
    disc: &'a [i16],
}

impl RawRead<'_> {
    /// Absolute word position of the first requested sample.
    #[inline]
    pub fn word_begin(&self) -> i64 {
        i64::from(self.begin) * CD_FRAMEWORDS as i64
    }

    /// The true sample at absolute word `pos`; zero outside the disc.
    pub fn truth(&self, pos: i64) -> i16 {
        let idx = pos - i64::from(self.first) * CD_FRAMEWORDS as i64;
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.disc.get(i).copied())
            .unwrap_or(0)
    }
}

/// Hook that may rewrite what a [`MemoryDrive`] returns.
///
/// It receives the request and the correct samples, edits them in place,
/// and returns how many sectors to report as delivered.
pub type ReadFilter = Box<dyn FnMut(&RawRead<'_>, &mut [i16]) -> usize + Send>;

/// In-memory disc image.
pub struct MemoryDrive {
    first: Lsn,
    samples: Vec<i16>,
    sectors_per_read: usize,
    reads: u64,
    filter: Option<ReadFilter>,
}

impl std::fmt::Debug for MemoryDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDrive")
            .field("first", &self.first)
            .field("words", &self.samples.len())
            .field("sectors_per_read", &self.sectors_per_read)
            .field("reads", &self.reads)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl MemoryDrive {
    /// Create a disc whose audio starts at sector `first`.
    ///
    /// The image is padded with silence to a whole number of sectors.
    pub fn new(first: Lsn, mut samples: Vec<i16>) -> Self {
        let rem = samples.len() % CD_FRAMEWORDS;
        if rem != 0 {
            samples.resize(samples.len() + CD_FRAMEWORDS - rem, 0);
        }
        Self {
            first,
            samples,
            sectors_per_read: DEFAULT_SECTORS_PER_READ,
            reads: 0,
            filter: None,
        }
    }

    /// Set how many sectors one request covers.
    #[must_use]
    pub fn with_sectors_per_read(mut self, sectors: usize) -> Self {
        self.sectors_per_read = sectors.max(1);
        self
    }

    /// Install a filter that distorts reads.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: FnMut(&RawRead<'_>, &mut [i16]) -> usize + Send + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// The undistorted image.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of requests served.
    pub fn reads(&self) -> u64 {
        self.reads
    }
}

impl SectorReader for MemoryDrive {
    fn geometry(&self) -> DiscGeometry {
        let sectors = (self.samples.len() / CD_FRAMEWORDS) as Lsn;
        DiscGeometry {
            first_sector: self.first,
            last_sector: self.first + sectors - 1,
        }
    }

    fn sectors_per_read(&self) -> usize {
        self.sectors_per_read
    }

    fn read_raw_sectors(&mut self, begin: Lsn, buffer: &mut [u8]) -> Result<usize> {
        if buffer.len() % CDIO_CD_FRAMESIZE_RAW != 0 {
            return Err(Error::MisalignedBuffer(buffer.len()));
        }
        let sectors = buffer.len() / CDIO_CD_FRAMESIZE_RAW;
        let request = RawRead {
            index: self.reads,
            begin,
            sectors,
            first: self.first,
            disc: &self.samples,
        };
        let base = request.word_begin();
        let mut words: Vec<i16> = (0..(sectors * CD_FRAMEWORDS) as i64)
            .map(|i| request.truth(base + i))
            .collect();
        let delivered = match self.filter.as_mut() {
            Some(filter) => filter(&request, &mut words).min(sectors),
            None => sectors,
        };
        encode_samples(&words, buffer);
        self.reads += 1;
        trace!(begin, sectors, delivered, "memory drive read");
        Ok(delivered)
    }
}

/// CD-ROM drive handle.
///
/// Wraps a libcdio handle opened on a physical drive or image file.
#[cfg(feature = "libcdio")]
pub struct CdromDrive {
    /// libcdio handle
    p_cdio: *mut CdIo_t,
    /// Device name/path
    device_name: Option<String>,
    /// Audio range from the table of contents
    geometry: DiscGeometry,
    /// Number of tracks on disc
    tracks: u8,
    /// Number of sectors to read at once
    nsectors: usize,
    /// Whether to swap bytes
    swap_bytes: bool,
}

// The handle is only ever used through `&mut self`.
#[cfg(feature = "libcdio")]
unsafe impl Send for CdromDrive {}

#[cfg(feature = "libcdio")]
impl std::fmt::Debug for CdromDrive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdromDrive")
            .field("device_name", &self.device_name)
            .field("geometry", &self.geometry)
            .field("tracks", &self.tracks)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "libcdio")]
impl CdromDrive {
    /// Open a CD-ROM drive by device path and read its table of contents.
    ///
    /// If `device` is None or empty, the default CD-ROM device is used.
    ///
    /// # Errors
    ///
    /// Returns an error if libcdio cannot open the device or the disc has no
    /// readable audio tracks.
    pub fn open(device: Option<&str>) -> Result<Self> {
        let device_cstr = device
            .filter(|s| !s.is_empty())
            .map(|s| CString::new(s).map_err(|_| Error::IdentifyError))
            .transpose()?;
        let device_ptr = device_cstr.as_ref().map_or(ptr::null(), |s| s.as_ptr());

        let p_cdio = unsafe { cdio_open(device_ptr, driver_id_t_DRIVER_UNKNOWN) };
        if p_cdio.is_null() {
            return Err(Error::IdentifyError);
        }

        let mut drive = Self {
            p_cdio,
            device_name: device.map(String::from),
            geometry: DiscGeometry {
                first_sector: 0,
                last_sector: -1,
            },
            tracks: 0,
            nsectors: DEFAULT_SECTORS_PER_READ,
            swap_bytes: false,
        };
        drive.read_toc()?;
        Ok(drive)
    }

    fn read_toc(&mut self) -> Result<()> {
        let num_tracks = unsafe { cdio_get_num_tracks(self.p_cdio) };
        if num_tracks == 0 || num_tracks == 255 {
            return Err(Error::NoAudioTracks);
        }
        self.tracks = num_tracks;

        let first_track = unsafe { cdio_get_first_track_num(self.p_cdio) };
        if first_track == 255 {
            return Err(Error::TocReadError("Invalid first track".to_string()));
        }

        let mut first_audio: Option<Lsn> = None;
        let mut last_audio: Lsn = 0;
        for i in 0..num_tracks {
            let track = first_track + i;
            let lsn = unsafe { cdio_get_track_lsn(self.p_cdio, track) };
            if lsn == CDIO_INVALID_LSN {
                return Err(Error::TocReadError(format!("Invalid LSN for track {track}")));
            }
            let format = unsafe { cdio_get_track_format(self.p_cdio, track) };
            if format != track_format_t_TRACK_FORMAT_AUDIO {
                continue;
            }
            first_audio.get_or_insert(lsn);
            let last = unsafe { cdio_get_track_last_lsn(self.p_cdio, track) };
            if last != CDIO_INVALID_LSN && last > last_audio {
                last_audio = last;
            }
        }

        let first_sector = first_audio.ok_or(Error::NoAudioTracks)?;
        self.geometry = DiscGeometry {
            first_sector,
            last_sector: last_audio,
        };
        Ok(())
    }

    /// Device name/path this drive was opened with.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Get the number of tracks.
    pub fn track_count(&self) -> u8 {
        self.tracks
    }

    /// Set how many sectors one request covers.
    pub fn set_sectors_per_read(&mut self, sectors: usize) {
        self.nsectors = sectors.max(1);
    }

    /// Swap the bytes of every sample the drive returns.
    pub fn set_swap_bytes(&mut self, swap: bool) {
        self.swap_bytes = swap;
    }

    fn read_into(&mut self, begin: Lsn, buffer: &mut [u8]) -> Result<()> {
        let sectors = (buffer.len() / CDIO_CD_FRAMESIZE_RAW) as u32;
        let result = unsafe {
            cdio_read_audio_sectors(self.p_cdio, buffer.as_mut_ptr().cast(), begin, sectors)
        };
        if result != driver_return_code_t_DRIVER_OP_SUCCESS {
            return Err(Error::TransportError(TransportError::from(result as i32)));
        }
        Ok(())
    }
}

#[cfg(feature = "libcdio")]
impl SectorReader for CdromDrive {
    fn geometry(&self) -> DiscGeometry {
        self.geometry
    }

    fn sectors_per_read(&self) -> usize {
        self.nsectors
    }

    fn read_raw_sectors(&mut self, begin: Lsn, buffer: &mut [u8]) -> Result<usize> {
        if buffer.len() % CDIO_CD_FRAMESIZE_RAW != 0 {
            return Err(Error::MisalignedBuffer(buffer.len()));
        }
        let sectors = buffer.len() / CDIO_CD_FRAMESIZE_RAW;

        // A failed batch is retried one sector at a time so the good prefix
        // still gets delivered.
        let delivered = if self.read_into(begin, buffer).is_ok() {
            sectors
        } else {
            let mut done = 0;
            for (i, frame) in buffer.chunks_exact_mut(CDIO_CD_FRAMESIZE_RAW).enumerate() {
                match self.read_into(begin + i as Lsn, frame) {
                    Ok(()) => done += 1,
                    Err(err) if done == 0 => return Err(err),
                    Err(_) => break,
                }
            }
            done
        };

        if self.swap_bytes {
            for pair in buffer[..delivered * CDIO_CD_FRAMESIZE_RAW].chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        Ok(delivered)
    }
}

#[cfg(feature = "libcdio")]
impl Drop for CdromDrive {
    fn drop(&mut self) {
        if !self.p_cdio.is_null() {
            unsafe {
                cdio_destroy(self.p_cdio);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(sectors: usize) -> Vec<i16> {
        (0..sectors * CD_FRAMEWORDS).map(|i| (i % 30000) as i16 + 1).collect()
    }

    #[test]
    fn test_geometry() {
        let drive = MemoryDrive::new(100, image(8));
        let geom = drive.geometry();
        assert_eq!(geom.first_sector, 100);
        assert_eq!(geom.last_sector, 107);
        assert_eq!(geom.sectors(), 8);
        assert!(geom.contains(100));
        assert!(geom.contains(107));
        assert!(!geom.contains(108));
    }

    #[test]
    fn test_image_padded_to_sectors() {
        let drive = MemoryDrive::new(0, vec![1; CD_FRAMEWORDS + 5]);
        assert_eq!(drive.samples().len(), CD_FRAMEWORDS * 2);
        assert_eq!(drive.geometry().last_sector, 1);
    }

    #[test]
    fn test_memory_drive_read() {
        let data = image(4);
        let mut drive = MemoryDrive::new(10, data.clone());
        let mut raw = vec![0u8; 2 * CDIO_CD_FRAMESIZE_RAW];
        assert_eq!(drive.read_raw_sectors(11, &mut raw).unwrap(), 2);

        let mut words = vec![0i16; 2 * CD_FRAMEWORDS];
        decode_samples(&raw, &mut words);
        assert_eq!(&words[..], &data[CD_FRAMEWORDS..3 * CD_FRAMEWORDS]);
        assert_eq!(drive.reads(), 1);
    }

    #[test]
    fn test_read_outside_disc_is_silent() {
        let mut drive = MemoryDrive::new(10, image(2));
        let mut raw = vec![0xffu8; CDIO_CD_FRAMESIZE_RAW];
        drive.read_raw_sectors(12, &mut raw).unwrap();
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_misaligned_buffer() {
        let mut drive = MemoryDrive::new(0, image(2));
        let mut raw = vec![0u8; 100];
        assert!(matches!(
            drive.read_raw_sectors(0, &mut raw),
            Err(Error::MisalignedBuffer(100))
        ));
    }

    #[test]
    fn test_filter_rewrites_and_shortens() {
        let data = image(4);
        let mut drive = MemoryDrive::new(0, data.clone()).with_filter(|read, words| {
            assert_eq!(read.truth(read.word_begin()), words[0]);
            words[0] = -1;
            read.sectors - 1
        });
        let mut raw = vec![0u8; 3 * CDIO_CD_FRAMESIZE_RAW];
        assert_eq!(drive.read_raw_sectors(1, &mut raw).unwrap(), 2);
        let mut words = vec![0i16; 3 * CD_FRAMEWORDS];
        decode_samples(&raw, &mut words);
        assert_eq!(words[0], -1);
        assert_eq!(words[1], data[CD_FRAMEWORDS + 1]);
    }

    #[test]
    fn test_boxed_reader() {
        let mut reader: Box<dyn SectorReader> =
            Box::new(MemoryDrive::new(5, image(3)).with_sectors_per_read(7));
        assert_eq!(reader.sectors_per_read(), 7);
        assert_eq!(reader.geometry().first_sector, 5);
        let mut raw = vec![0u8; CDIO_CD_FRAMESIZE_RAW];
        assert_eq!(reader.read_raw_sectors(5, &mut raw).unwrap(), 1);
    }
}
