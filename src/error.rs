//! Error types for the library.

use thiserror::Error;

use crate::types::Lsn;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during CD audio extraction.
///
/// Read shortfalls and verification stalls are recovered inside the engine
/// and surface only as callback events; the variants here are the conditions
/// a caller has to handle.
#[derive(Error, Debug)]
pub enum Error {
    /// Seek target lies outside the playable audio range
    #[error("Seek to sector {target} is outside the audio range {first}..={last}")]
    InvalidSeek {
        /// Requested sector
        target: i64,
        /// First playable sector
        first: Lsn,
        /// Last playable sector
        last: Lsn,
    },

    /// Unaddressable sector
    #[error("Unaddressable sector: {0}")]
    UnaddressableSector(i64),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Read buffer is not a whole number of raw frames
    #[error("Read buffer of {0} bytes is not a whole number of raw frames")]
    MisalignedBuffer(usize),

    /// Could not read any data from drive
    #[error("Could not read any data from drive")]
    NoDataRead,

    /// Unable to read table of contents
    #[error("Unable to read table of contents: {0}")]
    TocReadError(String),

    /// No audio tracks on disc
    #[error("No audio tracks on disc")]
    NoAudioTracks,

    /// Unable to identify CDROM model
    #[error("Unable to identify CDROM model")]
    IdentifyError,

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(TransportError),

    /// I/O error from the underlying device
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure codes a libcdio driver call can return.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Driver reported a generic error")]
    Failed,
    #[error("Operation not supported by the driver")]
    Unsupported,
    #[error("Driver not initialized")]
    Uninitialized,
    #[error("Operation not permitted")]
    NotPermitted,
    #[error("Bad parameter passed to the driver")]
    BadParameter,
    #[error("Bad pointer passed to the driver")]
    BadPointer,
    #[error("No driver available")]
    NoDriver,
    #[error("Drive returned MMC sense data")]
    SenseData,
    #[error("Unrecognized driver status {0}")]
    Other(i32),
}

impl From<i32> for TransportError {
    fn from(code: i32) -> Self {
        match code {
            -1 => TransportError::Failed,
            -2 => TransportError::Unsupported,
            -3 => TransportError::Uninitialized,
            -4 => TransportError::NotPermitted,
            -5 => TransportError::BadParameter,
            -6 => TransportError::BadPointer,
            -7 => TransportError::NoDriver,
            -8 => TransportError::SenseData,
            other => TransportError::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_from_code() {
        assert_eq!(TransportError::from(-2), TransportError::Unsupported);
        assert_eq!(TransportError::from(-8), TransportError::SenseData);
        assert_eq!(TransportError::from(42), TransportError::Other(42));
        assert_eq!(
            Error::TransportError(TransportError::NoDriver).to_string(),
            "Transport error: No driver available"
        );
    }

    #[test]
    fn test_invalid_seek_message() {
        let err = Error::InvalidSeek {
            target: 500,
            first: 0,
            last: 99,
        };
        assert_eq!(
            err.to_string(),
            "Seek to sector 500 is outside the audio range 0..=99"
        );
    }
}
