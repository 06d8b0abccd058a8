//! Error taxonomy shared across the capture pipeline.
//!
//! Every enum here follows the same shape: a plain `#[non_exhaustive]`
//! enum, a hand-written [`Display`] impl, and [`std::error::Error`] with
//! targeted `From` conversions at the call sites that need them. None of
//! these wrap a `thiserror` derive — the taxonomy is small and stable
//! enough that writing it out keeps every message under our control.

use std::{fmt, io};

pub use crate::connection::error::{Error as ConnectionError, Result as ConnectionResult};
pub use crate::relay::error::{Error as RelayError, Result as RelayResult};

/// Errors that can end a capture session outright.
#[derive(Debug)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The configured source URL could not be parsed.
    InvalidUrl(url::ParseError),
    /// The initial connection (after following redirects/playlists) failed.
    Connect(ConnectionError),
    /// The server declared a content-type we don't know how to split.
    UnknownContentType,
    /// The relay server could not bind to any port in its configured range.
    PortRangeExhausted,
    /// Writing a ripped track to disk failed in a way that isn't recoverable.
    Disk(io::Error),
    /// The configured `maxMB_rip_size` cap was reached.
    SizeCapReached,
    /// The session was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(e) => write!(f, "invalid source url: {e}"),
            Self::Connect(e) => write!(f, "could not connect to source: {e}"),
            Self::UnknownContentType => write!(f, "source advertised an unsupported content type"),
            Self::PortRangeExhausted => write!(f, "no free port found for the relay server"),
            Self::Disk(e) => write!(f, "disk error: {e}"),
            Self::SizeCapReached => write!(f, "maxMB_rip_size limit reached"),
            Self::Cancelled => write!(f, "session was cancelled"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidUrl(e) => Some(e),
            Self::Connect(e) => Some(e),
            Self::Disk(e) => Some(e),
            Self::UnknownContentType
            | Self::PortRangeExhausted
            | Self::SizeCapReached
            | Self::Cancelled => None,
        }
    }
}

impl From<url::ParseError> for SupervisorError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e)
    }
}

impl From<ConnectionError> for SupervisorError {
    fn from(e: ConnectionError) -> Self {
        Self::Connect(e)
    }
}

/// Convenience alias for supervisor-level results.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Errors surfaced while a track is being ripped to disk.
#[derive(Debug)]
#[non_exhaustive]
pub enum RipError {
    /// Could not create or open the output file.
    CantCreateFile(io::Error),
    /// A write to an already-open output file failed (e.g. disk full).
    DiskFull(io::Error),
    /// ID3 tag write failed; the audio file itself is still valid.
    Id3(id3::Error),
}

impl fmt::Display for RipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CantCreateFile(e) => write!(f, "could not create output file: {e}"),
            Self::DiskFull(e) => write!(f, "write failed: {e}"),
            Self::Id3(e) => write!(f, "id3 tag write failed: {e}"),
        }
    }
}

impl std::error::Error for RipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CantCreateFile(e) | Self::DiskFull(e) => Some(e),
            Self::Id3(e) => Some(e),
        }
    }
}

impl From<id3::Error> for RipError {
    fn from(e: id3::Error) -> Self {
        Self::Id3(e)
    }
}
