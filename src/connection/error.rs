//! Connection errors and convenience types.
//!
//! Grounded on the teacher's `driver::connection::error` shape: a plain
//! enum, a hand-written [`Display`], and targeted `From` conversions at
//! each call site rather than a derive macro.

use std::{error::Error as StdError, fmt, io};

/// Errors encountered while connecting to, or following redirects/
/// playlists from, a Shoutcast/Icecast source.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The source URL could not be parsed.
    InvalidUrl(url::ParseError),
    /// DNS resolution failed for the host.
    NameResolution(io::Error),
    /// The TCP connection was refused or otherwise failed to establish.
    ConnectRefused(io::Error),
    /// The connect/read timeout elapsed.
    Timeout,
    /// TLS client configuration could not be built.
    SslCtxNew(String),
    /// The TLS handshake failed.
    SslHandshake(rustls::Error),
    /// A TLS read or write failed after the handshake completed.
    SslIo(io::Error),
    /// Miscellaneous I/O error (plain TCP read/write).
    Io(io::Error),
    /// The response's first line was neither `ICY 200 OK` nor a `2xx`
    /// `HTTP/1.x` status line.
    BadResponse(String),
    /// Too many redirects were followed without reaching a final response.
    RedirectLoop,
    /// A redirect violated transport policy (e.g. https -> http not permitted).
    RedirectPolicy,
    /// Too many nested playlists (PLS/M3U) were followed.
    PlaylistRecursionLimit,
    /// A PLS/M3U playlist was fetched but contained no usable entry.
    EmptyPlaylist,
    /// The response declared a content-type this engine doesn't support.
    UnknownContentType(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to source: ")?;
        match self {
            Self::InvalidUrl(e) => write!(f, "invalid url ({e})"),
            Self::NameResolution(e) => write!(f, "name resolution failed ({e})"),
            Self::ConnectRefused(e) => write!(f, "connection refused ({e})"),
            Self::Timeout => write!(f, "timed out"),
            Self::SslCtxNew(msg) => write!(f, "could not build tls client config ({msg})"),
            Self::SslHandshake(e) => write!(f, "tls handshake failed ({e})"),
            Self::SslIo(e) => write!(f, "tls i/o error ({e})"),
            Self::Io(e) => write!(f, "i/o error ({e})"),
            Self::BadResponse(line) => write!(f, "unexpected response status line: {line:?}"),
            Self::RedirectLoop => write!(f, "too many redirects"),
            Self::RedirectPolicy => write!(f, "redirect rejected by transport policy"),
            Self::PlaylistRecursionLimit => write!(f, "too many nested playlists"),
            Self::EmptyPlaylist => write!(f, "playlist contained no usable entry"),
            Self::UnknownContentType(mime) => write!(f, "unsupported content-type {mime:?}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::InvalidUrl(e) => Some(e),
            Self::NameResolution(e) | Self::ConnectRefused(e) | Self::SslIo(e) | Self::Io(e) =>
                Some(e),
            Self::SslHandshake(e) => Some(e),
            Self::Timeout
            | Self::SslCtxNew(_)
            | Self::BadResponse(_)
            | Self::RedirectLoop
            | Self::RedirectPolicy
            | Self::PlaylistRecursionLimit
            | Self::EmptyPlaylist
            | Self::UnknownContentType(_) => None,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::SslHandshake(e)
    }
}

/// Convenience alias for connection-level results.
pub type Result<T> = std::result::Result<T, Error>;
