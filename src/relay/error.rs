//! Errors surfaced by the relay server (`spec.md` §4.7).

use std::{error::Error as StdError, fmt, io};

/// Errors raised by the relay acceptor and its per-listener sender threads.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// No free port was found within `[relay_port, relay_max_port]`.
    PortRangeExhausted { start: u16, end: u16 },
    /// Binding the chosen port failed for a reason other than "in use"
    /// (e.g. permission denied on a privileged port).
    Bind(io::Error),
    /// Accepting a new listener connection failed.
    Accept(io::Error),
    /// Writing to a listener's socket failed; the listener is dropped.
    ListenerWrite(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortRangeExhausted { start, end } => {
                write!(f, "no free relay port in [{start}, {end}]")
            },
            Self::Bind(e) => write!(f, "could not bind relay listener socket: {e}"),
            Self::Accept(e) => write!(f, "accept() failed on relay listener socket: {e}"),
            Self::ListenerWrite(e) => write!(f, "write to relay listener failed: {e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Bind(e) | Self::Accept(e) | Self::ListenerWrite(e) => Some(e),
            Self::PortRangeExhausted { .. } => None,
        }
    }
}

/// Shorthand for `std::result::Result<T, Error>` used throughout [`crate::relay`].
pub type Result<T> = std::result::Result<T, Error>;
