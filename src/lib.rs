#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! reelcast captures a live Shoutcast/Icecast stream over HTTP or HTTPS,
//! de-interleaves its in-band ICY metadata, and splits the resulting byte
//! stream into per-track files whenever the metadata changes. Track
//! boundaries can optionally be refined against a run of silence, and the
//! captured stream can optionally be relayed back out to its own ICY
//! listeners while it's being ripped.
//!
//! The crate is split into the pieces a [`Supervisor`] wires together for
//! one capture session:
//!
//! * [`connection`] — URL/redirect/playlist resolution, TCP/TLS connect,
//!   and the Shoutcast request/response handshake.
//! * [`frame`] — MP3/ADTS/Ogg frame and page boundary scanning, used to
//!   keep every split aligned on a decodable boundary.
//! * [`meta`] — in-band ICY metadata de-interleaving ([`meta::MetaStripper`])
//!   and the rule-driven [`meta::ParseEngine`] that turns raw metadata into
//!   a [`types::TrackInfo`].
//! * [`ring_buffer`] — the single-producer, multi-consumer buffer coupling
//!   the network reader to the track writer, silence detector, and any
//!   relay listeners.
//! * [`silence`] — split-point refinement against measured silence (MP3)
//!   or frame/page boundaries alone (Ogg/AAC).
//! * [`scheduler`] — the track-boundary state machine that writes ripped
//!   audio to disk under the configured naming and overwrite policy.
//! * [`relay`] — the optional ICY relay server re-serving the captured
//!   stream to other listeners.
//! * [`external_cmd`] — the optional external metadata source, spawned and
//!   parsed without ever going through a shell.
//! * [`supervisor`] — top-level session lifecycle: connect, reconnect with
//!   backoff, and own every thread above for as long as the session runs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reelcast::{StreamConfig, Supervisor};
//!
//! let url = url::Url::parse("http://example.com:8000/stream").unwrap();
//! let config = StreamConfig::new(url).output_directory("rips");
//! let sink = Arc::new(|event| println!("{event:?}"));
//! let mut supervisor = Supervisor::start(config, sink);
//! // ... later, or on Ctrl-C ...
//! supervisor.stop();
//! supervisor.join();
//! ```

#![warn(clippy::pedantic, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
)]

/// Typed stream configuration, its builder, and the TOML preferences file.
pub mod config;
/// URL/redirect resolution, TCP/TLS connect, and the ICY handshake.
pub mod connection;
/// Top-level error types returned by [`Supervisor`].
pub mod error;
/// The optional external metadata source process.
pub mod external_cmd;
/// Codec frame/page boundary scanning.
pub mod frame;
/// ICY metadata de-interleaving and rule-driven parsing.
pub mod meta;
/// The optional ICY relay server.
pub mod relay;
/// Exponential backoff for reconnection.
pub mod retry;
/// The producer/consumer byte ring buffer coupling every downstream thread.
pub mod ring_buffer;
/// The track-boundary state machine and on-disk file writer.
pub mod scheduler;
/// Silence-based split-point refinement.
pub mod silence;
/// The status callback sink and its polled snapshot.
pub mod status;
/// Top-level capture session lifecycle.
pub mod supervisor;
/// Shared data types crossing component boundaries.
pub mod types;

pub use config::{OverwritePolicy, SplitpointOptions, StreamConfig};
pub use error::{RipError, SupervisorError, SupervisorResult};
pub use status::{StatusEvent, StatusSink, StatusSnapshot};
pub use supervisor::Supervisor;
pub use types::{ContentType, SessionStatus, TrackInfo};
