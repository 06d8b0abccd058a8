//! The opaque status callback sink (`spec.md` §6) and the read-only status
//! snapshot exposed under its own lock (`spec.md` §5, `StatusLock`).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::types::{ContentType, SessionStatus, TrackInfo};

/// One message emitted on the status callback sink. Mirrors `spec.md` §6's
/// `UPDATE`/`ERROR`/`DONE`/`STARTED`/`NEW_TRACK`/`TRACK_DONE` kinds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum StatusEvent {
    /// The session has started connecting.
    Started,
    /// A periodic status + counters update.
    Update(StatusSnapshot),
    /// A recoverable or fatal error occurred; `fatal` distinguishes the two.
    Error { message: String, fatal: bool },
    /// A new track has begun (metadata change observed).
    NewTrack(TrackInfo),
    /// A track finished writing to disk.
    TrackDone { path: Option<std::path::PathBuf> },
    /// The session has fully stopped.
    Done,
}

/// Read-only snapshot of mutable stream state, guarded by its own lock so a
/// status poller never contends with the ring buffer or listener list. Per
/// `spec.md` §5's lock ordering, code holding `RingBufferLock` or
/// `ListenerListLock` must never then acquire this lock.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub status: SessionStatus,
    pub content_type: ContentType,
    pub metadata_interval: Option<u32>,
    pub declared_bitrate_kbps: Option<u32>,
    pub detected_bitrate_kbps: Option<u32>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Buffering,
            content_type: ContentType::Unknown,
            metadata_interval: None,
            declared_bitrate_kbps: None,
            detected_bitrate_kbps: None,
            bytes_read: 0,
            bytes_written: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// A callback sink that status events are pushed into. Implementations must
/// not block for long: the scheduler and reader threads call this inline.
pub trait StatusSink: Send + Sync {
    fn on_event(&self, event: StatusEvent);
}

impl<F> StatusSink for F
where
    F: Fn(StatusEvent) + Send + Sync,
{
    fn on_event(&self, event: StatusEvent) {
        self(event);
    }
}

/// Shared handle combining a [`StatusSink`] with the `StatusLock`-guarded
/// snapshot that read-only pollers can consult without waiting on a
/// callback.
#[derive(Clone)]
pub struct StatusHandle {
    sink: Arc<dyn StatusSink>,
    snapshot: Arc<Mutex<StatusSnapshot>>,
}

impl StatusHandle {
    /// Wraps a sink with a fresh, default-initialized snapshot.
    #[must_use]
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            sink,
            snapshot: Arc::new(Mutex::new(StatusSnapshot::default())),
        }
    }

    /// Emits an event to the sink and, for [`StatusEvent::Update`], refreshes
    /// the held snapshot.
    pub fn emit(&self, event: StatusEvent) {
        if let StatusEvent::Update(ref snap) = event {
            *self.snapshot.lock() = snap.clone();
        }
        self.sink.on_event(event);
    }

    /// Reads the most recently published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.lock().clone()
    }
}
