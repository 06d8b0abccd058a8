//! `spec.md` §4.9/§5 — the Supervisor: owns one capture session's whole
//! lifecycle. Spawns a long-lived reader thread that owns the connect/
//! reconnect loop and a long-lived `TrackScheduler` thread that survives
//! across reconnects; optionally stands up a `RelayServer` and an
//! `ExternalCmd` source alongside them.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::StreamConfig;
use crate::connection::{self, Connection};
use crate::error::{SupervisorError, SupervisorResult};
use crate::external_cmd::ExternalCmd;
use crate::meta::{MetaStripper, ParseEngine, StripEvent};
use crate::relay::{RelayHeaders, RelayServer};
use crate::retry::ExponentialBackoff;
use crate::ring_buffer::RingBuffer;
use crate::scheduler::{SchedulerEvent, TrackScheduler};
use crate::status::{StatusEvent, StatusHandle, StatusSink};
use crate::types::{SessionStatus, TrackInfo};

/// Bitrate assumed before the frame adapter has seen a single frame, or for
/// content types with no per-frame bitrate at all (Ogg). Only affects the
/// initial silence-detector window sizing; it is corrected the moment real
/// frames are observed.
const FALLBACK_BITRATE_KBPS: u32 = 128;

/// Floor under any computed ring buffer capacity, regardless of configured
/// silence-search windows: large enough that a momentary stall never starves
/// the slowest consumer before the next poll.
const MIN_RING_CAPACITY: usize = 64 * 1024;

/// `icy-metaint` advertised by the relay server. Chosen independently of the
/// upstream source's own interval since relay listeners never see the raw
/// interleaved stream, only the composed metadata this process re-inserts.
const RELAY_METAINT: u32 = 8192;

/// A running capture session. Dropping this stops and joins every thread it
/// owns.
pub struct Supervisor {
    cancel: Arc<AtomicBool>,
    reader_handle: Option<JoinHandle<()>>,
    status: StatusHandle,
}

impl Supervisor {
    /// Starts a capture session for `config` on a dedicated reader thread.
    /// Returns immediately; use [`Supervisor::status`] to poll progress or
    /// drop the handle (or call [`Supervisor::stop`]) to end the session.
    #[must_use]
    pub fn start(config: StreamConfig, sink: Arc<dyn StatusSink>) -> Self {
        let status = StatusHandle::new(sink);
        let cancel = Arc::new(AtomicBool::new(false));

        let thread_status = status.clone();
        let thread_cancel = Arc::clone(&cancel);
        let reader_handle = thread::Builder::new()
            .name("reelcast-supervisor".into())
            .spawn(move || run(config, thread_status, thread_cancel))
            .expect("failed to spawn supervisor thread");

        Self {
            cancel,
            reader_handle: Some(reader_handle),
            status,
        }
    }

    /// Requests the session stop. Non-blocking; call [`Supervisor::join`] or
    /// drop this handle to wait for the threads to actually exit.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Blocks until the session's threads have exited.
    pub fn join(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }

    /// Reads the most recently published status snapshot.
    #[must_use]
    pub fn status(&self) -> crate::status::StatusSnapshot {
        self.status.snapshot()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// The reader thread's top-level loop: connect, pump audio/metadata into the
/// ring buffer and scheduler, reconnect with backoff on failure, run until
/// cancelled or a fatal error per `spec.md` §4.9.
#[instrument(skip_all, fields(url = %config.url))]
fn run(config: StreamConfig, status: StatusHandle, cancel: Arc<AtomicBool>) {
    status.emit(StatusEvent::Started);

    let parse_engine = match ParseEngine::new(config.rules_file.as_deref()) {
        Ok(engine) => engine,
        Err(e) => {
            warn!(error = %e, "could not load parse rules file");
            status.emit(StatusEvent::Error { message: e.to_string(), fatal: true });
            status.emit(StatusEvent::Done);
            return;
        },
    };

    // First connection determines content type, declared bitrate, and
    // station name, all of which size the ring buffer and seed the
    // scheduler; later reconnects must not change any of these, so they're
    // carried across the whole session rather than re-derived per attempt.
    let first = match connect_with_redirects(&config) {
        Ok(conn) => conn,
        Err(e) => {
            status.emit(StatusEvent::Error { message: e.to_string(), fatal: true });
            status.emit(StatusEvent::Done);
            return;
        },
    };

    let content_type = first.headers.content_type;
    let station_name = first.headers.name.clone().unwrap_or_default();
    let declared_bitrate = first.headers.bitrate_kbps.unwrap_or(FALLBACK_BITRATE_KBPS);
    let metadata_interval = first.headers.metadata_interval;

    let ring = Arc::new(RingBuffer::new(ring_capacity(&config, declared_bitrate)));
    let composed_metadata = Arc::new(Mutex::new(Vec::new()));

    let relay = if config.flags.make_relay {
        match RelayServer::bind(
            config.relay_bind_ip,
            config.relay_port,
            config.relay_max_port,
            config.relay_max_connections,
            config.flags.search_ports,
            RelayHeaders {
                content_type,
                bitrate_kbps: Some(declared_bitrate),
                name: first.headers.name.clone(),
                genre: first.headers.genre.clone(),
                url: first.headers.url.clone(),
                metadata_interval: RELAY_METAINT,
            },
            Arc::clone(&ring),
            Arc::clone(&composed_metadata),
        ) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(error = %e, "could not start relay server");
                status.emit(StatusEvent::Error { message: e.to_string(), fatal: false });
                None
            },
        }
    } else {
        None
    };

    let (events_tx, events_rx) = flume::unbounded::<SchedulerEvent>();
    let scheduler_consumer = ring.register_consumer(false);
    let scheduler_ring = Arc::clone(&ring);
    let scheduler_cancel = Arc::clone(&cancel);
    let scheduler_status = status.clone();
    let scheduler_config = config.clone();
    let scheduler_handle = thread::Builder::new()
        .name("reelcast-scheduler".into())
        .spawn(move || {
            let mut scheduler = TrackScheduler::new(
                scheduler_config,
                content_type,
                scheduler_status,
                declared_bitrate,
                station_name,
            );
            scheduler.run(&scheduler_ring, scheduler_consumer, &events_rx, &scheduler_cancel);
            // Release the cursor immediately so a producer blocked on this
            // non-evictable consumer (see RingBuffer::push) isn't left
            // waiting on a thread that has already exited.
            scheduler_ring.unregister_consumer(scheduler_consumer);
            // The scheduler thread only returns when the session is truly
            // over (cancelled, size cap, or non-reconnecting disconnect);
            // tell the reader loop below to stop pumping too.
            scheduler_cancel.store(true, Ordering::Release);
        })
        .expect("failed to spawn scheduler thread");

    let external_cmd = config.external_cmd.as_deref().filter(|_| config.flags.external_cmd).map(|cmd| {
        let tx = events_tx.clone();
        let ring_for_marker = Arc::clone(&ring);
        let composed = Arc::clone(&composed_metadata);
        ExternalCmd::spawn(cmd, move |mut info| {
            info.compose_metadata(None);
            *composed.lock() = info.composed_metadata.clone();
            let marker = ring_for_marker.bytes_written();
            let _ = tx.send(SchedulerEvent::TrackChange(info, marker));
        })
    });
    let external_cmd = match external_cmd {
        Some(Ok(handle)) => Some(handle),
        Some(Err(e)) => {
            warn!(error = %e, "could not start external metadata command");
            status.emit(StatusEvent::Error { message: e.to_string(), fatal: false });
            None
        },
        None => None,
    };

    // Streams with no in-band metadata and no external command never emit a
    // TrackChange; per spec.md §4.2 that means one continuous, unnamed
    // track rather than a session stuck forever in Buffering.
    if (metadata_interval.unwrap_or(0) == 0) && external_cmd.is_none() {
        let mut info = TrackInfo { save: true, ..TrackInfo::default() };
        info.compose_metadata(first.headers.url.as_deref());
        let _ = events_tx.send(SchedulerEvent::TrackChange(info, 0));
    }

    pump(
        first,
        &config,
        &ring,
        &parse_engine,
        &events_tx,
        &composed_metadata,
        &status,
        &cancel,
    );

    ring.stop();
    if let Some(relay) = relay {
        relay.shutdown();
    }
    if let Some(external_cmd) = external_cmd {
        external_cmd.stop();
    }
    let _ = events_tx.send(SchedulerEvent::Stop);
    let _ = scheduler_handle.join();

    status.emit(StatusEvent::Done);
}

/// Connects to `config.url`, following redirects/playlists, translating the
/// low-level connection error into a [`SupervisorError`].
fn connect_with_redirects(config: &StreamConfig) -> SupervisorResult<Connection> {
    connection::connect(
        &config.url,
        config.proxy.as_ref(),
        &config.user_agent,
        config.timeout,
        config.http10,
        config.interface.as_deref(),
    )
    .map_err(SupervisorError::from)
}

/// Drives the connect → pump-bytes → reconnect-on-failure loop until
/// cancelled or `auto_reconnect` is off and the connection drops.
#[allow(clippy::too_many_arguments)]
fn pump(
    mut conn: Connection,
    config: &StreamConfig,
    ring: &RingBuffer,
    parse_engine: &ParseEngine,
    events_tx: &flume::Sender<SchedulerEvent>,
    composed_metadata: &Mutex<Vec<u8>>,
    status: &StatusHandle,
    cancel: &AtomicBool,
) {
    let mut backoff = ExponentialBackoff::default();
    let mut last_wait = None;
    let started_at = Instant::now();

    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }

        status.emit(StatusEvent::Update(crate::status::StatusSnapshot {
            status: SessionStatus::Ripping,
            content_type: conn.headers.content_type,
            metadata_interval: conn.headers.metadata_interval,
            declared_bitrate_kbps: conn.headers.bitrate_kbps,
            detected_bitrate_kbps: None,
            bytes_read: ring.bytes_written(),
            bytes_written: ring.bytes_written(),
            elapsed: started_at.elapsed(),
        }));

        let mut stripper = MetaStripper::new(&mut conn.reader, conn.headers.metadata_interval);
        let outcome = pump_one_connection(&mut stripper, ring, parse_engine, events_tx, composed_metadata, cancel, conn.headers.url.as_deref());

        match outcome {
            PumpOutcome::Cancelled => return,
            PumpOutcome::Disconnected => {
                let _ = events_tx.send(SchedulerEvent::Disconnected);
                if !config.flags.auto_reconnect {
                    return;
                }
                let wait = backoff.retry_in(last_wait);
                last_wait = Some(wait);
                info!(wait_ms = wait.as_millis() as u64, "reconnecting after disconnect");
                status.emit(StatusEvent::Error { message: "disconnected, reconnecting".to_string(), fatal: false });
                thread::sleep(wait);

                match connect_with_redirects(config) {
                    Ok(new_conn) => {
                        conn = new_conn;
                        last_wait = None;
                        let _ = events_tx.send(SchedulerEvent::Reconnected);
                    },
                    Err(e) => {
                        warn!(error = %e, "reconnect attempt failed");
                        continue;
                    },
                }
            },
        }
    }
}

enum PumpOutcome {
    Disconnected,
    Cancelled,
}

/// Reads one connection's bytes until EOF/error or cancellation, pushing
/// audio into `ring` and forwarding new metadata as [`SchedulerEvent`]s.
#[allow(clippy::too_many_arguments)]
fn pump_one_connection<R: std::io::Read>(
    stripper: &mut MetaStripper<R>,
    ring: &RingBuffer,
    parse_engine: &ParseEngine,
    events_tx: &flume::Sender<SchedulerEvent>,
    composed_metadata: &Mutex<Vec<u8>>,
    cancel: &AtomicBool,
    stream_url: Option<&str>,
) -> PumpOutcome {
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        if cancel.load(Ordering::Acquire) {
            return PumpOutcome::Cancelled;
        }

        match stripper.next_event(&mut buf) {
            Ok(StripEvent::Audio(n)) => {
                ring.push(&buf[..n]);
            },
            Ok(StripEvent::AudioThenMetadata(n, raw)) => {
                ring.push(&buf[..n]);
                let marker = ring.bytes_written();
                let info = parse_engine.apply(&raw, stream_url);
                if info.save {
                    *composed_metadata.lock() = info.composed_metadata.clone();
                    let _ = events_tx.send(SchedulerEvent::TrackChange(info, marker));
                } else {
                    debug!("metadata change excluded by parse rules");
                }
            },
            Ok(StripEvent::Eof) => return PumpOutcome::Disconnected,
            Err(e) => {
                warn!(error = %e, "stream read failed");
                return PumpOutcome::Disconnected;
            },
        }
    }
}

/// Sizes the ring buffer large enough to cover the silence detector's widest
/// configured search window plus a 30-second safety margin at the best known
/// bitrate, never smaller than [`MIN_RING_CAPACITY`].
fn ring_capacity(config: &StreamConfig, bitrate_kbps: u32) -> usize {
    let window_ms = i64::from(config.splitpoint.xs_search_window_1) + i64::from(config.splitpoint.xs_search_window_2);
    let window_bytes = crate::silence::ms_to_bytes(window_ms, bitrate_kbps).max(0) as usize;
    let thirty_seconds_bytes = crate::silence::ms_to_bytes(30_000, bitrate_kbps).max(0) as usize;
    window_bytes.max(thirty_seconds_bytes).max(MIN_RING_CAPACITY)
}
