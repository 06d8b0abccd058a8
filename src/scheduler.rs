//! `spec.md` §4.6 — TrackScheduler: the track-boundary state machine that
//! consumes the ring buffer, decides where to split, and writes tracks to
//! disk under the configured naming and overwrite policy.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use id3::TagLike;

use tracing::{debug, info, instrument, warn};

use crate::config::{OverwritePolicy, StreamConfig};
use crate::error::RipError;
use crate::ring_buffer::{ConsumerId, ReadOutcome, RingBuffer};
use crate::silence::{self, SilenceDetector};
use crate::status::{StatusEvent, StatusHandle};
use crate::types::{ContentType, TrackInfo};

/// How long [`TrackScheduler::run`] waits for ring buffer data before
/// looping back to drain pending [`SchedulerEvent`]s and re-check the
/// cancellation flag. Keeps reconnect/disconnect notifications and
/// cancellation responsive even while the producer has gone quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// `spec.md` §4.6's state machine states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Buffering,
    Ripping,
    Completing,
    Reconnecting,
    Stopped,
}

/// Out-of-band events fed to a running [`TrackScheduler`] alongside the raw
/// audio bytes it reads from its ring buffer cursor.
pub enum SchedulerEvent {
    /// A new metadata snapshot arrived at absolute stream offset `marker`.
    TrackChange(TrackInfo, u64),
    /// The upstream connection was lost; per `spec.md` §4.6 the scheduler
    /// moves to `Reconnecting` (or stops, if auto-reconnect is off) and
    /// closes the in-flight partial file per the `keep_incomplete` policy.
    Disconnected,
    /// The upstream connection was re-established; resumes `Buffering`.
    Reconnected,
    /// Supervisor is shutting down this session for good (cancellation,
    /// fatal error, or a reason other than "producer ran dry").
    Stop,
}

/// Drives one capture session's disk-writing side: pulls bytes from its own
/// ring buffer cursor, tracks the currently open file, and applies the
/// silence detector at every metadata boundary.
pub struct TrackScheduler {
    config: StreamConfig,
    content_type: ContentType,
    status: StatusHandle,
    state: State,
    current_track: Option<OpenTrack>,
    track_count: u32,
    dropped: u32,
    bytes_written: u64,
    started_at: Instant,
    detector: Option<Box<dyn SilenceDetector>>,
    bitrate_kbps: u32,
    station_name: String,
    pending_split: Option<PendingSplit>,
    /// The single growing output file for `flags.single_file_output`
    /// (`spec.md` §4.6/§6), opened once on the first track of the session
    /// and never reopened on track boundaries, independent of whatever
    /// `flags.individual_tracks` is doing with per-track files.
    show_file: Option<File>,
}

struct OpenTrack {
    info: TrackInfo,
    path: Option<PathBuf>,
    /// Set only when `path` is a staging path distinct from the track's
    /// real destination — currently just `OverwritePolicy::Larger` racing
    /// against an existing file, where the winner isn't known until
    /// [`TrackScheduler::apply_overwrite_policy`] compares sizes at close.
    target_path: Option<PathBuf>,
    file: Option<File>,
    bytes: u64,
}

/// A split decided by the [`SilenceDetector`] but not yet reached by the
/// write cursor. `write_audio` executes it the moment `split_offset` falls
/// inside an incoming chunk, so the cut lands exactly on the chosen byte
/// instead of wherever the event loop happened to drain the track-change
/// event.
struct PendingSplit {
    split_offset: u64,
    pad_end_of_prev: i64,
    pad_start_of_next: i64,
    next_info: TrackInfo,
}

impl TrackScheduler {
    /// Builds a scheduler starting in `Buffering`, with no track open yet.
    #[must_use]
    pub fn new(
        config: StreamConfig,
        content_type: ContentType,
        status: StatusHandle,
        initial_bitrate_kbps: u32,
        station_name: String,
    ) -> Self {
        Self {
            detector: silence::detector_for(content_type),
            config,
            content_type,
            status,
            state: State::Buffering,
            current_track: None,
            track_count: 0,
            dropped: 0,
            bytes_written: 0,
            started_at: Instant::now(),
            bitrate_kbps: initial_bitrate_kbps,
            station_name,
            pending_split: None,
            show_file: None,
        }
    }

    /// Runs the consumer loop against `ring` until the producer stops for
    /// good, the session is cancelled, or the size cap is hit. Blocking;
    /// intended to run on its own thread (`spec.md` §5: "TrackWriter"
    /// thread) and to survive across reconnects — `events` carries
    /// [`SchedulerEvent::Disconnected`]/`Reconnected` notifications so a
    /// dropped connection doesn't tear this thread down, only pause it.
    /// This is also where the MP3/AAC decode behind the silence detector
    /// runs, per `spec.md` §5's scheduling model.
    #[instrument(skip_all)]
    pub fn run(&mut self, ring: &RingBuffer, consumer: ConsumerId, events: &flume::Receiver<SchedulerEvent>, cancel: &std::sync::atomic::AtomicBool) {
        let mut buf = vec![0u8; 32 * 1024];

        loop {
            if cancel.load(std::sync::atomic::Ordering::Acquire) {
                self.finish(true);
                return;
            }

            let mut stopped = false;
            for event in events.try_iter() {
                match event {
                    SchedulerEvent::TrackChange(info, marker) => self.handle_track_change(ring, info, marker),
                    SchedulerEvent::Disconnected => self.on_disconnect(),
                    SchedulerEvent::Reconnected => self.on_reconnected(),
                    SchedulerEvent::Stop => stopped = true,
                }
            }
            if stopped {
                self.finish(false);
                return;
            }

            match ring.read_timeout(consumer, &mut buf, Some(POLL_INTERVAL)) {
                ReadOutcome::TimedOut => continue,
                ReadOutcome::Eof => {
                    self.finish(false);
                    return;
                },
                ReadOutcome::Data(n) => {
                    if let Some(br) = crate::frame::adapter_for(self.content_type).and_then(|a| a.detect_bitrate_kbps(&buf[..n])) {
                        self.bitrate_kbps = br;
                    }

                    self.write_audio(&buf[..n]);

                    if self.config.max_mb_rip_size > 0 && self.bytes_written >= self.config.max_mb_rip_size * 1024 * 1024 {
                        info!("maxMB_rip_size reached, stopping");
                        self.status.emit(StatusEvent::Error {
                            message: "size cap reached".to_string(),
                            fatal: false,
                        });
                        self.finish(false);
                        return;
                    }
                },
            }
        }
    }

    /// Peeks the region around `marker` out of `ring` (per `spec.md` §4.5's
    /// `[marker - xs_search_window_1, marker + xs_search_window_2]`) and
    /// hands it to the scheduler's track-change handling.
    fn handle_track_change(&mut self, ring: &RingBuffer, info: TrackInfo, marker: u64) {
        let window1 = silence::ms_to_bytes(i64::from(self.config.splitpoint.xs_search_window_1), self.bitrate_kbps).max(0) as u64;
        let window2 = silence::ms_to_bytes(i64::from(self.config.splitpoint.xs_search_window_2), self.bitrate_kbps).max(0) as u64;
        let region_start = marker.saturating_sub(window1);
        let region_len = (window1 + window2).min(1024 * 1024) as usize;

        let mut region_buf = vec![0u8; region_len.max(1)];
        let n = ring.peek_region(region_start, &mut region_buf);

        if n == 0 {
            self.on_track_change(info, marker, None);
        } else {
            self.on_track_change(info, marker, Some((&region_buf[..n], region_start)));
        }
    }

    /// Called when a new [`TrackInfo`] arrives. Drives the `Buffering ->
    /// Ripping -> Completing -> Ripping` transitions described in
    /// `spec.md` §4.6.
    fn on_track_change(&mut self, new_info: TrackInfo, marker_offset: u64, region: Option<(&[u8], u64)>) {
        match self.state {
            State::Buffering => {
                if self.dropped < self.config.dropcount {
                    self.dropped += 1;
                    debug!(dropped = self.dropped, "discarding track for dropcount");
                    return;
                }
                self.open_track(new_info);
                self.state = State::Ripping;
            },
            State::Ripping => {
                let should_split = self
                    .current_track
                    .as_ref()
                    .is_some_and(|t| !t.info.same_track_as(&new_info));
                if !should_split {
                    return;
                }

                let split = region.and_then(|(bytes, start)| {
                    self.detector.as_ref().map(|d| {
                        d.choose_split(bytes, start, marker_offset, self.bitrate_kbps, &self.config.splitpoint)
                    })
                });
                let (split_offset, pad_end_of_prev, pad_start_of_next) = match split {
                    Some(s) => (s.split_offset, s.pad_end_of_prev, s.pad_start_of_next),
                    None => (marker_offset, 0, 0),
                };

                if split_offset <= self.bytes_written {
                    // The chosen point (the silence search can nudge it
                    // backwards) is already behind the write cursor; cut
                    // right now rather than waiting for a byte offset we've
                    // already passed. No padding: there's nothing left of
                    // the old track's tail to duplicate from.
                    debug!(offset = split_offset, "split point already behind write cursor, cutting immediately");
                    self.close_current_track();
                    self.open_track(new_info);
                    return;
                }

                debug!(offset = split_offset, "scheduling silence-refined split");
                self.state = State::Completing;
                self.pending_split = Some(PendingSplit {
                    split_offset,
                    pad_end_of_prev,
                    pad_start_of_next,
                    next_info: new_info,
                });
            },
            State::Completing | State::Reconnecting | State::Stopped => {},
        }
    }

    /// Closes whatever track is currently open per the `keep_incomplete`
    /// policy (`spec.md` §5: "partial track files are either deleted or
    /// renamed with a `.partial` suffix"), then moves to `Reconnecting` if
    /// the session auto-reconnects, or stops for good otherwise.
    fn on_disconnect(&mut self) {
        if self.state == State::Stopped {
            return;
        }

        // Any split scheduled against the dropped connection's byte stream
        // no longer has a track to cut from; the track below is already
        // being closed out as a partial.
        self.pending_split = None;

        if let Some(track) = self.current_track.take() {
            drop(track.file);
            if let Some(path) = &track.path {
                if track.target_path.is_some() {
                    // `path` here is a `Larger`-policy staging file, not a
                    // real track destination; the comparison never got a
                    // chance to run, so just drop the staged write and
                    // leave whatever already occupies the real path alone.
                    if let Err(e) = fs::remove_file(path) {
                        warn!(error = %e, path = %path.display(), "could not remove partial staged track");
                    }
                } else if self.config.flags.keep_incomplete {
                    let partial = partial_path(path);
                    if let Err(e) = fs::rename(path, &partial) {
                        warn!(error = %e, path = %path.display(), "could not rename partial track");
                    }
                } else if let Err(e) = fs::remove_file(path) {
                    warn!(error = %e, path = %path.display(), "could not remove partial track");
                }
            }
        }

        if self.config.flags.auto_reconnect {
            self.state = State::Reconnecting;
        } else {
            self.finish(false);
        }
    }

    fn on_reconnected(&mut self) {
        if self.state == State::Reconnecting {
            self.state = State::Buffering;
        }
    }

    /// Writes `bytes` to the currently open track, executing a pending
    /// silence-refined split the moment its `split_offset` falls inside
    /// this chunk. `self.bytes_written` always advances by exactly
    /// `bytes.len()` regardless of how the chunk gets divided between the
    /// old and new track, so it stays in the same absolute coordinate space
    /// as the markers `handle_track_change` compares it against.
    fn write_audio(&mut self, bytes: &[u8]) {
        let chunk_start = self.bytes_written;
        self.bytes_written += bytes.len() as u64;

        let Some(pending) = self.pending_split.take() else {
            self.write_file_bytes(bytes);
            return;
        };

        if pending.split_offset >= self.bytes_written {
            self.write_file_bytes(bytes);
            self.pending_split = Some(pending);
            return;
        }

        let local_split = pending.split_offset.saturating_sub(chunk_start).min(bytes.len() as u64) as usize;
        let (before, after) = bytes.split_at(local_split);

        if pending.pad_end_of_prev >= 0 {
            let extra = (pending.pad_end_of_prev as usize).min(after.len());
            self.write_file_bytes(before);
            self.write_file_bytes(&after[..extra]);
        } else {
            let trim = ((-pending.pad_end_of_prev) as usize).min(before.len());
            self.write_file_bytes(&before[..before.len() - trim]);
        }

        self.close_current_track();
        self.open_track(pending.next_info);
        self.state = State::Ripping;

        if pending.pad_start_of_next >= 0 {
            let extra = (pending.pad_start_of_next as usize).min(before.len());
            self.write_file_bytes(&before[before.len() - extra..]);
            self.write_file_bytes(after);
        } else {
            let trim = ((-pending.pad_start_of_next) as usize).min(after.len());
            self.write_file_bytes(&after[trim..]);
        }
    }

    fn write_file_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(track) = self.current_track.as_mut() {
            track.bytes += bytes.len() as u64;
            if let Some(file) = track.file.as_mut() {
                if let Err(e) = file.write_all(bytes) {
                    warn!(error = %e, "write to track file failed");
                    self.status.emit(StatusEvent::Error {
                        message: RipError::DiskFull(e).to_string(),
                        fatal: false,
                    });
                }
            }
        }
        if let Some(show_file) = self.show_file.as_mut() {
            if let Err(e) = show_file.write_all(bytes) {
                warn!(error = %e, "write to show file failed");
                self.status.emit(StatusEvent::Error {
                    message: RipError::DiskFull(e).to_string(),
                    fatal: false,
                });
            }
        }
    }

    fn open_track(&mut self, info: TrackInfo) {
        self.track_count += 1;

        if self.config.flags.single_file_output && self.show_file.is_none() {
            self.open_show_file();
        }

        let (path, target_path, file) = if self.config.flags.individual_tracks {
            let path = self.build_path(&info);
            match self.open_for_write(&path) {
                Ok(Some((write_path, file))) => {
                    let target_path = (write_path != path).then(|| path.clone());
                    (Some(write_path), target_path, Some(file))
                },
                Ok(None) => {
                    info!(path = %path.display(), "skipping write: overwrite policy = never and file exists");
                    (None, None, None)
                },
                Err(e) => {
                    warn!(error = %e, "could not open track file");
                    self.status.emit(StatusEvent::Error {
                        message: RipError::CantCreateFile(e).to_string(),
                        fatal: false,
                    });
                    (None, None, None)
                },
            }
        } else {
            (None, None, None)
        };

        self.current_track = Some(OpenTrack { info: info.clone(), path, target_path, file, bytes: 0 });
        self.status.emit(StatusEvent::NewTrack(info));
    }

    /// Opens the single growing output file for the whole session, per
    /// `flags.single_file_output`. Named from `show_file_pattern` rather
    /// than `filename_pattern`; uses the same overwrite policy and is never
    /// reopened on a track boundary.
    fn open_show_file(&mut self) {
        let path = self.build_show_path();
        match self.open_for_write(&path) {
            Ok(Some((write_path, file))) => {
                if write_path != path {
                    // The `larger` policy would otherwise stage every
                    // session's growing file in a temp path and only
                    // reconcile it once, at process exit; that's a poor fit
                    // for a file meant to keep growing for the session's
                    // whole lifetime, so show files always overwrite in
                    // place regardless of the configured policy.
                    drop(file);
                    let _ = fs::remove_file(&write_path);
                    warn!(path = %path.display(), "overwrite policy ignored for show file; opening in place");
                    match OpenOptions::new().write(true).create(true).truncate(true).open(&path) {
                        Ok(file) => self.show_file = Some(file),
                        Err(e) => {
                            warn!(error = %e, "could not open show file");
                            self.status.emit(StatusEvent::Error {
                                message: RipError::CantCreateFile(e).to_string(),
                                fatal: false,
                            });
                        },
                    }
                } else {
                    self.show_file = Some(file);
                }
            },
            Ok(None) => {
                info!(path = %path.display(), "skipping show file: overwrite policy = never and file exists");
            },
            Err(e) => {
                warn!(error = %e, "could not open show file");
                self.status.emit(StatusEvent::Error {
                    message: RipError::CantCreateFile(e).to_string(),
                    fatal: false,
                });
            },
        }
    }

    fn close_current_track(&mut self) {
        let Some(track) = self.current_track.take() else {
            return;
        };
        drop(track.file);
        let reported_path = if let Some(path) = &track.path {
            if track.bytes > 0 {
                self.write_id3_tags(path, &track.info);
            }
            Some(self.apply_overwrite_policy(path, track.target_path.as_deref(), track.bytes))
        } else {
            None
        };
        self.status.emit(StatusEvent::TrackDone { path: reported_path });
    }

    /// Tags a just-closed MP3 file per the `add_id3v1`/`add_id3v2` flags
    /// (`spec.md`'s flag set). A tagging failure never invalidates the
    /// audio file itself, so it's reported as a recoverable error.
    fn write_id3_tags(&self, path: &Path, info: &TrackInfo) {
        if self.content_type != ContentType::Mp3 {
            return;
        }

        if self.config.flags.add_id3v2 {
            if let Err(e) = write_id3v2_tag(path, info) {
                warn!(error = %e, path = %path.display(), "id3v2 tag write failed");
                self.status.emit(StatusEvent::Error {
                    message: RipError::from(e).to_string(),
                    fatal: false,
                });
            }
        }

        if self.config.flags.add_id3v1 {
            if let Err(e) = write_id3v1_tag(path, info) {
                warn!(error = %e, path = %path.display(), "id3v1 tag write failed");
                self.status.emit(StatusEvent::Error {
                    message: RipError::DiskFull(e).to_string(),
                    fatal: false,
                });
            }
        }
    }

    /// `spec.md` §4.6's `larger` policy is only decided once the new
    /// file's final size is known, i.e. here at completion time; `always`,
    /// `never`, and `version` are all resolved up front in
    /// [`Self::open_for_write`]. When `write_path` staged into `target`
    /// (the `Larger`-vs-existing-file case), this keeps whichever of the
    /// two is bigger under `target` and removes the loser, returning the
    /// path callers should report as the track's real destination.
    fn apply_overwrite_policy(&self, write_path: &Path, target: Option<&Path>, new_size: u64) -> PathBuf {
        let Some(target) = target else {
            return write_path.to_path_buf();
        };

        let existing_size = fs::metadata(target).map(|m| m.len()).unwrap_or(0);
        if new_size > existing_size {
            if let Err(e) = fs::rename(write_path, target) {
                warn!(error = %e, path = %target.display(), "could not finalize larger track file");
            }
        } else if let Err(e) = fs::remove_file(write_path) {
            warn!(error = %e, path = %write_path.display(), "could not remove discarded track file");
        }
        target.to_path_buf()
    }

    /// Opens `path` for writing under the configured overwrite policy.
    /// Returns `(write_path, file)`: `write_path` is almost always `path`
    /// itself, except for `OverwritePolicy::Larger` racing an existing
    /// file, where it's a sibling staging path that [`Self::apply_overwrite_policy`]
    /// reconciles against `path` once the new file's final size is known.
    fn open_for_write(&self, path: &Path) -> io::Result<Option<(PathBuf, File)>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.config.overwrite_policy {
            OverwritePolicy::Always => Ok(Some((path.to_path_buf(), File::create(path)?))),
            OverwritePolicy::Never => {
                if path.exists() {
                    Ok(None)
                } else {
                    Ok(Some((path.to_path_buf(), File::create(path)?)))
                }
            },
            OverwritePolicy::Larger => {
                if path.exists() {
                    let staging = larger_staging_path(path);
                    Ok(Some((staging.clone(), File::create(&staging)?)))
                } else {
                    Ok(Some((path.to_path_buf(), File::create(path)?)))
                }
            },
            OverwritePolicy::Version => {
                let versioned = next_free_version(path);
                Ok(Some((
                    versioned.clone(),
                    OpenOptions::new().write(true).create_new(true).open(versioned)?,
                )))
            },
        }
    }

    fn build_path(&self, info: &TrackInfo) -> PathBuf {
        let pattern = &self.config.filename_pattern;
        let station = self.station_name.as_str();
        let name = substitute_tokens(pattern, info, self.track_count, self.config.count_start, station);
        let sanitized = sanitize_filename(&name);

        let mut path = self.config.output_directory.clone();
        if self.config.flags.separate_dirs {
            path.push(sanitize_filename(station));
        }
        path.push(format!("{sanitized}.{}", self.content_type.extension()));
        path
    }

    /// Builds the single show file's path from `show_file_pattern`. Has no
    /// single track's metadata to draw on, so `%A`/`%T`/`%B`/`%n`/`%Y`
    /// resolve to their defaults; only `%S`/`%d`/`%N` are meaningful here.
    fn build_show_path(&self) -> PathBuf {
        let pattern = &self.config.show_file_pattern;
        let station = self.station_name.as_str();
        let name = substitute_tokens(pattern, &TrackInfo::default(), self.track_count, self.config.count_start, station);
        let sanitized = sanitize_filename(&name);

        let mut path = self.config.output_directory.clone();
        if self.config.flags.separate_dirs {
            path.push(sanitize_filename(station));
        }
        path.push(format!("{sanitized}.{}", self.content_type.extension()));
        path
    }

    fn finish(&mut self, cancelled: bool) {
        if self.state == State::Stopped {
            return;
        }
        self.close_current_track();
        self.show_file.take();
        self.state = State::Stopped;
        self.status.emit(StatusEvent::Update(crate::status::StatusSnapshot {
            status: crate::types::SessionStatus::Ripping,
            content_type: self.content_type,
            metadata_interval: None,
            declared_bitrate_kbps: None,
            detected_bitrate_kbps: Some(self.bitrate_kbps),
            bytes_read: self.bytes_written,
            bytes_written: self.bytes_written,
            elapsed: self.started_at.elapsed(),
        }));
        if cancelled {
            self.status.emit(StatusEvent::Error {
                message: "cancelled".to_string(),
                fatal: false,
            });
        }
        self.status.emit(StatusEvent::Done);
    }
}

/// Substitutes `%`-tokens per `spec.md` §4.6: `%A` artist, `%T` title, `%B`
/// album, `%N` assigned track number, `%n` parsed track number, `%Y` year,
/// `%S` station name, `%d` UTC date.
fn substitute_tokens(pattern: &str, info: &TrackInfo, track_a: u32, count_start: u32, station: &str) -> String {
    let date = format_utc_date();
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('A') => out.push_str(info.artist.as_deref().unwrap_or("Unknown Artist")),
            Some('T') => out.push_str(info.title.as_deref().unwrap_or("Unknown Title")),
            Some('B') => out.push_str(info.album.as_deref().unwrap_or("")),
            Some('N') => out.push_str(&(count_start + track_a - 1).to_string()),
            Some('n') => out.push_str(&info.track_p.map(|n| n.to_string()).unwrap_or_default()),
            Some('Y') => out.push_str(info.year.as_deref().unwrap_or("")),
            Some('S') => out.push_str(station),
            Some('d') => out.push_str(&date),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            },
            None => out.push('%'),
        }
    }
    out
}

fn format_utc_date() -> String {
    // Avoids pulling in a datetime crate for a single `YYYYMMDD` stamp:
    // days-since-epoch civil conversion (Howard Hinnant's algorithm).
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let days = (secs / 86_400) as i64;
    let (y, m, d) = civil_from_days(days);
    format!("{y:04}{m:02}{d:02}")
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Strips path separators and the handful of characters Windows forbids in
/// filenames, since capture sessions should produce portable output
/// regardless of the host platform.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Writes (or rewrites) an ID3v2.4 header on `path` using whatever fields
/// are available on `info`. The `id3` crate rewrites the whole file with
/// the tag prepended, so this is called once, at track completion, rather
/// than incrementally.
fn write_id3v2_tag(path: &Path, info: &TrackInfo) -> id3::Result<()> {
    let mut tag = id3::Tag::new();

    if let Some(artist) = &info.artist {
        tag.set_artist(artist.clone());
    }
    if let Some(title) = &info.title {
        tag.set_title(title.clone());
    }
    if let Some(album) = &info.album {
        tag.set_album(album.clone());
    }
    if let Some(year) = &info.year {
        if let Ok(year) = year.parse::<i32>() {
            tag.set_year(year);
        }
    }
    if let Some(track_a) = info.track_a {
        tag.set_track(track_a);
    }

    tag.write_to_path(path, id3::Version::Id3v24)
}

/// Appends a classic 128-byte ID3v1.1 trailer to `path`: `"TAG"` followed by
/// fixed-width title/artist/album/year/comment fields, a zero byte, the
/// track number, and a genre byte. The `id3` crate only writes ID3v2, so
/// this is hand-rolled per the format's fixed layout.
fn write_id3v1_tag(path: &Path, info: &TrackInfo) -> io::Result<()> {
    let mut tag = [0u8; 128];
    tag[0..3].copy_from_slice(b"TAG");
    write_id3v1_field(&mut tag[3..33], info.title.as_deref().unwrap_or(""));
    write_id3v1_field(&mut tag[33..63], info.artist.as_deref().unwrap_or(""));
    write_id3v1_field(&mut tag[63..93], info.album.as_deref().unwrap_or(""));
    write_id3v1_field(&mut tag[93..97], info.year.as_deref().unwrap_or(""));
    // tag[97..125] (comment) left zero-padded; tag[125] stays 0 to mark the
    // ID3v1.1 layout (comment field truncated to make room for the track byte).
    tag[126] = info.track_a.map_or(0, |n| n.min(255) as u8);
    tag[127] = 0xFF; // genre: unspecified

    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&tag)
}

/// Copies as much of `value` as fits into `dst`, left-justified and
/// zero-padded, truncating on the byte boundary rather than overflowing.
fn write_id3v1_field(dst: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Appends a `.partial` suffix to `path` for the `keep_incomplete` policy
/// (`spec.md` §5), e.g. `track.mp3` -> `track.mp3.partial`.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().and_then(|s| s.to_str()).unwrap_or("track").to_string();
    name.push_str(".partial");
    path.with_file_name(name)
}

/// A sibling of `path` to stage the new recording into when
/// `OverwritePolicy::Larger` finds `path` already occupied; the new file is
/// written here so the existing one survives untouched until the final
/// sizes can be compared at track close.
fn larger_staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().and_then(|s| s.to_str()).unwrap_or("track").to_string();
    name.push_str(".larger-tmp");
    path.with_file_name(name)
}

fn next_free_version(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("track");
    let ext = path.extension().and_then(|s| s.to_str());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    for n in 2.. {
        let candidate_name = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("the version suffix space is unbounded")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_tokens() {
        let info = TrackInfo {
            artist: Some("Artist".to_string()),
            title: Some("Title".to_string()),
            ..Default::default()
        };
        let out = substitute_tokens("%N - %A - %T", &info, 3, 1, "Station");
        assert_eq!(out, "3 - Artist - Title");
    }

    #[test]
    fn unknown_token_is_preserved_literally() {
        let info = TrackInfo::default();
        let out = substitute_tokens("%Z", &info, 1, 1, "Station");
        assert_eq!(out, "%Z");
    }

    #[test]
    fn sanitizes_reserved_characters() {
        assert_eq!(sanitize_filename("AC/DC: Back?"), "AC_DC_ Back_");
    }

    #[test]
    fn civil_date_epoch_day_zero_is_1970_01_01() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
    }

    #[test]
    fn next_free_version_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("track.mp3");
        fs::write(&base, b"x").unwrap();
        let next = next_free_version(&base);
        assert_eq!(next, dir.path().join("track (2).mp3"));
    }

    #[test]
    fn larger_staging_path_adds_suffix() {
        let base = Path::new("/music/track.mp3");
        assert_eq!(larger_staging_path(base), Path::new("/music/track.mp3.larger-tmp"));
    }

    #[test]
    fn id3v1_tag_is_appended_as_a_trailing_128_byte_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.mp3");
        fs::write(&path, b"fake mp3 frames").unwrap();

        let info = TrackInfo {
            artist: Some("Artist".to_string()),
            title: Some("Title".to_string()),
            track_a: Some(5),
            ..Default::default()
        };
        write_id3v1_tag(&path, &info).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), "fake mp3 frames".len() + 128);
        let tag = &bytes[bytes.len() - 128..];
        assert_eq!(&tag[0..3], b"TAG");
        assert!(String::from_utf8_lossy(&tag[3..33]).starts_with("Title"));
        assert!(String::from_utf8_lossy(&tag[33..63]).starts_with("Artist"));
        assert_eq!(tag[126], 5);
    }

    #[test]
    fn write_id3v1_field_truncates_to_fit() {
        let mut dst = [0u8; 4];
        write_id3v1_field(&mut dst, "abcdef");
        assert_eq!(&dst, b"abcd");
    }
}
