//! `spec.md` §4.4 — the shared circular audio buffer coupling the single
//! network-reader producer to N consumers (track writer, silence detector,
//! relay listeners). Each consumer owns an independent read cursor;
//! `Mutex` + `Condvar` provide the wakeups, and every invariant check
//! (`item_count`, eviction) happens with the lock held so no reader can
//! observe a state the producer is mid-mutating (`spec.md` §5's
//! TOCTOU-safety requirement).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Opaque handle identifying one registered consumer's read cursor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConsumerId(u64);

/// Outcome of [`RingBuffer::read_timeout`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// The cursor was evicted, or the producer has permanently stopped and
    /// every already-written byte has been drained.
    Eof,
    /// No data arrived before the deadline; the caller should handle
    /// whatever it was waiting to interleave and call again.
    TimedOut,
}

struct Cursor {
    /// Total bytes consumed since registration; compared against the
    /// producer's running total to compute backlog and detect eviction.
    position: u64,
    evicted: bool,
    /// Whether a slow reader on this cursor gets disconnected (relay
    /// listeners) rather than allowed to block the producer (the track
    /// writer, registered with `evictable = false`).
    evictable: bool,
}

struct Inner {
    data: Vec<u8>,
    capacity: usize,
    /// Where the next producer write lands, mod `capacity`.
    write_pos: usize,
    /// Total bytes ever written; cursors' `position` is directly comparable.
    total_written: u64,
    stopped: bool,
    cursors: HashMap<ConsumerId, Cursor>,
    next_id: u64,
}

/// A single-producer, multi-consumer ring buffer over raw (post
/// metadata-stripped) stream bytes.
///
/// Each consumer is registered as either evictable or not
/// ([`RingBuffer::register_consumer`]). An evictable consumer (a relay
/// listener) that falls more than `capacity` bytes behind the producer is
/// evicted: its next [`RingBuffer::read`] call returns `0` permanently. This
/// is deliberate backpressure relief, grounded in `spec.md` §4.4/§5 ("a
/// consumer that cannot keep up is disconnected rather than allowed to stall
/// the producer"). A non-evictable consumer (the track writer) is never
/// evicted; instead [`RingBuffer::push`] blocks until it has read enough to
/// make room, per `spec.md` §4.4's "the producer never writes past any live
/// consumer cursor."
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RingBuffer {
    /// Allocates a new buffer with no registered consumers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity],
                capacity,
                write_pos: 0,
                total_written: 0,
                stopped: false,
                cursors: HashMap::new(),
                next_id: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Registers a new consumer cursor positioned at the current write head
    /// (it only sees bytes written from now on). `evictable` controls what
    /// happens if this cursor falls capacity bytes behind the producer:
    /// `true` (relay listeners) gets it disconnected; `false` (the track
    /// writer) makes [`RingBuffer::push`] block instead.
    pub fn register_consumer(&self, evictable: bool) -> ConsumerId {
        let mut inner = self.inner.lock();
        let id = ConsumerId(inner.next_id);
        inner.next_id += 1;
        let total_written = inner.total_written;
        inner.cursors.insert(
            id,
            Cursor {
                position: total_written,
                evicted: false,
                evictable,
            },
        );
        id
    }

    /// Drops a consumer's cursor. Safe to call on an already-evicted or
    /// unknown id. Wakes any producer blocked in [`RingBuffer::push`] on this
    /// cursor's backlog, since removing it may be exactly what was needed to
    /// make room.
    pub fn unregister_consumer(&self, id: ConsumerId) {
        self.inner.lock().cursors.remove(&id);
        self.not_full.notify_all();
    }

    /// Whether `id` has fallen behind enough to be evicted. Used by callers
    /// that want to distinguish "caught up, waiting for data" from
    /// "disconnected" without attempting a read.
    #[must_use]
    pub fn is_evicted(&self, id: ConsumerId) -> bool {
        self.inner
            .lock()
            .cursors
            .get(&id)
            .map(|c| c.evicted)
            .unwrap_or(true)
    }

    /// Producer-side append. If writing `chunk` would run `chunk.len()`
    /// bytes past a still-registered, non-evictable consumer's cursor (the
    /// track writer), blocks on `not_full` — re-checked on a bounded wait so
    /// a producer blocked here during shutdown is never stuck forever, only
    /// delayed up to that bound — until that consumer has read enough to
    /// make room. Evictable consumers (relay listeners) are never allowed to
    /// block the producer this way: one that has fallen behind far enough to
    /// be overrun by this chunk is disconnected instead, per `spec.md`
    /// §4.4/§5 ("a consumer that cannot keep up is disconnected rather than
    /// allowed to stall the producer").
    pub fn push(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let capacity = inner.capacity as u64;
        let chunk_len = chunk.len() as u64;

        loop {
            let prospective_total = inner.total_written + chunk_len;

            for cursor in inner.cursors.values_mut() {
                if cursor.evictable && !cursor.evicted && prospective_total - cursor.position > capacity {
                    cursor.evicted = true;
                }
            }

            let slowest_required = inner
                .cursors
                .values()
                .filter(|c| !c.evictable && !c.evicted)
                .map(|c| c.position)
                .min();

            match slowest_required {
                Some(pos) if prospective_total - pos > capacity => {
                    self.not_full.wait_for(&mut inner, Duration::from_millis(200));
                },
                _ => break,
            }
        }

        let capacity = inner.capacity;
        for byte in chunk {
            let pos = inner.write_pos;
            inner.data[pos] = *byte;
            inner.write_pos = (pos + 1) % capacity;
            inner.total_written += 1;
        }

        self.not_empty.notify_all();
    }

    /// Signals that no more data will ever be produced; wakes every blocked
    /// consumer so `read` can return `0` instead of hanging forever.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        self.not_empty.notify_all();
    }

    /// Blocking read: copies up to `buf.len()` bytes into `buf`, blocking
    /// until at least one byte is available. Returns `0` on eviction or
    /// permanent end-of-stream (after [`RingBuffer::stop`] and the cursor
    /// having drained everything already written).
    pub fn read(&self, id: ConsumerId, buf: &mut [u8]) -> usize {
        match self.read_timeout(id, buf, None) {
            ReadOutcome::Data(n) => n,
            ReadOutcome::Eof | ReadOutcome::TimedOut => 0,
        }
    }

    /// Bounded-wait read. Identical to [`RingBuffer::read`] except that a
    /// consumer that would otherwise block forever gives up and returns
    /// [`ReadOutcome::TimedOut`] after `timeout` elapses with nothing
    /// available. `timeout = None` waits indefinitely (this is what
    /// [`RingBuffer::read`] does).
    ///
    /// Used by consumers that must also react to out-of-band signals (a
    /// cancellation flag, a control-event queue) without a second thread:
    /// poll on a short timeout instead of blocking on data alone.
    pub fn read_timeout(&self, id: ConsumerId, buf: &mut [u8], timeout: Option<Duration>) -> ReadOutcome {
        if buf.is_empty() {
            return ReadOutcome::Data(0);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            let Some(cursor) = inner.cursors.get(&id) else {
                return ReadOutcome::Eof;
            };
            if cursor.evicted {
                return ReadOutcome::Eof;
            }

            let available = inner.total_written - cursor.position;
            if available > 0 {
                let capacity = inner.capacity;
                let to_read = (available as usize).min(buf.len());
                let start = (cursor.position % capacity as u64) as usize;

                for (i, slot) in buf.iter_mut().take(to_read).enumerate() {
                    *slot = inner.data[(start + i) % capacity];
                }

                let cursor = inner.cursors.get_mut(&id).expect("checked above");
                cursor.position += to_read as u64;
                self.not_full.notify_all();
                return ReadOutcome::Data(to_read);
            }

            if inner.stopped {
                return ReadOutcome::Eof;
            }

            match deadline {
                None => self.not_empty.wait(&mut inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return ReadOutcome::TimedOut;
                    }
                    if self.not_empty.wait_for(&mut inner, deadline - now).timed_out() {
                        return ReadOutcome::TimedOut;
                    }
                },
            }
        }
    }

    /// Total bytes ever pushed by the producer. Used by the reader/
    /// supervisor loop to stamp metadata events with an absolute marker
    /// offset (`spec.md` §4.4: "Metadata markers are immovable (identified
    /// by absolute byte position within the stream, not chunk index)").
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().total_written
    }

    /// Copies up to `buf.len()` bytes starting at the absolute stream
    /// offset `offset`, without advancing any consumer's cursor. Returns
    /// the number of bytes actually copied, which is `0` if `offset` has
    /// already been overwritten (fallen outside the live window) or is
    /// not yet written. Used by the silence detector to read a region
    /// around a metadata marker (`spec.md` §4.4's `peek_region`).
    pub fn peek_region(&self, offset: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let inner = self.inner.lock();
        if offset >= inner.total_written {
            return 0;
        }
        let capacity = inner.capacity as u64;
        let oldest_live = inner.total_written.saturating_sub(capacity);
        if offset < oldest_live {
            return 0;
        }

        let available = (inner.total_written - offset) as usize;
        let to_read = available.min(buf.len());
        let start = (offset % capacity) as usize;
        for (i, slot) in buf.iter_mut().take(to_read).enumerate() {
            *slot = inner.data[(start + i) % inner.capacity];
        }
        to_read
    }

    /// Current item count in the buffer relative to the oldest live
    /// consumer cursor — always computed under the lock, never derived from
    /// a stale snapshot (`spec.md` §5's TOCTOU-safety requirement).
    #[must_use]
    pub fn backlog_for(&self, id: ConsumerId) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .cursors
            .get(&id)
            .map(|c| inner.total_written - c.position)
    }

    /// Total allocated byte capacity of the buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_consumer_round_trip() {
        let ring = RingBuffer::new(1024);
        let id = ring.register_consumer(true);
        ring.push(b"hello world");

        let mut buf = [0u8; 32];
        let n = ring.read(id, &mut buf);
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn stop_unblocks_waiting_reader() {
        let ring = Arc::new(RingBuffer::new(64));
        let id = ring.register_consumer(true);

        let reader_ring = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader_ring.read(id, &mut buf)
        });

        // Give the reader a chance to block before we stop the buffer.
        thread::sleep(std::time::Duration::from_millis(50));
        ring.stop();

        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn slow_consumer_is_evicted() {
        let ring = RingBuffer::new(16);
        let id = ring.register_consumer(true);

        // Push far more than capacity without ever reading.
        for _ in 0..4 {
            ring.push(&[0u8; 16]);
        }

        assert!(ring.is_evicted(id));
        let mut buf = [0u8; 4];
        assert_eq!(ring.read(id, &mut buf), 0);
    }

    #[test]
    fn peek_region_reads_without_advancing_cursor() {
        let ring = RingBuffer::new(1024);
        let id = ring.register_consumer(true);
        ring.push(b"0123456789");

        let mut region = [0u8; 4];
        let n = ring.peek_region(3, &mut region);
        assert_eq!(n, 4);
        assert_eq!(&region, b"3456");

        let mut buf = [0u8; 10];
        assert_eq!(ring.read(id, &mut buf), 10);
    }

    #[test]
    fn peek_region_beyond_window_returns_zero() {
        let ring = RingBuffer::new(8);
        for _ in 0..4 {
            ring.push(&[0u8; 8]);
        }
        let mut buf = [0u8; 4];
        assert_eq!(ring.peek_region(0, &mut buf), 0);
    }

    #[test]
    fn read_timeout_returns_timed_out_when_idle() {
        let ring = RingBuffer::new(64);
        let id = ring.register_consumer(true);
        let mut buf = [0u8; 8];
        let outcome = ring.read_timeout(id, &mut buf, Some(std::time::Duration::from_millis(20)));
        assert_eq!(outcome, ReadOutcome::TimedOut);
    }

    #[test]
    fn read_timeout_wakes_on_push() {
        let ring = Arc::new(RingBuffer::new(64));
        let id = ring.register_consumer(true);

        let reader_ring = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader_ring.read_timeout(id, &mut buf, Some(std::time::Duration::from_secs(5)))
        });

        thread::sleep(std::time::Duration::from_millis(20));
        ring.push(b"hi");

        assert_eq!(handle.join().unwrap(), ReadOutcome::Data(2));
    }

    #[test]
    fn bytes_written_tracks_total_pushed() {
        let ring = RingBuffer::new(1024);
        assert_eq!(ring.bytes_written(), 0);
        ring.push(b"0123456789");
        assert_eq!(ring.bytes_written(), 10);
    }

    #[test]
    fn independent_consumer_cursors() {
        let ring = RingBuffer::new(1024);
        ring.push(b"first-chunk-");
        let id_late = ring.register_consumer(true);
        ring.push(b"second-chunk");

        let mut buf = [0u8; 32];
        let n = ring.read(id_late, &mut buf);
        assert_eq!(&buf[..n], b"second-chunk");
    }

    #[test]
    fn non_evictable_consumer_blocks_the_producer_instead_of_losing_bytes() {
        let ring = Arc::new(RingBuffer::new(16));
        let writer = ring.register_consumer(false);

        // Fill the buffer without reading; a fourth push would run 16 bytes
        // past `writer`'s cursor, so it must block rather than evict it.
        ring.push(&[1u8; 16]);

        let blocked_ring = Arc::clone(&ring);
        let handle = thread::spawn(move || {
            blocked_ring.push(&[2u8; 16]);
        });

        thread::sleep(std::time::Duration::from_millis(100));
        assert!(!handle.is_finished(), "push should still be blocked on the unread non-evictable cursor");
        assert!(!ring.is_evicted(writer), "a non-evictable cursor must never be evicted");

        let mut buf = [0u8; 16];
        assert_eq!(ring.read(writer, &mut buf), 16);
        assert_eq!(buf, [1u8; 16]);

        handle.join().unwrap();
        assert!(!ring.is_evicted(writer));

        let mut buf = [0u8; 16];
        assert_eq!(ring.read(writer, &mut buf), 16);
        assert_eq!(buf, [2u8; 16]);
    }

    #[test]
    fn evictable_consumer_still_gets_evicted_while_a_non_evictable_one_is_caught_up() {
        let ring = RingBuffer::new(16);
        let writer = ring.register_consumer(false);
        let listener = ring.register_consumer(true);

        // `writer` drains every push, but `listener` never reads; it should
        // be evicted instead of ever blocking the producer.
        for _ in 0..4 {
            ring.push(&[0u8; 16]);
            let mut buf = [0u8; 16];
            ring.read(writer, &mut buf);
        }

        assert!(ring.is_evicted(listener));
        assert!(!ring.is_evicted(writer));
    }
}
