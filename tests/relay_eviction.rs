//! Relay server concurrency tests: a listener that falls too far behind
//! gets evicted from the ring buffer without corrupting or stalling any
//! other listener, per `spec.md` §4.4/§4.7.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use reelcast::relay::{RelayHeaders, RelayServer};
use reelcast::ring_buffer::RingBuffer;
use reelcast::types::ContentType;

#[test]
fn ring_buffer_evicts_a_cursor_that_falls_behind_while_a_peer_keeps_up() {
    let ring = RingBuffer::new(256);
    let fast = ring.register_consumer(true);
    let slow = ring.register_consumer(true);

    let mut received = Vec::new();
    for chunk_index in 0..20u8 {
        let chunk = vec![chunk_index; 64];
        ring.push(&chunk);

        // The fast consumer drains every chunk as it arrives...
        let mut buf = vec![0u8; 64];
        let n = ring.read(fast, &mut buf);
        received.extend_from_slice(&buf[..n]);

        // ...but `slow` never reads, so its backlog grows by 64 bytes every
        // iteration; once that exceeds the 256-byte capacity it must be
        // evicted rather than silently missing bytes.
    }

    assert!(ring.is_evicted(slow), "slow consumer should have been evicted");
    assert!(!ring.is_evicted(fast), "fast consumer must not be evicted");

    let mut buf = [0u8; 8];
    assert_eq!(ring.read(slow, &mut buf), 0, "reads from an evicted cursor return 0");

    assert_eq!(received.len(), 20 * 64);
    for (i, byte) in received.iter().enumerate() {
        assert_eq!(*byte, (i / 64) as u8, "byte {i} corrupted for the fast consumer");
    }
}

#[test]
fn relay_serves_a_well_behaved_listener_without_corruption_regardless_of_a_stalled_one() {
    let ring = Arc::new(RingBuffer::new(64 * 1024));
    let composed_metadata = Arc::new(Mutex::new(Vec::new()));

    let headers = RelayHeaders {
        content_type: ContentType::Mp3,
        bitrate_kbps: Some(128),
        name: Some("Test Station".to_string()),
        genre: None,
        url: None,
        metadata_interval: 0,
    };

    let relay = RelayServer::bind(
        Ipv4Addr::LOCALHOST.into(),
        0,
        0,
        8,
        false,
        headers,
        Arc::clone(&ring),
        composed_metadata,
    )
    .unwrap();
    let port = relay.local_port();

    // Neither listener sends `Icy-MetaData: 1`, so the relay never
    // interleaves metadata into either stream.
    let mut fast = TcpStream::connect(("127.0.0.1", port)).unwrap();
    fast.write_all(b"GET /stream HTTP/1.0\r\n\r\n").unwrap();

    // `slow` connects and completes its request but then never reads again;
    // its sender thread keeps writing into the OS socket buffer until the
    // ring buffer itself evicts it (or the buffer fills), but it must never
    // be allowed to stall the fast listener's own sender thread.
    let mut slow = TcpStream::connect(("127.0.0.1", port)).unwrap();
    slow.write_all(b"GET /stream HTTP/1.0\r\n\r\n").unwrap();

    thread::sleep(Duration::from_millis(150));
    assert_eq!(relay.listener_count(), 2);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    for chunk in payload.chunks(256) {
        ring.push(chunk);
    }

    fast.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut collected = Vec::new();
    let mut read_buf = vec![0u8; 4096];
    let header_end = loop {
        let n = fast.read(&mut read_buf).unwrap();
        assert!(n > 0, "fast listener got no data before its read timeout");
        collected.extend_from_slice(&read_buf[..n]);
        if let Some(pos) = find_header_end(&collected) {
            break pos;
        }
        assert!(collected.len() < 4096, "ICY response headers never terminated");
    };

    let header_text = String::from_utf8_lossy(&collected[..header_end]);
    assert!(header_text.starts_with("ICY 200 OK"));
    assert!(!header_text.to_lowercase().contains("icy-metaint"));

    let mut audio = collected[header_end..].to_vec();
    while audio.len() < payload.len() {
        let n = fast.read(&mut read_buf).unwrap();
        assert!(n > 0, "fast listener stalled before receiving the full payload");
        audio.extend_from_slice(&read_buf[..n]);
    }

    assert_eq!(&audio[..payload.len()], payload.as_slice());

    drop(slow);
    drop(fast);
    relay.shutdown();
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}
