//! End-to-end capture test: a mock ICY source feeds three metadata-tagged
//! segments through [`Supervisor`] and down to per-track files on disk,
//! matching `spec.md` §8 scenario 1 ("Simple MP3 capture").

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread;

use reelcast::config::Flags;
use reelcast::{OverwritePolicy, StatusEvent, StreamConfig, Supervisor};

/// Builds an ICY in-band metadata block: a length byte (in 16-byte blocks)
/// followed by the NUL-padded payload, mirroring `meta::stripper`'s own
/// test helper.
fn metadata_block(raw: &str) -> Vec<u8> {
    let mut bytes = raw.as_bytes().to_vec();
    let padded = bytes.len().div_ceil(16) * 16;
    bytes.resize(padded, 0);
    let mut out = vec![(padded / 16) as u8];
    out.extend(bytes);
    out
}

/// Accepts a single connection, replies with ICY headers advertising
/// `metaint`, then streams three metadata-tagged segments before closing
/// the connection (simulating the source going away after the third track
/// starts).
fn spawn_mock_source(metaint: usize) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).unwrap();
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        let response = format!(
            "ICY 200 OK\r\ncontent-type: audio/mpeg\r\nicy-metaint: {metaint}\r\nicy-name: Test Station\r\nicy-br: 128\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).unwrap();

        let segment = vec![0x55u8; metaint];
        for title in [
            "Artist One - Title One",
            "Artist Two - Title Two",
            "Artist Three - Title Three",
        ] {
            stream.write_all(&segment).unwrap();
            stream
                .write_all(&metadata_block(&format!("StreamTitle='{title}';")))
                .unwrap();
        }
        // Dropping `stream` here closes the socket, simulating a source
        // disconnect right after the third track's metadata change.
    });

    (port, handle)
}

#[test]
fn three_metadata_changes_produce_three_named_tracks() {
    let metaint = 256;
    let (port, source) = spawn_mock_source(metaint);

    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("http://127.0.0.1:{port}/stream")).unwrap();

    let config = StreamConfig::new(url)
        .output_directory(dir.path())
        .overwrite_policy(OverwritePolicy::Version)
        .flags(Flags {
            individual_tracks: true,
            keep_incomplete: true,
            ..Flags::default()
        });

    let (tx, rx) = flume::unbounded::<StatusEvent>();
    let sink: std::sync::Arc<dyn reelcast::StatusSink> =
        std::sync::Arc::new(move |event: StatusEvent| {
            let _ = tx.send(event);
        });

    let mut supervisor = Supervisor::start(config, sink);

    // `auto_reconnect` defaults to false, so once the mock source closes
    // its socket the whole session runs to completion on its own; no
    // explicit `stop()` is needed.
    supervisor.join();
    source.join().unwrap();

    let mut new_track_titles = Vec::new();
    let mut track_done_count = 0;
    let mut saw_done = false;
    for event in rx.try_iter() {
        match event {
            StatusEvent::NewTrack(info) => new_track_titles.push(info.title),
            StatusEvent::TrackDone { .. } => track_done_count += 1,
            StatusEvent::Done => saw_done = true,
            _ => {},
        }
    }

    assert!(saw_done, "session should have reached Done");
    assert_eq!(
        new_track_titles,
        vec![
            Some("Title One".to_string()),
            Some("Title Two".to_string()),
            Some("Title Three".to_string()),
        ]
    );
    // The first two tracks close normally on the next metadata change; the
    // third is still open when the source disconnects and is handled by
    // `on_disconnect`'s keep_incomplete path instead of a normal close.
    assert_eq!(track_done_count, 2);

    let entries: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();

    assert!(
        entries.iter().any(|n| n.contains("Title One") && n.ends_with(".mp3")),
        "missing completed file for Title One, got: {entries:?}"
    );
    assert!(
        entries.iter().any(|n| n.contains("Title Two") && n.ends_with(".mp3")),
        "missing completed file for Title Two, got: {entries:?}"
    );
    assert!(
        entries.iter().any(|n| n.contains("Title Three") && n.ends_with(".partial")),
        "missing partial file for Title Three, got: {entries:?}"
    );
}

#[test]
fn stream_with_no_metadata_interval_rips_one_continuous_track() {
    // spec.md §9's Open Question resolution: no icy-metaint and no external
    // command means one unnamed track, not a session stuck in Buffering.
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let source = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).unwrap();
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }
        stream
            .write_all(b"ICY 200 OK\r\ncontent-type: audio/mpeg\r\n\r\n")
            .unwrap();
        stream.write_all(&vec![0xAAu8; 4096]).unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("http://127.0.0.1:{port}/stream")).unwrap();
    let config = StreamConfig::new(url).output_directory(dir.path()).flags(Flags {
        individual_tracks: true,
        keep_incomplete: true,
        ..Flags::default()
    });

    let (tx, rx) = flume::unbounded::<StatusEvent>();
    let sink: std::sync::Arc<dyn reelcast::StatusSink> =
        std::sync::Arc::new(move |event: StatusEvent| {
            let _ = tx.send(event);
        });

    let mut supervisor = Supervisor::start(config, sink);
    supervisor.join();
    source.join().unwrap();

    let new_track_count = rx.try_iter().filter(|e| matches!(e, StatusEvent::NewTrack(_))).count();
    assert_eq!(new_track_count, 1, "exactly one synthetic track should open");

    // `auto_reconnect` is off, so the lone track is still "current" when the
    // source disconnects; `keep_incomplete` means it's renamed rather than
    // deleted, not closed out normally.
    let entries: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one ripped file, got: {entries:?}");
    assert!(entries[0].ends_with(".partial"), "expected a .partial file, got: {entries:?}");
}
