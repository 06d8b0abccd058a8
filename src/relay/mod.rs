//! `spec.md` §4.7 — the concurrent ICY relay server: an acceptor thread that
//! binds the first free port in a configured range, plus one sender thread
//! per connected listener. Listeners are ordinary [`crate::ring_buffer`]
//! consumers; a listener that falls behind far enough to be evicted by the
//! ring buffer is simply dropped.

/// Errors surfaced by the relay server.
pub mod error;

use std::{
    io::{BufRead, BufReader, Write},
    net::{IpAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::ring_buffer::RingBuffer;
use crate::types::ContentType;
use error::{Error, Result};

/// Static response fields the relay reuses from the upstream source
/// connection, per `spec.md` §4.7 ("composed ICY metadata reuse").
#[derive(Clone, Debug)]
pub struct RelayHeaders {
    pub content_type: ContentType,
    pub bitrate_kbps: Option<u32>,
    pub name: Option<String>,
    pub genre: Option<String>,
    pub url: Option<String>,
    pub metadata_interval: u32,
}

/// A running relay server. Dropping this stops the acceptor thread (its
/// listening socket closes) but does not forcibly disconnect already
/// connected listeners; call [`RelayServer::shutdown`] for that.
pub struct RelayServer {
    local_port: u16,
    listener_count: Arc<AtomicUsize>,
    shutdown: Arc<parking_lot::Mutex<bool>>,
}

impl RelayServer {
    /// Binds the first free port in `[start_port, max_port]` on `bind_ip`,
    /// per `spec.md` §4.7's port-search behaviour, then spawns the acceptor
    /// thread. `composed_metadata` is shared with the metadata stripper,
    /// which updates it in place on every track change.
    #[instrument(skip(ring, composed_metadata, headers))]
    pub fn bind(
        bind_ip: IpAddr,
        start_port: u16,
        max_port: u16,
        max_connections: usize,
        search_ports: bool,
        headers: RelayHeaders,
        ring: Arc<RingBuffer>,
        composed_metadata: Arc<Mutex<Vec<u8>>>,
    ) -> Result<Self> {
        let listener = bind_in_range(bind_ip, start_port, max_port, search_ports)?;
        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(start_port);
        info!(port = local_port, "relay server listening");

        let listener_count = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(parking_lot::Mutex::new(false));

        let acceptor_count = Arc::clone(&listener_count);
        let acceptor_shutdown = Arc::clone(&shutdown);
        let headers = Arc::new(headers);

        thread::Builder::new()
            .name("relay-acceptor".into())
            .spawn(move || {
                accept_loop(
                    listener,
                    ring,
                    composed_metadata,
                    headers,
                    acceptor_count,
                    acceptor_shutdown,
                    max_connections,
                );
            })
            .expect("failed to spawn relay acceptor thread");

        Ok(Self {
            local_port,
            listener_count,
            shutdown,
        })
    }

    /// The port actually bound, which may differ from the configured start
    /// port if the search found it occupied.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Number of currently connected relay listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listener_count.load(Ordering::Acquire)
    }

    /// Signals the acceptor loop to stop accepting new connections. Existing
    /// sender threads keep running until their consumer is evicted or the
    /// ring buffer producer stops.
    pub fn shutdown(&self) {
        *self.shutdown.lock() = true;
    }
}

fn bind_in_range(
    bind_ip: IpAddr,
    start_port: u16,
    max_port: u16,
    search_ports: bool,
) -> Result<TcpListener> {
    let mut port = start_port;
    loop {
        match TcpListener::bind((bind_ip, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && search_ports && port < max_port => {
                debug!(port, "relay port in use, trying next");
                port += 1;
            },
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(Error::PortRangeExhausted {
                    start: start_port,
                    end: max_port,
                })
            },
            Err(e) => return Err(Error::Bind(e)),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: TcpListener,
    ring: Arc<RingBuffer>,
    composed_metadata: Arc<Mutex<Vec<u8>>>,
    headers: Arc<RelayHeaders>,
    listener_count: Arc<AtomicUsize>,
    shutdown: Arc<parking_lot::Mutex<bool>>,
    max_connections: usize,
) {
    for incoming in listener.incoming() {
        if *shutdown.lock() {
            break;
        }

        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "relay accept() failed");
                continue;
            },
        };

        if listener_count.load(Ordering::Acquire) >= max_connections {
            debug!("relay connection rejected: at capacity");
            drop(stream);
            continue;
        }

        // A listener whose receive window stays open but never drains could
        // otherwise block `write_all` indefinitely; bound it so a stalled
        // listener surfaces as a write error like any other socket failure.
        if let Err(e) = stream.set_write_timeout(Some(Duration::from_secs(30))) {
            warn!(error = %e, "failed to set relay listener write timeout");
        }

        let ring = Arc::clone(&ring);
        let composed_metadata = Arc::clone(&composed_metadata);
        let headers = Arc::clone(&headers);
        let listener_count = Arc::clone(&listener_count);

        listener_count.fetch_add(1, Ordering::AcqRel);
        thread::Builder::new()
            .name("relay-sender".into())
            .spawn(move || {
                serve_listener(stream, &ring, &composed_metadata, &headers);
                listener_count.fetch_sub(1, Ordering::AcqRel);
            })
            .expect("failed to spawn relay sender thread");
    }
}

/// Reads the connecting listener's own request line and headers and reports
/// whether it asked for in-band metadata, per `spec.md` §4.7 ("responds with
/// `icy-metaint: N` only if the client sent `Icy-MetaData: 1`"). A listener
/// that never sends a blank line (or disconnects mid-request) is treated as
/// a read error, same as any other I/O failure on this connection.
fn read_request_wants_metadata(stream: &TcpStream) -> std::io::Result<bool> {
    let mut reader = BufReader::new(stream);
    let mut wants_metadata = false;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("icy-metadata") && value.trim() == "1" {
                wants_metadata = true;
            }
        }
    }

    Ok(wants_metadata)
}

/// Per-listener sender loop: reads the listener's own request, writes the
/// ICY response headers, then interleaves audio bytes with the current
/// composed metadata block every `metadata_interval` bytes, per `spec.md`
/// §4.7 — but only if the listener asked for metadata in the first place.
fn serve_listener(
    mut stream: TcpStream,
    ring: &RingBuffer,
    composed_metadata: &Mutex<Vec<u8>>,
    headers: &RelayHeaders,
) {
    let wants_metadata = match read_request_wants_metadata(&stream) {
        Ok(w) => w,
        Err(e) => {
            debug!(error = %e, "relay listener request read failed");
            return;
        },
    };

    if write_response_headers(&mut stream, headers, wants_metadata).is_err() {
        return;
    }

    let consumer = ring.register_consumer(true);
    let metaint = if wants_metadata { headers.metadata_interval as usize } else { 0 };
    let mut since_metadata = 0usize;
    let mut buf = vec![0u8; 8192];
    // Per-listener dedup: only re-send the composed metadata block when it
    // changed since the last one *this* listener received, per spec.md
    // §4.7 ("length byte 0 when unchanged since the last block for this
    // listener").
    let mut last_sent: Vec<u8> = Vec::new();

    loop {
        let n = ring.read(consumer, &mut buf);
        if n == 0 {
            break;
        }

        if metaint == 0 {
            if stream.write_all(&buf[..n]).is_err() {
                ring.unregister_consumer(consumer);
                return;
            }
            continue;
        }

        let mut offset = 0;
        while offset < n {
            let until_meta = metaint.saturating_sub(since_metadata);
            let take = until_meta.min(n - offset);
            if stream.write_all(&buf[offset..offset + take]).is_err() {
                ring.unregister_consumer(consumer);
                return;
            }
            offset += take;
            since_metadata += take;

            if since_metadata >= metaint {
                let current = composed_metadata.lock().clone();
                let write_result = if current == last_sent {
                    stream.write_all(&[0u8])
                } else {
                    stream.write_all(&current)
                };
                if write_result.is_err() {
                    ring.unregister_consumer(consumer);
                    return;
                }
                last_sent = current;
                since_metadata = 0;
            }
        }
    }

    ring.unregister_consumer(consumer);
}

fn write_response_headers(
    stream: &mut TcpStream,
    headers: &RelayHeaders,
    wants_metadata: bool,
) -> std::io::Result<()> {
    let mut response = String::from("ICY 200 OK\r\n");
    if wants_metadata {
        response.push_str(&format!("icy-metaint: {}\r\n", headers.metadata_interval));
    }

    response.push_str(&format!(
        "Content-Type: {}\r\n",
        match headers.content_type {
            ContentType::Mp3 => "audio/mpeg",
            ContentType::Aac => "audio/aac",
            ContentType::Ogg => "application/ogg",
            _ => "application/octet-stream",
        }
    ));

    if let Some(br) = headers.bitrate_kbps {
        response.push_str(&format!("icy-br: {br}\r\n"));
    }
    if let Some(name) = &headers.name {
        response.push_str(&format!("icy-name: {name}\r\n"));
    }
    if let Some(genre) = &headers.genre {
        response.push_str(&format!("icy-genre: {genre}\r\n"));
    }
    if let Some(url) = &headers.url {
        response.push_str(&format!("icy-url: {url}\r\n"));
    }
    response.push_str("icy-pub: 0\r\n\r\n");

    stream.write_all(response.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bind_in_range_finds_next_free_port() {
        let first = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let first_port = first.local_addr().unwrap().port();

        // Bind with search starting at the occupied port; it must move on
        // rather than erroring, as long as search_ports is set.
        let result = bind_in_range(IpAddr::V4(Ipv4Addr::LOCALHOST), first_port, first_port + 50, true);
        assert!(result.is_ok());
        drop(first);
    }

    #[test]
    fn bind_without_search_fails_on_occupied_port() {
        let first = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let first_port = first.local_addr().unwrap().port();

        let result = bind_in_range(IpAddr::V4(Ipv4Addr::LOCALHOST), first_port, first_port, false);
        assert!(result.is_err());
    }

    fn request_over_loopback(request: &str) -> bool {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let request = request.to_string();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(request.as_bytes()).unwrap();
        });

        let (server_stream, _) = listener.accept().unwrap();
        let wants_metadata = read_request_wants_metadata(&server_stream).unwrap();
        client.join().unwrap();
        wants_metadata
    }

    #[test]
    fn request_with_icy_metadata_header_wants_metadata() {
        let request = "GET /stream HTTP/1.0\r\nIcy-MetaData: 1\r\nUser-Agent: test\r\n\r\n";
        assert!(request_over_loopback(request));
    }

    #[test]
    fn request_without_icy_metadata_header_does_not_want_metadata() {
        let request = "GET /stream HTTP/1.0\r\nUser-Agent: test\r\n\r\n";
        assert!(!request_over_loopback(request));
    }

    #[test]
    fn request_with_icy_metadata_zero_does_not_want_metadata() {
        let request = "GET /stream HTTP/1.0\r\nIcy-MetaData: 0\r\n\r\n";
        assert!(!request_over_loopback(request));
    }
}
