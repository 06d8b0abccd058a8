//! `spec.md` §4.1 — URL parsing, TCP/TLS connect, Shoutcast request, and
//! response header parsing. Exposes the blocking byte-reader the rest of
//! the pipeline consumes.

/// Errors establishing or negotiating the upstream connection.
pub mod error;

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::types::ContentType;
use error::{Error, Result};

/// A redirect chain longer than this is treated as `HttpRedirectLoop`
/// (`spec.md` §4.1/§8: "implementation-defined redirect bound (>= 5)").
const MAX_REDIRECTS: u32 = 8;

/// `spec.md` §6: "Maximum playlist recursion = 2."
const MAX_PLAYLIST_DEPTH: u32 = 2;

/// Headers parsed out of a source's response, per `spec.md` §4.1/§6.
#[derive(Clone, Debug, Default)]
pub struct IcyHeaders {
    pub content_type: ContentType,
    pub metadata_interval: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub name: Option<String>,
    pub genre: Option<String>,
    pub url: Option<String>,
    pub public: Option<bool>,
    pub server: Option<String>,
    pub location: Option<String>,
}

impl IcyHeaders {
    fn from_lines(lines: &[(String, String)]) -> Self {
        let mut headers = IcyHeaders::default();

        for (name, value) in lines {
            let lower = name.to_ascii_lowercase();
            match lower.as_str() {
                "content-type" => headers.content_type = ContentType::from_mime(value),
                "icy-metaint" => headers.metadata_interval = value.trim().parse().ok(),
                "icy-br" => headers.bitrate_kbps = value.trim().parse().ok(),
                "icy-name" => headers.name = Some(value.clone()),
                "icy-genre" => headers.genre = Some(value.clone()),
                "icy-url" => headers.url = Some(value.clone()),
                "icy-pub" => headers.public = Some(value.trim() == "1"),
                "server" => headers.server = Some(value.clone()),
                "location" => headers.location = Some(value.clone()),
                _ => {},
            }
        }

        headers
    }
}

/// A connected source: parsed headers plus the blocking byte-reader over
/// the (possibly de-chunked by the caller) audio/metadata stream.
pub struct Connection {
    pub headers: IcyHeaders,
    pub reader: Box<dyn Read + Send>,
}

/// Connects to `url`, following HTTP redirects and PLS/M3U playlists,
/// and returns the parsed headers plus a blocking reader positioned right
/// after the header block.
#[instrument(skip(proxy, user_agent), fields(url = %url))]
pub fn connect(
    url: &Url,
    proxy: Option<&Url>,
    user_agent: &str,
    timeout: Duration,
    http10: bool,
    interface: Option<&str>,
) -> Result<Connection> {
    connect_inner(url.clone(), proxy, user_agent, timeout, http10, interface, 0, 0)
}

#[allow(clippy::too_many_arguments)]
fn connect_inner(
    mut url: Url,
    proxy: Option<&Url>,
    user_agent: &str,
    timeout: Duration,
    http10: bool,
    interface: Option<&str>,
    redirects: u32,
    playlist_depth: u32,
) -> Result<Connection> {
    if redirects > MAX_REDIRECTS {
        return Err(Error::RedirectLoop);
    }

    let stream = raw_connect(&url, proxy, timeout, interface)?;
    let request = build_request(&url, proxy, user_agent, http10);

    let mut stream = stream;
    stream
        .write_all(request.as_bytes())
        .map_err(|e| classify_io(&url, e))?;

    let mut reader = BufReader::new(stream);
    let (status_line, header_lines) = read_headers(&mut reader)?;
    let status_code = parse_status_code(&status_line)?;
    let headers = IcyHeaders::from_lines(&header_lines);

    if (300..400).contains(&status_code) {
        let location = headers.location.ok_or(Error::RedirectLoop)?;
        let next = url.join(&location).map_err(Error::InvalidUrl)?;

        let was_https = url.scheme() == "https";
        let now_https = next.scheme() == "https";
        if was_https && !now_https {
            return Err(Error::RedirectPolicy);
        }

        info!(%next, "following redirect");
        return connect_inner(
            next,
            proxy,
            user_agent,
            timeout,
            http10,
            interface,
            redirects + 1,
            playlist_depth,
        );
    }

    if !(200..300).contains(&status_code) {
        return Err(Error::BadResponse(status_line));
    }

    if headers.content_type.is_playlist() {
        if playlist_depth >= MAX_PLAYLIST_DEPTH {
            return Err(Error::PlaylistRecursionLimit);
        }
        let mut body = String::new();
        reader
            .read_to_string(&mut body)
            .map_err(|e| classify_io(&url, e))?;
        let entry = first_playlist_entry(headers.content_type, &body).ok_or(Error::EmptyPlaylist)?;
        let next = url.join(&entry).map_err(Error::InvalidUrl)?;
        debug!(%next, "following playlist entry");
        return connect_inner(
            next,
            proxy,
            user_agent,
            timeout,
            http10,
            interface,
            redirects + 1,
            playlist_depth + 1,
        );
    }

    if headers.content_type == ContentType::Unknown {
        return Err(Error::UnknownContentType(
            header_lines
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
        ));
    }

    Ok(Connection {
        headers,
        reader: Box::new(reader),
    })
}

enum RawStream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

fn raw_connect(url: &Url, proxy: Option<&Url>, timeout: Duration, interface: Option<&str>) -> Result<RawStream> {
    let connect_target = proxy.unwrap_or(url);
    let host = connect_target
        .host_str()
        .ok_or_else(|| Error::InvalidUrl(url::ParseError::EmptyHost))?
        .to_string();
    let port = connect_target
        .port_or_known_default()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });

    let addr = resolve_first(&host, port)?;
    let tcp = connect_tcp(addr, timeout, interface)?;
    tcp.set_read_timeout(Some(timeout)).map_err(Error::Io)?;
    tcp.set_write_timeout(Some(timeout)).map_err(Error::Io)?;

    // Proxies always speak plain HTTP to us; TLS (when needed) is
    // negotiated with the origin's hostname, never the proxy's.
    if url.scheme() == "https" && proxy.is_none() {
        Ok(RawStream::Tls(Box::new(tls_connect(tcp, url.host_str().unwrap_or(&host))?)))
    } else {
        Ok(RawStream::Plain(tcp))
    }
}

fn resolve_first(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::NameResolution)?
        .next()
        .ok_or_else(|| Error::NameResolution(io::Error::new(io::ErrorKind::NotFound, "no address")))
}

/// Connects to `addr`, optionally binding the outbound socket to `interface`
/// first (`spec.md` §4.1's Connection contract). Only a literal IP address is
/// supported as a bind source: `socket2` can bind to an address but
/// device-name binding (`SO_BINDTODEVICE`) needs its `all` feature and is
/// Linux-only, so a non-IP `interface` is logged and otherwise ignored
/// rather than failing the whole connect.
fn connect_tcp(addr: SocketAddr, timeout: Duration, interface: Option<&str>) -> Result<TcpStream> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::ConnectRefused)?;

    if let Some(iface) = interface {
        match iface.parse::<IpAddr>() {
            Ok(bind_ip) => {
                let bind_addr = SocketAddr::new(bind_ip, 0);
                socket.bind(&bind_addr.into()).map_err(Error::ConnectRefused)?;
            },
            Err(_) => {
                warn!(interface = iface, "interface is not a literal IP address, connecting unbound");
            },
        }
    }

    socket.connect_timeout(&addr.into(), timeout).map_err(Error::ConnectRefused)?;

    Ok(socket.into())
}

fn tls_connect(
    tcp: TcpStream,
    sni_host: &str,
) -> Result<rustls::StreamOwned<rustls::ClientConnection, TcpStream>> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    // TLS 1.2 floor per spec.md §4.1.
    let config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth();

    let server_name = rustls::pki_types::ServerName::try_from(sni_host.to_string())
        .map_err(|_| Error::SslCtxNew(format!("invalid SNI hostname {sni_host:?}")))?;

    let conn = rustls::ClientConnection::new(Arc::new(config), server_name)?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

fn classify_io(_url: &Url, e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
        _ => Error::Io(e),
    }
}

fn build_request(url: &Url, proxy: Option<&Url>, user_agent: &str, http10: bool) -> String {
    let version = if http10 { "HTTP/1.0" } else { "HTTP/1.1" };
    let request_target = if proxy.is_some() {
        url.as_str().to_string()
    } else {
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    };

    let mut req = format!(
        "GET {request_target} {version}\r\n\
         Host: {host}\r\n\
         User-Agent: {user_agent}\r\n\
         Icy-MetaData: 1\r\n\
         Connection: close\r\n",
        host = host_header(url),
    );

    if let Some((user, pass)) = basic_credentials(url) {
        req.push_str(&format!(
            "Authorization: Basic {}\r\n",
            base64_encode(&format!("{user}:{pass}"))
        ));
    }

    if let Some(proxy) = proxy {
        if let Some((user, pass)) = basic_credentials(proxy) {
            req.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                base64_encode(&format!("{user}:{pass}"))
            ));
        }
    }

    req.push_str("\r\n");
    req
}

fn host_header(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    }
}

fn basic_credentials(url: &Url) -> Option<(String, String)> {
    if url.username().is_empty() {
        return None;
    }
    Some((
        url.username().to_string(),
        url.password().unwrap_or_default().to_string(),
    ))
}

/// Minimal base64 encoder for `Authorization: Basic` headers — avoids
/// pulling in a whole base64 crate for a handful of bytes per connection.
fn base64_encode(input: &str) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let bytes = input.as_bytes();
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);

    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);

        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(b2 & 0x3f) as usize] as char
        } else {
            '='
        });
    }

    out
}

/// Reads response header lines byte-by-byte until the terminating blank
/// line (`spec.md` §4.1: "Line-reader reads response headers byte-by-byte
/// until blank line; then the reader becomes a blocking chunked byte
/// stream."). Returns the status line and the parsed `(name, value)` pairs.
fn read_headers(reader: &mut impl BufRead) -> Result<(String, Vec<(String, String)>)> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).map_err(Error::Io)?;
    let status_line = status_line.trim_end().to_string();

    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            lines.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok((status_line, lines))
}

fn parse_status_code(status_line: &str) -> Result<u16> {
    // Accepts both "ICY 200 OK" and "HTTP/1.x 200 OK" per spec.md §4.1.
    let mut parts = status_line.split_whitespace();
    let first = parts.next().ok_or_else(|| Error::BadResponse(status_line.to_string()))?;

    if first != "ICY" && !first.starts_with("HTTP/") {
        return Err(Error::BadResponse(status_line.to_string()));
    }

    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::BadResponse(status_line.to_string()))
}

/// Follows `spec.md` §6: PLS `[playlist]` with `FileN=URL`, or M3U
/// line-per-URL. Returns the first usable (non-comment, non-empty) entry.
fn first_playlist_entry(kind: ContentType, body: &str) -> Option<String> {
    match kind {
        ContentType::Pls => body
            .lines()
            .filter_map(|line| line.split_once('='))
            .filter(|(k, _)| k.trim().to_ascii_lowercase().starts_with("file"))
            .map(|(_, v)| v.trim().to_string())
            .find(|v| !v.is_empty()),
        ContentType::M3u => body
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_icy_status_line() {
        assert_eq!(parse_status_code("ICY 200 OK").unwrap(), 200);
        assert_eq!(parse_status_code("HTTP/1.1 200 OK").unwrap(), 200);
        assert_eq!(parse_status_code("HTTP/1.1 302 Found").unwrap(), 302);
        assert!(parse_status_code("GARBAGE").is_err());
    }

    #[test]
    fn parses_header_block() {
        let raw = b"ICY 200 OK\r\nicy-metaint: 8192\r\nContent-Type: audio/mpeg\r\nicy-name: Test Radio\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let (status, lines) = read_headers(&mut reader).unwrap();
        assert_eq!(status, "ICY 200 OK");
        let headers = IcyHeaders::from_lines(&lines);
        assert_eq!(headers.metadata_interval, Some(8192));
        assert_eq!(headers.content_type, ContentType::Mp3);
        assert_eq!(headers.name.as_deref(), Some("Test Radio"));
    }

    #[test]
    fn url_round_trips_without_default_port_ambiguity() {
        let u = Url::parse("http://example.com/stream").unwrap();
        let round = Url::parse(u.as_str()).unwrap();
        assert_eq!(u, round);
    }

    #[test]
    fn pls_playlist_first_entry() {
        let body = "[playlist]\nNumberOfEntries=2\nFile1=http://a.example/stream\nFile2=http://b.example/stream\n";
        assert_eq!(
            first_playlist_entry(ContentType::Pls, body).as_deref(),
            Some("http://a.example/stream")
        );
    }

    #[test]
    fn m3u_playlist_skips_comments() {
        let body = "#EXTM3U\n#EXTINF:-1,Station\nhttp://a.example/stream\n";
        assert_eq!(
            first_playlist_entry(ContentType::M3u, body).as_deref(),
            Some("http://a.example/stream")
        );
    }
}
