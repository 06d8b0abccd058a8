//! Session configuration: the immutable [`StreamConfig`] a
//! [`Supervisor`](crate::supervisor::Supervisor) is started with, plus the
//! on-disk preferences file it can be loaded from.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use derivative::Derivative;
use serde::Deserialize;

/// What to do when a track's target filename already exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverwritePolicy {
    /// Always overwrite the existing file.
    Always,
    /// Never overwrite; skip writing this track.
    Never,
    /// Overwrite only if the new file is larger than the existing one.
    Larger,
    /// Keep the existing file and append `(2)`, `(3)`, ... until a free name is found.
    Version,
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::Larger => "larger",
            Self::Version => "version",
        };
        f.write_str(s)
    }
}

impl FromStr for OverwritePolicy {
    type Err = InvalidOverwritePolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "larger" => Ok(Self::Larger),
            "version" => Ok(Self::Version),
            other => Err(InvalidOverwritePolicy(other.to_string())),
        }
    }
}

/// Returned when parsing an unrecognised [`OverwritePolicy`] string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidOverwritePolicy(String);

impl fmt::Display for InvalidOverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a known overwrite policy", self.0)
    }
}

impl std::error::Error for InvalidOverwritePolicy {}

/// Boolean flags carried by a session; kept as a flat struct rather than a
/// bitflags type since the set is small and every flag is read far more
/// often than it's constructed.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Reconnect automatically on a dropped connection.
    pub auto_reconnect: bool,
    /// Write each station into its own subdirectory of the output directory.
    pub separate_dirs: bool,
    /// Stand up a [`RelayServer`](crate::relay::RelayServer) for this session.
    pub make_relay: bool,
    /// Tag completed MP3 files with an ID3v1 trailer.
    pub add_id3v1: bool,
    /// Tag completed MP3 files with an ID3v2 header.
    pub add_id3v2: bool,
    /// Write individual per-track files (as opposed to one growing file).
    pub individual_tracks: bool,
    /// Append all audio to one file instead of splitting by track.
    pub single_file_output: bool,
    /// Search `[relay_port, max_port]` for a free port instead of failing immediately.
    pub search_ports: bool,
    /// Stamp the current UTC date into filenames (`%d` token).
    pub date_stamp: bool,
    /// Read metadata from an external command instead of in-band ICY data.
    pub external_cmd: bool,
    /// Skip re-ripping a track whose output file already exists and matches.
    pub truncate_duplicates: bool,
    /// Keep partial files on disconnect/cancellation instead of deleting them.
    pub keep_incomplete: bool,
}

/// Silence-driven split-point refinement options. All durations are
/// milliseconds; padding may be negative to trim audio instead of
/// duplicating it.
#[derive(Clone, Copy, Debug)]
pub struct SplitpointOptions {
    /// Enables silence-based split refinement at all.
    pub xs: bool,
    /// Minimum linear PCM amplitude considered "silence".
    pub xs_min_volume: f32,
    /// Minimum run length, in ms, of sub-threshold audio to count as silence.
    pub xs_silence_length: u32,
    /// How far before the nominal metadata boundary to search, in ms.
    pub xs_search_window_1: u32,
    /// How far after the nominal metadata boundary to search, in ms.
    pub xs_search_window_2: u32,
    /// Shift applied to the nominal boundary before searching, in ms.
    pub xs_offset: i32,
    /// Audio duplicated (or trimmed, if negative) at the end of the previous track, in ms.
    pub xs_padding_1: i32,
    /// Audio duplicated (or trimmed, if negative) at the start of the next track, in ms.
    pub xs_padding_2: i32,
}

impl Default for SplitpointOptions {
    fn default() -> Self {
        Self {
            xs: false,
            xs_min_volume: 0.0,
            xs_silence_length: 300,
            xs_search_window_1: 2_000,
            xs_search_window_2: 2_000,
            xs_offset: 0,
            xs_padding_1: 0,
            xs_padding_2: 0,
        }
    }
}

/// Immutable configuration for one capture session. A [`Supervisor`]
/// (crate::supervisor::Supervisor) owns exactly one of these for its
/// lifetime; changing settings mid-session means starting a new session.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[non_exhaustive]
pub struct StreamConfig {
    /// Source stream URL.
    pub url: url::Url,
    /// Optional HTTP proxy to connect through.
    pub proxy: Option<url::Url>,
    /// `User-Agent` header value sent on every request.
    pub user_agent: String,
    /// Outbound interface name or bind address, if pinning egress traffic.
    pub interface: Option<String>,
    /// Connect/read timeout.
    pub timeout: Duration,
    /// Use HTTP/1.0 request lines instead of HTTP/1.1.
    pub http10: bool,
    /// Number of completed tracks to discard at session start.
    pub dropcount: u32,
    /// Track number assigned to the first kept track.
    pub count_start: u32,
    /// Root directory that ripped tracks are written under.
    pub output_directory: PathBuf,
    /// `%`-token filename pattern for individual tracks.
    pub filename_pattern: String,
    /// `%`-token filename pattern for the single-file show output.
    pub show_file_pattern: String,
    /// What to do when a target filename collides with an existing file.
    pub overwrite_policy: OverwritePolicy,
    /// Maximum total ripped bytes before the session stops; `0` means unlimited.
    pub max_mb_rip_size: u64,
    /// Preferred port for the relay server to listen on.
    pub relay_port: u16,
    /// Highest port to try if `search_ports` is set.
    pub relay_max_port: u16,
    /// Maximum concurrent relay listeners.
    pub relay_max_connections: usize,
    /// Local address the relay server binds to.
    pub relay_bind_ip: std::net::IpAddr,
    /// Silence-based split refinement options.
    pub splitpoint: SplitpointOptions,
    /// Path to a user-supplied parse-rules file, merged after the built-in defaults.
    pub rules_file: Option<PathBuf>,
    /// External metadata-source command line, tokenized (never passed to a shell).
    pub external_cmd: Option<String>,
    /// Session-wide boolean flags.
    pub flags: Flags,
    #[derivative(Debug = "ignore")]
    _reserved: (),
}

impl StreamConfig {
    /// Starts a builder for the given source URL with every other field
    /// defaulted.
    #[must_use]
    pub fn new(url: url::Url) -> Self {
        Self {
            url,
            proxy: None,
            user_agent: concat!("reelcast/", env!("CARGO_PKG_VERSION")).to_string(),
            interface: None,
            timeout: Duration::from_secs(10),
            http10: false,
            dropcount: 0,
            count_start: 1,
            output_directory: PathBuf::from("."),
            filename_pattern: "%N - %A - %T".to_string(),
            show_file_pattern: "%S".to_string(),
            overwrite_policy: OverwritePolicy::Version,
            max_mb_rip_size: 0,
            relay_port: 8000,
            relay_max_port: 8010,
            relay_max_connections: 32,
            relay_bind_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            splitpoint: SplitpointOptions::default(),
            rules_file: None,
            external_cmd: None,
            flags: Flags::default(),
            _reserved: (),
        }
    }

    /// Sets the proxy URL.
    #[must_use]
    pub fn proxy(mut self, proxy: Option<url::Url>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets the connect/read timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the dropcount (tracks discarded at session start).
    #[must_use]
    pub fn dropcount(mut self, dropcount: u32) -> Self {
        self.dropcount = dropcount;
        self
    }

    /// Sets the output directory tracks are written under.
    #[must_use]
    pub fn output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_directory = dir.into();
        self
    }

    /// Sets the overwrite policy applied at track completion.
    #[must_use]
    pub fn overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite_policy = policy;
        self
    }

    /// Sets the silence-based split refinement options.
    #[must_use]
    pub fn splitpoint(mut self, splitpoint: SplitpointOptions) -> Self {
        self.splitpoint = splitpoint;
        self
    }

    /// Sets the session's boolean flags.
    #[must_use]
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}

/// Serde mirror of [`StreamConfig`], used only to read the TOML preferences
/// file. Kept separate from `StreamConfig` so the public builder API isn't
/// forced to be `Deserialize`-shaped (e.g. `url::Url` needs a `FromStr`
/// bridge, `Duration` is expressed in plain seconds on disk).
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub url: String,
    pub proxy: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub http10: bool,
    #[serde(default)]
    pub dropcount: u32,
    #[serde(default = "default_count_start")]
    pub count_start: u32,
    #[serde(default = "default_output_directory")]
    pub output_directory: String,
    #[serde(default)]
    pub filename_pattern: Option<String>,
    #[serde(default)]
    pub show_file_pattern: Option<String>,
    #[serde(default = "default_overwrite_policy")]
    pub overwrite_policy: String,
    #[serde(default)]
    pub max_mb_rip_size: u64,
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    #[serde(default)]
    pub relay_max_port: Option<u16>,
    #[serde(default = "default_relay_max_connections")]
    pub relay_max_connections: usize,
    #[serde(default)]
    pub rules_file: Option<String>,
    #[serde(default)]
    pub external_cmd: Option<String>,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub splitpoint: SplitpointConfigFile,
}

/// TOML mirror of [`SplitpointOptions`], merged into it by [`StreamConfig`]'s
/// `TryFrom<ConfigFile>` conversion.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SplitpointConfigFile {
    pub xs: bool,
    pub xs_min_volume: f32,
    pub xs_silence_length: u32,
    pub xs_search_window_1: u32,
    pub xs_search_window_2: u32,
    pub xs_offset: i32,
    pub xs_padding_1: i32,
    pub xs_padding_2: i32,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_count_start() -> u32 {
    1
}
fn default_output_directory() -> String {
    ".".to_string()
}
fn default_overwrite_policy() -> String {
    "version".to_string()
}
fn default_relay_port() -> u16 {
    8000
}
fn default_relay_max_connections() -> usize {
    32
}

/// Errors converting a loaded [`ConfigFile`] into a [`StreamConfig`].
#[derive(Debug)]
pub enum ConfigFileError {
    /// The `url` field did not parse as a URL.
    Url(url::ParseError),
    /// The `proxy` field did not parse as a URL.
    Proxy(url::ParseError),
    /// The `overwrite_policy` field was not one of the four known values.
    OverwritePolicy(InvalidOverwritePolicy),
}

impl fmt::Display for ConfigFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(e) => write!(f, "invalid `url`: {e}"),
            Self::Proxy(e) => write!(f, "invalid `proxy`: {e}"),
            Self::OverwritePolicy(e) => write!(f, "invalid `overwrite_policy`: {e}"),
        }
    }
}

impl std::error::Error for ConfigFileError {}

impl TryFrom<ConfigFile> for StreamConfig {
    type Error = ConfigFileError;

    fn try_from(file: ConfigFile) -> Result<Self, Self::Error> {
        let url = url::Url::parse(&file.url).map_err(ConfigFileError::Url)?;
        let proxy = file
            .proxy
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .map_err(ConfigFileError::Proxy)?;
        let overwrite_policy = file
            .overwrite_policy
            .parse()
            .map_err(ConfigFileError::OverwritePolicy)?;

        let mut config = StreamConfig::new(url)
            .proxy(proxy)
            .timeout(Duration::from_secs(file.timeout_secs))
            .dropcount(file.dropcount)
            .output_directory(file.output_directory)
            .overwrite_policy(overwrite_policy)
            .flags(file.flags);

        config.http10 = file.http10;
        config.count_start = file.count_start;
        config.interface = file.interface;
        if let Some(ua) = file.user_agent {
            config.user_agent = ua;
        }
        if let Some(pat) = file.filename_pattern {
            config.filename_pattern = pat;
        }
        if let Some(pat) = file.show_file_pattern {
            config.show_file_pattern = pat;
        }
        config.max_mb_rip_size = file.max_mb_rip_size;
        config.relay_port = file.relay_port;
        config.relay_max_port = file.relay_max_port.unwrap_or(file.relay_port);
        config.relay_max_connections = file.relay_max_connections;
        config.rules_file = file.rules_file.map(PathBuf::from);
        config.external_cmd = file.external_cmd;
        config.splitpoint = SplitpointOptions {
            xs: file.splitpoint.xs,
            xs_min_volume: file.splitpoint.xs_min_volume,
            xs_silence_length: file.splitpoint.xs_silence_length,
            xs_search_window_1: file.splitpoint.xs_search_window_1,
            xs_search_window_2: file.splitpoint.xs_search_window_2,
            xs_offset: file.splitpoint.xs_offset,
            xs_padding_1: file.splitpoint.xs_padding_1,
            xs_padding_2: file.splitpoint.xs_padding_2,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_policy_round_trips() {
        for policy in [
            OverwritePolicy::Always,
            OverwritePolicy::Never,
            OverwritePolicy::Larger,
            OverwritePolicy::Version,
        ] {
            let s = policy.to_string();
            let parsed: OverwritePolicy = s.parse().unwrap();
            assert_eq!(parsed, policy);
        }
    }

    #[test]
    fn config_file_converts() {
        let file = ConfigFile {
            url: "http://example.com/stream".to_string(),
            proxy: None,
            user_agent: None,
            interface: None,
            timeout_secs: 5,
            http10: false,
            dropcount: 1,
            count_start: 1,
            output_directory: "/tmp/rip".to_string(),
            filename_pattern: None,
            show_file_pattern: None,
            overwrite_policy: "larger".to_string(),
            max_mb_rip_size: 0,
            relay_port: 8000,
            relay_max_port: None,
            relay_max_connections: 8,
            rules_file: None,
            external_cmd: None,
            flags: Flags::default(),
            splitpoint: SplitpointConfigFile::default(),
        };
        let config: StreamConfig = file.try_into().unwrap();
        assert_eq!(config.overwrite_policy, OverwritePolicy::Larger);
        assert_eq!(config.dropcount, 1);
    }
}
