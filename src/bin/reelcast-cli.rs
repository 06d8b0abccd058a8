//! Thin CLI front-end: loads a TOML preferences file, starts a
//! [`Supervisor`], and blocks until the process is killed.

use std::{env, fs, process::ExitCode};

use reelcast::{
    config::ConfigFile,
    status::{StatusEvent, StatusSink},
    StreamConfig, Supervisor,
};
use tracing::{error, info, warn};

struct LoggingSink;

impl StatusSink for LoggingSink {
    fn on_event(&self, event: StatusEvent) {
        match event {
            StatusEvent::Started => info!("session started"),
            StatusEvent::Update(snapshot) => info!(
                status = ?snapshot.status,
                content_type = %snapshot.content_type,
                bytes_written = snapshot.bytes_written,
                elapsed_secs = snapshot.elapsed.as_secs(),
                "status update"
            ),
            StatusEvent::Error { message, fatal } => {
                if fatal {
                    error!(reason = message, "fatal session error");
                } else {
                    warn!(reason = message, "recoverable session error");
                }
            },
            StatusEvent::NewTrack(info) => info!(
                artist = info.artist.as_deref().unwrap_or(""),
                title = info.title.as_deref().unwrap_or(""),
                "new track"
            ),
            StatusEvent::TrackDone { path } => {
                info!(path = ?path, "track finished");
            },
            StatusEvent::Done => info!("session done"),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let Some(config_path) = env::args_os().nth(1) else {
        eprintln!("usage: reelcast-cli <config.toml>");
        return ExitCode::FAILURE;
    };

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("could not load {}: {e}", config_path.to_string_lossy());
            return ExitCode::FAILURE;
        },
    };

    let mut supervisor = Supervisor::start(config, std::sync::Arc::new(LoggingSink));

    // No signal-handling crate appears anywhere in this project's dependency
    // stack, so shutdown is left to the OS default (SIGINT/SIGTERM kill the
    // process outright); `join` just waits for the session to end on its own
    // (disconnect without auto-reconnect, size cap, or fatal error).
    supervisor.join();

    ExitCode::SUCCESS
}

#[derive(Debug)]
enum LoadError {
    Read(std::io::Error),
    Parse(toml::de::Error),
    Convert(reelcast::config::ConfigFileError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read(e) => write!(f, "could not read config file: {e}"),
            Self::Parse(e) => write!(f, "could not parse config file: {e}"),
            Self::Convert(e) => write!(f, "invalid config file: {e}"),
        }
    }
}

fn load_config(path: &std::ffi::OsStr) -> Result<StreamConfig, LoadError> {
    let text = fs::read_to_string(path).map_err(LoadError::Read)?;
    let file: ConfigFile = toml::from_str(&text).map_err(LoadError::Parse)?;
    StreamConfig::try_from(file).map_err(LoadError::Convert)
}
