//! `spec.md` §4.8 — external metadata source: spawns a configured command
//! and parses `ARTIST=`/`ALBUM=`/`TITLE=` records from its stdout. The
//! command line is tokenized by hand and executed directly via argv —
//! never through a shell — so metadata configuration can never become a
//! command-injection vector.

use std::{
    io::{BufRead, BufReader},
    process::{Child, Command, Stdio},
    thread::JoinHandle,
};

use tracing::{debug, warn};

use crate::types::TrackInfo;

/// Maximum bytes kept from an over-long stdout line, per `spec.md` §4.8:
/// "A line exceeding 255 bytes is truncated at that boundary."
const MAX_LINE_BYTES: usize = 255;

/// Errors splitting a command line into argv tokens.
#[derive(Debug)]
#[non_exhaustive]
pub enum TokenizeError {
    /// A quoted token never saw its closing quote.
    UnterminatedQuote,
    /// A trailing backslash had no following character to escape.
    DanglingBackslash,
}

impl std::fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnterminatedQuote => write!(f, "unterminated quote in external command line"),
            Self::DanglingBackslash => write!(f, "dangling backslash at end of external command line"),
        }
    }
}

impl std::error::Error for TokenizeError {}

/// Splits a command line into argv tokens, honouring single quotes, double
/// quotes, and backslash escapes, but performing no shell expansion
/// (globs, variables, subshells) whatsoever — only quoting/escaping.
pub fn tokenize(command: &str) -> Result<Vec<String>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars().peekable();

    #[derive(Clone, Copy, PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$')) => current.push(next),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    },
                    None => return Err(TokenizeError::DanglingBackslash),
                },
                _ => current.push(c),
            },
            Quote::None => match c {
                ' ' | '\t' => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                },
                '\'' => {
                    quote = Quote::Single;
                    in_token = true;
                },
                '"' => {
                    quote = Quote::Double;
                    in_token = true;
                },
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_token = true;
                    },
                    None => return Err(TokenizeError::DanglingBackslash),
                },
                other => {
                    current.push(other);
                    in_token = true;
                },
            },
        }
    }

    if quote != Quote::None {
        return Err(TokenizeError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// A spawned external metadata source. Dropping this does not kill the
/// child; call [`ExternalCmd::stop`] for that.
pub struct ExternalCmd {
    child: Child,
    reader_handle: Option<JoinHandle<()>>,
}

impl ExternalCmd {
    /// Tokenizes and spawns `command`, feeding parsed [`TrackInfo`] records
    /// to `on_track` from a dedicated reader thread. The command's stdout
    /// is consumed line-by-line; a lone `.` line closes a record.
    pub fn spawn(
        command: &str,
        mut on_track: impl FnMut(TrackInfo) + Send + 'static,
    ) -> Result<Self, SpawnError> {
        let argv = tokenize(command).map_err(SpawnError::Tokenize)?;
        let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SpawnError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let reader_handle = std::thread::Builder::new()
            .name("external-cmd-reader".into())
            .spawn(move || read_records(stdout, &mut on_track))
            .expect("failed to spawn external-cmd reader thread");

        Ok(Self {
            child,
            reader_handle: Some(reader_handle),
        })
    }

    /// Kills the child process and waits for the reader thread to drain.
    pub fn stop(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Errors spawning the external metadata command.
#[derive(Debug)]
#[non_exhaustive]
pub enum SpawnError {
    /// The command line failed to tokenize.
    Tokenize(TokenizeError),
    /// The command line tokenized to zero arguments.
    EmptyCommand,
    /// The OS refused to spawn the process.
    Spawn(std::io::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tokenize(e) => write!(f, "invalid external command line: {e}"),
            Self::EmptyCommand => write!(f, "external command line is empty"),
            Self::Spawn(e) => write!(f, "could not spawn external command: {e}"),
        }
    }
}

impl std::error::Error for SpawnError {}

fn read_records(stdout: impl std::io::Read, on_track: &mut impl FnMut(TrackInfo)) {
    let reader = BufReader::new(stdout);
    let mut info = TrackInfo {
        save: true,
        ..TrackInfo::default()
    };
    let mut any_field = false;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "external command stdout read failed");
                break;
            },
        };
        let line = line.strip_suffix('\r').unwrap_or(&line);
        let line = if line.len() > MAX_LINE_BYTES { &line[..MAX_LINE_BYTES] } else { line };

        if line == "." {
            if any_field {
                info.have_track_info = true;
                info.compose_metadata(None);
                on_track(std::mem::replace(
                    &mut info,
                    TrackInfo { save: true, ..TrackInfo::default() },
                ));
                any_field = false;
            }
            continue;
        }

        if let Some(value) = line.strip_prefix("ARTIST=") {
            info.artist = Some(value.to_string());
            any_field = true;
        } else if let Some(value) = line.strip_prefix("ALBUM=") {
            info.album = Some(value.to_string());
            any_field = true;
        } else if let Some(value) = line.strip_prefix("TITLE=") {
            info.title = Some(value.to_string());
            any_field = true;
        } else {
            debug!(line, "ignoring unrecognised external command line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_quoted_and_escaped_args() {
        let tokens = tokenize(r#"notify-send 'Now Playing' "Track \"One\"" plain"#).unwrap();
        assert_eq!(tokens, vec!["notify-send", "Now Playing", "Track \"One\"", "plain"]);
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(matches!(tokenize("echo 'unterminated"), Err(TokenizeError::UnterminatedQuote)));
    }

    #[test]
    fn parses_record_terminated_by_dot() {
        let input = "ARTIST=Daft Punk\nTITLE=One More Time\n.\n";
        let mut received = Vec::new();
        read_records(input.as_bytes(), &mut |info| received.push(info));

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].artist.as_deref(), Some("Daft Punk"));
        assert_eq!(received[0].title.as_deref(), Some("One More Time"));
    }

    #[test]
    fn ignores_carriage_returns_before_newline() {
        let input = "ARTIST=A\r\nTITLE=B\r\n.\r\n";
        let mut received = Vec::new();
        read_records(input.as_bytes(), &mut |info| received.push(info));
        assert_eq!(received.len(), 1);
    }
}
