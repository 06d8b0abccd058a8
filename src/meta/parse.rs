//! `spec.md` §4.3 — the ParseEngine: an ordered rule chain that turns a raw
//! ICY metadata string into a [`TrackInfo`]. Patterns run over raw bytes
//! (`regex::bytes`), not `&str` — per `spec.md` §4.3, metadata is "opaque
//! to the regex engine"; decoding to a particular charset is a concern for
//! callers building on-disk names or relay payloads, not for matching.

use std::{collections::BTreeMap, fmt, fs, io, path::Path};

use regex::bytes::Regex;
use serde::Deserialize;

use crate::types::TrackInfo;

/// Which [`TrackInfo`] field a named capture group populates.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Populates [`TrackInfo::artist`].
    Artist,
    /// Populates [`TrackInfo::title`].
    Title,
    /// Populates [`TrackInfo::album`].
    Album,
    /// The track number as parsed out of metadata (`TrackInfo::track_p`).
    TrackP,
    /// Populates [`TrackInfo::year`].
    Year,
}

impl Field {
    fn assign(self, info: &mut TrackInfo, value: String) {
        match self {
            Self::Artist => info.artist = Some(value),
            Self::Title => info.title = Some(value),
            Self::Album => info.album = Some(value),
            Self::TrackP => info.track_p = value.trim().parse().ok(),
            Self::Year => info.year = Some(value),
        }
    }
}

/// Flags attached to a rule, per `spec.md` §4.3's enumerated flag set.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RuleFlags {
    /// Matches the pattern case-insensitively.
    pub case_insensitive: bool,
    /// Applies a substitution rule to every match, not just the first.
    pub global: bool,
    /// Ends the chain immediately, keeping whatever `save` is currently set to.
    pub skip: bool,
    /// Ends the chain, forcing `save = true`.
    pub save_on_match: bool,
    /// Ends the chain, forcing `save = false` (station IDs, ads, ...).
    pub exclude_on_match: bool,
}

enum RuleKind {
    Match(Vec<(String, Field)>),
    Substitute(String),
}

/// A single compiled rule. Construction validates the regex up front so a
/// malformed rules file fails fast at load time rather than mid-stream.
pub struct ParseRule {
    regex: Regex,
    kind: RuleKind,
    flags: RuleFlags,
}

impl fmt::Debug for ParseRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParseRule")
            .field("pattern", &self.regex.as_str())
            .finish_non_exhaustive()
    }
}

/// On-disk rules file shape (TOML), merged after the compiled-in defaults.
#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<RuleFileEntry>,
}

#[derive(Deserialize)]
struct RuleFileEntry {
    pattern: String,
    #[serde(default)]
    replacement: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, Field>,
    #[serde(flatten)]
    flags: RuleFlags,
}

/// Errors loading and compiling a user rules file.
#[derive(Debug)]
pub enum RuleFileError {
    /// The rules file could not be read from disk.
    Read(io::Error),
    /// The rules file's TOML was malformed.
    Parse(toml::de::Error),
    /// A rule's `pattern` failed to compile as a regex.
    Regex(Box<str>, regex::Error),
}

impl fmt::Display for RuleFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(e) => write!(f, "could not read rules file: {e}"),
            Self::Parse(e) => write!(f, "could not parse rules file: {e}"),
            Self::Regex(pattern, e) => write!(f, "invalid pattern {pattern:?}: {e}"),
        }
    }
}

impl std::error::Error for RuleFileError {}

fn compile(pattern: &str, case_insensitive: bool, kind: RuleKind, flags: RuleFlags) -> Result<ParseRule, RuleFileError> {
    let source = if case_insensitive {
        format!("(?i){pattern}")
    } else {
        pattern.to_string()
    };
    let regex = Regex::new(&source).map_err(|e| RuleFileError::Regex(pattern.into(), e))?;
    Ok(ParseRule { regex, kind, flags })
}

/// Walks an ordered rule chain against raw ICY metadata strings and
/// produces [`TrackInfo`] snapshots.
pub struct ParseEngine {
    rules: Vec<ParseRule>,
}

impl ParseEngine {
    /// Builds the engine from the compiled-in defaults, optionally merging
    /// in a user rules file (appended after the defaults, per `spec.md`
    /// §4.3: "default rules compiled in; user rules file appended/merged").
    pub fn new(rules_file: Option<&Path>) -> Result<Self, RuleFileError> {
        let mut rules = default_rules();
        if let Some(path) = rules_file {
            let text = fs::read_to_string(path).map_err(RuleFileError::Read)?;
            let parsed: RuleFile = toml::from_str(&text).map_err(RuleFileError::Parse)?;
            for entry in parsed.rule {
                let kind = match entry.replacement {
                    Some(replacement) => RuleKind::Substitute(replacement),
                    None => RuleKind::Match(entry.fields.into_iter().collect()),
                };
                rules.push(compile(&entry.pattern, entry.flags.case_insensitive, kind, entry.flags)?);
            }
        }
        Ok(Self { rules })
    }

    /// Runs `raw` (already trimmed of trailing NULs by the caller) through
    /// the rule chain and returns the resulting [`TrackInfo`].
    #[must_use]
    pub fn apply(&self, raw: &[u8], stream_url: Option<&str>) -> TrackInfo {
        let mut info = TrackInfo {
            raw_metadata: raw.to_vec(),
            save: true,
            ..Default::default()
        };
        let mut working = raw.to_vec();

        for rule in &self.rules {
            match &rule.kind {
                RuleKind::Substitute(replacement) => {
                    working = if rule.flags.global {
                        rule.regex
                            .replace_all(&working, regex::bytes::NoExpand(replacement.as_bytes()))
                            .into_owned()
                    } else {
                        rule.regex
                            .replace(&working, regex::bytes::NoExpand(replacement.as_bytes()))
                            .into_owned()
                    };
                },
                RuleKind::Match(field_map) => {
                    let Some(captures) = rule.regex.captures(&working) else {
                        continue;
                    };
                    info.have_track_info = true;
                    for (name, field) in field_map {
                        if let Some(m) = captures.name(name) {
                            field.assign(&mut info, String::from_utf8_lossy(m.as_bytes()).into_owned());
                        }
                    }

                    if rule.flags.exclude_on_match {
                        info.save = false;
                        break;
                    }
                    if rule.flags.save_on_match {
                        info.save = true;
                        break;
                    }
                    if rule.flags.skip {
                        break;
                    }
                },
            }
        }

        info.compose_metadata(stream_url);
        info
    }
}

/// `spec.md` §4.3: "Defaults recognize `StreamTitle='(.*)';`, `Artist -
/// Title`, and common station-ID patterns (skip)."
fn default_rules() -> Vec<ParseRule> {
    let station_id = compile(
        r"(?i)StreamTitle='\s*(station id|advertisement|-)?\s*';",
        false,
        RuleKind::Match(Vec::new()),
        RuleFlags {
            exclude_on_match: true,
            ..RuleFlags::default()
        },
    )
    .expect("built-in station-id pattern is valid");

    let artist_title = compile(
        r"^StreamTitle='(?P<artist>[^']*?) - (?P<title>[^']*)';",
        true,
        RuleKind::Match(vec![
            ("artist".to_string(), Field::Artist),
            ("title".to_string(), Field::Title),
        ]),
        RuleFlags {
            save_on_match: true,
            ..RuleFlags::default()
        },
    )
    .expect("built-in artist-title pattern is valid");

    let title_only = compile(
        r"^StreamTitle='(?P<title>[^']*)';",
        true,
        RuleKind::Match(vec![("title".to_string(), Field::Title)]),
        RuleFlags {
            save_on_match: true,
            ..RuleFlags::default()
        },
    )
    .expect("built-in title-only pattern is valid");

    vec![station_id, artist_title, title_only]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_artist_and_title() {
        let engine = ParseEngine::new(None).unwrap();
        let info = engine.apply(b"StreamTitle='Pink Floyd - Time';", None);
        assert_eq!(info.artist.as_deref(), Some("Pink Floyd"));
        assert_eq!(info.title.as_deref(), Some("Time"));
        assert!(info.save);
    }

    #[test]
    fn title_only_when_no_dash() {
        let engine = ParseEngine::new(None).unwrap();
        let info = engine.apply(b"StreamTitle='Solo Track';", None);
        assert_eq!(info.artist, None);
        assert_eq!(info.title.as_deref(), Some("Solo Track"));
    }

    #[test]
    fn station_id_excluded() {
        let engine = ParseEngine::new(None).unwrap();
        let info = engine.apply(b"StreamTitle='Station ID';", None);
        assert!(!info.save);
    }

    #[test]
    fn deterministic_on_identical_input() {
        let engine = ParseEngine::new(None).unwrap();
        let a = engine.apply(b"StreamTitle='A - B';", None);
        let b = engine.apply(b"StreamTitle='A - B';", None);
        assert_eq!(a.artist, b.artist);
        assert_eq!(a.title, b.title);
    }
}
