//! Shared data types that cross component boundaries: the detected
//! content-type of a source, the mutable stream state a status snapshot is
//! built from, and [`TrackInfo`] — the metadata snapshot that flows from
//! [`crate::meta`] through the ring buffer into the scheduler and relay.

use std::fmt;

/// Content types recognised from a source's response headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContentType {
    /// MPEG-1/2 Audio Layer III.
    Mp3,
    /// Raw ADTS-framed AAC.
    Aac,
    /// Ogg container (Vorbis/Opus payload not distinguished further).
    Ogg,
    /// Nullsoft Streaming Video, legacy Winamp/Shoutcast format.
    Nsv,
    /// Legacy Ultravox stream type.
    Ultravox,
    /// A nested `.pls` playlist; the caller should fetch and follow it.
    Pls,
    /// A nested `.m3u` playlist; the caller should fetch and follow it.
    M3u,
    /// Content type could not be classified from the response headers.
    Unknown,
}

impl ContentType {
    /// Classifies a MIME type taken from a `Content-Type` response header.
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        match mime {
            "audio/mpeg" => Self::Mp3,
            "audio/aacp" | "audio/aac" => Self::Aac,
            "application/ogg" | "audio/ogg" => Self::Ogg,
            "audio/x-scpls" => Self::Pls,
            "audio/x-mpegurl" => Self::M3u,
            _ => Self::Unknown,
        }
    }

    /// The filename extension used when writing a track of this type.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Ogg => "ogg",
            Self::Nsv | Self::Ultravox | Self::Pls | Self::M3u | Self::Unknown => "wav",
        }
    }

    /// True for containers whose nominal content is itself another
    /// playlist to be fetched and followed.
    #[must_use]
    pub fn is_playlist(self) -> bool {
        matches!(self, Self::Pls | Self::M3u)
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mp3 => "MP3",
            Self::Aac => "AAC",
            Self::Ogg => "OGG",
            Self::Nsv => "NSV",
            Self::Ultravox => "Ultravox",
            Self::Pls => "PLS",
            Self::M3u => "M3U",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Coarse session status, mirrored in the status callback as a bitflag-like
/// code (`spec.md` §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    /// Connected and waiting for the first track boundary.
    Buffering,
    /// Actively writing a track to disk.
    Ripping,
    /// Disconnected and retrying with backoff.
    Reconnecting,
}

impl SessionStatus {
    /// Numeric status code as documented in `spec.md` §6.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Buffering => 0x01,
            Self::Ripping => 0x02,
            Self::Reconnecting => 0x03,
        }
    }
}

/// Upper bound, in bytes, on a raw ICY metadata payload (`255 * 16`).
pub const MAX_RAW_METADATA_BYTES: usize = 255 * 16;

/// Upper bound, in 16-byte blocks, on a composed metadata payload. This is
/// a hard invariant: the ICY length byte is unsigned and a single byte can
/// only express up to 255 blocks.
pub const MAX_COMPOSED_METADATA_BLOCKS: usize = 255;

/// A metadata snapshot: the parsed fields for "the track currently
/// playing", immutable once attached to a ring buffer chunk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrackInfo {
    /// Raw `StreamTitle='...';` payload as received, trimmed of trailing NULs.
    pub raw_metadata: Vec<u8>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    /// Track number as parsed out of the raw metadata, if any.
    pub track_p: Option<u32>,
    /// Track number assigned by the scheduler (`count_start`-based sequence).
    pub track_a: Option<u32>,
    pub year: Option<String>,
    /// Whether this track should be written to disk. Defaults to `true`;
    /// rules can clear it (station IDs, ads, ...).
    pub save: bool,
    /// Whether any rule actually matched and populated fields.
    pub have_track_info: bool,
    /// Pre-composed ICY relay payload: a `255*16`-capped `StreamTitle='...';`
    /// block, NUL-padded to a 16-byte boundary, length-prefixed byte included.
    pub composed_metadata: Vec<u8>,
}

impl TrackInfo {
    /// Builds the `composed_metadata` field (`StreamTitle='{artist} -
    /// {title}';` or title-only) from the currently parsed fields,
    /// saturating the block count at 255 per `spec.md` §4.3/§7.
    pub fn compose_metadata(&mut self, stream_url: Option<&str>) {
        let title_field = match (&self.artist, &self.title) {
            (Some(artist), Some(title)) if !artist.is_empty() => format!("{artist} - {title}"),
            (_, Some(title)) => title.clone(),
            (Some(artist), None) if !artist.is_empty() => artist.clone(),
            _ => String::new(),
        };

        let mut body = format!("StreamTitle='{title_field}';");
        if let Some(url) = stream_url {
            if !url.is_empty() {
                body.push_str(&format!("StreamUrl='{url}';"));
            }
        }

        let mut bytes = body.into_bytes();
        let num_blocks = bytes.len().div_ceil(16).min(MAX_COMPOSED_METADATA_BLOCKS);
        let padded_len = num_blocks * 16;

        // Truncate rather than overflow the single length byte: this is the
        // bounded-copy discipline spec.md §7 requires of all ICY payload
        // writers.
        bytes.resize(padded_len, 0);
        if bytes.len() > padded_len {
            bytes.truncate(padded_len);
        }

        let mut out = Vec::with_capacity(1 + padded_len);
        out.push(u8::try_from(num_blocks).unwrap_or(255));
        out.extend_from_slice(&bytes);
        self.composed_metadata = out;
    }

    /// Whether `other` describes the same logical track (artist + title),
    /// used by the metadata stripper's pseudo-sticky de-duplication.
    #[must_use]
    pub fn same_track_as(&self, other: &TrackInfo) -> bool {
        self.artist == other.artist && self.title == other.title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_metadata_bounded() {
        let mut info = TrackInfo {
            artist: Some("A".repeat(10_000)),
            title: Some("T".repeat(10_000)),
            ..Default::default()
        };
        info.compose_metadata(None);
        assert!(info.composed_metadata[0] <= 255);
        assert!(info.composed_metadata.len() - 1 <= 255 * 16);
    }

    #[test]
    fn composed_metadata_title_only_when_no_artist() {
        let mut info = TrackInfo {
            title: Some("Solo".to_string()),
            ..Default::default()
        };
        info.compose_metadata(None);
        let text = String::from_utf8_lossy(&info.composed_metadata[1..]);
        assert!(text.starts_with("StreamTitle='Solo';"));
    }

    #[test]
    fn content_type_from_mime() {
        assert_eq!(ContentType::from_mime("audio/mpeg"), ContentType::Mp3);
        assert_eq!(
            ContentType::from_mime("application/ogg; charset=utf-8"),
            ContentType::Ogg
        );
        assert_eq!(ContentType::from_mime("text/html"), ContentType::Unknown);
    }
}
