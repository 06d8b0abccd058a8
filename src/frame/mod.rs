//! `spec.md` §4.5/§7 — frame/page boundary detection. A track split point
//! is only ever placed on an adapter-confirmed boundary: mid-frame splits
//! produce audible clicks, which is exactly what this layer exists to rule
//! out before the silence detector or scheduler commits to an offset.

/// ADTS (raw AAC) frame boundary scanning.
pub mod adts;
/// MP3 frame boundary scanning and per-frame bitrate detection.
pub mod mp3;
/// Ogg page boundary scanning.
pub mod ogg;

use crate::types::ContentType;

/// Finds codec frame/page boundaries inside a byte window and reports the
/// declared bitrate when the format carries one per-frame.
///
/// Implementations only need to be correct on well-formed streams; a
/// boundary search that finds nothing returns `None` rather than guessing,
/// and callers fall back to not splitting at all (`spec.md` §7: "no split
/// without a confirmed frame boundary").
pub trait FrameAdapter: Send + Sync {
    /// Returns the byte offsets (relative to the start of `buf`) of every
    /// frame/page boundary found in `buf`. An implementation may require a
    /// minimum amount of leading context to synchronize; callers should
    /// pass a window at least a few KB wide.
    fn boundaries(&self, buf: &[u8]) -> Vec<usize>;

    /// Finds the boundary in `boundaries(buf)` closest to `target`, or
    /// `None` if no boundary was found at all.
    fn nearest_boundary(&self, buf: &[u8], target: usize) -> Option<usize> {
        self.boundaries(buf)
            .into_iter()
            .min_by_key(|&b| b.abs_diff(target))
    }

    /// Bitrate in kbps detected from the frames actually present in `buf`,
    /// if the format encodes it per-frame (MP3, ADTS). Ogg reports `None`:
    /// its bitrate is a stream-level property, not a per-page one.
    fn detect_bitrate_kbps(&self, buf: &[u8]) -> Option<u32>;
}

/// Returns the adapter appropriate for `content_type`, or `None` for
/// formats this engine only ever treats as an opaque byte stream (no
/// boundary-aligned splitting is attempted for those).
#[must_use]
pub fn adapter_for(content_type: ContentType) -> Option<Box<dyn FrameAdapter>> {
    match content_type {
        ContentType::Mp3 => Some(Box::new(mp3::Mp3Adapter)),
        ContentType::Aac => Some(Box::new(adts::AdtsAdapter)),
        ContentType::Ogg => Some(Box::new(ogg::OggAdapter)),
        ContentType::Nsv
        | ContentType::Ultravox
        | ContentType::Pls
        | ContentType::M3u
        | ContentType::Unknown => None,
    }
}
