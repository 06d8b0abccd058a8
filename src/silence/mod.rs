//! `spec.md` §4.5 — silence-driven split-point refinement. MP3 gets full
//! PCM-power analysis; Ogg/AAC bypass decode entirely and only align to
//! the nearest frame/page boundary (`spec.md`: "silence refinement for
//! Ogg/AAC is a no-op in the baseline").

mod frame_only;
mod mp3;

use crate::config::SplitpointOptions;
use crate::types::ContentType;

/// The chosen split point and the padding to apply on either side of it,
/// all in bytes (already converted from the configured millisecond
/// values). Negative padding trims instead of duplicating.
#[derive(Clone, Copy, Debug)]
pub struct SplitDecision {
    /// Absolute byte offset (within the overall stream) of the split.
    pub split_offset: u64,
    /// Bytes duplicated (if positive) or trimmed (if negative) at the end
    /// of the track being completed.
    pub pad_end_of_prev: i64,
    /// Bytes duplicated (if positive) or trimmed (if negative) at the
    /// start of the new track.
    pub pad_start_of_next: i64,
}

/// Finds the best split point for a metadata-change marker.
pub trait SilenceDetector: Send + Sync {
    /// `region` covers `[marker - xs_search_window_1, marker +
    /// xs_search_window_2]` bytes (clamped to what's actually available);
    /// `region_start` is its absolute stream offset and `marker` the
    /// marker's absolute offset. `bitrate_kbps` is the best currently-known
    /// bitrate, used to convert the configured millisecond windows to
    /// bytes.
    fn choose_split(
        &self,
        region: &[u8],
        region_start: u64,
        marker: u64,
        bitrate_kbps: u32,
        opts: &SplitpointOptions,
    ) -> SplitDecision;
}

/// Converts a millisecond duration to a byte count at `bitrate_kbps`
/// (`bitrate_kbps * 1000 bit/s / 8 = bitrate_kbps * 125 byte/s`).
#[must_use]
pub fn ms_to_bytes(ms: i64, bitrate_kbps: u32) -> i64 {
    ms * i64::from(bitrate_kbps) * 125 / 1000
}

/// Returns the detector appropriate for `content_type`. Every content type
/// with a [`crate::frame::FrameAdapter`] gets at least frame-aligned
/// splitting; only MP3 additionally refines against silence.
#[must_use]
pub fn detector_for(content_type: ContentType) -> Option<Box<dyn SilenceDetector>> {
    match content_type {
        ContentType::Mp3 => Some(Box::new(mp3::Mp3SilenceDetector)),
        ContentType::Aac | ContentType::Ogg => {
            crate::frame::adapter_for(content_type).map(|adapter| {
                Box::new(frame_only::FrameOnlyDetector::new(adapter)) as Box<dyn SilenceDetector>
            })
        },
        ContentType::Nsv | ContentType::Ultravox | ContentType::Pls | ContentType::M3u | ContentType::Unknown => {
            None
        },
    }
}
