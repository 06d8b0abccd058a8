//! Frame/page-aligned splitting without PCM decode, for Ogg and AAC.
//! `spec.md` §4.5: "Ogg splits on page boundaries; AAC on ADTS frame
//! boundaries. Both bypass PCM decode; silence refinement ... is a no-op
//! in the baseline."

use crate::config::SplitpointOptions;
use crate::frame::FrameAdapter;

use super::{ms_to_bytes, SilenceDetector, SplitDecision};

/// [`SilenceDetector`] for codecs with no wired-up PCM decoder: refines a
/// split only as far as the nearest frame/page boundary.
pub struct FrameOnlyDetector {
    adapter: Box<dyn FrameAdapter>,
}

impl FrameOnlyDetector {
    /// Wraps a codec-specific [`FrameAdapter`] for boundary-only splitting.
    #[must_use]
    pub fn new(adapter: Box<dyn FrameAdapter>) -> Self {
        Self { adapter }
    }
}

impl SilenceDetector for FrameOnlyDetector {
    fn choose_split(
        &self,
        region: &[u8],
        region_start: u64,
        marker: u64,
        bitrate_kbps: u32,
        opts: &SplitpointOptions,
    ) -> SplitDecision {
        let target_local = (marker as i64 - region_start as i64 + i64::from(opts.xs_offset)).max(0) as usize;

        // Fallback per spec.md §4.5: the first frame/page boundary at or
        // after the offset target marker.
        let split_local = self
            .adapter
            .boundaries(region)
            .into_iter()
            .find(|&b| b >= target_local)
            .unwrap_or(target_local.min(region.len()));

        SplitDecision {
            split_offset: region_start + split_local as u64,
            pad_end_of_prev: ms_to_bytes(i64::from(opts.xs_padding_1), bitrate_kbps),
            pad_start_of_next: ms_to_bytes(i64::from(opts.xs_padding_2), bitrate_kbps),
        }
    }
}
