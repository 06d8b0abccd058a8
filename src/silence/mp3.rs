//! MP3 silence refinement: decodes each frame in the search window to PCM,
//! builds a per-frame RMS envelope, and picks the silence run closest to
//! `marker + xs_offset`, per `spec.md` §4.5.

use symphonia_core::audio::{AudioBufferRef, SampleBuffer, Signal};
use symphonia_core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
use symphonia_core::formats::Packet;

use crate::config::SplitpointOptions;
use crate::frame::{mp3::Mp3Adapter, FrameAdapter};

use super::{ms_to_bytes, SilenceDetector, SplitDecision};

struct FrameEnvelope {
    start: usize,
    end: usize,
    duration_ms: f64,
    rms: f32,
}

/// [`SilenceDetector`] for MP3, backed by a symphonia PCM decode.
pub struct Mp3SilenceDetector;

impl SilenceDetector for Mp3SilenceDetector {
    fn choose_split(
        &self,
        region: &[u8],
        region_start: u64,
        marker: u64,
        bitrate_kbps: u32,
        opts: &SplitpointOptions,
    ) -> SplitDecision {
        let adapter = Mp3Adapter;
        let boundaries = adapter.boundaries(region);
        let target_local = (marker as i64 - region_start as i64 + i64::from(opts.xs_offset)).max(0) as usize;

        if !opts.xs {
            // Silence refinement is opt-in (`spec.md` §4.5's `xs` flag); with
            // it off, MP3 gets the same frame-boundary-only treatment as
            // Ogg/AAC rather than paying for a PCM decode nobody asked for.
            let split_local = boundaries
                .iter()
                .copied()
                .find(|&b| b >= target_local)
                .unwrap_or_else(|| target_local.min(region.len()));
            return SplitDecision {
                split_offset: region_start + split_local as u64,
                pad_end_of_prev: ms_to_bytes(i64::from(opts.xs_padding_1), bitrate_kbps),
                pad_start_of_next: ms_to_bytes(i64::from(opts.xs_padding_2), bitrate_kbps),
            };
        }

        let frames = build_envelope(region, &boundaries, bitrate_kbps);
        let candidates = find_silence_candidates(&frames, opts);
        let split_local = candidates
            .into_iter()
            .min_by_key(|&mid| mid.abs_diff(target_local))
            .map(|mid| snap_to_boundary(&boundaries, mid))
            .or_else(|| boundaries.iter().copied().find(|&b| b >= target_local))
            .unwrap_or_else(|| target_local.min(region.len()));

        SplitDecision {
            split_offset: region_start + split_local as u64,
            pad_end_of_prev: ms_to_bytes(i64::from(opts.xs_padding_1), bitrate_kbps),
            pad_start_of_next: ms_to_bytes(i64::from(opts.xs_padding_2), bitrate_kbps),
        }
    }
}

fn build_envelope(region: &[u8], boundaries: &[usize], bitrate_kbps: u32) -> Vec<FrameEnvelope> {
    let Ok(mut decoder) = make_decoder() else {
        return Vec::new();
    };

    let mut frames = Vec::with_capacity(boundaries.len());
    for (i, &start) in boundaries.iter().enumerate() {
        let end = boundaries.get(i + 1).copied().unwrap_or(region.len());
        if end <= start {
            continue;
        }
        let (rms, duration_ms) = decode_frame_power(decoder.as_mut(), &region[start..end], bitrate_kbps);
        frames.push(FrameEnvelope { start, end, duration_ms, rms });
    }
    frames
}

fn make_decoder() -> symphonia_core::errors::Result<Box<dyn Decoder>> {
    let mut params = CodecParameters::new();
    params.for_codec(CODEC_TYPE_MP3);
    symphonia::default::get_codecs().make(&params, &DecoderOptions::default())
}

/// Decodes one MP3 frame and returns `(rms_amplitude, duration_ms)`. A
/// frame that fails to decode standalone (it may need bit-reservoir state
/// from a preceding frame we didn't feed the decoder) is treated as
/// non-silent so a decode failure never masks real audio into a spurious
/// split.
fn decode_frame_power(decoder: &mut dyn Decoder, slice: &[u8], bitrate_kbps: u32) -> (f32, f64) {
    let packet = Packet::new_from_slice(0, 0, 0, slice);
    match decoder.decode(&packet) {
        Ok(buf) => {
            let (rms, frame_count, rate) = rms_of(&buf);
            let duration_ms = if rate > 0 {
                frame_count as f64 / f64::from(rate) * 1000.0
            } else {
                fallback_duration_ms(slice.len(), bitrate_kbps)
            };
            (rms, duration_ms)
        },
        Err(_) => (f32::MAX, fallback_duration_ms(slice.len(), bitrate_kbps)),
    }
}

fn rms_of(buf: &AudioBufferRef<'_>) -> (f32, usize, u32) {
    let spec = *buf.spec();
    let frame_count = buf.frames();
    let mut sample_buf = SampleBuffer::<f32>::new(frame_count as u64, spec);
    sample_buf.copy_interleaved_ref(buf.clone());
    let samples = sample_buf.samples();

    let rms = if samples.is_empty() {
        0.0
    } else {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    };

    (rms, frame_count, spec.rate)
}

fn fallback_duration_ms(frame_bytes: usize, bitrate_kbps: u32) -> f64 {
    frame_bytes as f64 * 8.0 / f64::from(bitrate_kbps.max(1))
}

/// Finds every run of consecutive below-threshold frames spanning at least
/// `xs_silence_length` ms, returning each run's byte-midpoint (region-local
/// offset) as a split candidate. `choose_split` picks whichever candidate
/// lands closest to `marker + xs_offset`.
fn find_silence_candidates(frames: &[FrameEnvelope], opts: &SplitpointOptions) -> Vec<usize> {
    let mut candidates = Vec::new();
    let mut i = 0;
    while i < frames.len() {
        if frames[i].rms >= opts.xs_min_volume {
            i += 1;
            continue;
        }
        let run_start = i;
        let mut total_ms = 0.0;
        while i < frames.len() && frames[i].rms < opts.xs_min_volume {
            total_ms += frames[i].duration_ms;
            i += 1;
        }
        if total_ms >= f64::from(opts.xs_silence_length) {
            candidates.push((frames[run_start].start + frames[i - 1].end) / 2);
        }
    }
    candidates
}

fn snap_to_boundary(boundaries: &[usize], target: usize) -> usize {
    boundaries
        .iter()
        .copied()
        .min_by_key(|&b| b.abs_diff(target))
        .unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_duration_is_monotonic_in_bitrate() {
        let slow = fallback_duration_ms(1000, 64);
        let fast = fallback_duration_ms(1000, 320);
        assert!(slow > fast);
    }

    #[test]
    fn snap_picks_nearest() {
        let boundaries = vec![0, 100, 250, 400];
        assert_eq!(snap_to_boundary(&boundaries, 260), 250);
        assert_eq!(snap_to_boundary(&boundaries, 40), 0);
    }

    #[test]
    fn xs_disabled_skips_decode_and_lands_on_marker() {
        let opts = SplitpointOptions {
            xs: false,
            ..SplitpointOptions::default()
        };
        let region = vec![0u8; 64]; // no MP3 sync bytes, no frame boundaries
        let decision = Mp3SilenceDetector.choose_split(&region, 1_000, 1_032, 128, &opts);
        assert_eq!(decision.split_offset, 1_032);
        assert_eq!(decision.pad_end_of_prev, 0);
        assert_eq!(decision.pad_start_of_next, 0);
    }
}
