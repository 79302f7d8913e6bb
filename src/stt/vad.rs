//! Energy-based voice activity detection.
//!
//! Audio is processed in fixed 100 ms windows. A window whose RMS energy
//! meets the internal threshold flips the state machine to speech; 200 ms
//! of consecutive sub-threshold windows flips it back. Segments shorter
//! than 250 ms are discarded as clicks. All timestamps are snapped to
//! window boundaries.
//!
//! The public sensitivity knob is a `[0.0, 1.0]` threshold mapped linearly
//! onto RMS energy: lower values detect more (and larger) segments.

use crate::audio::AudioSegment;

/// Analysis window length.
pub const WINDOW_MS: usize = 100;

/// Consecutive silence needed to close a speech segment.
pub const HANGOVER_MS: usize = 200;

/// Segments shorter than this are dropped.
pub const MIN_SEGMENT_MS: usize = 250;

/// Map the public `[0, 1]` sensitivity onto an internal RMS threshold.
///
/// 0.0 → 0.01 (very sensitive), 1.0 → 0.10 (only loud speech).
pub fn energy_threshold(sensitivity: f32) -> f32 {
    0.01 + 0.09 * sensitivity
}

/// Detect speech segments in a mono PCM buffer.
///
/// `sensitivity` must already be validated to `[0.0, 1.0]` by the caller.
pub fn detect_segments(samples: &[f32], sample_rate: u32, sensitivity: f32) -> Vec<AudioSegment> {
    let window = (sample_rate as usize * WINDOW_MS / 1000).max(1);
    let hangover_windows = HANGOVER_MS / WINDOW_MS;
    let min_windows = MIN_SEGMENT_MS.div_ceil(WINDOW_MS);
    let threshold = energy_threshold(sensitivity);
    let window_s = WINDOW_MS as f32 / 1000.0;

    let window_count = samples.len().div_ceil(window);
    let mut segments = Vec::new();

    let mut speech_start: Option<usize> = None;
    let mut silent_run = 0usize;
    let mut last_voiced = 0usize;

    for idx in 0..window_count {
        let lo = idx * window;
        let hi = (lo + window).min(samples.len());
        let rms = rms_energy(&samples[lo..hi]);
        let voiced = rms >= threshold;

        match (speech_start, voiced) {
            (None, true) => {
                speech_start = Some(idx);
                last_voiced = idx;
                silent_run = 0;
            }
            (Some(_), true) => {
                last_voiced = idx;
                silent_run = 0;
            }
            (Some(start), false) => {
                silent_run += 1;
                if silent_run >= hangover_windows {
                    push_segment(&mut segments, start, last_voiced + 1, min_windows, window_s);
                    speech_start = None;
                    silent_run = 0;
                }
            }
            (None, false) => {}
        }
    }
    if let Some(start) = speech_start {
        push_segment(&mut segments, start, last_voiced + 1, min_windows, window_s);
    }
    segments
}

fn push_segment(
    segments: &mut Vec<AudioSegment>,
    start_window: usize,
    end_window: usize,
    min_windows: usize,
    window_s: f32,
) {
    if end_window - start_window < min_windows {
        return;
    }
    segments.push(AudioSegment::new(
        start_window as f32 * window_s,
        end_window as f32 * window_s,
    ));
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const RATE: u32 = 16_000;

    /// Build audio from 100 ms blocks of either tone (given amplitude) or silence.
    fn blocks(spec: &[(usize, f32)]) -> Vec<f32> {
        let window = RATE as usize / 10;
        let mut samples = Vec::new();
        for &(count, amplitude) in spec {
            for n in 0..window * count {
                let t = n as f32 / RATE as f32;
                samples.push((2.0 * std::f32::consts::PI * 200.0 * t).sin() * amplitude);
            }
        }
        samples
    }

    #[test]
    fn threshold_mapping_is_linear() {
        assert!((energy_threshold(0.0) - 0.01).abs() < 1e-6);
        assert!((energy_threshold(0.5) - 0.055).abs() < 1e-6);
        assert!((energy_threshold(1.0) - 0.10).abs() < 1e-6);
    }

    #[test]
    fn silence_produces_no_segments() {
        let samples = vec![0.0f32; RATE as usize * 2];
        assert!(detect_segments(&samples, RATE, 0.5).is_empty());
    }

    #[test]
    fn one_utterance_is_one_segment_snapped_to_windows() {
        // 500 ms speech, then 500 ms silence.
        let samples = blocks(&[(5, 0.5), (5, 0.0)]);
        let segments = detect_segments(&samples, RATE, 0.5);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start_time_s - 0.0).abs() < 1e-6);
        assert!((segments[0].end_time_s - 0.5).abs() < 1e-6);
    }

    #[test]
    fn short_pause_does_not_split_a_segment() {
        // 300 ms speech, 100 ms dip (under the 200 ms hangover), 300 ms speech.
        let samples = blocks(&[(3, 0.5), (1, 0.0), (3, 0.5)]);
        let segments = detect_segments(&samples, RATE, 0.5);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn long_pause_splits_segments() {
        // Two 400 ms utterances separated by 400 ms of silence.
        let samples = blocks(&[(4, 0.5), (4, 0.0), (4, 0.5)]);
        let segments = detect_segments(&samples, RATE, 0.5);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].end_time_s <= segments[1].start_time_s);
    }

    #[test]
    fn clicks_shorter_than_the_minimum_are_discarded() {
        // A single 100 ms burst.
        let samples = blocks(&[(1, 0.5), (5, 0.0)]);
        assert!(detect_segments(&samples, RATE, 0.5).is_empty());
    }

    #[test]
    fn trailing_speech_is_flushed_at_end_of_buffer() {
        let samples = blocks(&[(2, 0.0), (4, 0.5)]);
        let segments = detect_segments(&samples, RATE, 0.5);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start_time_s - 0.2).abs() < 1e-6);
        assert!((segments[0].end_time_s - 0.6).abs() < 1e-6);
    }

    #[test]
    fn lower_sensitivity_detects_quieter_speech() {
        // Quiet audio: RMS ≈ 0.035 (amplitude 0.05 sine).
        let samples = blocks(&[(4, 0.05), (4, 0.0)]);
        let at_low = detect_segments(&samples, RATE, 0.0);
        let at_high = detect_segments(&samples, RATE, 1.0);
        assert_eq!(at_low.len(), 1, "sensitive setting should catch quiet speech");
        assert!(at_high.is_empty(), "strict setting should ignore quiet speech");
    }

    #[test]
    fn segments_are_ordered_and_well_formed() {
        let samples = blocks(&[(3, 0.5), (3, 0.0), (3, 0.4), (3, 0.0), (3, 0.6)]);
        let segments = detect_segments(&samples, RATE, 0.5);
        assert_eq!(segments.len(), 3);
        for seg in &segments {
            assert!(seg.start_time_s < seg.end_time_s);
        }
        for pair in segments.windows(2) {
            assert!(pair[0].end_time_s <= pair[1].start_time_s);
        }
    }
}
