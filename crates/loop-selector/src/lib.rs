//! Loop segment selection and confidence estimation
//!
//! Maps the best repetition candidate back to a time range, or falls back to
//! a fixed proportional window when no repetition was found. The confidence
//! tier rewards evidence of recurrence rather than fine-grained similarity,
//! which the detector thresholds already gate.

use drill_loop_common::{Frame, LoopSpec, RepetitionCandidate};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Fallback window start as a fraction of the duration
    pub fallback_start_fraction: f64,
    /// Fallback window end as a fraction of the duration
    pub fallback_end_fraction: f64,
    /// Maximum loop length as a fraction of the frame count
    pub max_loop_fraction: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            fallback_start_fraction: 0.2,
            fallback_end_fraction: 0.8,
            max_loop_fraction: 1.0 / 3.0,
        }
    }
}

/// Pick the loop segment from ranked candidates (best first).
///
/// With candidates, the winner's start indices map back to frame times and
/// the loop length is clamped to `max_loop_fraction` of the frame count so an
/// accidental whole-video "repetition" is never exported. Without
/// candidates, the middle portion of the timeline is used on the assumption
/// that setup/teardown motion sits at the edges. The returned segment always
/// satisfies `0 <= start < end <= duration` except for the degenerate empty
/// input, which yields the zero segment.
#[must_use]
pub fn select_loop(
    frames: &[Frame],
    ranked: &[RepetitionCandidate],
    duration_secs: f64,
    config: &SelectorConfig,
) -> LoopSpec {
    if frames.is_empty() || duration_secs <= 0.0 {
        return LoopSpec::zero();
    }

    let (start, end) = match ranked.first() {
        Some(best) => {
            let n = frames.len();
            let max_len = ((n as f64 * config.max_loop_fraction).round() as usize).max(1);
            let start_index = best.start_index.min(n - 1);
            let mut end_index = best.other_start_index.min(n - 1);
            if end_index - start_index > max_len {
                debug!(
                    "clamping loop of {} frames to {max_len}",
                    end_index - start_index
                );
                end_index = start_index + max_len;
            }
            (frames[start_index].time, frames[end_index].time)
        }
        None => {
            debug!("no repetition candidates, using proportional fallback window");
            (
                config.fallback_start_fraction * duration_secs,
                config.fallback_end_fraction * duration_secs,
            )
        }
    };

    let start = start.max(0.0);
    let end = end.min(duration_secs);
    if start < end {
        LoopSpec {
            start_secs: start,
            end_secs: end,
        }
    } else {
        // Clamping arithmetic collapsed the segment; fall back to everything
        LoopSpec {
            start_secs: 0.0,
            end_secs: duration_secs,
        }
    }
}

/// Confidence tier for a candidate count.
///
/// A coarse, monotone function of repetition evidence, not a probability:
/// the fallback loop still gets a usable low tier.
#[must_use]
pub fn confidence_for(candidate_count: usize) -> f64 {
    match candidate_count {
        0 => 0.3,
        1 => 0.6,
        2 => 0.75,
        _ => 0.9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_loop_common::Fingerprint;

    fn frames(count: usize, interval: f64) -> Vec<Frame> {
        (0..count)
            .map(|k| Frame {
                time: k as f64 * interval,
                fingerprint: Fingerprint::from_bits(&[true; 8]),
                motion: if k == 0 { 0.0 } else { 0.1 },
            })
            .collect()
    }

    fn candidate(start: usize, other: usize) -> RepetitionCandidate {
        RepetitionCandidate {
            start_index: start,
            other_start_index: other,
            window: 4,
            similarity: 1.0,
        }
    }

    #[test]
    fn test_best_candidate_maps_to_times() {
        let frames = frames(50, 0.2);
        let spec = select_loop(
            &frames,
            &[candidate(5, 15)],
            10.0,
            &SelectorConfig::default(),
        );
        assert!((spec.start_secs - 1.0).abs() < 1e-9);
        assert!((spec.end_secs - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_loop_length_clamped_to_third() {
        let frames = frames(30, 0.2);
        // Implied loop of 25 frames exceeds 30/3 = 10
        let spec = select_loop(
            &frames,
            &[candidate(2, 27)],
            6.0,
            &SelectorConfig::default(),
        );
        assert!((spec.start_secs - 0.4).abs() < 1e-9);
        assert!((spec.end_secs - frames[12].time).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_middle_window() {
        let frames = frames(50, 0.2);
        let spec = select_loop(&frames, &[], 10.0, &SelectorConfig::default());
        assert!((spec.start_secs - 2.0).abs() < 1e-9);
        assert!((spec.end_secs - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_frames_zero_segment() {
        let spec = select_loop(&[], &[], 10.0, &SelectorConfig::default());
        assert_eq!(spec, LoopSpec::zero());
    }

    #[test]
    fn test_invariant_holds_with_out_of_range_candidate() {
        let frames = frames(20, 0.2);
        // Indices past the sequence end are clamped, never out of bounds
        let spec = select_loop(
            &frames,
            &[candidate(18, 60)],
            4.0,
            &SelectorConfig::default(),
        );
        assert!(spec.start_secs >= 0.0);
        assert!(spec.start_secs < spec.end_secs);
        assert!(spec.end_secs <= 4.0);
    }

    #[test]
    fn test_degenerate_candidate_reclamps_to_full_duration() {
        let frames = frames(20, 0.2);
        // Both indices clamp to the last frame; the collapsed segment is
        // replaced by the whole timeline
        let spec = select_loop(
            &frames,
            &[candidate(30, 40)],
            4.0,
            &SelectorConfig::default(),
        );
        assert_eq!(spec.start_secs, 0.0);
        assert_eq!(spec.end_secs, 4.0);
    }

    #[test]
    fn test_confidence_tiers() {
        assert_eq!(confidence_for(0), 0.3);
        assert_eq!(confidence_for(1), 0.6);
        assert_eq!(confidence_for(2), 0.75);
        assert_eq!(confidence_for(3), 0.9);
        assert_eq!(confidence_for(12), 0.9);

        // Non-decreasing step function
        let tiers: Vec<f64> = (0..6).map(confidence_for).collect();
        assert!(tiers.windows(2).all(|w| w[1] >= w[0]));
    }
}
