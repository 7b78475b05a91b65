//! Repetition detection over fingerprint/motion sequences
//!
//! Searches a scored frame sequence for pairs of windows that contain the
//! same movement cycle recurring later in time. Multiple window sizes are
//! tried so both fast and slow repeated movements are caught; candidate
//! starts can be pruned to cycle starts (low-motion to rising-motion
//! transitions) to keep the pair search tractable.

use drill_loop_common::{Frame, RepetitionCandidate};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Per-frame fingerprint similarity needed to count a pair as a match
    pub frame_similarity_threshold: f64,
    /// Matched-frame fraction needed to record a window pair
    pub window_similarity_threshold: f64,
    /// Motion level separating "still" from "moving" for cycle starts
    pub low_motion_threshold: f64,
    /// Candidate window sizes as fractions of the sequence length
    pub window_fractions: Vec<f64>,
    /// Smallest usable window in frames
    pub min_window: usize,
    /// Candidates with both indices within this distance collapse into one
    pub dedup_tolerance: usize,
    /// Sequences shorter than this produce no candidates
    pub min_frames: usize,
    /// Prune candidate starts to detected cycle starts
    pub restrict_to_cycle_starts: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_similarity_threshold: 0.7,
            window_similarity_threshold: 0.75,
            low_motion_threshold: 0.05,
            window_fractions: vec![1.0 / 15.0, 1.0 / 10.0, 1.0 / 5.0],
            min_window: 4,
            dedup_tolerance: 5,
            min_frames: 10,
            restrict_to_cycle_starts: true,
        }
    }
}

/// Frame indices where motion rises from below the threshold to above it and
/// keeps increasing, i.e. the "movement begins" transitions
#[must_use]
pub fn cycle_starts(frames: &[Frame], low_motion_threshold: f64) -> Vec<usize> {
    if frames.len() < 3 {
        return Vec::new();
    }
    (1..frames.len() - 1)
        .filter(|&k| {
            frames[k - 1].motion < low_motion_threshold
                && frames[k].motion >= low_motion_threshold
                && frames[k + 1].motion >= frames[k].motion
        })
        .collect()
}

/// Frame indices of local motion maxima above the low-motion threshold
#[must_use]
pub fn motion_peaks(frames: &[Frame], low_motion_threshold: f64) -> Vec<usize> {
    if frames.len() < 3 {
        return Vec::new();
    }
    (1..frames.len() - 1)
        .filter(|&k| {
            frames[k].motion > frames[k - 1].motion
                && frames[k].motion >= frames[k + 1].motion
                && frames[k].motion > low_motion_threshold
        })
        .collect()
}

/// Matched-frame fraction between two aligned windows of length `window`
fn window_similarity(
    frames: &[Frame],
    start: usize,
    other_start: usize,
    window: usize,
    frame_threshold: f64,
) -> f64 {
    let matched = (0..window)
        .filter(|&k| {
            frames[start + k]
                .fingerprint
                .similarity(&frames[other_start + k].fingerprint)
                >= frame_threshold
        })
        .count();
    matched as f64 / window as f64
}

/// Distinct window sizes derived from the configured fractions
fn window_sizes(frame_count: usize, config: &DetectorConfig) -> Vec<usize> {
    let mut sizes: Vec<usize> = config
        .window_fractions
        .iter()
        .map(|fraction| ((frame_count as f64 * fraction) as usize).max(config.min_window))
        .collect();
    sizes.sort_unstable();
    sizes.dedup();
    sizes
}

/// Collapse candidates whose index pairs fall within the tolerance of an
/// already kept candidate, preferring higher similarity
fn dedup_candidates(
    mut candidates: Vec<RepetitionCandidate>,
    tolerance: usize,
) -> Vec<RepetitionCandidate> {
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.start_index.cmp(&b.start_index))
            .then(a.other_start_index.cmp(&b.other_start_index))
            .then(a.window.cmp(&b.window))
    });

    let mut kept: Vec<RepetitionCandidate> = Vec::new();
    for candidate in candidates {
        let duplicate = kept.iter().any(|existing| {
            existing.start_index.abs_diff(candidate.start_index) <= tolerance
                && existing
                    .other_start_index
                    .abs_diff(candidate.other_start_index)
                    <= tolerance
        });
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

/// Search the frame sequence for repeating windows.
///
/// Returns deduplicated candidates in deterministic order (highest
/// similarity first). Sequences below `min_frames` are too short to judge
/// and yield nothing.
#[must_use]
pub fn detect_repetitions(frames: &[Frame], config: &DetectorConfig) -> Vec<RepetitionCandidate> {
    let n = frames.len();
    if n < config.min_frames {
        debug!("only {n} frames, too few to judge repetition");
        return Vec::new();
    }

    let all_starts: Vec<usize> = (0..n).collect();
    let pruned_starts = if config.restrict_to_cycle_starts {
        let starts = cycle_starts(frames, config.low_motion_threshold);
        if starts.len() >= 2 {
            debug!("restricting search to {} cycle starts", starts.len());
            Some(starts)
        } else {
            None
        }
    } else {
        None
    };
    let starts = pruned_starts.as_ref().unwrap_or(&all_starts);

    let mut candidates = Vec::new();
    for window in window_sizes(n, config) {
        // Both occurrences plus the gap must fit in the sequence
        if 2 * window + 1 > n {
            continue;
        }
        for (position, &start) in starts.iter().enumerate() {
            if start + window > n {
                break;
            }
            for &other_start in &starts[position + 1..] {
                if other_start <= start + window {
                    continue;
                }
                if other_start + window > n {
                    break;
                }
                let similarity = window_similarity(
                    frames,
                    start,
                    other_start,
                    window,
                    config.frame_similarity_threshold,
                );
                if similarity >= config.window_similarity_threshold {
                    candidates.push(RepetitionCandidate {
                        start_index: start,
                        other_start_index: other_start,
                        window,
                        similarity,
                    });
                }
            }
        }
    }

    let deduped = dedup_candidates(candidates, config.dedup_tolerance);
    debug!("{} repetition candidates after dedup", deduped.len());
    deduped
}

/// Mean motion over the first occurrence window of a candidate
fn window_motion(frames: &[Frame], candidate: &RepetitionCandidate) -> f64 {
    let end = (candidate.start_index + candidate.window).min(frames.len());
    let span = &frames[candidate.start_index..end];
    if span.is_empty() {
        return 0.0;
    }
    span.iter().map(|f| f.motion).sum::<f64>() / span.len() as f64
}

/// Order candidates best-first for loop selection.
///
/// Candidates whose implied cycle duration recurs most often across the set
/// rank highest, weighted by the mean motion inside the window so cycles
/// with real movement beat near-static false positives.
#[must_use]
pub fn rank_candidates(
    candidates: &[RepetitionCandidate],
    frames: &[Frame],
    tolerance: usize,
) -> Vec<RepetitionCandidate> {
    let score = |candidate: &RepetitionCandidate| -> f64 {
        let consistency = candidates
            .iter()
            .filter(|other| other.cycle_len().abs_diff(candidate.cycle_len()) <= tolerance)
            .count();
        consistency as f64 * window_motion(frames, candidate)
    };

    let mut ranked: Vec<(f64, RepetitionCandidate)> = candidates
        .iter()
        .map(|candidate| (score(candidate), candidate.clone()))
        .collect();
    ranked.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.start_index.cmp(&b.start_index))
            .then(a.other_start_index.cmp(&b.other_start_index))
    });
    ranked.into_iter().map(|(_, candidate)| candidate).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_loop_common::Fingerprint;

    /// Walsh codeword: any two distinct rows agree in exactly half their
    /// positions, so distinct phases compare at similarity 0.5
    fn walsh(row: usize) -> Fingerprint {
        let bits: Vec<bool> = (0..32u32).map(|j| (row as u32 & j).count_ones() % 2 == 1).collect();
        Fingerprint::from_bits(&bits)
    }

    fn frame(index: usize, phase: usize, motion: f64) -> Frame {
        Frame {
            time: index as f64 * 0.2,
            fingerprint: walsh(phase),
            motion,
        }
    }

    /// Pattern repeating every `period` frames with constant motion
    fn repeating_sequence(count: usize, period: usize) -> Vec<Frame> {
        (0..count)
            .map(|k| frame(k, k % period, if k == 0 { 0.0 } else { 0.2 }))
            .collect()
    }

    /// Every frame unique, motion strictly increasing
    fn drifting_sequence(count: usize) -> Vec<Frame> {
        (0..count)
            .map(|k| frame(k, k, if k == 0 { 0.0 } else { 0.05 + 0.02 * k as f64 }))
            .collect()
    }

    #[test]
    fn test_detects_periodic_pattern() {
        let frames = repeating_sequence(24, 4);
        let candidates = detect_repetitions(&frames, &DetectorConfig::default());
        assert!(!candidates.is_empty());
        for candidate in &candidates {
            assert_eq!(candidate.cycle_len() % 4, 0, "cycle must align with the period");
            assert!(candidate.similarity >= 0.75);
            assert!(candidate.other_start_index > candidate.start_index + candidate.window);
        }
    }

    #[test]
    fn test_no_candidates_for_drifting_content() {
        let frames = drifting_sequence(24);
        let candidates = detect_repetitions(&frames, &DetectorConfig::default());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_too_few_frames() {
        let frames = repeating_sequence(9, 3);
        let candidates = detect_repetitions(&frames, &DetectorConfig::default());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_dedup_tolerance_property() {
        let frames = repeating_sequence(40, 4);
        let config = DetectorConfig::default();
        let candidates = detect_repetitions(&frames, &config);
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                let clustered = a.start_index.abs_diff(b.start_index) <= config.dedup_tolerance
                    && a.other_start_index.abs_diff(b.other_start_index)
                        <= config.dedup_tolerance;
                assert!(!clustered, "dedup left a clustered pair: {a:?} / {b:?}");
            }
        }
    }

    #[test]
    fn test_determinism() {
        let frames = repeating_sequence(30, 5);
        let config = DetectorConfig::default();
        let first = detect_repetitions(&frames, &config);
        let second = detect_repetitions(&frames, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cycle_starts_rising_transition() {
        let motions = [0.0, 0.01, 0.02, 0.2, 0.3, 0.02, 0.01, 0.15, 0.25, 0.3];
        let frames: Vec<Frame> = motions
            .iter()
            .enumerate()
            .map(|(k, &m)| frame(k, k, m))
            .collect();
        assert_eq!(cycle_starts(&frames, 0.05), vec![3, 7]);
    }

    #[test]
    fn test_motion_peaks() {
        let motions = [0.0, 0.1, 0.3, 0.1, 0.05, 0.4, 0.2];
        let frames: Vec<Frame> = motions
            .iter()
            .enumerate()
            .map(|(k, &m)| frame(k, k, m))
            .collect();
        assert_eq!(motion_peaks(&frames, 0.05), vec![2, 5]);
    }

    #[test]
    fn test_ranking_prefers_consistent_cycles_with_motion() {
        let frames = repeating_sequence(40, 4);
        // Three candidates share a cycle length, one is an outlier; the
        // outlier carries the same motion but no support
        let candidates = vec![
            RepetitionCandidate {
                start_index: 0,
                other_start_index: 8,
                window: 4,
                similarity: 1.0,
            },
            RepetitionCandidate {
                start_index: 8,
                other_start_index: 16,
                window: 4,
                similarity: 1.0,
            },
            RepetitionCandidate {
                start_index: 16,
                other_start_index: 24,
                window: 4,
                similarity: 1.0,
            },
            RepetitionCandidate {
                start_index: 0,
                other_start_index: 32,
                window: 4,
                similarity: 1.0,
            },
        ];
        let ranked = rank_candidates(&candidates, &frames, 5);
        assert_eq!(ranked.len(), 4);
        assert_eq!(ranked[0].cycle_len(), 8);
        assert_eq!(ranked.last().unwrap().cycle_len(), 32);
    }

    #[test]
    fn test_ranking_downweighs_static_windows() {
        // Identical support counts; the moving window must win
        let mut frames = repeating_sequence(30, 5);
        for frame in frames.iter_mut().take(10) {
            frame.motion = 0.0;
        }
        let candidates = vec![
            RepetitionCandidate {
                start_index: 0,
                other_start_index: 10,
                window: 5,
                similarity: 1.0,
            },
            RepetitionCandidate {
                start_index: 15,
                other_start_index: 25,
                window: 5,
                similarity: 1.0,
            },
        ];
        let ranked = rank_candidates(&candidates, &frames, 2);
        assert_eq!(ranked[0].start_index, 15);
    }
}
