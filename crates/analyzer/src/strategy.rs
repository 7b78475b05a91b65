//! Analysis strategies
//!
//! One engine, two interchangeable scorer/detector internals: the
//! fingerprint/motion pipeline, and a pose-landmark variant fed by an
//! injected estimator. Both share the sampler, the repetition search and the
//! downstream selection stages, and produce the same outcome type so the
//! analyzer can try them in configured order.

use std::sync::Arc;

use drill_loop_common::{AnalysisError, Fingerprint, Frame, RepetitionCandidate, Result};
use drill_loop_detector::detect_repetitions;
use drill_loop_fingerprint::FrameScorer;
use drill_loop_sampler::FrameSampler;
use drill_loop_source::{PixelBuffer, VideoSource};
use tracing::debug;

use crate::AnalyzerConfig;

/// Uniform result of one strategy run
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    /// Scored frame sequence in time order
    pub frames: Vec<Frame>,
    /// Deduplicated repetition candidates
    pub candidates: Vec<RepetitionCandidate>,
}

/// A scorer/detector pairing behind a common interface
pub trait AnalysisStrategy {
    fn name(&self) -> &'static str;

    /// Walk the source and produce frames plus repetition candidates
    fn run(&self, source: &mut dyn VideoSource, config: &AnalyzerConfig)
        -> Result<StrategyOutcome>;
}

/// The fingerprint/motion pipeline; degrades instead of failing
pub struct MotionFingerprintStrategy;

impl AnalysisStrategy for MotionFingerprintStrategy {
    fn name(&self) -> &'static str {
        "motion-fingerprint"
    }

    fn run(
        &self,
        source: &mut dyn VideoSource,
        config: &AnalyzerConfig,
    ) -> Result<StrategyOutcome> {
        let mut sampler = FrameSampler::new(source, config.sampler.clone());
        let mut scorer = FrameScorer::new(config.scorer.clone());

        let mut frames = Vec::with_capacity(sampler.planned());
        while let Some((time, buffer)) = sampler.next_capture() {
            frames.push(scorer.score(time, buffer));
        }
        debug!("scored {} frames", frames.len());

        let candidates = detect_repetitions(&frames, &config.detector);
        Ok(StrategyOutcome { frames, candidates })
    }
}

/// A detected body landmark in normalized `[0, 1]` coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// External pose model collaborator; model internals live elsewhere
pub trait LandmarkEstimator: Send + Sync {
    /// Detect landmarks on a single raster
    fn landmarks(&self, frame: &PixelBuffer) -> Result<Vec<Landmark>>;
}

/// Pose-landmark variant of the scorer, sharing the repetition search.
///
/// Frames are reduced to an occupancy grid of confident landmark positions
/// and a mean-displacement motion signal. Estimator failures propagate so
/// the strategy chain can fall through.
pub struct PoseBasedStrategy {
    estimator: Arc<dyn LandmarkEstimator>,
    grid_size: u32,
    min_confidence: f32,
}

impl PoseBasedStrategy {
    #[must_use]
    pub fn new(estimator: Arc<dyn LandmarkEstimator>) -> Self {
        Self {
            estimator,
            grid_size: 4,
            min_confidence: 0.3,
        }
    }
}

/// Occupancy-grid fingerprint of confident landmarks
fn occupancy_fingerprint(landmarks: &[Landmark], grid_size: u32, min_confidence: f32) -> Fingerprint {
    let cells = (grid_size * grid_size) as usize;
    let mut bits = vec![false; cells];
    for landmark in landmarks {
        if landmark.confidence < min_confidence {
            continue;
        }
        let col = ((landmark.x.clamp(0.0, 1.0) * grid_size as f32) as u32).min(grid_size - 1);
        let row = ((landmark.y.clamp(0.0, 1.0) * grid_size as f32) as u32).min(grid_size - 1);
        bits[(row * grid_size + col) as usize] = true;
    }
    Fingerprint::from_bits(&bits)
}

/// Mean landmark displacement between consecutive frames, normalized to `[0, 1]`
fn landmark_motion(previous: &[Landmark], current: &[Landmark]) -> f64 {
    let paired = previous.len().min(current.len());
    if paired == 0 {
        return 0.0;
    }
    let total: f64 = previous
        .iter()
        .zip(current.iter())
        .map(|(a, b)| {
            let dx = f64::from(b.x - a.x);
            let dy = f64::from(b.y - a.y);
            (dx * dx + dy * dy).sqrt()
        })
        .sum();
    (total / paired as f64 / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

impl AnalysisStrategy for PoseBasedStrategy {
    fn name(&self) -> &'static str {
        "pose-based"
    }

    fn run(
        &self,
        source: &mut dyn VideoSource,
        config: &AnalyzerConfig,
    ) -> Result<StrategyOutcome> {
        let mut sampler = FrameSampler::new(source, config.sampler.clone());
        let mut frames = Vec::with_capacity(sampler.planned());
        let mut previous: Option<Vec<Landmark>> = None;

        while let Some((time, buffer)) = sampler.next_capture() {
            let landmarks = self.estimator.landmarks(buffer)?;
            if landmarks.is_empty() {
                return Err(AnalysisError::Other(format!(
                    "no landmarks detected at {time:.3}s"
                )));
            }
            let fingerprint =
                occupancy_fingerprint(&landmarks, self.grid_size, self.min_confidence);
            let motion = match &previous {
                None => 0.0,
                Some(prev) => landmark_motion(prev, &landmarks),
            };
            previous = Some(landmarks);
            frames.push(Frame {
                time,
                fingerprint,
                motion,
            });
        }
        debug!("scored {} frames from landmarks", frames.len());

        let candidates = detect_repetitions(&frames, &config.detector);
        Ok(StrategyOutcome { frames, candidates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy_fingerprint_layout() {
        let landmarks = [
            Landmark {
                x: 0.1,
                y: 0.1,
                confidence: 0.9,
            },
            Landmark {
                x: 0.9,
                y: 0.9,
                confidence: 0.9,
            },
            // Below confidence, ignored
            Landmark {
                x: 0.5,
                y: 0.5,
                confidence: 0.1,
            },
        ];
        let fp = occupancy_fingerprint(&landmarks, 4, 0.3);
        assert_eq!(fp.len_bits(), 16);

        let corner_only = occupancy_fingerprint(&landmarks[..1], 4, 0.3);
        assert!(fp.similarity(&corner_only) < 1.0);
    }

    #[test]
    fn test_occupancy_clamps_out_of_range() {
        let landmarks = [Landmark {
            x: 1.5,
            y: -0.5,
            confidence: 1.0,
        }];
        let fp = occupancy_fingerprint(&landmarks, 4, 0.3);
        assert_eq!(fp.len_bits(), 16);
    }

    #[test]
    fn test_landmark_motion_normalized() {
        let still = [Landmark {
            x: 0.5,
            y: 0.5,
            confidence: 1.0,
        }];
        assert_eq!(landmark_motion(&still, &still), 0.0);

        let moved = [Landmark {
            x: 0.6,
            y: 0.5,
            confidence: 1.0,
        }];
        let motion = landmark_motion(&still, &moved);
        assert!(motion > 0.0 && motion < 1.0);

        // Corner-to-corner displacement clamps to 1
        let a = [Landmark {
            x: 0.0,
            y: 0.0,
            confidence: 1.0,
        }];
        let b = [Landmark {
            x: 1.0,
            y: 1.0,
            confidence: 1.0,
        }];
        assert_eq!(landmark_motion(&a, &b), 1.0);

        assert_eq!(landmark_motion(&[], &moved), 0.0);
    }
}
