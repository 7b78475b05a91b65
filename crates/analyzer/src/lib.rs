//! Drill-motion loop analysis engine
//!
//! Orchestrates the pipeline sampler -> scorer -> detector -> selector ->
//! confidence over a single video source, entirely within one invocation:
//! no state survives between analyses. Unreadable or empty sources degrade
//! to a well-defined zero-value result instead of failing; only the
//! top-level wall-clock timeout surfaces as an error.
//!
//! # Example
//! ```no_run
//! use drill_loop_analyzer::{AnalyzerConfig, LoopAnalyzer};
//!
//! # async fn run() -> drill_loop_common::Result<()> {
//! let analyzer = LoopAnalyzer::new(AnalyzerConfig::default());
//! let result = analyzer.analyze_file("drill.mp4").await?;
//! println!(
//!     "{} repetitions, loop {:.2}s..{:.2}s (confidence {:.2})",
//!     result.repetitions, result.loop_start_secs, result.loop_end_secs, result.confidence
//! );
//! # Ok(())
//! # }
//! ```

pub mod strategy;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use drill_loop_common::{AnalysisError, AnalysisResult, Result};
use drill_loop_detector::{motion_peaks, rank_candidates, DetectorConfig};
use drill_loop_fingerprint::ScorerConfig;
use drill_loop_sampler::SamplerConfig;
use drill_loop_selector::{confidence_for, select_loop, SelectorConfig};
use drill_loop_source::{FfmpegSource, VideoSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use strategy::{
    AnalysisStrategy, LandmarkEstimator, MotionFingerprintStrategy, PoseBasedStrategy,
    StrategyOutcome,
};

/// Selectable scorer/detector internals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Block-luminance fingerprints plus pixel-difference motion
    MotionFingerprint,
    /// Pose-landmark occupancy, requires an injected estimator
    PoseBased,
}

/// Full configuration surface of the engine, all fields defaulted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub sampler: SamplerConfig,
    pub scorer: ScorerConfig,
    pub detector: DetectorConfig,
    pub selector: SelectorConfig,
    /// Strategies tried in order until one succeeds
    pub strategies: Vec<StrategyKind>,
    /// Wall-clock budget for a whole analysis in seconds
    pub analysis_timeout_secs: u64,
    /// Bounding box for analysis rasters
    pub analysis_max_width: u32,
    /// Bounding box for analysis rasters
    pub analysis_max_height: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            scorer: ScorerConfig::default(),
            detector: DetectorConfig::default(),
            selector: SelectorConfig::default(),
            strategies: vec![StrategyKind::MotionFingerprint],
            analysis_timeout_secs: 60,
            analysis_max_width: 320,
            analysis_max_height: 240,
        }
    }
}

/// The drill-motion loop analyzer
#[derive(Clone)]
pub struct LoopAnalyzer {
    config: AnalyzerConfig,
    pose_estimator: Option<Arc<dyn LandmarkEstimator>>,
}

impl LoopAnalyzer {
    #[must_use]
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            pose_estimator: None,
        }
    }

    /// Attach the external pose model used by [`StrategyKind::PoseBased`]
    #[must_use]
    pub fn with_pose_estimator(mut self, estimator: Arc<dyn LandmarkEstimator>) -> Self {
        self.pose_estimator = Some(estimator);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn build_strategy(&self, kind: StrategyKind) -> Result<Box<dyn AnalysisStrategy>> {
        match kind {
            StrategyKind::MotionFingerprint => Ok(Box::new(MotionFingerprintStrategy)),
            StrategyKind::PoseBased => match &self.pose_estimator {
                Some(estimator) => Ok(Box::new(PoseBasedStrategy::new(estimator.clone()))),
                None => Err(AnalysisError::Other(
                    "pose strategy selected without a landmark estimator".to_string(),
                )),
            },
        }
    }

    /// Run the configured strategies in order, keeping the first outcome
    fn run_strategies(
        &self,
        source: &mut dyn VideoSource,
    ) -> Option<StrategyOutcome> {
        for &kind in &self.config.strategies {
            let strategy = match self.build_strategy(kind) {
                Ok(strategy) => strategy,
                Err(err) => {
                    warn!("strategy {kind:?} unavailable: {err}");
                    continue;
                }
            };
            match strategy.run(source, &self.config) {
                Ok(outcome) => {
                    debug!(
                        "strategy {} produced {} frames, {} candidates",
                        strategy.name(),
                        outcome.frames.len(),
                        outcome.candidates.len()
                    );
                    return Some(outcome);
                }
                Err(err) => warn!("strategy {} failed: {err}", strategy.name()),
            }
        }
        None
    }

    /// Analyze an already opened source synchronously.
    ///
    /// Deterministic for identical pixel data; never fails, since degenerate
    /// inputs produce [`AnalysisResult::zero`].
    pub fn analyze_source(&self, source: &mut dyn VideoSource) -> AnalysisResult {
        let duration = source.metadata().duration_secs;
        if duration <= 0.0 {
            warn!("source has non-positive duration, returning zero-value result");
            return AnalysisResult::zero();
        }

        let Some(outcome) = self.run_strategies(source) else {
            warn!("no strategy produced an outcome, returning zero-value result");
            return AnalysisResult::zero();
        };
        if outcome.frames.len() < 2 {
            warn!(
                "{} frame(s) captured, too few to analyze; returning zero-value result",
                outcome.frames.len()
            );
            return AnalysisResult::zero();
        }

        let ranked = rank_candidates(
            &outcome.candidates,
            &outcome.frames,
            self.config.detector.dedup_tolerance,
        );
        let loop_spec = select_loop(&outcome.frames, &ranked, duration, &self.config.selector);
        let key_frames = motion_peaks(&outcome.frames, self.config.detector.low_motion_threshold);
        let repetitions = outcome.candidates.len();

        info!(
            "analysis done: {repetitions} repetitions, loop {:.2}s..{:.2}s",
            loop_spec.start_secs, loop_spec.end_secs
        );

        AnalysisResult {
            duration_secs: duration,
            repetitions,
            key_frames,
            loop_start_secs: loop_spec.start_secs,
            loop_end_secs: loop_spec.end_secs,
            confidence: confidence_for(repetitions),
        }
    }

    /// Open a video file and analyze it under the configured wall-clock
    /// budget.
    ///
    /// An unreadable source yields the zero-value result; only timeout (and
    /// runtime) failures surface as errors, with no partial result.
    pub async fn analyze_file(&self, path: impl AsRef<Path>) -> Result<AnalysisResult> {
        let timeout_secs = self.config.analysis_timeout_secs;
        let analyzer = self.clone();
        let path = path.as_ref().to_path_buf();

        let task = tokio::task::spawn_blocking(move || {
            let mut source = match FfmpegSource::open_scaled(
                &path,
                analyzer.config.analysis_max_width,
                analyzer.config.analysis_max_height,
            ) {
                Ok(source) => source,
                Err(err) => {
                    warn!("{err}; returning zero-value result");
                    return AnalysisResult::zero();
                }
            };
            analyzer.analyze_source(&mut source)
        });

        match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) => Err(AnalysisError::Other(format!(
                "analysis task failed: {join_err}"
            ))),
            Err(_) => Err(AnalysisError::AnalysisTimeout(timeout_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Landmark;
    use drill_loop_source::{PixelBuffer, VideoMetadata};

    /// Striped test scene cycling through ten phases; same phase means
    /// identical pixels, distinct phases disagree in at least 40% of
    /// fingerprint blocks
    struct StripedSource {
        metadata: VideoMetadata,
        scratch: PixelBuffer,
        period_secs: f64,
        sample_rate: f64,
    }

    impl StripedSource {
        fn new(duration_secs: f64, period_secs: f64) -> Self {
            Self {
                metadata: VideoMetadata {
                    duration_secs,
                    width: 160,
                    height: 120,
                },
                scratch: PixelBuffer::new(160, 120),
                period_secs,
                sample_rate: 5.0,
            }
        }

        fn phase(&self, time: f64) -> u32 {
            let steps = (self.period_secs * self.sample_rate).round() as u32;
            ((time * self.sample_rate).round() as u32) % steps
        }
    }

    impl VideoSource for StripedSource {
        fn metadata(&self) -> &VideoMetadata {
            &self.metadata
        }

        fn frame_at(&mut self, time: f64, _deadline: Duration) -> drill_loop_common::Result<&PixelBuffer> {
            let phase = self.phase(time);
            self.scratch.paint(|x, _| {
                let block = x / 8;
                if (phase & block).count_ones() % 2 == 1 {
                    [255, 255, 255]
                } else {
                    [0, 0, 0]
                }
            });
            Ok(&self.scratch)
        }
    }

    #[test]
    fn test_detects_striped_repetition() {
        let mut source = StripedSource::new(10.0, 2.0);
        let analyzer = LoopAnalyzer::new(AnalyzerConfig::default());
        let result = analyzer.analyze_source(&mut source);

        assert!(result.repetitions >= 1);
        assert!(result.confidence >= 0.6);
        assert!(result.loop_start_secs < result.loop_end_secs);
        assert!(result.loop_end_secs <= 10.0);
        let loop_len = result.loop_end_secs - result.loop_start_secs;
        assert!(
            (1.4..=2.6).contains(&loop_len),
            "loop length {loop_len:.2}s should approximate the 2s cycle"
        );
    }

    #[test]
    fn test_zero_duration_source() {
        let mut source = StripedSource::new(0.0, 2.0);
        let analyzer = LoopAnalyzer::new(AnalyzerConfig::default());
        assert_eq!(analyzer.analyze_source(&mut source), AnalysisResult::zero());
    }

    #[test]
    fn test_determinism() {
        let analyzer = LoopAnalyzer::new(AnalyzerConfig::default());
        let first = analyzer.analyze_source(&mut StripedSource::new(10.0, 2.0));
        let second = analyzer.analyze_source(&mut StripedSource::new(10.0, 2.0));
        assert_eq!(first, second);
    }

    #[test]
    fn test_pose_strategy_falls_through_without_estimator() {
        let config = AnalyzerConfig {
            strategies: vec![StrategyKind::PoseBased, StrategyKind::MotionFingerprint],
            ..AnalyzerConfig::default()
        };
        let mut source = StripedSource::new(10.0, 2.0);
        let result = LoopAnalyzer::new(config).analyze_source(&mut source);
        // Fell through to the fingerprint strategy
        assert!(result.repetitions >= 1);
    }

    /// Reads the phase shade painted into the frame and returns a column of
    /// landmarks whose position cycles with it
    struct ShadeEstimator;

    impl LandmarkEstimator for ShadeEstimator {
        fn landmarks(&self, frame: &PixelBuffer) -> drill_loop_common::Result<Vec<Landmark>> {
            let phase = f32::from(frame.pixel(0, 0)[0] / 20);
            Ok((0..12)
                .map(|i| Landmark {
                    x: (phase + 0.5) / 10.0,
                    y: (i as f32 + 0.5) / 12.0,
                    confidence: 0.9,
                })
                .collect())
        }
    }

    /// Uniform shade encoding the phase, for the pose strategy tests
    struct ShadeSource {
        metadata: VideoMetadata,
        scratch: PixelBuffer,
    }

    impl ShadeSource {
        fn new(duration_secs: f64) -> Self {
            Self {
                metadata: VideoMetadata {
                    duration_secs,
                    width: 32,
                    height: 32,
                },
                scratch: PixelBuffer::new(32, 32),
            }
        }
    }

    impl VideoSource for ShadeSource {
        fn metadata(&self) -> &VideoMetadata {
            &self.metadata
        }

        fn frame_at(&mut self, time: f64, _deadline: Duration) -> drill_loop_common::Result<&PixelBuffer> {
            let phase = ((time * 5.0).round() as u32 % 10) as u8;
            let shade = phase * 20;
            self.scratch.paint(|_, _| [shade, shade, shade]);
            Ok(&self.scratch)
        }
    }

    #[test]
    fn test_pose_strategy_with_estimator() {
        let config = AnalyzerConfig {
            strategies: vec![StrategyKind::PoseBased],
            ..AnalyzerConfig::default()
        };
        let analyzer = LoopAnalyzer::new(config).with_pose_estimator(Arc::new(ShadeEstimator));
        let mut source = ShadeSource::new(10.0);
        let result = analyzer.analyze_source(&mut source);

        assert!(result.repetitions >= 1);
        assert!(result.confidence >= 0.6);
    }

    #[test]
    fn test_config_yaml_overrides() {
        let yaml = r#"
sampler:
  sample_rate: 2.0
strategies: ["pose-based", "motion-fingerprint"]
analysis_timeout_secs: 10
"#;
        let config: AnalyzerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sampler.sample_rate, 2.0);
        assert_eq!(config.sampler.max_frames, 300);
        assert_eq!(
            config.strategies,
            vec![StrategyKind::PoseBased, StrategyKind::MotionFingerprint]
        );
        assert_eq!(config.analysis_timeout_secs, 10);
        assert_eq!(config.detector.min_frames, 10);
    }
}
