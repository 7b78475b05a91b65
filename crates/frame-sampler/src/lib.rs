//! Frame sampler
//!
//! Walks a [`VideoSource`] at a bounded rate, yielding evenly spaced captures
//! over `[0, duration)`. The sequence is lazy, forward-only and
//! non-restartable; the yielded raster is overwritten by the next capture, so
//! consumers extract durable values (fingerprint, motion) immediately.
//!
//! Individual seek failures never abort the walk: the previous successful
//! capture is re-presented at the requested time instead.

use std::time::Duration;

use drill_loop_source::{PixelBuffer, VideoSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Target sample rate in frames per second
    pub sample_rate: f64,
    /// Hard cap on the number of captures per pass
    pub max_frames: usize,
    /// Per-capture seek deadline in milliseconds
    pub seek_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 5.0,
            max_frames: 300,
            seek_timeout_ms: 500,
        }
    }
}

impl SamplerConfig {
    /// Per-capture deadline as a [`Duration`]
    #[must_use]
    pub fn seek_deadline(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }
}

/// Bounded, time-ordered walk over a video source
pub struct FrameSampler<'a, S: VideoSource + ?Sized> {
    source: &'a mut S,
    config: SamplerConfig,
    /// Spacing between captures in seconds
    interval: f64,
    /// Number of captures this pass will yield
    total: usize,
    index: usize,
    /// Last successful capture; doubles as the timeout substitute
    fallback: PixelBuffer,
    have_capture: bool,
    substituted: usize,
}

impl<'a, S: VideoSource + ?Sized> FrameSampler<'a, S> {
    /// Plan a sampling pass over `source`.
    ///
    /// The effective rate is `min(sample_rate, max_frames / duration)` so the
    /// capture count never exceeds `max_frames`. Degenerate sources (unknown
    /// or non-positive duration) produce an empty pass.
    pub fn new(source: &'a mut S, config: SamplerConfig) -> Self {
        let duration = source.metadata().duration_secs;
        let (interval, total) =
            if duration <= 0.0 || config.sample_rate <= 0.0 || config.max_frames == 0 {
                (0.0, 0)
            } else {
                let effective_rate = config
                    .sample_rate
                    .min(config.max_frames as f64 / duration);
                let interval = 1.0 / effective_rate;
                let total = ((duration / interval).ceil() as usize).min(config.max_frames);
                (interval, total)
            };

        if total == 0 {
            debug!("degenerate source (duration {duration:.3}s), sampling nothing");
        }

        Self {
            source,
            config,
            interval,
            total,
            index: 0,
            fallback: PixelBuffer::new(0, 0),
            have_capture: false,
            substituted: 0,
        }
    }

    /// Number of captures this pass yields in total
    #[must_use]
    pub fn planned(&self) -> usize {
        self.total
    }

    /// Captures substituted so far due to seek failures
    #[must_use]
    pub fn substituted(&self) -> usize {
        self.substituted
    }

    /// Capture the next frame, or `None` once the pass is exhausted.
    ///
    /// The returned raster stays valid until the next call. On a seek
    /// failure the previous capture's pixels are yielded unchanged at the
    /// requested time; leading failures (nothing captured yet) skip the slot.
    pub fn next_capture(&mut self) -> Option<(f64, &PixelBuffer)> {
        while self.index < self.total {
            let time = self.index as f64 * self.interval;
            self.index += 1;

            match self.source.frame_at(time, self.config.seek_deadline()) {
                Ok(buffer) => {
                    self.fallback.copy_from(buffer);
                    self.have_capture = true;
                }
                Err(err) => {
                    if !self.have_capture {
                        warn!("capture at {time:.3}s failed before any success ({err}), skipping");
                        continue;
                    }
                    self.substituted += 1;
                    debug!("capture at {time:.3}s failed ({err}), reusing previous frame");
                }
            }

            return Some((time, &self.fallback));
        }

        if self.substituted > 0 {
            debug!(
                "sampling pass finished: {} captures, {} substituted",
                self.total, self.substituted
            );
        }
        None
    }
}
