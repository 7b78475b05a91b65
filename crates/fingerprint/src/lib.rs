//! Frame fingerprinting and motion scoring
//!
//! Reduces each raster to two durable values: a block-mean-luminance bit
//! fingerprint for cheap self-similarity comparison, and a scalar motion
//! score relative to the immediately preceding frame.

use drill_loop_common::{Fingerprint, Frame};
use drill_loop_source::PixelBuffer;
use serde::{Deserialize, Serialize};

/// Luminance quantization threshold (mid-gray)
const LUMA_THRESHOLD: f64 = 128.0;

/// Maximum possible per-pixel absolute difference across three channels
const MAX_PIXEL_DELTA: f64 = 765.0;

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Fingerprint block edge length in pixels
    pub block_size: u32,
    /// Sample every n-th pixel when scoring motion
    pub motion_stride: usize,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            block_size: 8,
            motion_stride: 16,
        }
    }
}

/// Compute the block-mean-luminance fingerprint of a raster.
///
/// The raster is partitioned into a grid of `block_size`-square blocks
/// (partial edge blocks are dropped so the layout is stable); each block
/// contributes one bit: mean `(R+G+B)/3` at or above mid-gray. Bits are
/// packed row-major. Rasters smaller than one block collapse to a single
/// whole-image block.
#[must_use]
pub fn compute_fingerprint(buffer: &PixelBuffer, block_size: u32) -> Fingerprint {
    let width = buffer.width();
    let height = buffer.height();
    if width == 0 || height == 0 || block_size == 0 {
        return Fingerprint::from_bits(&[]);
    }

    let grid_w = (width / block_size).max(1) as usize;
    let grid_h = (height / block_size).max(1) as usize;

    let mut bits = Vec::with_capacity(grid_w * grid_h);
    for by in 0..grid_h {
        for bx in 0..grid_w {
            let x0 = bx as u32 * block_size;
            let y0 = by as u32 * block_size;
            let x1 = (x0 + block_size).min(width);
            let y1 = (y0 + block_size).min(height);

            let mut sum = 0u64;
            let mut count = 0u64;
            for y in y0..y1 {
                for x in x0..x1 {
                    let [r, g, b] = buffer.pixel(x, y);
                    sum += u64::from(r) + u64::from(g) + u64::from(b);
                    count += 1;
                }
            }
            let mean_luma = sum as f64 / (3.0 * count as f64);
            bits.push(mean_luma >= LUMA_THRESHOLD);
        }
    }

    Fingerprint::from_bits(&bits)
}

/// Normalized motion between two equally sized rasters.
///
/// Sums absolute per-channel differences over a strided pixel subset and
/// normalizes by the maximum per-pixel delta, yielding a value in `[0, 1]`.
/// Mismatched rasters score 0 (cannot occur within one pass).
#[must_use]
pub fn motion_score(previous: &PixelBuffer, current: &PixelBuffer, stride: usize) -> f64 {
    debug_assert_eq!(previous.data().len(), current.data().len());
    if previous.data().len() != current.data().len() || current.data().is_empty() {
        return 0.0;
    }

    let stride = stride.max(1);
    let pixels = current.data().len() / 3;
    let mut total = 0u64;
    let mut sampled = 0u64;
    for p in (0..pixels).step_by(stride) {
        let offset = p * 3;
        for c in 0..3 {
            let a = previous.data()[offset + c];
            let b = current.data()[offset + c];
            total += u64::from(a.abs_diff(b));
        }
        sampled += 1;
    }

    if sampled == 0 {
        return 0.0;
    }
    total as f64 / (sampled as f64 * MAX_PIXEL_DELTA)
}

/// Stateful per-pass scorer.
///
/// Retains a copy of the previous raster so motion always references the
/// immediately preceding frame, regardless of the sampler reusing its
/// capture buffer.
pub struct FrameScorer {
    config: ScorerConfig,
    previous: Option<PixelBuffer>,
}

impl FrameScorer {
    #[must_use]
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    /// Reduce a capture to its durable [`Frame`] values. The first frame of
    /// a pass always scores motion 0.
    pub fn score(&mut self, time: f64, buffer: &PixelBuffer) -> Frame {
        let fingerprint = compute_fingerprint(buffer, self.config.block_size);
        let motion = match &self.previous {
            None => 0.0,
            Some(previous) => motion_score(previous, buffer, self.config.motion_stride),
        };

        match &mut self.previous {
            Some(previous) => previous.copy_from(buffer),
            None => self.previous = Some(buffer.clone()),
        }

        Frame {
            time,
            fingerprint,
            motion,
        }
    }
}
