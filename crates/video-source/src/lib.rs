//! Video source abstraction with an FFmpeg-backed implementation
//!
//! A [`VideoSource`] exposes duration/dimensions and a blocking
//! seek-then-read operation with an explicit per-call deadline. The decode
//! raster is owned by the source and reused between captures, so callers must
//! extract durable values before requesting the next frame.

use std::path::Path;
use std::time::{Duration, Instant};

use drill_loop_common::{AnalysisError, Result};
use ffmpeg_next as ffmpeg;
use tracing::debug;

/// Presentation tolerance when matching a decoded frame against the requested
/// time (~1 frame at 24fps)
const PRESENT_TOLERANCE_SECS: f64 = 0.04;

/// RGB24 raster at the source's output resolution.
///
/// Row-major, 3 bytes per pixel. Reused (overwritten) between successive
/// captures within one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Create a zeroed raster
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    /// Wrap raw RGB24 data; returns `None` when the length does not match
    #[must_use]
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB24 bytes, row-major
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at pixel coordinates; callers stay in bounds
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    /// Overwrite this raster with another, reusing the allocation
    pub fn copy_from(&mut self, other: &PixelBuffer) {
        self.width = other.width;
        self.height = other.height;
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }

    /// Rebuild the raster from a strided plane (drops row padding)
    pub fn fill_from_plane(&mut self, width: u32, height: u32, stride: usize, plane: &[u8]) {
        let row_len = width as usize * 3;
        self.width = width;
        self.height = height;
        self.data.clear();
        self.data.reserve(row_len * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            self.data.extend_from_slice(&plane[start..start + row_len]);
        }
    }

    /// Overwrite pixel data in place via a painter callback. The callback
    /// receives `(x, y)` and returns the RGB triple for that pixel.
    pub fn paint<F: FnMut(u32, u32) -> [u8; 3]>(&mut self, mut painter: F) {
        let mut offset = 0;
        for y in 0..self.height {
            for x in 0..self.width {
                let rgb = painter(x, y);
                self.data[offset] = rgb[0];
                self.data[offset + 1] = rgb[1];
                self.data[offset + 2] = rgb[2];
                offset += 3;
            }
        }
    }
}

/// Static properties of an opened video
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    /// Total duration in seconds; non-positive when unknown
    pub duration_secs: f64,
    /// Natural frame width in pixels
    pub width: u32,
    /// Natural frame height in pixels
    pub height: u32,
}

/// A decodable video exposing seek-then-read frame access.
///
/// Sources are exclusively owned by the pass that reads them; `&mut`
/// receivers encode that frames are produced strictly one at a time.
pub trait VideoSource {
    /// Duration and natural dimensions
    fn metadata(&self) -> &VideoMetadata;

    /// Seek to `time` and read the presented frame.
    ///
    /// Blocks at most `deadline`; expiry before any frame is presented yields
    /// [`AnalysisError::SeekTimeout`] and the caller decides fallback. The
    /// returned raster is overwritten by the next call.
    fn frame_at(&mut self, time: f64, deadline: Duration) -> Result<&PixelBuffer>;
}

/// Initialize the FFmpeg library once per process
fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialize FFmpeg");
    });
}

/// Fit dimensions within a bounding box, preserving aspect ratio and
/// rounding to even values for downstream encoders
fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let scale = (f64::from(max_width) / f64::from(width))
        .min(f64::from(max_height) / f64::from(height))
        .min(1.0);
    let w = (((f64::from(width) * scale).round() as u32) & !1).max(2);
    let h = (((f64::from(height) * scale).round() as u32) & !1).max(2);
    (w, h)
}

/// FFmpeg-backed video source with software scaling to a bounded RGB24 raster
pub struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    metadata: VideoMetadata,
    decoded: ffmpeg::util::frame::video::Video,
    converted: ffmpeg::util::frame::video::Video,
    scratch: PixelBuffer,
    decoded_any: bool,
}

impl FfmpegSource {
    /// Open a video at its natural resolution
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_scaled(path, u32::MAX, u32::MAX)
    }

    /// Open a video, downscaling output rasters to fit within the given
    /// bounding box (aspect ratio preserved)
    pub fn open_scaled(path: &Path, max_width: u32, max_height: u32) -> Result<Self> {
        init_ffmpeg();

        let input = ffmpeg::format::input(&path)
            .map_err(|e| AnalysisError::SourceUnreadable(format!("{}: {e}", path.display())))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| {
                AnalysisError::SourceUnreadable(format!("{}: no video stream", path.display()))
            })?;
        let stream_index = stream.index();
        let time_base = stream.time_base();

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| AnalysisError::SourceUnreadable(format!("decoder context: {e}")))?
            .decoder()
            .video()
            .map_err(|e| AnalysisError::SourceUnreadable(format!("video decoder: {e}")))?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(AnalysisError::SourceUnreadable(format!(
                "{}: zero-sized video stream",
                path.display()
            )));
        }

        let (out_width, out_height) = fit_within(width, height, max_width, max_height);
        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg::format::Pixel::RGB24,
            out_width,
            out_height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| AnalysisError::SourceUnreadable(format!("scaler: {e}")))?;

        let raw_duration =
            input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
        let metadata = VideoMetadata {
            duration_secs: raw_duration.max(0.0),
            width,
            height,
        };

        debug!(
            "Opened {} ({}x{} -> {}x{}, {:.2}s)",
            path.display(),
            width,
            height,
            out_width,
            out_height,
            metadata.duration_secs
        );

        Ok(Self {
            input,
            decoder,
            scaler,
            stream_index,
            time_base,
            metadata,
            decoded: ffmpeg::util::frame::video::Video::empty(),
            converted: ffmpeg::util::frame::video::Video::empty(),
            scratch: PixelBuffer::new(out_width, out_height),
            decoded_any: false,
        })
    }

    /// Scale the decoded frame into the scratch raster
    fn present(&mut self) -> Result<()> {
        self.scaler
            .run(&self.decoded, &mut self.converted)
            .map_err(|e| AnalysisError::FFmpegError(format!("pixel conversion: {e}")))?;
        let width = self.converted.width();
        let height = self.converted.height();
        let stride = self.converted.stride(0);
        self.scratch
            .fill_from_plane(width, height, stride, self.converted.data(0));
        Ok(())
    }
}

impl VideoSource for FfmpegSource {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn frame_at(&mut self, time: f64, deadline: Duration) -> Result<&PixelBuffer> {
        let started = Instant::now();
        let target = time.max(0.0);
        let target_pts = (target * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;

        // A fresh demuxer is already positioned at the start; everything else
        // needs an explicit backward-capable seek to the preceding keyframe.
        if self.decoded_any || target_pts > 0 {
            self.input
                .seek(target_pts, ..target_pts)
                .map_err(|e| AnalysisError::FFmpegError(format!("seek to {target:.3}s: {e}")))?;
            self.decoder.flush();
        }

        let tb_num = f64::from(self.time_base.0);
        let tb_den = f64::from(self.time_base.1);
        let stream_index = self.stream_index;

        let mut reached = false;
        let mut saw_frame = false;
        let mut timed_out = false;

        for (stream, packet) in self.input.packets() {
            if stream.index() != stream_index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_ok() {
                while self.decoder.receive_frame(&mut self.decoded).is_ok() {
                    saw_frame = true;
                    let presented = self.decoded.timestamp().unwrap_or(0) as f64 * tb_num / tb_den;
                    if presented + PRESENT_TOLERANCE_SECS >= target {
                        reached = true;
                        break;
                    }
                }
            }
            if reached {
                break;
            }
            if started.elapsed() > deadline {
                timed_out = true;
                break;
            }
        }

        if !reached && !timed_out {
            // End of stream; drain buffered frames
            self.decoder.send_eof().ok();
            while self.decoder.receive_frame(&mut self.decoded).is_ok() {
                saw_frame = true;
                let presented = self.decoded.timestamp().unwrap_or(0) as f64 * tb_num / tb_den;
                if presented + PRESENT_TOLERANCE_SECS >= target {
                    break;
                }
            }
        }

        if saw_frame {
            // Either the target frame or, on timeout/EOF, whatever frame is
            // currently presented
            self.present()?;
            self.decoded_any = true;
            return Ok(&self.scratch);
        }

        if timed_out {
            debug!("seek to {target:.3}s expired without presenting a frame");
            return Err(AnalysisError::SeekTimeout {
                time: target,
                deadline_ms: deadline.as_millis() as u64,
            });
        }

        Err(AnalysisError::FFmpegError(format!(
            "no frame decodable at {target:.3}s"
        )))
    }
}
