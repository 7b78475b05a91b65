//! Loop rendering
//!
//! Replays a selected loop segment several times, handing each presented
//! frame to an external encoder, and grabs a single still thumbnail from the
//! segment midpoint. Per-frame seek failures reuse the last drawn frame; the
//! whole render is bounded by a wall-clock budget after which partial output
//! is discarded.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use drill_loop_common::{AnalysisError, LoopSpec, Result};
use drill_loop_source::{FfmpegSource, PixelBuffer, VideoSource};
use image::ImageEncoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Render configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Number of passes over the loop segment
    pub repeat_count: u32,
    /// Output frame rate
    pub frame_rate: f64,
    /// Bounding box for the rendered frames
    pub max_width: u32,
    /// Bounding box for the rendered frames
    pub max_height: u32,
    /// Per-frame seek deadline in milliseconds
    pub seek_timeout_ms: u64,
    /// Wall-clock budget for the whole render in seconds
    pub render_timeout_secs: u64,
    /// JPEG quality for the thumbnail
    pub thumbnail_quality: u8,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            repeat_count: 3,
            frame_rate: 30.0,
            max_width: 1280,
            max_height: 720,
            seek_timeout_ms: 500,
            render_timeout_secs: 45,
            thumbnail_quality: 85,
        }
    }
}

/// Encoded render artifacts, handed unmodified to the caller
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// Encoded loop video
    pub video: Vec<u8>,
    /// Still JPEG of the loop midpoint
    pub thumbnail: Vec<u8>,
}

/// External encoder collaborator.
///
/// Receives frames in presentation order and returns the encoded media blob
/// when finished. The renderer's job ends at deciding what to hand over.
pub trait LoopEncoder {
    /// Start an encode at the given raster dimensions and frame rate
    fn begin(&mut self, width: u32, height: u32, frame_rate: f64) -> Result<()>;

    /// Accept one frame
    fn write_frame(&mut self, frame: &PixelBuffer) -> Result<()>;

    /// Finalize and return the encoded bytes
    fn finish(&mut self) -> Result<Vec<u8>>;
}

/// MP4 encoder piping RGB24 rawvideo into the `ffmpeg` CLI
pub struct FfmpegCliEncoder {
    child: Option<std::process::Child>,
    stdin: Option<std::process::ChildStdin>,
    output_path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl FfmpegCliEncoder {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let output_path = temp_dir.path().join("loop.mp4");
        Ok(Self {
            child: None,
            stdin: None,
            output_path,
            _temp_dir: temp_dir,
        })
    }
}

impl LoopEncoder for FfmpegCliEncoder {
    fn begin(&mut self, width: u32, height: u32, frame_rate: f64) -> Result<()> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pixel_format", "rgb24"])
            .arg("-video_size")
            .arg(format!("{width}x{height}"))
            .arg("-framerate")
            .arg(format!("{frame_rate}"))
            .args(["-i", "-"])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"])
            .args(["-movflags", "+faststart", "-y"])
            .arg(&self.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AnalysisError::EncodingFailure(format!("failed to spawn ffmpeg: {e}")))?;

        self.stdin = child.stdin.take();
        self.child = Some(child);
        Ok(())
    }

    fn write_frame(&mut self, frame: &PixelBuffer) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AnalysisError::EncodingFailure("encoder not started".to_string()))?;
        stdin
            .write_all(frame.data())
            .map_err(|e| AnalysisError::EncodingFailure(format!("encoder rejected frame: {e}")))
    }

    fn finish(&mut self) -> Result<Vec<u8>> {
        // Closing stdin signals end of input
        self.stdin.take();
        let child = self
            .child
            .take()
            .ok_or_else(|| AnalysisError::EncodingFailure("encoder not started".to_string()))?;
        let output = child
            .wait_with_output()
            .map_err(|e| AnalysisError::EncodingFailure(format!("ffmpeg wait failed: {e}")))?;
        if !output.status.success() {
            return Err(AnalysisError::EncodingFailure(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(std::fs::read(&self.output_path)?)
    }
}

/// Encode a raster as a JPEG still
fn encode_jpeg(frame: &PixelBuffer, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality).write_image(
        frame.data(),
        frame.width(),
        frame.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(bytes)
}

/// Replays a loop segment into an encoder
#[derive(Debug, Clone)]
pub struct LoopRenderer {
    config: RenderConfig,
}

impl LoopRenderer {
    #[must_use]
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    /// Render a loop from an already opened source into the given encoder.
    ///
    /// Frames are requested strictly below `spec.end_secs`, so a loop ending
    /// exactly at the video duration never seeks out of range.
    pub fn render_source(
        &self,
        source: &mut dyn VideoSource,
        spec: &LoopSpec,
        encoder: &mut dyn LoopEncoder,
    ) -> Result<RenderOutput> {
        let duration = source.metadata().duration_secs;
        if duration <= 0.0 {
            return Err(AnalysisError::SourceUnreadable(
                "source has no duration to render from".to_string(),
            ));
        }
        if !(spec.start_secs >= 0.0
            && spec.start_secs < spec.end_secs
            && spec.end_secs <= duration + 1e-6)
        {
            return Err(AnalysisError::InvalidLoopSpec(format!(
                "segment {:.3}s..{:.3}s does not fit video of {duration:.3}s",
                spec.start_secs, spec.end_secs
            )));
        }

        let started = Instant::now();
        let budget = Duration::from_secs(self.config.render_timeout_secs);
        let seek_deadline = Duration::from_millis(self.config.seek_timeout_ms);
        let frame_rate = self.config.frame_rate;
        let frames_per_pass = ((spec.duration() * frame_rate).round() as usize).max(1);

        info!(
            "rendering {:.3}s..{:.3}s x{} at {frame_rate}fps ({frames_per_pass} frames/pass)",
            spec.start_secs, spec.end_secs, self.config.repeat_count
        );

        let mut last_drawn: Option<PixelBuffer> = None;
        let mut began = false;
        let mut written = 0usize;

        for _pass in 0..self.config.repeat_count {
            for k in 0..frames_per_pass {
                if started.elapsed() > budget {
                    return Err(AnalysisError::RenderTimeout(
                        self.config.render_timeout_secs,
                    ));
                }
                let time = spec.start_secs + k as f64 / frame_rate;
                match source.frame_at(time, seek_deadline) {
                    Ok(buffer) => match &mut last_drawn {
                        Some(drawn) => drawn.copy_from(buffer),
                        None => last_drawn = Some(buffer.clone()),
                    },
                    Err(err) => {
                        debug!("frame at {time:.3}s failed ({err}), reusing last drawn frame");
                    }
                }
                let Some(frame) = last_drawn.as_ref() else {
                    continue;
                };
                if !began {
                    encoder.begin(frame.width(), frame.height(), frame_rate)?;
                    began = true;
                }
                encoder.write_frame(frame)?;
                written += 1;
            }
        }

        if written == 0 {
            return Err(AnalysisError::EncodingFailure(
                "no frames decoded for render".to_string(),
            ));
        }
        let video = encoder.finish()?;

        let thumbnail_frame = match source.frame_at(spec.midpoint(), seek_deadline) {
            Ok(buffer) => buffer.clone(),
            Err(err) => {
                debug!("thumbnail seek failed ({err}), reusing last drawn frame");
                match last_drawn.take() {
                    Some(buffer) => buffer,
                    None => {
                        return Err(AnalysisError::EncodingFailure(
                            "no frame available for thumbnail".to_string(),
                        ))
                    }
                }
            }
        };
        let thumbnail = encode_jpeg(&thumbnail_frame, self.config.thumbnail_quality)?;

        info!("render finished: {written} frames, {} bytes", video.len());
        Ok(RenderOutput { video, thumbnail })
    }

    /// Open the video independently and render the loop with the production
    /// encoder, bounded by the configured wall-clock budget.
    pub async fn render_file(&self, path: &Path, spec: LoopSpec) -> Result<RenderOutput> {
        let timeout_secs = self.config.render_timeout_secs;
        let renderer = self.clone();
        let path = path.to_path_buf();

        let task = tokio::task::spawn_blocking(move || {
            let mut source = FfmpegSource::open_scaled(
                &path,
                renderer.config.max_width,
                renderer.config.max_height,
            )?;
            let mut encoder = FfmpegCliEncoder::new()?;
            renderer.render_source(&mut source, &spec, &mut encoder)
        });

        match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(AnalysisError::Other(format!(
                "render task failed: {join_err}"
            ))),
            Err(_) => Err(AnalysisError::RenderTimeout(timeout_secs)),
        }
    }
}
