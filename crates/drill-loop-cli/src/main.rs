//! Drill Loop CLI - repetition analysis and loop export for drill videos
//!
//! Command-line interface over the loop analysis engine and renderer.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use drill_loop_analyzer::{AnalyzerConfig, LoopAnalyzer};
use drill_loop_common::LoopSpec;
use drill_loop_renderer::{LoopRenderer, RenderConfig};
use drill_loop_source::FfmpegSource;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "drill-loop",
    version,
    about = "Find and export the best repetition loop in a training-drill video",
    after_help = "EXAMPLES:\n  \
                  # Probe a clip\n  \
                  drill-loop inspect drill.mp4\n\n  \
                  # Analyze and print the result as JSON\n  \
                  drill-loop analyze drill.mp4 --pretty\n  \
                  drill-loop analyze drill.mp4 --fps 8 --max-frames 400\n\n  \
                  # Render the detected loop plus a thumbnail\n  \
                  drill-loop render drill.mp4 --out loop.mp4 --thumbnail thumb.jpg\n  \
                  # Render an explicit segment without analysis\n  \
                  drill-loop render drill.mp4 --start 2.5 --end 4.5"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe a video and print its metadata as JSON
    Inspect {
        /// Input video file
        video: PathBuf,
    },

    /// Detect the best repetition loop segment
    Analyze {
        /// Input video file
        video: PathBuf,

        /// YAML configuration file (flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target sample rate in frames per second
        #[arg(long)]
        fps: Option<f64>,

        /// Hard cap on sampled frames
        #[arg(long)]
        max_frames: Option<usize>,

        /// Fingerprint block edge length in pixels
        #[arg(long)]
        block_size: Option<u32>,

        /// Analysis wall-clock budget in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Pretty-print the JSON result
        #[arg(long)]
        pretty: bool,
    },

    /// Render the selected loop segment and its thumbnail
    Render {
        /// Input video file
        video: PathBuf,

        /// YAML configuration file (flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Explicit loop start in seconds (with --end, skips analysis)
        #[arg(long)]
        start: Option<f64>,

        /// Explicit loop end in seconds (with --start, skips analysis)
        #[arg(long)]
        end: Option<f64>,

        /// Number of passes over the loop segment
        #[arg(long)]
        repeat: Option<u32>,

        /// Output frame rate
        #[arg(long)]
        fps: Option<f64>,

        /// Output video path
        #[arg(short, long, default_value = "loop.mp4")]
        out: PathBuf,

        /// Output thumbnail path
        #[arg(long, default_value = "loop_thumb.jpg")]
        thumbnail: PathBuf,
    },
}

/// On-disk configuration: analyzer and render sections, both optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppConfig {
    analyzer: AnalyzerConfig,
    render: RenderConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(AppConfig::default()),
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Inspect { video } => {
            let metadata = tokio::task::spawn_blocking({
                let video = video.clone();
                move || FfmpegSource::open(&video).map(|source| source.metadata().clone())
            })
            .await
            .context("inspect task failed")?
            .with_context(|| format!("probing {}", video.display()))?;

            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "duration_secs": metadata.duration_secs,
                    "width": metadata.width,
                    "height": metadata.height,
                }))?
            );
        }

        Commands::Analyze {
            video,
            config,
            fps,
            max_frames,
            block_size,
            timeout,
            pretty,
        } => {
            let mut app = load_config(config.as_ref())?;
            if let Some(fps) = fps {
                app.analyzer.sampler.sample_rate = fps;
            }
            if let Some(max_frames) = max_frames {
                app.analyzer.sampler.max_frames = max_frames;
            }
            if let Some(block_size) = block_size {
                app.analyzer.scorer.block_size = block_size;
            }
            if let Some(timeout) = timeout {
                app.analyzer.analysis_timeout_secs = timeout;
            }

            let analyzer = LoopAnalyzer::new(app.analyzer);
            let result = analyzer
                .analyze_file(&video)
                .await
                .with_context(|| format!("analyzing {}", video.display()))?;

            let json = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{json}");
        }

        Commands::Render {
            video,
            config,
            start,
            end,
            repeat,
            fps,
            out,
            thumbnail,
        } => {
            let mut app = load_config(config.as_ref())?;
            if let Some(repeat) = repeat {
                app.render.repeat_count = repeat;
            }
            if let Some(fps) = fps {
                app.render.frame_rate = fps;
            }

            let spec = match (start, end) {
                (Some(start), Some(end)) => LoopSpec::new(start, end)?,
                _ => {
                    let analyzer = LoopAnalyzer::new(app.analyzer);
                    let result = analyzer
                        .analyze_file(&video)
                        .await
                        .with_context(|| format!("analyzing {}", video.display()))?;
                    if result.loop_end_secs <= result.loop_start_secs {
                        anyhow::bail!(
                            "analysis produced no usable loop segment for {}",
                            video.display()
                        );
                    }
                    info!(
                        "analysis chose loop {:.2}s..{:.2}s (confidence {:.2})",
                        result.loop_start_secs, result.loop_end_secs, result.confidence
                    );
                    result.loop_spec()
                }
            };

            let renderer = LoopRenderer::new(app.render);
            let output = renderer
                .render_file(&video, spec)
                .await
                .with_context(|| format!("rendering {}", video.display()))?;

            std::fs::write(&out, &output.video)
                .with_context(|| format!("writing {}", out.display()))?;
            std::fs::write(&thumbnail, &output.thumbnail)
                .with_context(|| format!("writing {}", thumbnail.display()))?;
            info!(
                "wrote {} ({} bytes) and {} ({} bytes)",
                out.display(),
                output.video.len(),
                thumbnail.display(),
                output.thumbnail.len()
            );
        }
    }

    Ok(())
}
