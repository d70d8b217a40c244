use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use engine::render::RenderCommand;
use engine::timeline::{secs_to_ticks, ticks_to_secs, AspectRatio, TICKS_PER_SECOND};

use crate::media::Compositor;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_ticks: i64,
    pub width: i32,
    pub height: i32,
    pub has_video: bool,
    pub has_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutput {
    format: Option<FormatInfo>,
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FormatInfo {
    duration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamInfo {
    codec_type: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
}

pub struct FFmpegWrapper;

impl FFmpegWrapper {
    pub async fn probe(media_path: &Path) -> Result<MediaInfo> {
        let output = Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "format=duration:stream=codec_type,width,height", "-of", "json"])
            .arg(media_path)
            .output()
            .await
            .context("Failed to execute ffprobe. Make sure FFmpeg is installed.")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed on {}: {}", media_path.display(), stderr);
        }

        parse_probe_output(&output.stdout)
    }

    pub async fn run(args: &[String]) -> Result<()> {
        debug!("[Media] ffmpeg {}", args.join(" "));
        let output = Command::new("ffmpeg")
            .args(args)
            .output()
            .await
            .context("Failed to execute ffmpeg. Make sure FFmpeg is installed.")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg failed: {}", stderr.trim());
        }
        Ok(())
    }
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<MediaInfo> {
    let probe_output: ProbeOutput =
        serde_json::from_slice(stdout).context("Failed to parse ffprobe JSON output")?;

    let duration_seconds = probe_output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .context("ffprobe reported no duration")?;

    let video_stream = probe_output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let (width, height) = video_stream
        .map(|vs| (vs.width.unwrap_or(0), vs.height.unwrap_or(0)))
        .unwrap_or((0, 0));
    let has_audio = probe_output
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(MediaInfo {
        duration_ticks: secs_to_ticks(duration_seconds),
        width,
        height,
        has_video: video_stream.is_some(),
        has_audio,
    })
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// drawtext treats these as syntax.
fn drawtext_escape(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\'' | ':' | '\\' | '%' | '\n' | '\r'))
        .take(80)
        .collect()
}

fn scale_pad(aspect: AspectRatio, fps: u32) -> String {
    let res = aspect.resolution();
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p",
        w = res.width,
        h = res.height,
        fps = fps
    )
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// `Compositor` backed by the ffmpeg/ffprobe command-line tools.
pub struct FfmpegCompositor {
    fps: u32,
}

impl FfmpegCompositor {
    pub fn new(fps: u32) -> Self {
        FfmpegCompositor { fps: fps.max(1) }
    }
}

#[async_trait]
impl Compositor for FfmpegCompositor {
    async fn probe_duration(&self, path: &Path) -> Result<i64> {
        Ok(FFmpegWrapper::probe(path).await?.duration_ticks)
    }

    async fn render_silence(&self, duration_ticks: i64, out: &Path) -> Result<()> {
        ensure_parent(out).await?;
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            "anullsrc=r=48000:cl=stereo".into(),
            "-t".into(),
            format!("{:.6}", ticks_to_secs(duration_ticks)),
            "-c:a".into(),
            "pcm_s16le".into(),
            "-y".into(),
            path_arg(out),
        ];
        FFmpegWrapper::run(&args).await.context("failed to render silence")
    }

    async fn render_placeholder(
        &self,
        text: &str,
        duration_ticks: i64,
        aspect: AspectRatio,
        out: &Path,
    ) -> Result<()> {
        ensure_parent(out).await?;
        let res = aspect.resolution();
        let seconds = format!("{:.6}", ticks_to_secs(duration_ticks));
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            format!("color=c=0x1b1b2f:s={}x{}:r={}:d={}", res.width, res.height, self.fps, seconds),
            "-vf".into(),
            format!(
                "drawtext=text='{}':fontcolor=white:fontsize=48:x=(w-text_w)/2:y=(h-text_h)/2,format=yuv420p",
                drawtext_escape(text)
            ),
            "-c:v".into(),
            "libx264".into(),
            "-t".into(),
            seconds,
            "-y".into(),
            path_arg(out),
        ];
        FFmpegWrapper::run(&args).await.context("failed to render placeholder clip")
    }

    async fn render_slideshow(
        &self,
        images: &[PathBuf],
        images_per_second: f64,
        aspect: AspectRatio,
        out: &Path,
    ) -> Result<i64> {
        anyhow::ensure!(!images.is_empty(), "slideshow needs at least one image");
        anyhow::ensure!(images_per_second > 0.0, "images per second must be positive");
        ensure_parent(out).await?;

        // Concat demuxer list; the last file is repeated so its duration holds.
        let per_image = 1.0 / images_per_second;
        let mut list = String::new();
        for image in images {
            list.push_str(&format!("file '{}'\nduration {:.6}\n", image.display(), per_image));
        }
        if let Some(last) = images.last() {
            list.push_str(&format!("file '{}'\n", last.display()));
        }
        let list_path = out.with_extension("txt");
        tokio::fs::write(&list_path, list)
            .await
            .with_context(|| format!("failed to write concat list '{}'", list_path.display()))?;

        let total = images.len() as f64 * per_image;
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            path_arg(&list_path),
            "-vf".into(),
            scale_pad(aspect, self.fps),
            "-c:v".into(),
            "libx264".into(),
            "-t".into(),
            format!("{:.6}", total),
            "-y".into(),
            path_arg(out),
        ];
        FFmpegWrapper::run(&args).await.context("failed to assemble image sequence")?;
        self.probe_duration(out).await
    }

    async fn compose(&self, command: &RenderCommand) -> Result<i64> {
        ensure_parent(&command.output_path).await?;
        FFmpegWrapper::run(&command.ffmpeg_args)
            .await
            .context("final assembly failed")?;
        let measured = self.probe_duration(&command.output_path).await?;
        debug!(
            "[Media] composed {} ({:.3}s)",
            command.output_path.display(),
            measured as f64 / TICKS_PER_SECOND as f64
        );
        Ok(measured)
    }
}
