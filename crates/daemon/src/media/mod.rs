pub mod ffmpeg;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use engine::render::RenderCommand;
use engine::timeline::AspectRatio;

/// The external composition tool. Every method is a pure function of its
/// inputs: ordered media plus explicit timing in, file plus measured
/// duration out.
#[async_trait]
pub trait Compositor: Send + Sync {
    /// Measured duration of a media file, in ticks.
    async fn probe_duration(&self, path: &Path) -> Result<i64>;

    async fn render_silence(&self, duration_ticks: i64, out: &Path) -> Result<()>;

    async fn render_placeholder(
        &self,
        text: &str,
        duration_ticks: i64,
        aspect: AspectRatio,
        out: &Path,
    ) -> Result<()>;

    /// Returns the measured duration of the assembled slideshow.
    async fn render_slideshow(
        &self,
        images: &[PathBuf],
        images_per_second: f64,
        aspect: AspectRatio,
        out: &Path,
    ) -> Result<i64>;

    /// Run a final assembly command; returns the measured output duration.
    async fn compose(&self, command: &RenderCommand) -> Result<i64>;
}

pub async fn compute_file_checksum(file_path: &Path) -> Result<String> {
    let file = File::open(file_path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Short stable hex fingerprint of `parts`.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}
