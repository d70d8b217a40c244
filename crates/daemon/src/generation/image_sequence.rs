use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use engine::timeline::{GenerationRequest, Tier};

use crate::generation::video_service::{build_client, classify_code, classify_status, classify_transport, download, ErrorDetail};
use crate::generation::{artifact_path, GeneratedClip, TierBackend, TierFailure};
use crate::media::Compositor;

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

/// Number of stills requested for a clip of `duration_secs`.
pub fn image_count(duration_secs: f64, images_per_second: f64) -> usize {
    ((duration_secs * images_per_second).round() as usize).max(1)
}

/// Secondary tier: stills from an image service, assembled into a slideshow
/// clip by the composition tool. Its probed duration is approximate.
pub struct ImageSequenceBackend {
    client: reqwest::Client,
    base_url: String,
    images_per_second: f64,
    compositor: Arc<dyn Compositor>,
}

impl ImageSequenceBackend {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        images_per_second: f64,
        compositor: Arc<dyn Compositor>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(images_per_second > 0.0, "images per second must be positive");
        Ok(ImageSequenceBackend {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            images_per_second,
            compositor,
        })
    }
}

#[async_trait]
impl TierBackend for ImageSequenceBackend {
    fn tier(&self) -> Tier {
        Tier::Secondary
    }

    async fn generate(&self, request: &GenerationRequest, out_dir: &Path) -> Result<GeneratedClip, TierFailure> {
        let count = image_count(request.duration_target_secs(), self.images_per_second);
        let response = self
            .client
            .post(format!("{}/v1/images", self.base_url))
            .json(&serde_json::json!({
                "prompt": request.content_prompt,
                "count": count,
                "aspect_ratio": request.platform_aspect.as_str(),
            }))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let parsed: ImagesResponse = serde_json::from_str(&body)
            .map_err(|e| TierFailure::Transient(format!("invalid response from image service: {}", e)))?;
        if let Some(err) = parsed.error {
            let message = err.message.unwrap_or_else(|| "image service error".to_string());
            return Err(classify_code(err.code.as_deref().unwrap_or_default(), message));
        }
        if parsed.images.is_empty() {
            return Err(TierFailure::Transient("image service returned no images".to_string()));
        }

        let clip_path = artifact_path(out_dir, Tier::Secondary, request, "mp4");
        let stills_dir = clip_path.with_extension("frames");
        let mut stills: Vec<PathBuf> = Vec::with_capacity(parsed.images.len());
        for (n, url) in parsed.images.iter().enumerate() {
            let still = stills_dir.join(format!("{:04}.png", n));
            download(&self.client, url, &still).await?;
            stills.push(still);
        }

        let measured_duration_ticks = self
            .compositor
            .render_slideshow(&stills, self.images_per_second, request.platform_aspect, &clip_path)
            .await?;
        debug!(
            "[Generation] image sequence {} ({} stills) measured {} ticks",
            request.sequence_index,
            stills.len(),
            measured_duration_ticks
        );
        Ok(GeneratedClip {
            path: clip_path,
            measured_duration_ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_count_follows_density() {
        assert_eq!(image_count(10.0, 0.5), 5);
        assert_eq!(image_count(7.0, 0.5), 4);
        assert_eq!(image_count(0.4, 0.5), 1);
        assert_eq!(image_count(10.0, 2.0), 20);
    }
}
