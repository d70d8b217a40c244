use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use engine::timeline::{GenerationRequest, Tier};

use crate::generation::{artifact_path, GeneratedClip, TierBackend, TierFailure};
use crate::media::Compositor;

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct VideoResponse {
    #[serde(default)]
    artifact_url: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

/// Map a service error code onto a failure class. Unknown codes are transient.
pub(crate) fn classify_code(code: &str, message: String) -> TierFailure {
    match code {
        "content_policy_rejected" => TierFailure::ContentPolicyRejected(message),
        "quota_exceeded" => TierFailure::QuotaExceeded(message),
        "timeout" => TierFailure::Timeout(message),
        _ => TierFailure::Transient(message),
    }
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> TierFailure {
    let detail = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let message = detail
        .as_ref()
        .and_then(|d| d.message.clone())
        .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>()));
    if let Some(code) = detail.as_ref().and_then(|d| d.code.as_deref()) {
        if code == "content_policy_rejected" || code == "quota_exceeded" {
            return classify_code(code, message);
        }
    }
    match status.as_u16() {
        429 => TierFailure::QuotaExceeded(message),
        422 | 451 => TierFailure::ContentPolicyRejected(message),
        408 | 504 => TierFailure::Timeout(message),
        _ => TierFailure::Transient(message),
    }
}

pub(crate) fn classify_transport(err: reqwest::Error) -> TierFailure {
    if err.is_timeout() {
        TierFailure::Timeout(err.to_string())
    } else {
        TierFailure::Transient(err.to_string())
    }
}

pub(crate) fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Fetch `url` into `dest`.
pub(crate) async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<(), TierFailure> {
    let response = client.get(url).send().await.map_err(classify_transport)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    let bytes = response.bytes().await.map_err(classify_transport)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TierFailure::Transient(format!("failed to create '{}': {}", parent.display(), e)))?;
    }
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| TierFailure::Transient(format!("failed to write '{}': {}", dest.display(), e)))?;
    Ok(())
}

/// Primary tier: a generative video service that returns one clip per prompt.
pub struct HttpVideoBackend {
    client: reqwest::Client,
    base_url: String,
    compositor: Arc<dyn Compositor>,
}

impl HttpVideoBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration, compositor: Arc<dyn Compositor>) -> anyhow::Result<Self> {
        Ok(HttpVideoBackend {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            compositor,
        })
    }
}

#[async_trait]
impl TierBackend for HttpVideoBackend {
    fn tier(&self) -> Tier {
        Tier::Primary
    }

    async fn generate(&self, request: &GenerationRequest, out_dir: &Path) -> Result<GeneratedClip, TierFailure> {
        let response = self
            .client
            .post(format!("{}/v1/videos", self.base_url))
            .json(&serde_json::json!({
                "prompt": request.content_prompt,
                "duration_seconds": request.duration_target_secs(),
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

        let parsed: VideoResponse = serde_json::from_str(&body)
            .map_err(|e| TierFailure::Transient(format!("invalid response from video service: {}", e)))?;
        if let Some(err) = parsed.error {
            let message = err.message.unwrap_or_else(|| "video service error".to_string());
            return Err(classify_code(err.code.as_deref().unwrap_or_default(), message));
        }
        let url = parsed
            .artifact_url
            .ok_or_else(|| TierFailure::Transient("video service returned no artifact".to_string()))?;

        let path = artifact_path(out_dir, Tier::Primary, request, "mp4");
        download(&self.client, &url, &path).await?;
        let measured_duration_ticks = self.compositor.probe_duration(&path).await?;
        debug!(
            "[Generation] primary clip {} measured {} ticks (asked {})",
            request.sequence_index, measured_duration_ticks, request.duration_target_ticks
        );
        Ok(GeneratedClip {
            path,
            measured_duration_ticks,
        })
    }
}
