use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use engine::timeline::{GenerationRequest, Tier};

use crate::generation::{GeneratedClip, TierBackend, TierFailure};
use crate::media::{fingerprint, Compositor};

/// Terminal tier. A colour card sized to exactly the requested duration,
/// so the clip's duration is known without probing.
pub struct PlaceholderBackend {
    compositor: Arc<dyn Compositor>,
}

impl PlaceholderBackend {
    pub fn new(compositor: Arc<dyn Compositor>) -> Self {
        PlaceholderBackend { compositor }
    }
}

#[async_trait]
impl TierBackend for PlaceholderBackend {
    fn tier(&self) -> Tier {
        Tier::Fallback
    }

    async fn generate(&self, request: &GenerationRequest, out_dir: &Path) -> Result<GeneratedClip, TierFailure> {
        let name = fingerprint(&[
            &request.sequence_index.to_string(),
            &request.duration_target_ticks.to_string(),
            request.platform_aspect.as_str(),
        ]);
        let path = out_dir.join(format!("fallback_{}.mp4", name));
        self.compositor
            .render_placeholder(
                &request.content_prompt,
                request.duration_target_ticks,
                request.platform_aspect,
                &path,
            )
            .await?;
        Ok(GeneratedClip {
            path,
            measured_duration_ticks: request.duration_target_ticks,
        })
    }
}
