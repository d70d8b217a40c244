use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use engine::captions::to_srt;
use engine::compiler::{compile_assembly, AssemblySettings};
use engine::decision::DecisionRecord;
use engine::error::{OrchestratorError, OrchestratorResult};
use engine::ops::Tracks;
use engine::reconcile::ReconciliationPlan;
use engine::render::generate_render_command;
use engine::timeline::{ticks_to_secs, AudioSegment, CaptionCue, ClipArtifact};

use crate::generation::AttemptLog;
use crate::media::Compositor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyOutcome {
    pub output_path: PathBuf,
    pub subtitle_path: Option<PathBuf>,
    pub expected_duration_ticks: i64,
    pub final_duration_ticks: i64,
}

pub struct AssemblyEmitter {
    compositor: Arc<dyn Compositor>,
    fps: u32,
    epsilon_ticks: i64,
}

impl AssemblyEmitter {
    pub fn new(compositor: Arc<dyn Compositor>, fps: u32, epsilon_ticks: i64) -> Self {
        AssemblyEmitter {
            compositor,
            fps,
            epsilon_ticks: epsilon_ticks.max(0),
        }
    }

    /// Apply `plan`, hand the timed media to the compositor, and check the
    /// produced file against the plan's expected duration. Every failure
    /// carries the attempt log.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit(
        &self,
        decision: &DecisionRecord,
        clips: &[ClipArtifact],
        audio: &[AudioSegment],
        captions: &[CaptionCue],
        plan: &ReconciliationPlan,
        output_path: &Path,
        log: &AttemptLog,
    ) -> OrchestratorResult<AssemblyOutcome> {
        let fail = |reason: String| {
            warn!("[Assembly] {}", reason);
            OrchestratorError::assembly(reason, log.snapshot())
        };

        let mut tracks = Tracks::new(clips.to_vec(), audio.to_vec());
        tracks
            .apply_plan(plan)
            .map_err(|e| fail(format!("failed to apply reconciliation plan: {}", e)))?;

        let settings = AssemblySettings {
            resolution: decision.platform_aspect.resolution(),
            fps: self.fps,
        };
        let instructions = compile_assembly(&tracks, captions, plan, settings).map_err(fail)?;
        let command = generate_render_command(&instructions, output_path.to_path_buf());

        if let Some(srt_path) = &command.subtitle_path {
            if let Some(parent) = srt_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| fail(format!("failed to create '{}': {}", parent.display(), e)))?;
            }
            tokio::fs::write(srt_path, to_srt(&instructions.captions))
                .await
                .map_err(|e| fail(format!("failed to write captions '{}': {}", srt_path.display(), e)))?;
        }

        info!(
            "[Assembly] composing {} clips, {} audio segments, {} cues into {} (expect {:.3}s)",
            instructions.video.len(),
            instructions.audio.len(),
            instructions.captions.len(),
            output_path.display(),
            ticks_to_secs(instructions.expected_duration_ticks)
        );
        let final_duration_ticks = self
            .compositor
            .compose(&command)
            .await
            .map_err(|e| fail(format!("composition failed: {:#}", e)))?;

        let drift = (final_duration_ticks - instructions.expected_duration_ticks).abs();
        if drift > self.epsilon_ticks {
            return Err(fail(format!(
                "output measured {:.3}s but {:.3}s was expected",
                ticks_to_secs(final_duration_ticks),
                ticks_to_secs(instructions.expected_duration_ticks)
            )));
        }

        Ok(AssemblyOutcome {
            output_path: command.output_path,
            subtitle_path: command.subtitle_path,
            expected_duration_ticks: instructions.expected_duration_ticks,
            final_duration_ticks,
        })
    }
}
