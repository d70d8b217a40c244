use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine::captions::{derive_captions, CaptionConfig};
use engine::decision::{decide, DecisionConfig, DecisionRecord, JobParams};
use engine::error::{OrchestratorError, OrchestratorResult, ToleranceViolation};
use engine::ops::Tracks;
use engine::reconcile::{reconcile, ReconciliationPlan};
use engine::timeline::{ticks_to_secs, AudioSegment, CaptionCue, ClipArtifact};

use crate::assembly::AssemblyEmitter;
use crate::config::DaemonConfig;
use crate::generation::image_sequence::ImageSequenceBackend;
use crate::generation::placeholder::PlaceholderBackend;
use crate::generation::video_service::HttpVideoBackend;
use crate::generation::{AttemptLog, GenerationContext, TieredExecutor};
use crate::llm::{CreativeSource, HttpCreativeSource, StaticCreativeSource};
use crate::media::ffmpeg::FfmpegCompositor;
use crate::media::{compute_file_checksum, Compositor};
use crate::planner;
use crate::speech::{HttpSpeechBackend, SpeechCoordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Deciding,
    Planning,
    Generating,
    Reconciling,
    Captioning,
    Assembling,
    Done,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Deciding => "deciding",
            JobStage::Planning => "planning",
            JobStage::Generating => "generating",
            JobStage::Reconciling => "reconciling",
            JobStage::Captioning => "captioning",
            JobStage::Assembling => "assembling",
            JobStage::Done => "done",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a finished job produced. A report with a tolerance violation
/// still points at a playable file but must not be published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: i64,
    pub decision: DecisionRecord,
    pub plan: ReconciliationPlan,
    pub clips: Vec<ClipArtifact>,
    /// Audio after reconciliation; captions are timed against this.
    pub audio: Vec<AudioSegment>,
    pub captions: Vec<CaptionCue>,
    pub output_path: PathBuf,
    pub final_duration_ticks: i64,
    pub checksum: Option<String>,
    pub tolerance_violation: Option<ToleranceViolation>,
}

impl JobReport {
    pub fn is_publishable(&self) -> bool {
        self.tolerance_violation.is_none()
    }

    pub fn ensure_publishable(&self) -> OrchestratorResult<()> {
        match &self.tolerance_violation {
            Some(violation) => Err(OrchestratorError::DurationOutOfTolerance(violation.clone())),
            None => Ok(()),
        }
    }
}

fn ensure_active(cancel: &CancellationToken, stage: JobStage) -> OrchestratorResult<()> {
    if cancel.is_cancelled() {
        return Err(OrchestratorError::cancelled(stage.as_str()));
    }
    Ok(())
}

/// Sequences the stages of one job: decide, brief, plan, generate and
/// synthesize concurrently, reconcile, caption, assemble.
pub struct Orchestrator {
    decision_config: DecisionConfig,
    captions: CaptionConfig,
    worker_limit: usize,
    work_dir: PathBuf,
    creative: Arc<dyn CreativeSource>,
    executor: TieredExecutor,
    speech: SpeechCoordinator,
    emitter: AssemblyEmitter,
}

impl Orchestrator {
    pub fn new(
        config: &DaemonConfig,
        creative: Arc<dyn CreativeSource>,
        executor: TieredExecutor,
        speech: SpeechCoordinator,
        emitter: AssemblyEmitter,
    ) -> Self {
        Orchestrator {
            decision_config: config.decision.clone(),
            captions: config.captions.clone(),
            worker_limit: config.worker_limit.max(1),
            work_dir: config.work_dir.clone(),
            creative,
            executor,
            speech,
            emitter,
        }
    }

    /// Wire the production backends from configuration.
    pub fn from_config(config: &DaemonConfig) -> anyhow::Result<Self> {
        let services = &config.services;
        let compositor: Arc<dyn Compositor> = Arc::new(FfmpegCompositor::new(config.fps));

        let creative: Arc<dyn CreativeSource> = match &services.creative_url {
            Some(url) => Arc::new(HttpCreativeSource::new(url.clone(), services.request_timeout)?),
            None => Arc::new(StaticCreativeSource),
        };

        let executor = TieredExecutor::new(Arc::new(PlaceholderBackend::new(compositor.clone())))
            .with_tier(
                Arc::new(HttpVideoBackend::new(
                    services.video_url.clone(),
                    services.request_timeout,
                    compositor.clone(),
                )?),
                config.primary_retry,
            )
            .with_tier(
                Arc::new(ImageSequenceBackend::new(
                    services.image_url.clone(),
                    services.request_timeout,
                    config.images_per_second,
                    compositor.clone(),
                )?),
                config.secondary_retry,
            );

        let speech = SpeechCoordinator::new(
            Arc::new(HttpSpeechBackend::new(services.speech_url.clone(), services.request_timeout)?),
            compositor.clone(),
            config.voices.clone(),
            config.speech_retry,
            config.worker_limit,
        );

        let emitter = AssemblyEmitter::new(compositor, config.fps, config.assembly_epsilon_ticks);

        Ok(Self::new(config, creative, executor, speech, emitter))
    }

    /// Validate parameters without touching any external service.
    pub fn decide(&self, params: &JobParams) -> OrchestratorResult<DecisionRecord> {
        decide(params, &self.decision_config)
    }

    pub async fn run(
        &self,
        job_id: i64,
        mission: &str,
        params: &JobParams,
        cancel: &CancellationToken,
        log: Arc<AttemptLog>,
        observer: &(dyn Fn(JobStage) + Send + Sync),
    ) -> OrchestratorResult<JobReport> {
        observer(JobStage::Deciding);
        let decision = self.decide(params)?;
        info!(
            "[Jobs] job {} decided: {:.3}s on {}, {} clips, tolerance {:.3}s",
            job_id,
            ticks_to_secs(decision.target_duration_ticks),
            decision.platform,
            decision.clip_count,
            ticks_to_secs(decision.tolerance_ticks())
        );

        ensure_active(cancel, JobStage::Planning)?;
        observer(JobStage::Planning);
        let brief = self.creative.brief(mission, &decision).await?;
        let requests = planner::plan(&decision, &brief);

        ensure_active(cancel, JobStage::Generating)?;
        observer(JobStage::Generating);
        let job_dir = self.work_dir.join(format!("job_{}", job_id));
        let ctx = GenerationContext::new(job_dir.join("clips"), log.clone(), cancel.clone());
        let audio_dir = job_dir.join("audio");
        // Generation and speech have no data dependency; both finish before reconciling.
        let (clips, audio) = tokio::join!(
            self.executor.generate_all(requests, &ctx, self.worker_limit),
            self.speech.synthesize(&brief.script, &decision, &audio_dir, cancel),
        );
        let clips = clips?;
        let audio = audio?;

        ensure_active(cancel, JobStage::Reconciling)?;
        observer(JobStage::Reconciling);
        let plan = reconcile(&decision, &clips, &audio);
        info!(
            "[Reconcile] job {} governing {:.3}s, delta {:+.3}s, {} adjustments",
            job_id,
            ticks_to_secs(plan.total_measured_duration_ticks),
            ticks_to_secs(plan.delta_from_target_ticks),
            plan.adjustments.len()
        );
        if let Some(violation) = &plan.tolerance_violation {
            warn!("[Reconcile] job {} flagged: {}", job_id, violation);
        }

        let mut tracks = Tracks::new(clips.clone(), audio.clone());
        tracks
            .apply_plan(&plan)
            .map_err(|e| OrchestratorError::assembly(e, log.snapshot()))?;

        observer(JobStage::Captioning);
        let captions = derive_captions(&brief.script, &tracks.audio, &self.captions);

        ensure_active(cancel, JobStage::Assembling)?;
        observer(JobStage::Assembling);
        let output_path = job_dir.join("final.mp4");
        let outcome = self
            .emitter
            .emit(&decision, &clips, &audio, &captions, &plan, &output_path, &log)
            .await?;

        let checksum = match compute_file_checksum(&outcome.output_path).await {
            Ok(sum) => Some(sum),
            Err(e) => {
                warn!("[Assembly] could not checksum {}: {}", outcome.output_path.display(), e);
                None
            }
        };

        let tolerance_violation = plan.tolerance_violation.clone().or_else(|| {
            (!decision.is_within_tolerance(outcome.final_duration_ticks)).then(|| ToleranceViolation {
                target_ticks: decision.target_duration_ticks,
                actual_ticks: outcome.final_duration_ticks,
                tolerance_ticks: decision.tolerance_ticks(),
                reason: "assembled output outside the tolerance band".to_string(),
            })
        });

        observer(JobStage::Done);
        info!(
            "[Jobs] job {} assembled {:.3}s at {}",
            job_id,
            ticks_to_secs(outcome.final_duration_ticks),
            outcome.output_path.display()
        );

        Ok(JobReport {
            job_id,
            decision,
            plan,
            clips,
            audio: tracks.audio,
            captions,
            output_path: outcome.output_path,
            final_duration_ticks: outcome.final_duration_ticks,
            checksum,
            tolerance_violation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::TierFailure;
    use crate::testing::{params, test_orchestrator, MockCompositor, MockSpeech, ScriptedBackend};
    use engine::captions::cues_are_well_formed;
    use engine::reconcile::AdjustmentKind;
    use engine::timeline::{secs_to_ticks, Tier, TrackKind};
    use std::sync::Mutex;

    fn no_observer(_: JobStage) {}

    #[tokio::test]
    async fn measured_drift_within_tolerance_needs_no_edits() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 10.0)
            .with_duration(0, 9.8)
            .with_duration(1, 10.3);
        let compositor = Arc::new(MockCompositor::with_probe_secs(29.4));
        let t = test_orchestrator(primary.clone(), compositor, Arc::new(MockSpeech::default()));
        let log = Arc::new(AttemptLog::new());
        let stages = Mutex::new(Vec::new());
        let observer = |stage: JobStage| stages.lock().unwrap().push(stage);

        let report = t
            .orchestrator
            .run(1, "One long narrated line", &params(30.0, Some(0.05)), &CancellationToken::new(), log.clone(), &observer)
            .await
            .unwrap();

        assert!(report.plan.is_empty());
        assert_eq!(report.plan.total_measured_duration_ticks, secs_to_ticks(30.1));
        assert_eq!(report.final_duration_ticks, secs_to_ticks(30.1));
        assert!(report.is_publishable());
        assert_eq!(primary.calls(), 3);
        assert_eq!(log.len(), 3);
        let last_cue_end = report.captions.last().unwrap().end_ticks;
        assert!(last_cue_end <= secs_to_ticks(29.4));
        assert!(cues_are_well_formed(&report.captions));
        assert_eq!(stages.lock().unwrap().last(), Some(&JobStage::Done));
    }

    #[tokio::test]
    async fn overrun_trims_only_the_fallback_clip() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 10.0)
            .with_duration(0, 15.0)
            .failing_for(1, TierFailure::ContentPolicyRejected("blocked".into()));
        let compositor = Arc::new(MockCompositor::with_probe_secs(14.0));
        let t = test_orchestrator(primary, compositor, Arc::new(MockSpeech::default()));
        t.secondary
            .clone()
            .failing_for(1, TierFailure::ContentPolicyRejected("blocked".into()));

        let report = t
            .orchestrator
            .run(3, "Short line", &params(20.0, Some(0.05)), &CancellationToken::new(), Arc::new(AttemptLog::new()), &no_observer)
            .await
            .unwrap();

        assert_eq!(report.clips[0].tier, Tier::Primary);
        assert_eq!(report.clips[1].tier, Tier::Fallback);
        assert_eq!(report.plan.total_measured_duration_ticks, secs_to_ticks(25.0));
        assert_eq!(report.plan.adjustments.len(), 1);
        let adjustment = &report.plan.adjustments[0];
        assert_eq!(adjustment.track, TrackKind::Video);
        assert_eq!(adjustment.kind, AdjustmentKind::Trim);
        assert_eq!(adjustment.segment_index, 1);
        assert_eq!(adjustment.amount_ticks, secs_to_ticks(4.0));
        assert!(report.final_duration_ticks >= secs_to_ticks(19.0));
        assert!(report.final_duration_ticks <= secs_to_ticks(21.0));
        assert!(report.is_publishable());
    }

    #[tokio::test]
    async fn underrun_holds_the_final_frame() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 10.0).with_duration(0, 5.0);
        let compositor = Arc::new(MockCompositor::with_probe_secs(14.0));
        let t = test_orchestrator(primary, compositor, Arc::new(MockSpeech::default()));

        let report = t
            .orchestrator
            .run(2, "Short line", &params(20.0, Some(0.05)), &CancellationToken::new(), Arc::new(AttemptLog::new()), &no_observer)
            .await
            .unwrap();

        // 20s on tiktok is two 10s requests; the first came back at 5s.
        assert_eq!(report.plan.adjustments.len(), 1);
        let adjustment = &report.plan.adjustments[0];
        assert_eq!(adjustment.track, TrackKind::Video);
        assert_eq!(adjustment.kind, AdjustmentKind::Extend);
        assert_eq!(adjustment.segment_index, 1);
        assert_eq!(adjustment.amount_ticks, secs_to_ticks(5.0));
        assert_eq!(report.final_duration_ticks, secs_to_ticks(20.0));
        assert_eq!(report.audio[0].measured_duration_ticks, secs_to_ticks(14.0));
        assert!(report.is_publishable());
    }

    #[tokio::test]
    async fn reconciliation_waits_for_slow_narration() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 9.5);
        let compositor = Arc::new(MockCompositor::with_probe_secs(20.5));
        let speech = Arc::new(MockSpeech::delayed(std::time::Duration::from_millis(100)));
        let t = test_orchestrator(primary.clone(), compositor, speech.clone());

        let report = t
            .orchestrator
            .run(4, "Line", &params(20.0, Some(0.05)), &CancellationToken::new(), Arc::new(AttemptLog::new()), &no_observer)
            .await
            .unwrap();

        assert_eq!(primary.calls(), 2);
        assert_eq!(speech.completed(), 1);
        assert_eq!(report.audio.len(), 1);
        // Narration outlasts the 19s of clips, so it governs the measurement.
        assert_eq!(report.plan.total_measured_duration_ticks, secs_to_ticks(20.5));
        assert!(report.plan.is_empty());
        assert_eq!(report.final_duration_ticks, secs_to_ticks(20.5));
    }

    #[tokio::test]
    async fn invalid_duration_makes_zero_external_calls() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 10.0);
        let compositor = Arc::new(MockCompositor::default());
        let speech = Arc::new(MockSpeech::default());
        let t = test_orchestrator(primary.clone(), compositor.clone(), speech.clone());

        let err = t
            .orchestrator
            .run(3, "Mission", &params(2.0, None), &CancellationToken::new(), Arc::new(AttemptLog::new()), &no_observer)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::InvalidDuration { .. }));
        assert_eq!(t.creative.calls(), 0);
        assert_eq!(primary.calls(), 0);
        assert_eq!(t.secondary.calls(), 0);
        assert_eq!(t.fallback.calls(), 0);
        assert_eq!(speech.calls(), 0);
        assert_eq!(compositor.total_calls(), 0);
    }

    #[tokio::test]
    async fn oversized_gap_is_flagged_but_playable() {
        // Both clips land at 3s against 10s requests: the freeze needed on
        // the last clip is far beyond half its length.
        let primary = ScriptedBackend::succeeding(Tier::Primary, 3.0);
        let compositor = Arc::new(MockCompositor::with_probe_secs(4.0));
        let t = test_orchestrator(primary, compositor, Arc::new(MockSpeech::default()));

        let report = t
            .orchestrator
            .run(4, "Line", &params(20.0, Some(0.05)), &CancellationToken::new(), Arc::new(AttemptLog::new()), &no_observer)
            .await
            .unwrap();

        assert!(!report.is_publishable());
        assert!(matches!(
            report.ensure_publishable(),
            Err(OrchestratorError::DurationOutOfTolerance(_))
        ));
        assert!(report.checksum.is_none());
    }

    #[tokio::test]
    async fn policy_rejection_is_invisible_to_the_caller() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 10.0)
            .failing_for(1, TierFailure::ContentPolicyRejected("blocked".into()));
        let compositor = Arc::new(MockCompositor::with_probe_secs(19.0));
        let t = test_orchestrator(primary, compositor, Arc::new(MockSpeech::default()));
        let log = Arc::new(AttemptLog::new());

        let report = t
            .orchestrator
            .run(5, "Line", &params(20.0, None), &CancellationToken::new(), log.clone(), &no_observer)
            .await
            .unwrap();

        assert_eq!(report.clips[1].tier, Tier::Secondary);
        let attempts = log.for_request(1);
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success && attempts[1].success);
    }

    #[tokio::test]
    async fn cancellation_before_generation_stops_the_job() {
        let primary = ScriptedBackend::succeeding(Tier::Primary, 10.0);
        let t = test_orchestrator(primary.clone(), Arc::new(MockCompositor::default()), Arc::new(MockSpeech::default()));
        let cancel = CancellationToken::new();
        let cancel_on_plan = cancel.clone();
        let observer = move |stage: JobStage| {
            if stage == JobStage::Planning {
                cancel_on_plan.cancel();
            }
        };

        let err = t
            .orchestrator
            .run(6, "Line", &params(20.0, None), &cancel, Arc::new(AttemptLog::new()), &observer)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        assert_eq!(primary.calls(), 0);
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(serde_json::to_string(&JobStage::Assembling).unwrap(), "\"assembling\"");
        assert_eq!(JobStage::Done.to_string(), "done");
    }
}
