pub mod attempt_log;
pub mod image_sequence;
pub mod placeholder;
pub mod retry;
pub mod video_service;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine::error::{OrchestratorError, OrchestratorResult};
use engine::timeline::{ClipArtifact, GenerationRequest, Tier, TierAttemptResult};

pub use attempt_log::AttemptLog;
use retry::RetryPolicy;

/// Tier-local failure classes. They decide retry-vs-advance inside the
/// executor and never reach its caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TierFailure {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("content policy rejected: {0}")]
    ContentPolicyRejected(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl TierFailure {
    /// Quota and policy failures skip straight to the next tier.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TierFailure::Transient(_) | TierFailure::Timeout(_))
    }
}

impl From<anyhow::Error> for TierFailure {
    fn from(err: anyhow::Error) -> Self {
        TierFailure::Transient(format!("{:#}", err))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedClip {
    pub path: PathBuf,
    pub measured_duration_ticks: i64,
}

#[async_trait]
pub trait TierBackend: Send + Sync {
    fn tier(&self) -> Tier;

    async fn generate(&self, request: &GenerationRequest, out_dir: &Path) -> Result<GeneratedClip, TierFailure>;
}

/// File name for a tier artifact; stable for a given request.
pub fn artifact_path(out_dir: &Path, tier: Tier, request: &GenerationRequest, extension: &str) -> PathBuf {
    let fingerprint = crate::media::fingerprint(&[
        tier.as_str(),
        &request.sequence_index.to_string(),
        &request.duration_target_ticks.to_string(),
        request.platform_aspect.as_str(),
        &request.content_prompt,
    ]);
    out_dir.join(format!("{}_{:03}_{}.{}", tier.as_str(), request.sequence_index, fingerprint, extension))
}

#[derive(Clone)]
pub struct GenerationContext {
    pub out_dir: PathBuf,
    pub log: Arc<AttemptLog>,
    pub cancel: CancellationToken,
}

impl GenerationContext {
    pub fn new(out_dir: PathBuf, log: Arc<AttemptLog>, cancel: CancellationToken) -> Self {
        GenerationContext { out_dir, log, cancel }
    }

    pub fn ensure_active(&self) -> OrchestratorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("generation"));
        }
        Ok(())
    }

    /// Backoff wait; holds nothing open and wakes early on cancellation.
    async fn backoff(&self, delay: Duration) -> OrchestratorResult<()> {
        if delay.is_zero() {
            return self.ensure_active();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OrchestratorError::cancelled("generation")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

struct TierSlot {
    backend: Arc<dyn TierBackend>,
    policy: RetryPolicy,
}

/// Ordered fallback chain: generative tiers in rank order with their retry
/// policies, ending in a non-generative tier that is tried once.
pub struct TieredExecutor {
    tiers: Vec<TierSlot>,
    fallback: Arc<dyn TierBackend>,
}

impl TieredExecutor {
    pub fn new(fallback: Arc<dyn TierBackend>) -> Self {
        TieredExecutor {
            tiers: Vec::new(),
            fallback,
        }
    }

    pub fn with_tier(mut self, backend: Arc<dyn TierBackend>, policy: RetryPolicy) -> Self {
        self.tiers.push(TierSlot { backend, policy });
        self
    }

    fn record(
        ctx: &GenerationContext,
        request: &GenerationRequest,
        tier: Tier,
        attempt_number: u32,
        outcome: &Result<GeneratedClip, TierFailure>,
    ) {
        let entry = match outcome {
            Ok(clip) => TierAttemptResult {
                sequence_index: request.sequence_index,
                tier,
                attempt_number,
                success: true,
                produced_artifact_path: Some(clip.path.clone()),
                failure_reason: None,
                measured_duration_ticks: Some(clip.measured_duration_ticks),
            },
            Err(failure) => TierAttemptResult {
                sequence_index: request.sequence_index,
                tier,
                attempt_number,
                success: false,
                produced_artifact_path: None,
                failure_reason: Some(failure.to_string()),
                measured_duration_ticks: None,
            },
        };
        ctx.log.append(entry);
    }

    /// Run one request through the tier state machine.
    pub async fn generate(&self, request: &GenerationRequest, ctx: &GenerationContext) -> OrchestratorResult<ClipArtifact> {
        for slot in &self.tiers {
            let tier = slot.backend.tier();
            for attempt in 1..=slot.policy.max_attempts {
                ctx.ensure_active()?;
                let outcome = slot.backend.generate(request, &ctx.out_dir).await;
                Self::record(ctx, request, tier, attempt, &outcome);
                match outcome {
                    Ok(clip) => {
                        info!(
                            "[Generation] clip {} ready from {} tier (attempt {}, {} ticks)",
                            request.sequence_index, tier, attempt, clip.measured_duration_ticks
                        );
                        return Ok(ClipArtifact::new(request.sequence_index, tier, clip.path, clip.measured_duration_ticks));
                    }
                    Err(failure) if !failure.is_retryable() => {
                        warn!(
                            "[Generation] clip {} {} tier attempt {}: {}; advancing tier",
                            request.sequence_index, tier, attempt, failure
                        );
                        break;
                    }
                    Err(failure) => {
                        warn!(
                            "[Generation] clip {} {} tier attempt {}/{}: {}",
                            request.sequence_index, tier, attempt, slot.policy.max_attempts, failure
                        );
                        if attempt < slot.policy.max_attempts {
                            ctx.backoff(slot.policy.backoff.delay(attempt)).await?;
                        }
                    }
                }
            }
        }

        ctx.ensure_active()?;
        let tier = self.fallback.tier();
        let outcome = self.fallback.generate(request, &ctx.out_dir).await;
        Self::record(ctx, request, tier, 1, &outcome);
        match outcome {
            Ok(clip) => {
                info!("[Generation] clip {} filled by {} tier", request.sequence_index, tier);
                Ok(ClipArtifact::new(request.sequence_index, tier, clip.path, clip.measured_duration_ticks))
            }
            Err(failure) => Err(OrchestratorError::FallbackExhausted {
                sequence_index: request.sequence_index,
                reason: failure.to_string(),
            }),
        }
    }

    /// Run every request with at most `worker_limit` in flight. Each worker
    /// finishes its current request before taking the next; once the job is
    /// cancelled or a request fails fatally, queued requests are dropped.
    pub async fn generate_all(
        &self,
        requests: Vec<GenerationRequest>,
        ctx: &GenerationContext,
        worker_limit: usize,
    ) -> OrchestratorResult<Vec<ClipArtifact>> {
        let expected = requests.len();
        let workers = worker_limit.max(1).min(expected.max(1));
        let queue = Mutex::new(requests.into_iter().collect::<VecDeque<_>>());
        let stop = ctx.cancel.child_token();
        let worker_ctx = GenerationContext {
            cancel: stop.clone(),
            ..ctx.clone()
        };

        let queue = &queue;
        let worker_ctx = &worker_ctx;
        let stop = &stop;
        let results = join_all((0..workers).map(|_| async move {
            let mut done = Vec::new();
            while !stop.is_cancelled() {
                let next = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
                let Some(request) = next else { break };
                let outcome = self.generate(&request, worker_ctx).await;
                if outcome.is_err() {
                    stop.cancel();
                }
                done.push(outcome);
            }
            done
        }))
        .await;

        if ctx.cancel.is_cancelled() {
            return Err(OrchestratorError::cancelled("generation"));
        }

        let mut clips = Vec::with_capacity(expected);
        let mut first_error = None;
        for outcome in results.into_iter().flatten() {
            match outcome {
                Ok(clip) => clips.push(clip),
                // Siblings stopped by a fatal failure report Cancelled; keep the cause.
                Err(OrchestratorError::Cancelled(_)) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if clips.len() != expected {
            return Err(OrchestratorError::cancelled("generation"));
        }
        clips.sort_by_key(|c| c.sequence_index);
        Ok(clips)
    }
}
