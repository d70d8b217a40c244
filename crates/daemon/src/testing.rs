//! Hand-written doubles for the external boundaries. All of them count calls.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use engine::decision::{decide, DecisionConfig, DecisionRecord, JobParams};
use engine::render::RenderCommand;
use engine::timeline::{secs_to_ticks, AspectRatio, GenerationRequest, Tier};

use crate::assembly::AssemblyEmitter;
use crate::config::DaemonConfig;
use crate::generation::retry::RetryPolicy;
use crate::generation::{GeneratedClip, TierBackend, TierFailure, TieredExecutor};
use crate::llm::{CreativeBrief, CreativeSource, StaticCreativeSource};
use crate::media::Compositor;
use crate::orchestrator::Orchestrator;
use crate::speech::{SpeechBackend, SpeechCoordinator};

pub fn params(target_duration: f64, tolerance: Option<f64>) -> JobParams {
    JobParams {
        target_duration,
        platform: "tiktok".to_string(),
        tolerance,
        voice_strategy: None,
        language: None,
    }
}

pub fn decision_for(target_duration: f64) -> DecisionRecord {
    decide(&params(target_duration, None), &DecisionConfig::default()).unwrap()
}

pub fn request(sequence_index: usize, seconds: f64) -> GenerationRequest {
    GenerationRequest {
        sequence_index,
        duration_target_ticks: secs_to_ticks(seconds),
        content_prompt: format!("prompt {}", sequence_index),
        platform_aspect: AspectRatio::Portrait,
    }
}

/// Tier backend with a fixed script of outcomes.
pub struct ScriptedBackend {
    tier: Tier,
    default_secs: f64,
    durations: Mutex<HashMap<usize, f64>>,
    per_index: Mutex<HashMap<usize, TierFailure>>,
    always: Option<TierFailure>,
    leading: Mutex<Option<(usize, TierFailure)>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    fn build(tier: Tier, default_secs: f64, always: Option<TierFailure>) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            tier,
            default_secs,
            durations: Mutex::new(HashMap::new()),
            per_index: Mutex::new(HashMap::new()),
            always,
            leading: Mutex::new(None),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn succeeding(tier: Tier, seconds: f64) -> Arc<Self> {
        Self::build(tier, seconds, None)
    }

    pub fn failing(tier: Tier, failure: TierFailure) -> Arc<Self> {
        Self::build(tier, 0.0, Some(failure))
    }

    pub fn with_duration(self: Arc<Self>, sequence_index: usize, seconds: f64) -> Arc<Self> {
        self.durations.lock().unwrap().insert(sequence_index, seconds);
        self
    }

    /// Every call for `sequence_index` fails with `failure`.
    pub fn failing_for(self: Arc<Self>, sequence_index: usize, failure: TierFailure) -> Arc<Self> {
        self.per_index.lock().unwrap().insert(sequence_index, failure);
        self
    }

    /// The first `times` calls fail with `failure`.
    pub fn failing_times(self: Arc<Self>, times: usize, failure: TierFailure) -> Arc<Self> {
        *self.leading.lock().unwrap() = Some((times, failure));
        self
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn outcome(&self, request: &GenerationRequest, out_dir: &Path) -> Result<GeneratedClip, TierFailure> {
        if let Some(failure) = &self.always {
            return Err(failure.clone());
        }
        if let Some(failure) = self.per_index.lock().unwrap().get(&request.sequence_index) {
            return Err(failure.clone());
        }
        {
            let mut leading = self.leading.lock().unwrap();
            if let Some((remaining, failure)) = leading.as_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(failure.clone());
                }
            }
        }
        let seconds = self
            .durations
            .lock()
            .unwrap()
            .get(&request.sequence_index)
            .copied()
            .unwrap_or(self.default_secs);
        Ok(GeneratedClip {
            path: out_dir.join(format!("{}_{}.mp4", self.tier.as_str(), request.sequence_index)),
            measured_duration_ticks: secs_to_ticks(seconds),
        })
    }
}

#[async_trait]
impl TierBackend for ScriptedBackend {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn generate(&self, request: &GenerationRequest, out_dir: &Path) -> Result<GeneratedClip, TierFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.outcome(request, out_dir);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Compositor that touches no files. Probes report a fixed duration and
/// composition reports the `-t` bound of the command unless overridden.
#[derive(Default)]
pub struct MockCompositor {
    probe_ticks: Option<i64>,
    compose_ticks: Option<i64>,
    probes: AtomicUsize,
    silences: AtomicUsize,
    placeholders: AtomicUsize,
    slideshows: AtomicUsize,
    composes: AtomicUsize,
}

impl MockCompositor {
    pub fn with_probe_secs(seconds: f64) -> Self {
        MockCompositor {
            probe_ticks: Some(secs_to_ticks(seconds)),
            ..Default::default()
        }
    }

    pub fn composing_secs(seconds: f64) -> Self {
        MockCompositor {
            compose_ticks: Some(secs_to_ticks(seconds)),
            ..Default::default()
        }
    }

    pub fn placeholder_calls(&self) -> usize {
        self.placeholders.load(Ordering::SeqCst)
    }

    pub fn compose_calls(&self) -> usize {
        self.composes.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        [&self.probes, &self.silences, &self.placeholders, &self.slideshows, &self.composes]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl Compositor for MockCompositor {
    async fn probe_duration(&self, _path: &Path) -> Result<i64> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.probe_ticks.unwrap_or_else(|| secs_to_ticks(1.0)))
    }

    async fn render_silence(&self, _duration_ticks: i64, _out: &Path) -> Result<()> {
        self.silences.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn render_placeholder(&self, _text: &str, _duration_ticks: i64, _aspect: AspectRatio, _out: &Path) -> Result<()> {
        self.placeholders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn render_slideshow(
        &self,
        images: &[PathBuf],
        images_per_second: f64,
        _aspect: AspectRatio,
        _out: &Path,
    ) -> Result<i64> {
        self.slideshows.fetch_add(1, Ordering::SeqCst);
        Ok(secs_to_ticks(images.len() as f64 / images_per_second))
    }

    async fn compose(&self, command: &RenderCommand) -> Result<i64> {
        self.composes.fetch_add(1, Ordering::SeqCst);
        if let Some(ticks) = self.compose_ticks {
            return Ok(ticks);
        }
        let bound = command
            .ffmpeg_args
            .iter()
            .position(|a| a == "-t")
            .and_then(|i| command.ffmpeg_args.get(i + 1))
            .ok_or_else(|| anyhow::anyhow!("render command has no -t bound"))?;
        Ok(secs_to_ticks(bound.parse::<f64>()?))
    }
}

#[derive(Default)]
pub struct MockSpeech {
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl MockSpeech {
    pub fn failing_times(times: usize) -> Self {
        MockSpeech {
            failures_left: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        MockSpeech {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechBackend for MockSpeech {
    async fn synthesize(&self, _text: &str, _voice: &str, _language: &str, _out: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            anyhow::bail!("speech service returned error: 503");
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingCreative {
    inner: StaticCreativeSource,
    calls: AtomicUsize,
}

impl CountingCreative {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CreativeSource for CountingCreative {
    async fn brief(&self, mission: &str, decision: &DecisionRecord) -> Result<CreativeBrief> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.brief(mission, decision).await
    }
}

pub struct TestOrchestrator {
    pub orchestrator: Orchestrator,
    pub creative: Arc<CountingCreative>,
    pub secondary: Arc<ScriptedBackend>,
    pub fallback: Arc<ScriptedBackend>,
}

pub fn test_config() -> DaemonConfig {
    DaemonConfig {
        work_dir: std::env::temp_dir().join(format!("reel-test-{}", uuid::Uuid::new_v4())),
        ..DaemonConfig::default()
    }
}

/// Orchestrator over mocks. The secondary and fallback tiers return exactly
/// the requested 10s unless the test replaces the primary's script.
pub fn test_orchestrator(
    primary: Arc<ScriptedBackend>,
    compositor: Arc<MockCompositor>,
    speech: Arc<MockSpeech>,
) -> TestOrchestrator {
    let config = test_config();
    let creative = Arc::new(CountingCreative::default());
    let secondary = ScriptedBackend::succeeding(Tier::Secondary, 10.0);
    let fallback = ScriptedBackend::succeeding(Tier::Fallback, 10.0);

    let executor = TieredExecutor::new(fallback.clone())
        .with_tier(primary, RetryPolicy::immediate(2))
        .with_tier(secondary.clone(), RetryPolicy::immediate(2));
    let coordinator = SpeechCoordinator::new(
        speech,
        compositor.clone(),
        config.voices.clone(),
        RetryPolicy::immediate(2),
        config.worker_limit,
    );
    let emitter = AssemblyEmitter::new(compositor, config.fps, config.assembly_epsilon_ticks);

    TestOrchestrator {
        orchestrator: Orchestrator::new(&config, creative.clone(), executor, coordinator, emitter),
        creative,
        secondary,
        fallback,
    }
}
