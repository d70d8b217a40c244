use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use engine::decision::DecisionRecord;
use engine::error::{OrchestratorError, OrchestratorResult};
use engine::timeline::{AudioSegment, ScriptKind, ScriptSegment, Speaker, VoiceStrategy};

use crate::config::VoiceConfig;
use crate::generation::retry::RetryPolicy;
use crate::media::{fingerprint, Compositor};

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Write synthesized speech for `text` to `out`.
    async fn synthesize(&self, text: &str, voice: &str, language: &str, out: &Path) -> Result<()>;
}

pub struct HttpSpeechBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpeechBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(HttpSpeechBackend {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn synthesize(&self, text: &str, voice: &str, language: &str, out: &Path) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/speech", self.base_url))
            .json(&serde_json::json!({
                "text": text,
                "voice": voice,
                "language": language,
            }))
            .send()
            .await
            .context("speech service request failed")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Speech service returned error: {}", response.status()));
        }
        let audio = response.bytes().await.context("failed to read speech audio")?;
        if audio.is_empty() {
            anyhow::bail!("speech service returned no audio");
        }
        tokio::fs::write(out, &audio)
            .await
            .with_context(|| format!("failed to write '{}'", out.display()))?;
        Ok(())
    }
}

/// Voice per script segment; `None` for pauses. Multi-voice rotation counts
/// spoken segments only, so pauses do not shift the rotation.
pub fn assign_voices(script: &[ScriptSegment], strategy: VoiceStrategy, voices: &VoiceConfig) -> Vec<Option<String>> {
    let mut spoken_ordinal = 0usize;
    script
        .iter()
        .map(|segment| {
            if segment.is_pause() {
                return None;
            }
            let voice = match strategy {
                VoiceStrategy::Single => voices.narrator.clone(),
                VoiceStrategy::Multi if voices.pool.is_empty() => voices.narrator.clone(),
                VoiceStrategy::Multi => voices.pool[spoken_ordinal % voices.pool.len()].clone(),
                VoiceStrategy::NarratorPlusCharacter => match segment.speaker {
                    Speaker::Narrator => voices.narrator.clone(),
                    Speaker::Character => voices.character.clone(),
                },
            };
            spoken_ordinal += 1;
            Some(voice)
        })
        .collect()
}

pub struct SpeechCoordinator {
    backend: Arc<dyn SpeechBackend>,
    compositor: Arc<dyn Compositor>,
    voices: VoiceConfig,
    retry: RetryPolicy,
    concurrency: usize,
}

impl SpeechCoordinator {
    pub fn new(
        backend: Arc<dyn SpeechBackend>,
        compositor: Arc<dyn Compositor>,
        voices: VoiceConfig,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        SpeechCoordinator {
            backend,
            compositor,
            voices,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Synthesize every script segment independently and return them in
    /// sequence order with durations read back from the produced files.
    pub async fn synthesize(
        &self,
        script: &[ScriptSegment],
        decision: &DecisionRecord,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Vec<AudioSegment>> {
        let mut ordered: Vec<ScriptSegment> = script
            .iter()
            .filter(|s| s.is_pause() || !s.text.trim().is_empty())
            .cloned()
            .collect();
        ordered.sort_by_key(|s| s.sequence_index);
        let voices = assign_voices(&ordered, decision.voice_strategy, &self.voices);

        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("failed to create '{}'", out_dir.display()))?;

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let tasks = ordered.iter().zip(voices).map(|(segment, voice)| {
            let permits = permits.clone();
            async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| OrchestratorError::cancelled("speech synthesis"))?;
                if cancel.is_cancelled() {
                    return Err(OrchestratorError::cancelled("speech synthesis"));
                }
                self.synthesize_one(segment, voice, &decision.language, out_dir, cancel).await
            }
        });
        let results = join_all(tasks).await;

        let mut segments = Vec::with_capacity(results.len());
        for result in results {
            segments.push(result?);
        }
        info!(
            "[Speech] {} segments synthesized ({} ticks of timeline)",
            segments.len(),
            engine::timeline::timeline_ticks(&segments)
        );
        Ok(segments)
    }

    async fn synthesize_one(
        &self,
        segment: &ScriptSegment,
        voice: Option<String>,
        language: &str,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<AudioSegment> {
        if let ScriptKind::Pause { duration_ticks } = segment.kind {
            let path = out_dir.join(format!("pause_{:03}_{}.wav", segment.sequence_index, duration_ticks));
            self.compositor
                .render_silence(duration_ticks, &path)
                .await
                .map_err(|e| OrchestratorError::synthesis(format!("pause {}: {:#}", segment.sequence_index, e)))?;
            return Ok(AudioSegment::pause(segment.sequence_index, path, duration_ticks));
        }

        let voice = voice.unwrap_or_else(|| self.voices.narrator.clone());
        let path: PathBuf = out_dir.join(format!(
            "speech_{:03}_{}.wav",
            segment.sequence_index,
            fingerprint(&[&segment.text, &voice, language])
        ));

        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.backend.synthesize(&segment.text, &voice, language, &path).await {
                Ok(()) => {
                    let measured = self
                        .compositor
                        .probe_duration(&path)
                        .await
                        .map_err(|e| OrchestratorError::synthesis(format!("segment {}: {:#}", segment.sequence_index, e)))?;
                    return Ok(AudioSegment::spoken(segment.sequence_index, path, measured, voice));
                }
                Err(e) => {
                    warn!(
                        "[Speech] segment {} attempt {}/{} failed: {:#}",
                        segment.sequence_index, attempt, self.retry.max_attempts, e
                    );
                    last_error = Some(e);
                    if attempt < self.retry.max_attempts {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(OrchestratorError::cancelled("speech synthesis")),
                            _ = tokio::time::sleep(self.retry.backoff.delay(attempt)) => {}
                        }
                    }
                }
            }
        }

        Err(OrchestratorError::synthesis(format!(
            "segment {} failed after {} attempts: {}",
            segment.sequence_index,
            self.retry.max_attempts,
            last_error.map(|e| format!("{:#}", e)).unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{decision_for, MockCompositor, MockSpeech};
    use engine::timeline::{secs_to_ticks, SegmentKind};

    fn voices() -> VoiceConfig {
        VoiceConfig {
            narrator: "nar".to_string(),
            character: "chr".to_string(),
            pool: vec!["a".to_string(), "b".to_string()],
        }
    }

    fn script() -> Vec<ScriptSegment> {
        vec![
            ScriptSegment::spoken(0, "First line."),
            ScriptSegment::pause(1, secs_to_ticks(0.4)),
            ScriptSegment::spoken(2, "\"Second line.\"").with_speaker(Speaker::Character),
            ScriptSegment::spoken(3, "Third line."),
        ]
    }

    fn coordinator(speech: Arc<MockSpeech>, compositor: Arc<MockCompositor>, attempts: u32) -> SpeechCoordinator {
        SpeechCoordinator::new(speech, compositor, voices(), RetryPolicy::immediate(attempts), 2)
    }

    #[test]
    fn voices_follow_strategy() {
        let s = script();
        assert_eq!(
            assign_voices(&s, VoiceStrategy::Single, &voices()),
            vec![Some("nar".into()), None, Some("nar".into()), Some("nar".into())]
        );
        assert_eq!(
            assign_voices(&s, VoiceStrategy::Multi, &voices()),
            vec![Some("a".into()), None, Some("b".into()), Some("a".into())]
        );
        assert_eq!(
            assign_voices(&s, VoiceStrategy::NarratorPlusCharacter, &voices()),
            vec![Some("nar".into()), None, Some("chr".into()), Some("nar".into())]
        );
    }

    #[tokio::test]
    async fn durations_come_from_the_produced_audio() {
        let speech = Arc::new(MockSpeech::default());
        let compositor = Arc::new(MockCompositor::with_probe_secs(2.35));
        let coord = coordinator(speech.clone(), compositor, 2);
        let decision = decision_for(20.0);

        let audio = coord
            .synthesize(&script(), &decision, Path::new("/tmp/reel-speech"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(audio.len(), 4);
        assert_eq!(audio.iter().map(|a| a.sequence_index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(audio[0].measured_duration_ticks, secs_to_ticks(2.35));
        assert_eq!(audio[1].kind, SegmentKind::Pause);
        assert_eq!(audio[1].measured_duration_ticks, secs_to_ticks(0.4));
        assert_eq!(audio[1].voice_identifier, None);
        assert_eq!(speech.calls(), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let speech = Arc::new(MockSpeech::failing_times(1));
        let compositor = Arc::new(MockCompositor::with_probe_secs(1.0));
        let coord = coordinator(speech.clone(), compositor, 3);
        let script = vec![ScriptSegment::spoken(0, "Only line.")];

        let audio = coord
            .synthesize(&script, &decision_for(20.0), Path::new("/tmp/reel-speech"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(audio.len(), 1);
        assert_eq!(speech.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_failure_is_a_synthesis_error() {
        let speech = Arc::new(MockSpeech::failing_times(usize::MAX));
        let compositor = Arc::new(MockCompositor::with_probe_secs(1.0));
        let coord = coordinator(speech.clone(), compositor, 2);
        let script = vec![ScriptSegment::spoken(0, "Only line.")];

        let err = coord
            .synthesize(&script, &decision_for(20.0), Path::new("/tmp/reel-speech"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Synthesis(_)));
        assert_eq!(speech.calls(), 2);
    }
}
