use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use engine::decision::DecisionRecord;
use engine::timeline::{secs_to_ticks, ScriptSegment, Speaker};

/// Prompt text and narration script for one job, from the creative-strategy
/// collaborator. Opaque text only; timing is never taken from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreativeBrief {
    pub mission: String,
    /// Content prompt per clip sequence index.
    pub prompts: BTreeMap<usize, String>,
    pub script: Vec<ScriptSegment>,
}

#[async_trait]
pub trait CreativeSource: Send + Sync {
    async fn brief(&self, mission: &str, decision: &DecisionRecord) -> Result<CreativeBrief>;
}

pub struct HttpCreativeSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCreativeSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(HttpCreativeSource {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct BriefResponse {
    prompts: Vec<String>,
    #[serde(default)]
    script: Vec<ScriptSegment>,
}

#[async_trait]
impl CreativeSource for HttpCreativeSource {
    async fn brief(&self, mission: &str, decision: &DecisionRecord) -> Result<CreativeBrief> {
        let response = self
            .client
            .post(format!("{}/creative/brief", self.base_url))
            .json(&serde_json::json!({
                "mission": mission,
                "platform": decision.platform,
                "clip_count": decision.clip_count,
                "target_duration_seconds": decision.target_duration_secs(),
                "voice_strategy": decision.voice_strategy,
                "language": decision.language,
            }))
            .send()
            .await
            .context("creative service request failed")?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Creative service returned error: {}", response.status()));
        }
        let body: BriefResponse = response
            .json()
            .await
            .context("Invalid response format from creative service")?;

        Ok(CreativeBrief {
            mission: mission.to_string(),
            prompts: body.prompts.into_iter().enumerate().collect(),
            script: body.script,
        })
    }
}

const SENTENCE_PAUSE_SECS: f64 = 0.3;

/// Derives a brief locally from the mission text: one narration segment per
/// sentence with a short pause between sentences, and the mission as every
/// clip's prompt. Quoted sentences are voiced by the character.
#[derive(Debug, Default, Clone)]
pub struct StaticCreativeSource;

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

#[async_trait]
impl CreativeSource for StaticCreativeSource {
    async fn brief(&self, mission: &str, decision: &DecisionRecord) -> Result<CreativeBrief> {
        let mission = mission.trim();
        anyhow::ensure!(!mission.is_empty(), "mission text is empty");

        let sentences = split_sentences(mission);
        let mut script = Vec::with_capacity(sentences.len() * 2);
        for (n, sentence) in sentences.iter().enumerate() {
            if n > 0 {
                script.push(ScriptSegment::pause(script.len(), secs_to_ticks(SENTENCE_PAUSE_SECS)));
            }
            let speaker = if sentence.starts_with('"') {
                Speaker::Character
            } else {
                Speaker::Narrator
            };
            script.push(ScriptSegment::spoken(script.len(), sentence.clone()).with_speaker(speaker));
        }

        let prompts = (0..decision.clip_count)
            .map(|idx| {
                let beat = sentences.get(idx).map(String::as_str).unwrap_or(mission);
                (idx, format!("{} (scene {} of {})", beat, idx + 1, decision.clip_count))
            })
            .collect();

        Ok(CreativeBrief {
            mission: mission.to_string(),
            prompts,
            script,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::decision_for;

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hook them fast! Then explain. Close strong"),
            vec!["Hook them fast!", "Then explain.", "Close strong"]
        );
        assert!(split_sentences("   ").is_empty());
    }

    #[tokio::test]
    async fn static_brief_interleaves_pauses() {
        let decision = decision_for(30.0);
        let brief = StaticCreativeSource
            .brief("Coffee is old. \"I need it now!\" Brew well.", &decision)
            .await
            .unwrap();

        assert_eq!(brief.prompts.len(), decision.clip_count);
        let kinds: Vec<bool> = brief.script.iter().map(|s| s.is_pause()).collect();
        assert_eq!(kinds, vec![false, true, false, true, false]);
        assert_eq!(brief.script[2].speaker, Speaker::Character);
        let indices: Vec<usize> = brief.script.iter().map(|s| s.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn empty_mission_is_rejected() {
        assert!(StaticCreativeSource.brief("  ", &decision_for(30.0)).await.is_err());
    }
}
