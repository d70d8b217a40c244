use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use engine::captions::CaptionConfig;
use engine::decision::DecisionConfig;
use engine::timeline::secs_to_ticks;

use crate::generation::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub video_url: String,
    pub image_url: String,
    pub speech_url: String,
    /// When unset, briefs are derived locally from the mission text.
    pub creative_url: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub narrator: String,
    pub character: String,
    /// Rotation used by the multi-voice strategy.
    pub pool: Vec<String>,
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub services: ServiceEndpoints,
    pub decision: DecisionConfig,
    pub worker_limit: usize,
    pub primary_retry: RetryPolicy,
    pub secondary_retry: RetryPolicy,
    pub speech_retry: RetryPolicy,
    pub images_per_second: f64,
    pub voices: VoiceConfig,
    pub captions: CaptionConfig,
    pub assembly_epsilon_ticks: i64,
    pub fps: u32,
    pub work_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            services: ServiceEndpoints {
                video_url: "http://127.0.0.1:8010".to_string(),
                image_url: "http://127.0.0.1:8011".to_string(),
                speech_url: "http://127.0.0.1:8012".to_string(),
                creative_url: None,
                request_timeout: Duration::from_secs(300),
            },
            decision: DecisionConfig::default(),
            worker_limit: 3,
            primary_retry: RetryPolicy::default(),
            secondary_retry: RetryPolicy::default(),
            speech_retry: RetryPolicy::default(),
            images_per_second: 0.5,
            voices: VoiceConfig {
                narrator: "narrator".to_string(),
                character: "character".to_string(),
                pool: vec!["narrator".to_string(), "voice_b".to_string(), "voice_c".to_string()],
            },
            captions: CaptionConfig::default(),
            assembly_epsilon_ticks: secs_to_ticks(0.15),
            fps: 30,
            work_dir: PathBuf::from(".cache/reels"),
            db_path: PathBuf::from(".cache/reels.db"),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().filter(|(k, _)| k.starts_with("REEL_")).collect();
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = DaemonConfig::default();

        if let Some(v) = lookup("REEL_VIDEO_URL") {
            config.services.video_url = v;
        }
        if let Some(v) = lookup("REEL_IMAGE_URL") {
            config.services.image_url = v;
        }
        if let Some(v) = lookup("REEL_SPEECH_URL") {
            config.services.speech_url = v;
        }
        config.services.creative_url = lookup("REEL_CREATIVE_URL").filter(|v| !v.trim().is_empty());
        if let Some(secs) = parse_var::<u64>(&lookup, "REEL_REQUEST_TIMEOUT_SECS")? {
            config.services.request_timeout = Duration::from_secs(secs);
        }

        if let Some(workers) = parse_var::<usize>(&lookup, "REEL_WORKERS")? {
            config.worker_limit = workers.max(1);
        }

        let backoff = match parse_var::<u64>(&lookup, "REEL_BACKOFF_MS")? {
            Some(ms) => Backoff::Exponential {
                base: Duration::from_millis(ms),
                max: Duration::from_millis(ms.saturating_mul(16)),
            },
            None => RetryPolicy::default().backoff,
        };
        let primary_attempts = parse_var::<u32>(&lookup, "REEL_PRIMARY_ATTEMPTS")?.unwrap_or(2);
        let secondary_attempts = parse_var::<u32>(&lookup, "REEL_SECONDARY_ATTEMPTS")?.unwrap_or(2);
        let speech_attempts = parse_var::<u32>(&lookup, "REEL_SPEECH_ATTEMPTS")?.unwrap_or(3);
        config.primary_retry = RetryPolicy::new(primary_attempts, backoff);
        config.secondary_retry = RetryPolicy::new(secondary_attempts, backoff);
        config.speech_retry = RetryPolicy::new(speech_attempts, backoff);

        if let Some(ips) = parse_var::<f64>(&lookup, "REEL_IMAGES_PER_SECOND")? {
            anyhow::ensure!(ips.is_finite() && ips > 0.0, "REEL_IMAGES_PER_SECOND must be positive");
            config.images_per_second = ips;
        }

        if let Some(v) = lookup("REEL_NARRATOR_VOICE") {
            config.voices.narrator = v;
        }
        if let Some(v) = lookup("REEL_CHARACTER_VOICE") {
            config.voices.character = v;
        }
        if let Some(v) = lookup("REEL_VOICE_POOL") {
            let pool: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !pool.is_empty() {
                config.voices.pool = pool;
            }
        }
        if let Some(v) = lookup("REEL_LANGUAGE") {
            config.decision.default_language = v;
        }
        if let Some(tolerance) = parse_var::<f64>(&lookup, "REEL_DEFAULT_TOLERANCE")? {
            config.decision.default_tolerance_ratio = tolerance;
        }

        if let Some(chars) = parse_var::<usize>(&lookup, "REEL_CAPTION_MAX_CHARS")? {
            config.captions.max_chars = chars;
        }
        if let Some(words) = parse_var::<usize>(&lookup, "REEL_CAPTION_MAX_WORDS")? {
            config.captions.max_words = words;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "REEL_ASSEMBLY_EPSILON_MS")? {
            config.assembly_epsilon_ticks = secs_to_ticks(ms as f64 / 1000.0);
        }
        if let Some(fps) = parse_var::<u32>(&lookup, "REEL_FPS")? {
            config.fps = fps.max(1);
        }
        if let Some(v) = lookup("REEL_WORK_DIR") {
            config.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("REEL_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value '{}' for {}", raw, key)),
    }
}
