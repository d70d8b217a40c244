use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::timeline::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub name: String,
    pub aspect: AspectRatio,
    pub min_duration_ticks: i64,
    pub max_duration_ticks: i64,
    /// Longest clip the generative services are asked for.
    pub max_clip_ticks: i64,
    pub max_clip_count: usize,
}

impl PlatformProfile {
    pub fn new(
        name: &str,
        aspect: AspectRatio,
        min_seconds: f64,
        max_seconds: f64,
        max_clip_seconds: f64,
        max_clip_count: usize,
    ) -> Self {
        PlatformProfile {
            name: name.to_string(),
            aspect,
            min_duration_ticks: secs_to_ticks(min_seconds),
            max_duration_ticks: secs_to_ticks(max_seconds),
            max_clip_ticks: secs_to_ticks(max_clip_seconds),
            max_clip_count,
        }
    }
}

/// Every duration-related constant the pipeline uses. Threaded through
/// `decide` and copied into the record; nothing downstream reads it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub platforms: BTreeMap<String, PlatformProfile>,
    pub default_tolerance_ratio: f64,
    pub default_voice_strategy: VoiceStrategy,
    pub default_language: String,
    pub max_adjustment_ratio: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        let platforms = [
            PlatformProfile::new("tiktok", AspectRatio::Portrait, 5.0, 180.0, 10.0, 18),
            PlatformProfile::new("youtube_shorts", AspectRatio::Portrait, 5.0, 60.0, 8.0, 8),
            PlatformProfile::new("instagram_reels", AspectRatio::Portrait, 5.0, 90.0, 10.0, 9),
            PlatformProfile::new("youtube", AspectRatio::Landscape, 5.0, 600.0, 10.0, 60),
        ]
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();

        DecisionConfig {
            platforms,
            default_tolerance_ratio: 0.05,
            default_voice_strategy: VoiceStrategy::Single,
            default_language: "en".to_string(),
            max_adjustment_ratio: 0.5,
        }
    }
}

impl DecisionConfig {
    pub fn platform(&self, name: &str) -> Option<&PlatformProfile> {
        let key = name.trim().to_ascii_lowercase().replace('-', "_");
        self.platforms.get(&key)
    }

    pub fn with_platform(mut self, profile: PlatformProfile) -> Self {
        self.platforms.insert(profile.name.clone(), profile);
        self
    }
}

/// Inputs consumed from the command layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// Seconds.
    pub target_duration: f64,
    pub platform: String,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub voice_strategy: Option<VoiceStrategy>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub platform: String,
    pub platform_aspect: AspectRatio,
    pub target_duration_ticks: i64,
    pub clip_count: usize,
    pub per_clip_durations: Vec<i64>,
    pub voice_strategy: VoiceStrategy,
    pub language: String,
    pub tolerance_ratio: f64,
    pub max_adjustment_ratio: f64,
}

impl DecisionRecord {
    pub fn target_duration_secs(&self) -> f64 {
        ticks_to_secs(self.target_duration_ticks)
    }

    pub fn tolerance_ticks(&self) -> i64 {
        (self.target_duration_ticks as f64 * self.tolerance_ratio).round() as i64
    }

    pub fn is_within_tolerance(&self, ticks: i64) -> bool {
        (ticks - self.target_duration_ticks).abs() <= self.tolerance_ticks()
    }

    /// Largest edit a single segment of `segment_ticks` may receive.
    pub fn adjustment_bound(&self, segment_ticks: i64) -> i64 {
        (segment_ticks as f64 * self.max_adjustment_ratio).floor() as i64
    }
}

/// Fix target duration and clip/voice structure before any generation.
/// Pure and deterministic: identical inputs give identical records.
pub fn decide(params: &JobParams, config: &DecisionConfig) -> OrchestratorResult<DecisionRecord> {
    let profile = config.platform(&params.platform).ok_or_else(|| {
        OrchestratorError::invalid_parameters(format!("unknown platform '{}'", params.platform))
    })?;

    let invalid_duration = || OrchestratorError::InvalidDuration {
        platform: profile.name.clone(),
        requested: params.target_duration,
        min: ticks_to_secs(profile.min_duration_ticks),
        max: ticks_to_secs(profile.max_duration_ticks),
    };

    if !params.target_duration.is_finite() || params.target_duration <= 0.0 {
        return Err(invalid_duration());
    }
    let target = secs_to_ticks(params.target_duration);
    if target < profile.min_duration_ticks || target > profile.max_duration_ticks {
        return Err(invalid_duration());
    }

    let tolerance_ratio = params.tolerance.unwrap_or(config.default_tolerance_ratio);
    if !tolerance_ratio.is_finite() || tolerance_ratio <= 0.0 || tolerance_ratio >= 1.0 {
        return Err(OrchestratorError::invalid_parameters(format!(
            "tolerance must be in (0, 1), got {}",
            tolerance_ratio
        )));
    }
    if !(config.max_adjustment_ratio > 0.0 && config.max_adjustment_ratio <= 1.0) {
        return Err(OrchestratorError::invalid_parameters(format!(
            "max adjustment ratio must be in (0, 1], got {}",
            config.max_adjustment_ratio
        )));
    }
    if profile.max_clip_ticks <= 0 || profile.max_clip_count == 0 {
        return Err(OrchestratorError::invalid_parameters(format!(
            "platform '{}' has no usable clip limits",
            profile.name
        )));
    }

    // Over the ceiling the clips get longer than the per-clip limit but the
    // sum stays on target.
    let naive_count = ((target + profile.max_clip_ticks - 1) / profile.max_clip_ticks).max(1) as usize;
    let clip_count = naive_count.min(profile.max_clip_count);
    let per_clip_durations = split_evenly(target, clip_count);

    let record = DecisionRecord {
        platform: profile.name.clone(),
        platform_aspect: profile.aspect,
        target_duration_ticks: target,
        clip_count,
        per_clip_durations,
        voice_strategy: params.voice_strategy.unwrap_or(config.default_voice_strategy),
        language: params
            .language
            .clone()
            .unwrap_or_else(|| config.default_language.clone()),
        tolerance_ratio,
        max_adjustment_ratio: config.max_adjustment_ratio,
    };

    let sum: i64 = record.per_clip_durations.iter().sum();
    if !record.is_within_tolerance(sum) {
        return Err(OrchestratorError::invalid_parameters(format!(
            "clip durations sum to {:.3}s, outside tolerance of {:.3}s",
            ticks_to_secs(sum),
            record.target_duration_secs()
        )));
    }

    Ok(record)
}

/// Split `total` into `count` parts differing by at most one tick, larger
/// parts first.
fn split_evenly(total: i64, count: usize) -> Vec<i64> {
    let count_i = count as i64;
    let base = total / count_i;
    let remainder = total % count_i;
    (0..count_i)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}
