use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const TICKS_PER_SECOND: i64 = 48000;

pub fn secs_to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND as f64).round() as i64
}

pub fn ticks_to_secs(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    Portrait,
    Landscape,
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Portrait => "9:16",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Square => "1:1",
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            AspectRatio::Portrait => Resolution { width: 1080, height: 1920 },
            AspectRatio::Landscape => Resolution { width: 1920, height: 1080 },
            AspectRatio::Square => Resolution { width: 1080, height: 1080 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceStrategy {
    Single,
    Multi,
    NarratorPlusCharacter,
}

impl FromStr for VoiceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "single" => Ok(VoiceStrategy::Single),
            "multi" => Ok(VoiceStrategy::Multi),
            "narrator_plus_character" => Ok(VoiceStrategy::NarratorPlusCharacter),
            other => Err(format!("unknown voice strategy '{}'", other)),
        }
    }
}

/// Ranked option in the generation fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Primary,
    Secondary,
    Fallback,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
            Tier::Fallback => "fallback",
        }
    }

    /// Lower values are trimmed first when the clip track overruns.
    pub fn trim_priority(&self) -> u8 {
        match self {
            Tier::Fallback => 0,
            Tier::Secondary => 1,
            Tier::Primary => 2,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Tier::Primary),
            "secondary" => Ok(Tier::Secondary),
            "fallback" => Ok(Tier::Fallback),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub sequence_index: usize,
    pub duration_target_ticks: i64,
    pub content_prompt: String,
    pub platform_aspect: AspectRatio,
}

impl GenerationRequest {
    pub fn duration_target_secs(&self) -> f64 {
        ticks_to_secs(self.duration_target_ticks)
    }
}

/// One entry of the append-only attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierAttemptResult {
    pub sequence_index: usize,
    pub tier: Tier,
    pub attempt_number: u32,
    pub success: bool,
    pub produced_artifact_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub measured_duration_ticks: Option<i64>,
}

/// A generated clip. `measured_duration_ticks` is ground truth from the tier
/// that produced it; trim/hold are reconciliation edits on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipArtifact {
    pub sequence_index: usize,
    pub tier: Tier,
    pub path: PathBuf,
    pub measured_duration_ticks: i64,
    #[serde(default)]
    pub trim_ticks: i64,
    #[serde(default)]
    pub hold_ticks: i64,
}

impl ClipArtifact {
    pub fn new(sequence_index: usize, tier: Tier, path: PathBuf, measured_duration_ticks: i64) -> Self {
        ClipArtifact {
            sequence_index,
            tier,
            path,
            measured_duration_ticks,
            trim_ticks: 0,
            hold_ticks: 0,
        }
    }

    /// Source ticks that are actually played.
    pub fn played_source_ticks(&self) -> i64 {
        (self.measured_duration_ticks - self.trim_ticks).max(0)
    }

    pub fn effective_ticks(&self) -> i64 {
        self.played_source_ticks() + self.hold_ticks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Spoken,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Narrator,
    Character,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptKind {
    Spoken,
    Pause { duration_ticks: i64 },
}

/// Narration script entry supplied by the creative-strategy source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub sequence_index: usize,
    pub text: String,
    pub kind: ScriptKind,
    pub speaker: Speaker,
}

impl ScriptSegment {
    pub fn spoken(sequence_index: usize, text: impl Into<String>) -> Self {
        ScriptSegment {
            sequence_index,
            text: text.into(),
            kind: ScriptKind::Spoken,
            speaker: Speaker::Narrator,
        }
    }

    pub fn pause(sequence_index: usize, duration_ticks: i64) -> Self {
        ScriptSegment {
            sequence_index,
            text: String::new(),
            kind: ScriptKind::Pause { duration_ticks },
            speaker: Speaker::Narrator,
        }
    }

    pub fn with_speaker(mut self, speaker: Speaker) -> Self {
        self.speaker = speaker;
        self
    }

    pub fn is_pause(&self) -> bool {
        matches!(self.kind, ScriptKind::Pause { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSegment {
    pub sequence_index: usize,
    pub audio_path: PathBuf,
    pub measured_duration_ticks: i64,
    pub voice_identifier: Option<String>,
    pub kind: SegmentKind,
    #[serde(default)]
    pub trim_ticks: i64,
}

impl AudioSegment {
    pub fn spoken(
        sequence_index: usize,
        audio_path: PathBuf,
        measured_duration_ticks: i64,
        voice_identifier: impl Into<String>,
    ) -> Self {
        AudioSegment {
            sequence_index,
            audio_path,
            measured_duration_ticks,
            voice_identifier: Some(voice_identifier.into()),
            kind: SegmentKind::Spoken,
            trim_ticks: 0,
        }
    }

    pub fn pause(sequence_index: usize, audio_path: PathBuf, duration_ticks: i64) -> Self {
        AudioSegment {
            sequence_index,
            audio_path,
            measured_duration_ticks: duration_ticks,
            voice_identifier: None,
            kind: SegmentKind::Pause,
            trim_ticks: 0,
        }
    }

    pub fn effective_ticks(&self) -> i64 {
        (self.measured_duration_ticks - self.trim_ticks).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionCue {
    pub sequence_index: usize,
    pub text: String,
    pub start_ticks: i64,
    pub end_ticks: i64,
}

pub fn total_clip_ticks(clips: &[ClipArtifact]) -> i64 {
    clips.iter().map(|c| c.effective_ticks()).sum()
}

/// Spoken narration only; pauses excluded.
pub fn spoken_ticks(audio: &[AudioSegment]) -> i64 {
    audio
        .iter()
        .filter(|s| s.kind == SegmentKind::Spoken)
        .map(|s| s.effective_ticks())
        .sum()
}

/// Full audio timeline, pauses included.
pub fn timeline_ticks(audio: &[AudioSegment]) -> i64 {
    audio.iter().map(|s| s.effective_ticks()).sum()
}
