use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ops::Tracks;
use crate::reconcile::ReconciliationPlan;
use crate::timeline::*;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssemblySettings {
    pub resolution: Resolution,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEntry {
    pub sequence_index: usize,
    pub path: PathBuf,
    pub source_ticks: i64,
    pub hold_ticks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEntry {
    pub sequence_index: usize,
    pub path: PathBuf,
    pub duration_ticks: i64,
}

/// Explicit timing instructions for the composition tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyInstructions {
    pub settings: AssemblySettings,
    pub video: Vec<VideoEntry>,
    pub audio: Vec<AudioEntry>,
    pub captions: Vec<CaptionCue>,
    pub expected_duration_ticks: i64,
    /// Extra freeze on the last clip so video reaches the governing length.
    pub video_pad_ticks: i64,
    /// Trailing silence so audio reaches the governing length.
    pub audio_pad_ticks: i64,
}

/// Compile reconciled tracks into assembly instructions. `tracks` must be
/// the output of applying `plan`.
pub fn compile_assembly(
    tracks: &Tracks,
    captions: &[CaptionCue],
    plan: &ReconciliationPlan,
    settings: AssemblySettings,
) -> Result<AssemblyInstructions, String> {
    if tracks.clips.is_empty() {
        return Err("no clips to assemble".to_string());
    }

    let clip_ticks = tracks.clip_ticks();
    let audio_ticks = tracks.audio_ticks();
    let expected = clip_ticks.max(audio_ticks);
    if expected != plan.expected_duration_ticks {
        return Err(format!(
            "tracks total {:.3}s but the plan expects {:.3}s",
            ticks_to_secs(expected),
            ticks_to_secs(plan.expected_duration_ticks)
        ));
    }

    let mut clips: Vec<&ClipArtifact> = tracks.clips.iter().collect();
    clips.sort_by_key(|c| c.sequence_index);
    let video = clips
        .into_iter()
        .map(|c| VideoEntry {
            sequence_index: c.sequence_index,
            path: c.path.clone(),
            source_ticks: c.played_source_ticks(),
            hold_ticks: c.hold_ticks,
        })
        .collect();

    let mut segments: Vec<&AudioSegment> = tracks.audio.iter().collect();
    segments.sort_by_key(|s| s.sequence_index);
    let audio = segments
        .into_iter()
        .filter(|s| s.effective_ticks() > 0)
        .map(|s| AudioEntry {
            sequence_index: s.sequence_index,
            path: s.audio_path.clone(),
            duration_ticks: s.effective_ticks(),
        })
        .collect();

    let captions = captions
        .iter()
        .filter(|c| c.start_ticks < expected)
        .map(|c| CaptionCue {
            end_ticks: c.end_ticks.min(expected),
            ..c.clone()
        })
        .collect();

    Ok(AssemblyInstructions {
        settings,
        video,
        audio,
        captions,
        expected_duration_ticks: expected,
        video_pad_ticks: expected - clip_ticks,
        audio_pad_ticks: expected - audio_ticks,
    })
}
