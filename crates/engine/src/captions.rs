use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::timeline::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionConfig {
    pub max_chars: usize,
    pub max_words: usize,
    pub gap_ticks: i64,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        CaptionConfig {
            max_chars: 42,
            max_words: 7,
            gap_ticks: secs_to_ticks(0.08),
        }
    }
}

/// Build caption cues from where narration actually landed on the audio
/// timeline. Only measured audio durations and pause tags drive timing.
pub fn derive_captions(
    script: &[ScriptSegment],
    audio: &[AudioSegment],
    config: &CaptionConfig,
) -> Vec<CaptionCue> {
    let texts: HashMap<usize, &str> = script
        .iter()
        .filter(|s| !s.is_pause())
        .map(|s| (s.sequence_index, s.text.as_str()))
        .collect();

    let mut cues = Vec::new();
    let mut cursor = 0i64;
    for segment in audio {
        let duration = segment.effective_ticks();
        if segment.kind == SegmentKind::Spoken {
            if let Some(text) = texts.get(&segment.sequence_index) {
                let chunks = split_text(text, config);
                distribute(&chunks, segment.sequence_index, cursor, duration, config.gap_ticks, &mut cues);
            }
        }
        cursor += duration;
    }
    cues
}

/// Greedy word packing under the character and word budgets.
fn split_text(text: &str, config: &CaptionConfig) -> Vec<String> {
    let max_chars = config.max_chars.max(1);
    let max_words = config.max_words.max(1);

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let candidate = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };
        if !current.is_empty() && (candidate > max_chars || current.len() >= max_words) {
            chunks.push(current.join(" "));
            current.clear();
            current_len = 0;
        }
        current_len = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };
        current.push(word);
    }
    if !current.is_empty() {
        chunks.push(current.join(" "));
    }
    chunks
}

fn distribute(
    chunks: &[String],
    sequence_index: usize,
    start: i64,
    duration: i64,
    gap_ticks: i64,
    cues: &mut Vec<CaptionCue>,
) {
    if chunks.is_empty() || duration <= 0 {
        return;
    }
    let weights: Vec<i64> = chunks.iter().map(|c| c.chars().count().max(1) as i64).collect();
    let total: i64 = weights.iter().sum();

    let mut accumulated = 0i64;
    let mut slot_start = start;
    for (chunk, weight) in chunks.iter().zip(&weights) {
        accumulated += weight;
        let slot_end = start + (duration as i128 * accumulated as i128 / total as i128) as i64;
        let slot = slot_end - slot_start;
        if slot <= 0 {
            continue;
        }
        let pull_back = gap_ticks.max(0).min(slot / 2);
        cues.push(CaptionCue {
            sequence_index,
            text: chunk.clone(),
            start_ticks: slot_start,
            end_ticks: slot_end - pull_back,
        });
        slot_start = slot_end;
    }
}

/// True when cues are start-monotonic and never overlap.
pub fn cues_are_well_formed(cues: &[CaptionCue]) -> bool {
    cues.iter().all(|c| c.end_ticks > c.start_ticks)
        && cues.windows(2).all(|w| w[0].end_ticks <= w[1].start_ticks && w[0].start_ticks <= w[1].start_ticks)
}

fn srt_timestamp(ticks: i64) -> String {
    let total_ms = (ticks.max(0) as i128 * 1000 / TICKS_PER_SECOND as i128) as i64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        ms
    )
}

pub fn to_srt(cues: &[CaptionCue]) -> String {
    let mut out = String::new();
    for (i, cue) in cues.iter().enumerate() {
        let _ = writeln!(out, "{}", i + 1);
        let _ = writeln!(out, "{} --> {}", srt_timestamp(cue.start_ticks), srt_timestamp(cue.end_ticks));
        let _ = writeln!(out, "{}", cue.text);
        out.push('\n');
    }
    out
}
