use serde::{Deserialize, Serialize};

use crate::decision::DecisionRecord;
use crate::error::ToleranceViolation;
use crate::timeline::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    None,
    Trim,
    Extend,
    SpeedAdjust,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentAdjustment {
    pub track: TrackKind,
    pub segment_index: usize,
    pub kind: AdjustmentKind,
    pub amount_ticks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub target_duration_ticks: i64,
    /// Governing duration: the longer of the clip and audio tracks.
    pub total_measured_duration_ticks: i64,
    pub delta_from_target_ticks: i64,
    pub adjustments: Vec<SegmentAdjustment>,
    pub expected_duration_ticks: i64,
    pub tolerance_violation: Option<ToleranceViolation>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.adjustments.is_empty()
    }

    pub fn is_flagged(&self) -> bool {
        self.tolerance_violation.is_some()
    }
}

/// Compare measured tracks against the decided target and pick the edits
/// that bring the assembly back into the tolerance band.
///
/// The shorter track is always padded up to the longer one at assembly time,
/// so the governing duration is the maximum of the two. Overruns trim video
/// (fallback clips first, trailing first) and trailing audio pauses; spoken
/// audio is never cut, so the clip track is only trimmed down to whatever
/// the narration can reach. Underruns hold the final frame; audio is never
/// sped up. Each clip's edits, including ones already applied, are capped at
/// `max_adjustment_ratio` of its measured length; a plan that hits a cap is
/// flagged, and reconciling its output again yields no further edits.
pub fn reconcile(
    decision: &DecisionRecord,
    clips: &[ClipArtifact],
    audio: &[AudioSegment],
) -> ReconciliationPlan {
    let clip_total = total_clip_ticks(clips);
    let audio_total = timeline_ticks(audio);
    let governing = clip_total.max(audio_total);
    let target = decision.target_duration_ticks;
    let tolerance = decision.tolerance_ticks();
    let delta = governing - target;

    let mut plan = ReconciliationPlan {
        target_duration_ticks: target,
        total_measured_duration_ticks: governing,
        delta_from_target_ticks: delta,
        adjustments: Vec::new(),
        expected_duration_ticks: governing,
        tolerance_violation: None,
    };

    if delta.abs() <= tolerance {
        return plan;
    }

    let mut problems = Vec::new();
    if delta > 0 {
        let ceiling = target + tolerance;
        let audio_trims = trim_audio_pauses(audio, audio_total - ceiling, &mut problems);
        let audio_after: i64 = audio_total - audio_trims.iter().map(|a| a.amount_ticks).sum::<i64>();
        let floor = ceiling.max(audio_after);
        plan.adjustments.extend(trim_clip_track(decision, clips, clip_total - floor, &mut problems));
        plan.adjustments.extend(audio_trims);
    } else {
        plan.adjustments.extend(extend_final_clip(decision, clips, target - clip_total, &mut problems));
    }

    plan.adjustments.sort_by_key(|a| (a.track == TrackKind::Audio, a.segment_index));

    let video_change: i64 = plan
        .adjustments
        .iter()
        .filter(|a| a.track == TrackKind::Video)
        .map(signed_amount)
        .sum();
    let audio_change: i64 = plan
        .adjustments
        .iter()
        .filter(|a| a.track == TrackKind::Audio)
        .map(signed_amount)
        .sum();
    plan.expected_duration_ticks = (clip_total + video_change).max(audio_total + audio_change);

    if !decision.is_within_tolerance(plan.expected_duration_ticks) && problems.is_empty() {
        problems.push("adjusted tracks still miss the tolerance band".to_string());
    }
    if !problems.is_empty() {
        plan.tolerance_violation = Some(ToleranceViolation {
            target_ticks: target,
            actual_ticks: plan.expected_duration_ticks,
            tolerance_ticks: tolerance,
            reason: problems.join("; "),
        });
    }

    plan
}

fn signed_amount(adjustment: &SegmentAdjustment) -> i64 {
    match adjustment.kind {
        AdjustmentKind::Trim => -adjustment.amount_ticks,
        AdjustmentKind::Extend | AdjustmentKind::SpeedAdjust => adjustment.amount_ticks,
        AdjustmentKind::None => 0,
    }
}

fn trim_clip_track(
    decision: &DecisionRecord,
    clips: &[ClipArtifact],
    excess: i64,
    problems: &mut Vec<String>,
) -> Vec<SegmentAdjustment> {
    let mut adjustments = Vec::new();
    if excess <= 0 {
        return adjustments;
    }

    // Trailing first; the stable sort keeps that order inside each tier.
    let mut order: Vec<&ClipArtifact> = clips.iter().rev().collect();
    order.sort_by_key(|c| c.tier.trim_priority());

    let mut remaining = excess;
    for clip in order {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(decision.adjustment_bound(clip.measured_duration_ticks) - clip.trim_ticks);
        if take <= 0 {
            continue;
        }
        adjustments.push(SegmentAdjustment {
            track: TrackKind::Video,
            segment_index: clip.sequence_index,
            kind: AdjustmentKind::Trim,
            amount_ticks: take,
        });
        remaining -= take;
    }

    if remaining > 0 {
        problems.push(format!(
            "clip track needs {:.3}s more trimming than the per-segment bound allows",
            ticks_to_secs(remaining)
        ));
    }
    adjustments
}

fn trim_audio_pauses(audio: &[AudioSegment], excess: i64, problems: &mut Vec<String>) -> Vec<SegmentAdjustment> {
    let mut adjustments = Vec::new();
    if excess <= 0 {
        return adjustments;
    }

    let mut remaining = excess;
    for segment in audio.iter().rev() {
        if remaining == 0 {
            break;
        }
        if segment.kind != SegmentKind::Pause {
            continue;
        }
        let take = remaining.min(segment.effective_ticks());
        if take <= 0 {
            continue;
        }
        adjustments.push(SegmentAdjustment {
            track: TrackKind::Audio,
            segment_index: segment.sequence_index,
            kind: AdjustmentKind::Trim,
            amount_ticks: take,
        });
        remaining -= take;
    }

    if remaining > 0 {
        problems.push(format!(
            "narration overruns the band by {:.3}s and spoken audio is never truncated",
            ticks_to_secs(remaining)
        ));
    }
    adjustments
}

fn extend_final_clip(
    decision: &DecisionRecord,
    clips: &[ClipArtifact],
    shortfall: i64,
    problems: &mut Vec<String>,
) -> Vec<SegmentAdjustment> {
    let Some(last) = clips.last() else {
        problems.push("no clips to extend".to_string());
        return Vec::new();
    };
    if shortfall <= 0 {
        return Vec::new();
    }

    let bound = (decision.adjustment_bound(last.measured_duration_ticks) - last.hold_ticks).max(0);
    let amount = if shortfall > bound {
        problems.push(format!(
            "freeze-frame of {:.3}s exceeds the remaining bound of {:.3}s for clip {}",
            ticks_to_secs(shortfall),
            ticks_to_secs(bound),
            last.sequence_index
        ));
        bound
    } else {
        shortfall
    };

    if amount <= 0 {
        return Vec::new();
    }
    vec![SegmentAdjustment {
        track: TrackKind::Video,
        segment_index: last.sequence_index,
        kind: AdjustmentKind::Extend,
        amount_ticks: amount,
    }]
}
