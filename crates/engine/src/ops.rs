use crate::reconcile::{AdjustmentKind, ReconciliationPlan, SegmentAdjustment};
use crate::timeline::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrackOperation {
    TrimClip { segment_index: usize, amount_ticks: i64 },
    FreezeExtendClip { segment_index: usize, amount_ticks: i64 },
    TrimAudio { segment_index: usize, amount_ticks: i64 },
}

impl TrackOperation {
    pub fn from_adjustment(adjustment: &SegmentAdjustment) -> Result<Option<Self>, String> {
        let segment_index = adjustment.segment_index;
        let amount_ticks = adjustment.amount_ticks;
        let op = match (adjustment.track, adjustment.kind) {
            (_, AdjustmentKind::None) => return Ok(None),
            (TrackKind::Video, AdjustmentKind::Trim) => TrackOperation::TrimClip { segment_index, amount_ticks },
            (TrackKind::Video, AdjustmentKind::Extend) => {
                TrackOperation::FreezeExtendClip { segment_index, amount_ticks }
            }
            (TrackKind::Audio, AdjustmentKind::Trim) => TrackOperation::TrimAudio { segment_index, amount_ticks },
            (_, AdjustmentKind::SpeedAdjust) => {
                return Err(format!("speed changes are not applied to {:?} segment {}", adjustment.track, segment_index));
            }
            (TrackKind::Audio, kind) => {
                return Err(format!("{:?} is not a permitted audio adjustment", kind));
            }
        };
        Ok(Some(op))
    }
}

/// Clip and audio tracks as they will be handed to assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracks {
    pub clips: Vec<ClipArtifact>,
    pub audio: Vec<AudioSegment>,
}

impl Tracks {
    pub fn new(clips: Vec<ClipArtifact>, audio: Vec<AudioSegment>) -> Self {
        Tracks { clips, audio }
    }

    pub fn clip_ticks(&self) -> i64 {
        total_clip_ticks(&self.clips)
    }

    pub fn audio_ticks(&self) -> i64 {
        timeline_ticks(&self.audio)
    }

    pub fn apply_plan(&mut self, plan: &ReconciliationPlan) -> Result<(), String> {
        for adjustment in &plan.adjustments {
            if let Some(op) = TrackOperation::from_adjustment(adjustment)? {
                self.apply_operation(op)?;
            }
        }
        Ok(())
    }

    pub fn apply_operation(&mut self, op: TrackOperation) -> Result<(), String> {
        match op {
            TrackOperation::TrimClip {
                segment_index,
                amount_ticks,
            } => {
                let clip = self.clip_mut(segment_index)?;
                if amount_ticks < 0 || amount_ticks > clip.played_source_ticks() {
                    return Err(format!("cannot trim {} ticks from clip {}", amount_ticks, segment_index));
                }
                clip.trim_ticks += amount_ticks;
                Ok(())
            }
            TrackOperation::FreezeExtendClip {
                segment_index,
                amount_ticks,
            } => {
                if amount_ticks < 0 {
                    return Err("freeze-frame extension must be positive".to_string());
                }
                self.clip_mut(segment_index)?.hold_ticks += amount_ticks;
                Ok(())
            }
            TrackOperation::TrimAudio {
                segment_index,
                amount_ticks,
            } => {
                let segment = self
                    .audio
                    .iter_mut()
                    .find(|s| s.sequence_index == segment_index)
                    .ok_or_else(|| format!("Audio segment {} not found", segment_index))?;
                if segment.kind == SegmentKind::Spoken {
                    return Err(format!("refusing to trim spoken audio segment {}", segment_index));
                }
                if amount_ticks < 0 || amount_ticks > segment.effective_ticks() {
                    return Err(format!("cannot trim {} ticks from pause {}", amount_ticks, segment_index));
                }
                segment.trim_ticks += amount_ticks;
                Ok(())
            }
        }
    }

    fn clip_mut(&mut self, segment_index: usize) -> Result<&mut ClipArtifact, String> {
        self.clips
            .iter_mut()
            .find(|c| c.sequence_index == segment_index)
            .ok_or_else(|| format!("Clip {} not found", segment_index))
    }
}
