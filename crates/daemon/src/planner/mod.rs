use engine::decision::DecisionRecord;
use engine::timeline::GenerationRequest;

use crate::llm::CreativeBrief;

/// One generation request per clip index. Durations are copied from the
/// decision record verbatim; this stage never computes timing.
pub fn plan(decision: &DecisionRecord, brief: &CreativeBrief) -> Vec<GenerationRequest> {
    decision
        .per_clip_durations
        .iter()
        .enumerate()
        .map(|(sequence_index, &duration_target_ticks)| GenerationRequest {
            sequence_index,
            duration_target_ticks,
            content_prompt: brief
                .prompts
                .get(&sequence_index)
                .cloned()
                .unwrap_or_else(|| brief.mission.clone()),
            platform_aspect: decision.platform_aspect,
        })
        .collect()
}
