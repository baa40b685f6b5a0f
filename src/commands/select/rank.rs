use super::*;

pub(super) fn quality_of(input: &SelectionInput<'_>) -> SourceQualityScore {
    let metrics = &input.cleanup.metrics;
    SourceQualityScore {
        officialness: clamp_unit(input.trust_score),
        parse_success: clamp_unit(input.parse_success),
        schema_coverage: metrics.required_field_coverage,
        noise_penalty: metrics.noise_ratio,
        cleanup_pass_rate: metrics.pass_rate,
        freshness: 0.0,
        completeness: clamp_unit(input.cleanup.clean_records as f64 / COMPLETENESS_FULL_RECORDS),
        schema_signal_rate: metrics.schema_signal_rate,
        confidence: metrics.mean_confidence,
    }
}

/// Deterministic order: composite score, then discovery rank, then id.
pub fn rank_sources(inputs: &[SelectionInput<'_>]) -> Vec<RankedSource> {
    let mut ranked = inputs
        .iter()
        .map(|input| {
            let quality = quality_of(input);
            RankedSource {
                source_id: input.cleanup.source_id.clone(),
                rank_score: quality.weighted(&SELECTION_WEIGHTS),
                quality,
                records: input.cleanup.clean_records,
                discover_rank: input.discover_rank,
            }
        })
        .collect::<Vec<RankedSource>>();

    ranked.sort_by(|left, right| {
        right
            .rank_score
            .total_cmp(&left.rank_score)
            .then_with(|| {
                left.discover_rank
                    .unwrap_or(usize::MAX)
                    .cmp(&right.discover_rank.unwrap_or(usize::MAX))
            })
            .then_with(|| left.source_id.cmp(&right.source_id))
    });
    ranked
}

/// Whether the model gets a say for this ranking.
pub(super) fn should_consult_model(policy: &SelectionPolicy, ranked: &[RankedSource]) -> bool {
    if ranked.len() < 2 {
        return false;
    }
    match policy.mode {
        SelectionMode::Deterministic => false,
        SelectionMode::LlmFirst => true,
        SelectionMode::Hybrid => ranked[0].rank_score - ranked[1].rank_score < policy.hybrid_margin,
    }
}
