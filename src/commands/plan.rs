use anyhow::Result;
use tracing::info;

use crate::error::PipelineError;
use crate::model::{
    ExecutorType, ExtractionPlan, ExtractionTask, SourceDescriptor, SourceManifest, SourceType,
};
use crate::runtime::artifacts::{EXTRACTION_PLAN, RunLayout, SOURCE_MANIFEST};
use crate::util::{now_utc_string, read_json, write_json_pretty};

const PLAN_VERSION: u32 = 1;

/// Primary executor and ordered fallbacks for a detected source type.
pub fn capability_chain(source_type: SourceType) -> (ExecutorType, Vec<ExecutorType>) {
    use ExecutorType as E;
    match source_type {
        SourceType::Csv => (E::Csv, vec![]),
        SourceType::Xlsx => (E::Xlsx, vec![]),
        SourceType::Pdf => (E::Pdf, vec![E::Image, E::Html]),
        SourceType::Image => (E::Image, vec![E::Html]),
        SourceType::Html => (E::Html, vec![E::Api]),
        SourceType::Api => (E::Api, vec![E::Html]),
        SourceType::Unknown => (E::Html, vec![E::Api]),
    }
}

pub fn build_extraction_plan(
    run_id: &str,
    manifest: &SourceManifest,
) -> Result<ExtractionPlan, PipelineError> {
    let mut tasks = Vec::new();
    let mut sources = Vec::new();

    for entry in &manifest.sources {
        sources.push(SourceDescriptor {
            id: entry.id.clone(),
            url: entry.final_url.clone(),
            local_path: entry.local_path.clone(),
            source_type: entry.source_type,
            mime: entry.mime.clone(),
            charset: entry.charset.clone(),
            trust_score: entry.trust_score,
        });

        let (executor_type, fallback) = capability_chain(entry.source_type);
        for target in &entry.target_hints {
            tasks.push(ExtractionTask {
                task_id: format!("{}:{}", entry.id, target),
                source_id: entry.id.clone(),
                source_type: entry.source_type,
                executor_type,
                target: *target,
                fallback: fallback.clone(),
                required_features: target
                    .required_features()
                    .iter()
                    .map(|feature| feature.to_string())
                    .collect(),
                rank: entry.discover_rank.get(target).copied(),
            });
        }
    }

    if tasks.is_empty() {
        return Err(PipelineError::Pipeline(format!(
            "extraction plan is empty: {} downloaded sources carry no target hints",
            manifest.sources.len()
        )));
    }

    tasks.sort_by(|left, right| {
        left.rank
            .unwrap_or(usize::MAX)
            .cmp(&right.rank.unwrap_or(usize::MAX))
            .then_with(|| left.task_id.cmp(&right.task_id))
    });

    Ok(ExtractionPlan {
        plan_version: PLAN_VERSION,
        run_id: run_id.to_string(),
        generated_at: now_utc_string(),
        tasks,
        sources,
    })
}

pub fn run(layout: &RunLayout, run_id: &str) -> Result<ExtractionPlan> {
    let manifest: SourceManifest = read_json(&layout.file(SOURCE_MANIFEST))?;
    let plan = build_extraction_plan(run_id, &manifest)?;
    write_json_pretty(&layout.file(EXTRACTION_PLAN), &plan)?;

    info!(
        tasks = plan.tasks.len(),
        sources = plan.sources.len(),
        "extraction plan written"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{SourceManifestEntry, Target};

    fn entry(id: &str, source_type: SourceType, ranks: &[(Target, usize)]) -> SourceManifestEntry {
        SourceManifestEntry {
            id: id.to_string(),
            url: format!("https://www.city.example.lg.jp/{id}"),
            final_url: format!("https://www.city.example.lg.jp/{id}"),
            local_path: format!("sources/{id}.{}", source_type.file_extension()),
            source_type,
            mime: None,
            charset: None,
            bytes: 10,
            sha256: "00".to_string(),
            trust_score: 0.9,
            target_hints: ranks.iter().map(|(target, _)| *target).collect(),
            discover_rank: ranks.iter().copied().collect::<BTreeMap<Target, usize>>(),
            last_modified: None,
            fetched_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn manifest(sources: Vec<SourceManifestEntry>) -> SourceManifest {
        SourceManifest {
            manifest_version: 1,
            run_id: "run-test".to_string(),
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            sources,
            failures: Vec::new(),
        }
    }

    #[test]
    fn capability_matrix_matches_detected_types() {
        assert_eq!(capability_chain(SourceType::Csv), (ExecutorType::Csv, vec![]));
        assert_eq!(
            capability_chain(SourceType::Pdf),
            (ExecutorType::Pdf, vec![ExecutorType::Image, ExecutorType::Html])
        );
        assert_eq!(
            capability_chain(SourceType::Unknown),
            (ExecutorType::Html, vec![ExecutorType::Api])
        );
    }

    #[test]
    fn tasks_follow_discover_rank_then_task_id() {
        let plan = build_extraction_plan(
            "run-test",
            &manifest(vec![
                entry("cand-b", SourceType::Html, &[(Target::Schedule, 1), (Target::Separation, 0)]),
                entry("cand-a", SourceType::Csv, &[(Target::Schedule, 0)]),
                entry("cand-c", SourceType::Pdf, &[(Target::Separation, 1)]),
            ]),
        )
        .unwrap();

        let order = plan
            .tasks
            .iter()
            .map(|task| task.task_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                "cand-a:schedule",
                "cand-b:separation",
                "cand-b:schedule",
                "cand-c:separation"
            ]
        );
        assert_eq!(plan.tasks[0].executor_type, ExecutorType::Csv);
        assert_eq!(plan.sources.len(), 3);
    }

    #[test]
    fn empty_plan_fails_without_retry() {
        let err = build_extraction_plan("run-test", &manifest(vec![entry("cand-a", SourceType::Csv, &[])]))
            .unwrap_err();
        assert_eq!(err.code(), "pipeline");
        assert!(!err.retryable());
    }
}
