use super::*;
use crate::config::PipelineOptions;
use crate::llm::scripted::{Reply, ScriptedModel};
use crate::model::{
    CleanupMetrics, ExtractionTask, ExecutorType, GateStatus, SourceDescriptor, SourceType,
    TaskExecution,
};
use crate::net::fetch::testing::StaticFetcher;
use crate::runtime::budget::Budget;
use crate::runtime::state::StepName;

fn ranked(id: &str, score: f64, confidence: f64, noise: f64) -> RankedSource {
    RankedSource {
        source_id: id.to_string(),
        rank_score: score,
        quality: SourceQualityScore {
            officialness: 0.9,
            parse_success: 1.0,
            noise_penalty: noise,
            confidence,
            ..SourceQualityScore::default()
        },
        records: 10,
        discover_rank: None,
    }
}

fn cleanup_entry(source_id: &str, target: Target, confidence: f64, noise: f64) -> CleanupSourceReport {
    CleanupSourceReport {
        task_id: format!("{source_id}:{target}"),
        source_id: source_id.to_string(),
        target,
        source_type: SourceType::Csv,
        status: GateStatus::Passed,
        reasons: Vec::new(),
        clean_records: 12,
        metrics: CleanupMetrics {
            total: 12,
            kept: 12,
            clean_count: 12,
            pass_rate: 1.0,
            noise_ratio: noise,
            schema_signal_rate: 0.8,
            required_field_coverage: 1.0,
            mean_confidence: confidence,
            ..CleanupMetrics::default()
        },
        hybrid: None,
    }
}

fn ctx() -> StepContext {
    StepContext::detached(StepName::Select, Budget::unbounded(), Duration::from_secs(5))
}

#[test]
fn noisy_top_candidate_is_vetoed_for_the_clean_one() {
    let a = ranked("cand-a", 0.9, 0.95, 0.9);
    let b = ranked("cand-b", 0.7, 0.9, 0.05);
    let gate = PreflightGate::default();

    let (primary, secondaries, vetoes) = walk_queue(Target::Schedule, &[&a, &b], &gate, 2).unwrap();
    assert_eq!(primary, "cand-b");
    assert!(secondaries.is_empty());
    assert_eq!(vetoes.len(), 1);
    assert!(vetoes[0].starts_with("cand-a:noise-penalty-above-threshold"));
}

#[test]
fn empty_queue_is_a_non_retryable_quality_error() {
    let a = ranked("cand-a", 0.9, 0.1, 0.0);
    let err = walk_queue(Target::Separation, &[&a], &PreflightGate::default(), 2).unwrap_err();
    assert!(!err.retryable());
    match err {
        PipelineError::Quality { gate, detail } => {
            assert_eq!(gate, "selection-preflight");
            assert!(detail.contains("confidence-below-threshold"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = walk_queue(Target::Separation, &[], &PreflightGate::default(), 2).unwrap_err();
    assert_eq!(err.code(), "quality");
}

#[test]
fn secondaries_follow_the_primary_up_to_the_cap() {
    let candidates = [
        ranked("cand-a", 0.9, 0.9, 0.0),
        ranked("cand-b", 0.8, 0.9, 0.0),
        ranked("cand-c", 0.7, 0.1, 0.0),
        ranked("cand-d", 0.6, 0.9, 0.0),
        ranked("cand-e", 0.5, 0.9, 0.0),
    ];
    let queue = candidates.iter().collect::<Vec<&RankedSource>>();
    let (primary, secondaries, vetoes) =
        walk_queue(Target::Schedule, &queue, &PreflightGate::default(), 2).unwrap();
    assert_eq!(primary, "cand-a");
    assert_eq!(secondaries, vec!["cand-b", "cand-d"]);
    assert!(vetoes.is_empty());
}

#[test]
fn ranking_breaks_ties_on_discover_rank() {
    let first = cleanup_entry("cand-z", Target::Schedule, 0.9, 0.0);
    let second = cleanup_entry("cand-a", Target::Schedule, 0.9, 0.0);
    let inputs = vec![
        SelectionInput {
            cleanup: &second,
            trust_score: 0.9,
            parse_success: 1.0,
            discover_rank: Some(1),
        },
        SelectionInput {
            cleanup: &first,
            trust_score: 0.9,
            parse_success: 1.0,
            discover_rank: Some(0),
        },
    ];
    let order = rank_sources(&inputs)
        .into_iter()
        .map(|candidate| candidate.source_id)
        .collect::<Vec<String>>();
    assert_eq!(order, vec!["cand-z", "cand-a"]);
}

#[test]
fn hybrid_mode_only_consults_the_model_on_close_calls() {
    let policy = SelectionPolicy::default();
    let close = [ranked("a", 0.80, 0.9, 0.0), ranked("b", 0.75, 0.9, 0.0)];
    let clear = [ranked("a", 0.90, 0.9, 0.0), ranked("b", 0.50, 0.9, 0.0)];
    assert!(should_consult_model(&policy, &close));
    assert!(!should_consult_model(&policy, &clear));

    let llm_first = SelectionPolicy {
        mode: SelectionMode::LlmFirst,
        ..SelectionPolicy::default()
    };
    assert!(should_consult_model(&llm_first, &clear));
    assert!(!should_consult_model(&llm_first, &clear[..1]));
}

#[tokio::test]
async fn model_choice_outside_the_top_k_falls_back_silently() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = PipelineOptions::for_tests(dir.path());
    options.selection.mode = SelectionMode::LlmFirst;
    let layout = RunLayout::new(&options.cache_root, "run-test");
    let fetcher = StaticFetcher::default();
    let model = ScriptedModel::new(vec![Reply::Structured(json!({"primarySourceId": "cand-x"}))]);
    let deps = PipelineDeps {
        options: &options,
        layout: &layout,
        run_id: "run-test",
        fetcher: &fetcher,
        model: &model,
    };

    let candidates = [ranked("cand-a", 0.9, 0.9, 0.0), ranked("cand-b", 0.8, 0.9, 0.0)];
    let decision = select_primary(deps, &ctx(), Target::Schedule, &candidates)
        .await
        .unwrap();
    assert_eq!(model.calls(), 1);
    assert_eq!(decision.primary_source_id, "cand-a");
    assert_eq!(decision.model_choice, None);
    assert_eq!(decision.mode, "llm-first");
}

#[tokio::test]
async fn valid_model_choice_goes_through_the_preflight_gate() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = PipelineOptions::for_tests(dir.path());
    options.selection.mode = SelectionMode::LlmFirst;
    let layout = RunLayout::new(&options.cache_root, "run-test");
    let fetcher = StaticFetcher::default();
    let model = ScriptedModel::new(vec![
        Reply::Text("```json\n{\"primarySourceId\": \"cand-b\"}\n```".to_string()),
        Reply::Structured(json!({"primarySourceId": "cand-c"})),
    ]);
    let deps = PipelineDeps {
        options: &options,
        layout: &layout,
        run_id: "run-test",
        fetcher: &fetcher,
        model: &model,
    };

    let candidates = [
        ranked("cand-a", 0.9, 0.9, 0.0),
        ranked("cand-b", 0.8, 0.9, 0.0),
        ranked("cand-c", 0.7, 0.9, 0.95),
    ];
    let decision = select_primary(deps, &ctx(), Target::Schedule, &candidates)
        .await
        .unwrap();
    assert_eq!(decision.primary_source_id, "cand-b");
    assert_eq!(decision.secondary_source_ids, vec!["cand-a"]);
    assert_eq!(decision.model_choice.as_deref(), Some("cand-b"));

    let decision = select_primary(deps, &ctx(), Target::Separation, &candidates)
        .await
        .unwrap();
    assert_eq!(decision.model_choice.as_deref(), Some("cand-c"));
    assert_eq!(decision.primary_source_id, "cand-a");
    assert!(decision.vetoed);
}

#[tokio::test]
async fn one_target_failing_leaves_the_other_decision_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = PipelineOptions::for_tests(dir.path());
    options.selection.mode = SelectionMode::Deterministic;
    let layout = RunLayout::new(&options.cache_root, "run-test");
    layout.create().unwrap();

    let cleanup = CleanupReport {
        report_version: 1,
        run_id: "run-test".to_string(),
        generated_at: now_utc_string(),
        sources: vec![
            cleanup_entry("cand-s", Target::Schedule, 0.2, 0.0),
            cleanup_entry("cand-p", Target::Separation, 0.9, 0.05),
        ],
    };
    let execution = ExecutionReport {
        report_version: 1,
        run_id: "run-test".to_string(),
        generated_at: now_utc_string(),
        tasks: ["cand-s:schedule", "cand-p:separation"]
            .iter()
            .map(|task_id| {
                let (source_id, target) = task_id.split_once(':').unwrap();
                TaskExecution {
                    task_id: task_id.to_string(),
                    source_id: source_id.to_string(),
                    target: Target::parse_label(target).unwrap(),
                    source_type: SourceType::Csv,
                    executor: Some(ExecutorType::Csv),
                    attempts: Vec::new(),
                    records: 12,
                    followed_links: Vec::new(),
                    parse_success: 1.0,
                }
            })
            .collect(),
    };
    let plan = ExtractionPlan {
        plan_version: 1,
        run_id: "run-test".to_string(),
        generated_at: now_utc_string(),
        tasks: vec![ExtractionTask {
            task_id: "cand-p:separation".to_string(),
            source_id: "cand-p".to_string(),
            source_type: SourceType::Csv,
            executor_type: ExecutorType::Csv,
            target: Target::Separation,
            fallback: Vec::new(),
            required_features: Vec::new(),
            rank: Some(0),
        }],
        sources: ["cand-s", "cand-p"]
            .iter()
            .map(|id| SourceDescriptor {
                id: id.to_string(),
                url: format!("https://www.city.example.lg.jp/{id}.csv"),
                local_path: format!("sources/{id}.csv"),
                source_type: SourceType::Csv,
                mime: Some("text/csv".to_string()),
                charset: None,
                trust_score: 1.0,
            })
            .collect(),
    };
    write_json_pretty(&layout.file(CLEANUP_REPORT), &cleanup).unwrap();
    write_json_pretty(&layout.file(EXECUTION_REPORT), &execution).unwrap();
    write_json_pretty(&layout.file(EXTRACTION_PLAN), &plan).unwrap();

    let fetcher = StaticFetcher::default();
    let model = ScriptedModel::default();
    let deps = PipelineDeps {
        options: &options,
        layout: &layout,
        run_id: "run-test",
        fetcher: &fetcher,
        model: &model,
    };

    let err = run(deps, &ctx()).await.unwrap_err();
    let pipeline = err.downcast_ref::<PipelineError>().unwrap();
    assert_eq!(pipeline.code(), "quality");
    assert!(pipeline.to_string().contains("schedule"));

    let report: SelectionReport = read_json(&layout.file(SELECTION_REPORT)).unwrap();
    assert!(report.decision(Target::Schedule).is_none());
    let separation = report.decision(Target::Separation).unwrap();
    assert_eq!(separation.primary_source_id, "cand-p");
    assert!(!separation.vetoed);
    assert_eq!(report.ranked[&Target::Separation][0].discover_rank, Some(0));
    assert_eq!(model.calls(), 0);
}
