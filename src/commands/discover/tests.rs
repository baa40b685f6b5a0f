use super::*;
use crate::config::PipelineOptions;
use crate::llm::scripted::{Reply, ScriptedModel};
use crate::net::fetch::testing::StaticFetcher;
use crate::runtime::artifacts::RunLayout;
use crate::runtime::budget::Budget;
use crate::runtime::state::StepName;
use crate::util::read_json;

const CSV_URL: &str = "https://www.city.example.lg.jp/gomi/calendar.csv";
const HTML_URL: &str = "https://www.city.example.lg.jp/gomi/bunbetsu.html";

fn candidate(id: &str, host: &str, source_type: SourceType, score: f64) -> DiscoverCandidate {
    DiscoverCandidate {
        id: id.to_string(),
        url: format!("https://{host}/{id}"),
        source_type,
        target_hints: Target::ALL.to_vec(),
        host: host.to_string(),
        depth: 0,
        officialness: 1.0,
        directness: 1.0,
        relevance: 0.8,
        score,
        evidence_metrics: DiscoverEvidenceMetrics {
            coverage_schedule: 0.9,
            coverage_separation: 0.9,
            noise_ratio: 0.05,
            cleanup_pass_rate: 0.9,
            freshness_score: 0.5,
            parse_success: 1.0,
            officialness: 1.0,
        },
        rejected: false,
        reject_reason: None,
        title: None,
    }
}

fn output_with(schedule: DiscoverCandidate, separation: DiscoverCandidate) -> DiscoverOutputV2 {
    DiscoverOutputV2 {
        city_id: "example-city".to_string(),
        prefecture_id: "example-pref".to_string(),
        official_url: None,
        official_domains: Vec::new(),
        selected: SelectedIds {
            schedule: vec![schedule.id.clone()],
            separation: vec![separation.id.clone()],
        },
        candidates: vec![schedule, separation],
    }
}

#[test]
fn domain_lock_prefers_the_repeated_government_host() {
    let candidates = vec![
        candidate("a", "www.city.example.lg.jp", SourceType::Csv, 0.8),
        candidate("b", "www.city.example.lg.jp", SourceType::Html, 0.7),
        candidate("c", "www.city.example.lg.jp", SourceType::Html, 0.6),
        candidate("d", "gomi-matome.example.com", SourceType::Html, 0.9),
    ];
    let lock = compute_domain_lock(&candidates, &[], 2);
    assert!(lock.locked);
    assert_eq!(lock.hosts, vec!["www.city.example.lg.jp".to_string()]);
    assert_eq!(lock.ranking[0].count, 3);
    assert_eq!(lock.ranking[0].rank, 0.9 * 10.0 + 3.0);
}

#[test]
fn no_lock_without_a_trusted_host() {
    let candidates = vec![candidate("d", "gomi-matome.example.com", SourceType::Html, 0.9)];
    let lock = compute_domain_lock(&candidates, &[], 2);
    assert!(!lock.locked);
    assert!(lock.hosts.is_empty());
    assert_eq!(lock.ranking.len(), 1);
}

#[test]
fn quality_stop_requires_machine_readable_schedule() {
    let policy = StopPolicy {
        mode: StopMode::Quality,
        require_machine_readable_schedule: true,
        ..StopPolicy::default()
    };
    let separation = candidate("sep", "www.city.example.lg.jp", SourceType::Html, 0.8);

    let html = output_with(
        candidate("sched", "www.city.example.lg.jp", SourceType::Html, 0.8),
        separation.clone(),
    );
    let decision = evaluate_discover_stop(&html, &policy);
    assert!(!decision.ready);
    assert_eq!(decision.reason, "quality-schedule-not-machine-readable");

    let csv = output_with(
        candidate("sched", "www.city.example.lg.jp", SourceType::Csv, 0.8),
        separation,
    );
    let decision = evaluate_discover_stop(&csv, &policy);
    assert!(decision.ready);
    assert_eq!(decision.reason, "quality-met");
}

#[test]
fn quality_stop_names_the_failed_threshold() {
    let mut weak = candidate("sched", "www.city.example.lg.jp", SourceType::Csv, 0.8);
    weak.evidence_metrics.noise_ratio = 0.7;
    let output = output_with(weak, candidate("sep", "www.city.example.lg.jp", SourceType::Html, 0.8));
    let decision = evaluate_discover_stop(&output, &StopPolicy::default());
    assert!(!decision.ready);
    assert_eq!(decision.reason, "quality-schedule-noise-above-threshold:0.700>0.500");
}

#[test]
fn coverage_stop_reports_the_missing_target() {
    let mut output = output_with(
        candidate("sched", "www.city.example.lg.jp", SourceType::Csv, 0.8),
        candidate("sep", "www.city.example.lg.jp", SourceType::Html, 0.8),
    );
    output.selected.separation.clear();
    let policy = StopPolicy {
        mode: StopMode::Coverage,
        ..StopPolicy::default()
    };
    let decision = evaluate_discover_stop(&output, &policy);
    assert_eq!(decision.reason, "coverage-missing-separation");
}

#[test]
fn round_timeouts_grow_then_cap() {
    let schedule = (1..=3)
        .map(|round| calculate_discover_round_timeout(35_000, 10_000, 90_000, round))
        .collect::<Vec<u64>>();
    assert_eq!(schedule, vec![35_000, 45_000, 55_000]);
    assert_eq!(calculate_discover_round_timeout(35_000, 10_000, 40_000, 3), 40_000);
}

#[test]
fn rejection_reasons_follow_a_fixed_order() {
    let url = "https://www.city.example.lg.jp/gomi/calendar.csv";
    let schedule = [Target::Schedule];
    assert_eq!(
        reject_reason("https://www.city.example.lg.jp/sitemap", 0.1, 0.0, &[], SourceType::Csv, 0.0),
        Some("utility-page")
    );
    assert_eq!(reject_reason(url, 0.2, 0.0, &[], SourceType::Csv, 0.0), Some("low-officialness"));
    assert_eq!(reject_reason(url, 1.0, 0.1, &[], SourceType::Csv, 0.0), Some("low-relevance"));
    assert_eq!(reject_reason(url, 1.0, 0.5, &[], SourceType::Csv, 0.0), Some("no-target-hint"));
    assert_eq!(
        reject_reason(url, 1.0, 0.5, &schedule, SourceType::Csv, 0.3),
        Some("insufficiently-direct")
    );
    assert_eq!(reject_reason(url, 1.0, 0.5, &schedule, SourceType::Html, 0.4), None);
    assert_eq!(reject_reason(url, 1.0, 0.5, &schedule, SourceType::Csv, 1.0), None);
}

#[test]
fn declared_csv_behind_an_extensionless_url_is_not_direct() {
    let raw = RawCandidate {
        url: "https://www.city.example.lg.jp/gomi/calendar".to_string(),
        declared_type: Some("csv".to_string()),
        targets: vec!["schedule".to_string()],
        title: Some("ごみ収集カレンダー".to_string()),
        depth: 0,
    };
    let context = CurationContext {
        official_domains: &["www.city.example.lg.jp".to_string()],
        half_life_days: 365.0,
        now: Utc::now(),
    };
    let curated = curate_candidate(&raw, &Probe::NotFetched, &context).unwrap();
    assert_eq!(curated.source_type, SourceType::Csv);
    assert_eq!(curated.directness, 0.3);
    assert!(curated.rejected);
    assert_eq!(curated.reject_reason.as_deref(), Some("insufficiently-direct"));
}

#[test]
fn officialness_tiers() {
    let official = ["city.example.lg.jp".to_string()];
    assert_eq!(officialness_for_host("www.city.example.lg.jp", &official), 1.0);
    assert_eq!(officialness_for_host("www.city.other.lg.jp", &official), 0.9);
    assert_eq!(officialness_for_host("opendata.example.com", &official), 0.7);
    assert_eq!(officialness_for_host("example.com", &official), 0.2);
}

#[test]
fn freshness_halves_over_one_half_life() {
    let now = DateTime::parse_from_rfc2822("Wed, 01 Jan 2025 00:00:00 +0000")
        .unwrap()
        .with_timezone(&Utc);
    let value = freshness(Some("Tue, 02 Jan 2024 00:00:00 +0000"), 365.0, now);
    assert!((value - 0.5).abs() < 1e-9, "freshness {value}");
    assert_eq!(freshness(None, 365.0, now), 0.5);
    assert_eq!(freshness(Some("not a date"), 365.0, now), 0.5);
}

#[test]
fn canonical_urls_drop_tracking_and_fragments() {
    let canonical =
        canonicalize_url("HTTPS://WWW.City.Example.LG.JP:443/gomi/?utm_source=x&id=3#top").unwrap();
    assert_eq!(canonical, "https://www.city.example.lg.jp/gomi?id=3");
    assert_eq!(canonicalize_url(&canonical).as_deref(), Some(canonical.as_str()));
    assert_eq!(
        canonicalize_url("https://example.jp/").as_deref(),
        Some("https://example.jp/")
    );
    assert_eq!(canonicalize_url("ftp://example.jp/file.csv"), None);

    let id = candidate_id(&canonical);
    assert!(id.starts_with("cand-"));
    assert_eq!(id.len(), 21);
}

#[test]
fn query_policy_normalises_and_drops_repeats() {
    let mut policy = QueryPolicy::default();
    assert_eq!(policy.admit("ごみ  収集日").as_deref(), Some("ごみ 収集日"));
    assert_eq!(policy.admit(" ごみ 収集日 "), None);
    assert_eq!(policy.admit("ＧＯＭＩ Calendar").as_deref(), Some("gomi calendar"));
    assert_eq!(policy.admit("   "), None);
    assert_eq!(policy.issued().len(), 2);
}

#[test]
fn outbound_links_keep_waste_data_and_skip_utility_pages() {
    let html = r#"
        <html><body>
          <a href="/gomi/calendar.csv">カレンダー(CSV)</a>
          <a href="/contact">お問い合わせ</a>
          <a href="/news">お知らせ</a>
          <a href="bunbetsu.html#list">ごみ分別一覧</a>
          <a href="bunbetsu.html">ごみ分別一覧</a>
        </body></html>
    "#;
    let links = outbound_links(html, "https://www.city.example.lg.jp/gomi/index.html");
    let urls = links.iter().map(|(url, _)| url.as_str()).collect::<Vec<&str>>();
    assert_eq!(urls, vec![CSV_URL, HTML_URL]);
    assert_eq!(links[1].1, "ごみ分別一覧");
}

fn fetcher() -> StaticFetcher {
    StaticFetcher::default()
        .with_page(
            CSV_URL,
            "text/csv; charset=utf-8",
            "地区,燃やすごみ,資源\n中央,月曜,木曜\n北,火曜,金曜\n",
        )
        .with_page(
            HTML_URL,
            "text/html; charset=utf-8",
            "<html><head><title>ごみの分別</title></head><body><h1>ごみの分け方・出し方</h1>\
             <p>燃やすごみ 生ごみ</p><p>資源 びん 缶</p></body></html>",
        )
}

fn good_reply() -> Reply {
    Reply::Structured(json!({
        "candidates": [
            {"url": CSV_URL, "type": "csv", "targets": ["schedule"], "title": "ごみ収集カレンダー"},
            {"url": HTML_URL, "type": "html", "targets": ["separation"], "title": "ごみの分別"}
        ]
    }))
}

fn garbage_reply() -> Reply {
    Reply::Text("I could not find anything useful.".to_string())
}

fn coverage_options(root: &std::path::Path) -> PipelineOptions {
    let mut options = PipelineOptions::for_tests(root);
    options.discover.stop.mode = StopMode::Coverage;
    options
}

fn ctx() -> StepContext {
    StepContext::detached(StepName::Discover, Budget::unbounded(), Duration::from_secs(120))
}

async fn discover_with(
    options: &PipelineOptions,
    fetcher: &StaticFetcher,
    model: &ScriptedModel,
) -> (Result<DiscoverOutputV2, PipelineError>, DiscoverReport) {
    let layout = RunLayout::new(&options.cache_root, "run-test");
    let deps = PipelineDeps {
        options,
        layout: &layout,
        run_id: "run-test",
        fetcher,
        model,
    };
    let ctx = ctx();
    let mut engine = DiscoverEngine::new(deps, &ctx);
    let outcome = engine.discover().await;
    let report = engine.report(outcome.as_ref().err());
    (outcome, report)
}

#[tokio::test]
async fn one_good_round_meets_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let options = coverage_options(dir.path());
    let fetcher = fetcher();
    let model = ScriptedModel::new(vec![good_reply()]);

    let (outcome, report) = discover_with(&options, &fetcher, &model).await;
    let output = outcome.unwrap();

    assert!(output.selected.schedule.contains(&candidate_id(CSV_URL)));
    assert!(output.selected.separation.contains(&candidate_id(HTML_URL)));
    let csv = output.candidate(&candidate_id(CSV_URL)).unwrap();
    assert_eq!(csv.source_type, SourceType::Csv);
    assert_eq!(csv.officialness, 1.0);
    assert!(!csv.rejected);

    assert_eq!(report.rounds.len(), 1);
    assert_eq!(report.rounds[0].new_candidates, 2);
    assert_eq!(report.stop.as_ref().map(|stop| stop.reason.as_str()), Some("coverage-met"));
    assert_eq!(report.fetches_used, 2);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn unparseable_round_is_followed_by_another() {
    let dir = tempfile::tempdir().unwrap();
    let options = coverage_options(dir.path());
    let fetcher = fetcher();
    let model = ScriptedModel::new(vec![garbage_reply(), good_reply()]);

    let (outcome, report) = discover_with(&options, &fetcher, &model).await;
    assert!(outcome.is_ok());
    assert_eq!(report.rounds.len(), 2);
    assert_eq!(report.rounds[0].proposed, 0);
    assert!(report.rounds[0].soft_fail.is_none());
    assert_eq!(report.rounds[0].stop.reason, "coverage-missing-schedule");
    assert!(report.rounds[1].stop.ready);

    let prompts = model.prompts_for("discover");
    assert!(prompts[1].contains("Still missing a good source for: schedule, separation"));
}

#[tokio::test]
async fn exhausted_rounds_fail_with_the_unmet_policy_and_keep_the_report() {
    let dir = tempfile::tempdir().unwrap();
    let options = coverage_options(dir.path());
    let layout = RunLayout::new(&options.cache_root, "run-test");
    layout.create().unwrap();
    let fetcher = fetcher();
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
    assert!(!pipeline.retryable());
    match pipeline {
        PipelineError::Quality { gate, detail } => {
            assert_eq!(gate, "discover-stop");
            assert!(detail.contains("coverage-missing-schedule"));
            assert!(detail.contains("after 3 rounds"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let report: Value = read_json(&layout.file(DISCOVER_REPORT)).unwrap();
    let rounds = report["rounds"].as_array().unwrap();
    assert_eq!(rounds.len(), 3);
    assert!(rounds.iter().all(|round| round["softFail"].is_string()));
    let timeouts = rounds
        .iter()
        .map(|round| round["timeoutMs"].as_u64().unwrap())
        .collect::<Vec<u64>>();
    assert_eq!(timeouts, vec![35_000, 45_000, 55_000]);
    assert!(report["error"].as_str().unwrap().contains("discover-stop"));
    assert!(!layout.file(DISCOVER_SELECTED).exists());
}

#[tokio::test]
async fn required_lock_fails_fast_on_untrusted_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = coverage_options(dir.path());
    options.discover.require_domain_lock = true;
    options.discover.domain_lock_failure = DomainLockFailure::FailFast;
    let fetcher = StaticFetcher::default();
    let model = ScriptedModel::new(vec![Reply::Structured(json!({
        "candidates": [{"url": "https://gomi-matome.example.com/calendar.csv", "targets": ["schedule"]}]
    }))]);

    let (outcome, report) = discover_with(&options, &fetcher, &model).await;
    match outcome.unwrap_err() {
        PipelineError::Quality { gate, .. } => assert_eq!(gate, "domain-lock"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.calls(), 1);
    assert!(!report.emergency_used);
    assert!(!report.domain_lock.locked);
}

#[tokio::test]
async fn emergency_burst_restricts_queries_to_the_official_domain() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = coverage_options(dir.path());
    options.discover.require_domain_lock = true;
    options.discover.domain_lock_failure = DomainLockFailure::EmergencyBurst;
    let fetcher = fetcher();
    let model = ScriptedModel::new(vec![garbage_reply(), good_reply()]);

    let (outcome, report) = discover_with(&options, &fetcher, &model).await;
    assert!(outcome.is_ok());
    assert!(report.emergency_used);
    assert!(!report.rounds[0].emergency);
    assert!(report.rounds[1].emergency);
    assert!(
        report.rounds[1]
            .queries
            .contains(&"site:www.city.example.lg.jp ごみ 収集日".to_string())
    );
    assert_eq!(report.domain_lock.hosts, vec!["www.city.example.lg.jp".to_string()]);
}

#[tokio::test]
async fn emergency_burst_is_issued_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = coverage_options(dir.path());
    options.discover.require_domain_lock = true;
    let fetcher = fetcher();
    let model = ScriptedModel::new(vec![garbage_reply(), garbage_reply(), good_reply()]);

    let (outcome, report) = discover_with(&options, &fetcher, &model).await;
    match outcome.unwrap_err() {
        PipelineError::Quality { gate, detail } => {
            assert_eq!(gate, "domain-lock");
            assert!(detail.contains("after round 2"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.calls(), 2);
    assert_eq!(report.rounds.len(), 2);
}

#[tokio::test]
async fn hung_round_keeps_the_pool_and_reports_a_step_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = coverage_options(dir.path());
    options.discover.max_rounds = 2;
    options.discover.round_timeout_base_ms = 200;
    options.discover.round_timeout_step_ms = 0;
    options.discover.round_timeout_max_ms = 200;
    let fetcher = StaticFetcher::default().with_page(
        CSV_URL,
        "text/csv; charset=utf-8",
        "地区,収集曜日\n中央,月曜日\n北,火曜日\n",
    );
    let model = ScriptedModel::new(vec![
        Reply::Structured(json!({
            "candidates": [
                {"url": CSV_URL, "type": "csv", "targets": ["schedule"], "title": "ごみ収集カレンダー"}
            ]
        })),
        Reply::Hang,
    ]);

    let (outcome, report) = discover_with(&options, &fetcher, &model).await;
    match outcome.unwrap_err() {
        PipelineError::Quality { gate, .. } => assert_eq!(gate, "discover-stop"),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.calls(), 2);
    assert_eq!(report.rounds.len(), 2);
    assert_eq!(report.rounds[0].new_candidates, 1);
    assert!(report.rounds[0].soft_fail.is_none());
    assert!(!report.rounds[0].stop.ready);

    let hung = &report.rounds[1];
    assert!(hung.soft_fail.as_deref().unwrap().starts_with("step-timeout"));
    assert_eq!(hung.timeout_ms, 200);
    assert_eq!(hung.proposed, 0);
    assert_eq!(report.pool_size, 1);
}
