use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::commands::run::PipelineDeps;
use crate::error::PipelineError;
use crate::model::{
    DiscoverCandidate, DiscoverOutputV2, DownloadFailure, SourceManifest, SourceManifestEntry,
    SourceType, Target,
};
use crate::net::fetch::FetchedDocument;
use crate::runtime::artifacts::{DISCOVER_SELECTED, SOURCE_MANIFEST};
use crate::runtime::runner::StepContext;
use crate::util::{now_utc_string, read_json, sha256_hex, write_bytes_atomic, write_json_pretty};

const MANIFEST_VERSION: u32 = 1;

/// Selected ids across every target, interleaved by rank so each target's primary is
/// fetched before anyone's runner-up.
pub fn download_order(discovered: &DiscoverOutputV2) -> Vec<String> {
    let depth = Target::ALL
        .iter()
        .map(|target| discovered.selected.for_target(*target).len())
        .max()
        .unwrap_or(0);

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for rank in 0..depth {
        for target in Target::ALL {
            if let Some(id) = discovered.selected.for_target(target).get(rank)
                && seen.insert(id.clone())
            {
                order.push(id.clone());
            }
        }
    }
    order
}

fn manifest_entry(
    discovered: &DiscoverOutputV2,
    candidate: &DiscoverCandidate,
    document: &FetchedDocument,
) -> SourceManifestEntry {
    let detected = document.source_type();
    let source_type = if detected == SourceType::Unknown {
        candidate.source_type
    } else {
        detected
    };

    let discover_rank = Target::ALL
        .iter()
        .filter_map(|target| {
            discovered
                .rank_of(&candidate.id, *target)
                .map(|rank| (*target, rank))
        })
        .collect::<BTreeMap<Target, usize>>();

    SourceManifestEntry {
        id: candidate.id.clone(),
        url: candidate.url.clone(),
        final_url: document.final_url.clone(),
        local_path: format!("sources/{}.{}", candidate.id, source_type.file_extension()),
        source_type,
        mime: document.mime.clone(),
        charset: document.charset.clone(),
        bytes: document.bytes.len() as u64,
        sha256: sha256_hex(&document.bytes),
        trust_score: candidate.officialness,
        target_hints: discover_rank.keys().copied().collect(),
        discover_rank,
        last_modified: document.last_modified.clone(),
        fetched_at: document.fetched_at.clone(),
    }
}

pub async fn run(deps: PipelineDeps<'_>, ctx: &StepContext) -> Result<SourceManifest> {
    let discovered: DiscoverOutputV2 = read_json(&deps.layout.file(DISCOVER_SELECTED))?;
    let order = download_order(&discovered);
    info!(selected = order.len(), "downloading selected sources");

    let mut sources = Vec::new();
    let mut failures = Vec::new();
    for id in &order {
        ctx.check_cancelled()?;
        let Some(candidate) = discovered.candidate(id) else {
            failures.push(DownloadFailure {
                id: id.clone(),
                url: String::new(),
                code: "pipeline".to_string(),
                message: format!("selected id {id} has no candidate entry"),
            });
            continue;
        };

        let timeout = ctx.bounded(deps.options.fetch.timeout);
        let document = match deps.fetcher.fetch(&candidate.url, &ctx.cancel, timeout).await {
            Ok(document) => document,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled.into()),
            Err(err) => {
                warn!(id = %id, url = %candidate.url, code = err.code(), error = %err, "download failed");
                failures.push(DownloadFailure {
                    id: id.clone(),
                    url: candidate.url.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        let entry = manifest_entry(&discovered, candidate, &document);
        write_bytes_atomic(&deps.layout.run_dir().join(&entry.local_path), &document.bytes)?;
        ctx.events.emit(
            "source-downloaded",
            json!({
                "id": entry.id,
                "url": entry.final_url,
                "type": entry.source_type,
                "bytes": entry.bytes,
            }),
        );
        sources.push(entry);
    }

    let manifest = SourceManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: deps.run_id.to_string(),
        generated_at: now_utc_string(),
        sources,
        failures,
    };
    write_json_pretty(&deps.layout.file(SOURCE_MANIFEST), &manifest)?;

    info!(
        downloaded = manifest.sources.len(),
        failed = manifest.failures.len(),
        "download finished"
    );

    if manifest.sources.is_empty() {
        return Err(PipelineError::network(format!(
            "none of {} selected sources could be downloaded",
            order.len()
        ))
        .into());
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::PipelineOptions;
    use crate::llm::scripted::ScriptedModel;
    use crate::model::{DiscoverEvidenceMetrics, SelectedIds};
    use crate::net::fetch::testing::StaticFetcher;
    use crate::runtime::artifacts::RunLayout;
    use crate::runtime::budget::Budget;
    use crate::runtime::state::StepName;

    fn candidate(id: &str, url: &str, source_type: SourceType) -> DiscoverCandidate {
        DiscoverCandidate {
            id: id.to_string(),
            url: url.to_string(),
            source_type,
            target_hints: vec![Target::Schedule],
            host: "www.city.example.lg.jp".to_string(),
            depth: 0,
            officialness: 0.9,
            directness: 1.0,
            relevance: 0.6,
            score: 0.7,
            evidence_metrics: DiscoverEvidenceMetrics::default(),
            rejected: false,
            reject_reason: None,
            title: None,
        }
    }

    fn discovered() -> DiscoverOutputV2 {
        DiscoverOutputV2 {
            city_id: "example-city".to_string(),
            prefecture_id: "example-pref".to_string(),
            official_url: None,
            official_domains: Vec::new(),
            candidates: vec![
                candidate("cand-a", "https://www.city.example.lg.jp/a.csv", SourceType::Csv),
                candidate("cand-b", "https://www.city.example.lg.jp/b.html", SourceType::Html),
                candidate("cand-c", "https://www.city.example.lg.jp/c.html", SourceType::Html),
            ],
            selected: SelectedIds {
                schedule: vec!["cand-a".to_string(), "cand-c".to_string()],
                separation: vec!["cand-b".to_string(), "cand-a".to_string()],
            },
        }
    }

    #[test]
    fn order_interleaves_targets_by_rank() {
        assert_eq!(download_order(&discovered()), vec!["cand-a", "cand-b", "cand-c"]);
    }

    #[tokio::test]
    async fn failed_fetches_are_recorded_and_the_rest_saved() {
        let dir = tempfile::tempdir().unwrap();
        let options = PipelineOptions::for_tests(dir.path());
        let layout = RunLayout::new(&options.cache_root, "run-test");
        layout.create().unwrap();
        write_json_pretty(&layout.file(DISCOVER_SELECTED), &discovered()).unwrap();

        let fetcher = StaticFetcher::default()
            .with_page(
                "https://www.city.example.lg.jp/a.csv",
                "text/csv",
                "品目,収集日\n燃やすごみ,月曜日\n",
            )
            .with_page(
                "https://www.city.example.lg.jp/b.html",
                "text/html; charset=utf-8",
                "<html><body><p>分別</p></body></html>",
            );
        let model = ScriptedModel::default();
        let deps = PipelineDeps {
            options: &options,
            layout: &layout,
            run_id: "run-test",
            fetcher: &fetcher,
            model: &model,
        };
        let ctx = StepContext::detached(StepName::Download, Budget::unbounded(), Duration::from_secs(5));

        let manifest = run(deps, &ctx).await.unwrap();
        assert_eq!(manifest.sources.len(), 2);
        assert_eq!(manifest.failures.len(), 1);
        assert_eq!(manifest.failures[0].id, "cand-c");
        assert_eq!(manifest.failures[0].code, "network");

        let csv = &manifest.sources[0];
        assert_eq!(csv.local_path, "sources/cand-a.csv");
        assert_eq!(csv.discover_rank[&Target::Schedule], 0);
        assert_eq!(csv.discover_rank[&Target::Separation], 1);
        assert_eq!(csv.target_hints, vec![Target::Schedule, Target::Separation]);
        assert_eq!(csv.charset, None);
        assert_eq!(manifest.sources[1].charset.as_deref(), Some("utf-8"));
        assert!(layout.run_dir().join(&csv.local_path).exists());
        assert!(layout.file(SOURCE_MANIFEST).exists());
    }

    #[tokio::test]
    async fn nothing_downloaded_is_a_retryable_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = PipelineOptions::for_tests(dir.path());
        let layout = RunLayout::new(&options.cache_root, "run-test");
        layout.create().unwrap();
        write_json_pretty(&layout.file(DISCOVER_SELECTED), &discovered()).unwrap();

        let fetcher = StaticFetcher::default();
        let model = ScriptedModel::default();
        let deps = PipelineDeps {
            options: &options,
            layout: &layout,
            run_id: "run-test",
            fetcher: &fetcher,
            model: &model,
        };
        let ctx = StepContext::detached(StepName::Download, Budget::unbounded(), Duration::from_secs(5));

        let err = run(deps, &ctx).await.unwrap_err();
        let pipeline = err.downcast_ref::<PipelineError>().unwrap();
        assert!(pipeline.retryable());
        assert_eq!(fetcher.request_count(), 3);
    }
}
