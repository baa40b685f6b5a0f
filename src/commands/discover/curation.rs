use super::*;

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || key == "fbclid" || key == "gclid"
}

/// Lowercase scheme and host, no fragment, no default port, no tracking parameters and
/// no trailing slash on a non-root path. Non-http(s) URLs are refused.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    let kept = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<(String, String)>>();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept.iter());
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Some(url.to_string())
}

pub fn candidate_id(canonical_url: &str) -> String {
    format!("cand-{}", &sha256_hex(canonical_url.as_bytes())[..16])
}

pub fn officialness_for_host(host: &str, official_domains: &[String]) -> f64 {
    let host = host.to_ascii_lowercase();
    let official = official_domains.iter().any(|domain| {
        let domain = domain.to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    });
    if official {
        1.0
    } else if host.ends_with(".go.jp") || host.ends_with(".lg.jp") {
        0.9
    } else if host.contains("opendata") {
        0.7
    } else {
        0.2
    }
}

/// Machine-readable types only count as direct when the URL or the fetched content
/// confirms the type.
pub(super) fn directness(source_type: SourceType, url: &str, probed: Option<SourceType>) -> f64 {
    match source_type {
        SourceType::Csv | SourceType::Xlsx | SourceType::Api => {
            if source_type_from_url(url) == Some(source_type) || probed == Some(source_type) {
                1.0
            } else {
                0.3
            }
        }
        SourceType::Pdf => 0.6,
        SourceType::Html => 0.4,
        SourceType::Image => 0.3,
        SourceType::Unknown => 0.2,
    }
}

/// `0.5^(age_days / half_life_days)`; 0.5 when the date is unknown.
pub(super) fn freshness(last_modified: Option<&str>, half_life_days: f64, now: DateTime<Utc>) -> f64 {
    let Some(modified) = last_modified.and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
    else {
        return 0.5;
    };
    let age_days = (now - modified.with_timezone(&Utc)).num_seconds().max(0) as f64 / 86_400.0;
    clamp_unit(0.5_f64.powf(age_days / half_life_days.max(f64::EPSILON)))
}

fn feature_hits(text: &str, target: Target) -> usize {
    match target {
        Target::Schedule => {
            vocab::distinct_hits(text, vocab::SCHEDULE_KEYWORDS)
                + vocab::distinct_hits(text, vocab::WEEKDAY_KEYWORDS).min(2)
                + vocab::distinct_hits(text, vocab::CATEGORY_KEYWORDS).min(2)
        }
        Target::Separation => {
            vocab::distinct_hits(text, vocab::SEPARATION_KEYWORDS)
                + vocab::distinct_hits(text, vocab::CATEGORY_KEYWORDS).min(3)
        }
    }
}

fn content_parse_success(page: &PageProbe) -> f64 {
    let lines = page.lines.len();
    match page.source_type {
        SourceType::Csv => {
            let delimited = page
                .lines
                .iter()
                .filter(|line| line.contains(',') || line.contains('\t') || line.contains(';'))
                .count();
            if delimited >= 2 { 1.0 } else { 0.3 }
        }
        SourceType::Api => {
            if serde_json::from_str::<Value>(page.text.trim()).is_ok() {
                1.0
            } else {
                0.2
            }
        }
        SourceType::Xlsx => 0.8,
        SourceType::Html => {
            if lines >= 3 {
                0.7
            } else {
                0.3
            }
        }
        SourceType::Pdf => 0.4,
        SourceType::Image => 0.2,
        SourceType::Unknown => 0.1,
    }
}

fn prior_parse_success(source_type: SourceType) -> f64 {
    match source_type {
        SourceType::Csv | SourceType::Xlsx | SourceType::Api => 0.6,
        SourceType::Html => 0.5,
        SourceType::Pdf => 0.3,
        SourceType::Image => 0.2,
        SourceType::Unknown => 0.1,
    }
}

/// Evidence estimate for one candidate. Fetched content is measured line by line; without
/// it the estimate falls back to keyword relevance and per-type priors.
pub(super) fn estimate_evidence(
    source_type: SourceType,
    probe: &Probe,
    label_text: &str,
    hints: &[Target],
    officialness: f64,
    freshness_score: f64,
) -> DiscoverEvidenceMetrics {
    let mut metrics = DiscoverEvidenceMetrics {
        officialness,
        freshness_score,
        ..DiscoverEvidenceMetrics::default()
    };

    let page = match probe {
        Probe::Fetched(page) if !page.lines.is_empty() => page,
        Probe::Fetched(page) => {
            metrics.parse_success = content_parse_success(page);
            return metrics;
        }
        Probe::Failed => return metrics,
        Probe::NotFetched => {
            let (relevance, _) = vocab::relevance(label_text);
            metrics.coverage_schedule = if hints.contains(&Target::Schedule) { 0.5 * relevance } else { 0.0 };
            metrics.coverage_separation = if hints.contains(&Target::Separation) { 0.5 * relevance } else { 0.0 };
            metrics.cleanup_pass_rate = 0.5;
            metrics.parse_success = prior_parse_success(source_type);
            return metrics;
        }
    };

    let total = page.lines.len() as f64;
    let noise = page.lines.iter().filter(|line| vocab::is_noise_text(line)).count() as f64;
    let signal = page
        .lines
        .iter()
        .filter(|line| Target::ALL.iter().any(|target| vocab::has_target_signal(line, *target)))
        .count() as f64;

    metrics.coverage_schedule = clamp_unit(0.25 * feature_hits(&page.text, Target::Schedule) as f64);
    metrics.coverage_separation = clamp_unit(0.25 * feature_hits(&page.text, Target::Separation) as f64);
    metrics.noise_ratio = clamp_unit(noise / total);
    metrics.cleanup_pass_rate = clamp_unit(signal / total);
    metrics.parse_success = content_parse_success(page);
    metrics
}

pub(super) fn discover_score(evidence: &DiscoverEvidenceMetrics, hints: &[Target]) -> f64 {
    let coverage = hints
        .iter()
        .map(|target| evidence.coverage_for(*target))
        .fold(0.0, f64::max);
    SourceQualityScore {
        officialness: evidence.officialness,
        parse_success: evidence.parse_success,
        schema_coverage: coverage,
        cleanup_pass_rate: evidence.cleanup_pass_rate,
        freshness: evidence.freshness_score,
        ..SourceQualityScore::default()
    }
    .weighted(&DISCOVER_WEIGHTS)
}

/// First failing check wins, in a fixed order.
pub(super) fn reject_reason(
    url: &str,
    officialness: f64,
    relevance: f64,
    hints: &[Target],
    source_type: SourceType,
    directness: f64,
) -> Option<&'static str> {
    if vocab::is_utility_url(url) {
        return Some("utility-page");
    }
    if officialness < MIN_OFFICIALNESS {
        return Some("low-officialness");
    }
    if relevance < MIN_RELEVANCE {
        return Some("low-relevance");
    }
    if hints.is_empty() {
        return Some("no-target-hint");
    }
    if hints.contains(&Target::Schedule)
        && source_type.is_machine_readable()
        && directness < MIN_SCHEDULE_DIRECTNESS
    {
        return Some("insufficiently-direct");
    }
    None
}

pub(super) struct CurationContext<'a> {
    pub official_domains: &'a [String],
    pub half_life_days: f64,
    pub now: DateTime<Utc>,
}

/// Scores one raw candidate. `None` when the URL cannot be canonicalised.
pub(super) fn curate_candidate(
    raw: &RawCandidate,
    probe: &Probe,
    context: &CurationContext<'_>,
) -> Option<DiscoverCandidate> {
    let url = canonicalize_url(&raw.url)?;
    let host = Url::parse(&url).ok()?.host_str()?.to_string();

    let page = match probe {
        Probe::Fetched(page) => Some(page),
        _ => None,
    };
    let probed_type = page.map(|page| page.source_type).filter(|kind| *kind != SourceType::Unknown);
    let declared = raw
        .declared_type
        .as_deref()
        .map(SourceType::parse_label)
        .filter(|kind| *kind != SourceType::Unknown);
    let source_type = probed_type
        .or(declared)
        .or_else(|| source_type_from_url(&url))
        .unwrap_or(SourceType::Unknown);

    let title = raw.title.clone().or_else(|| page.and_then(|page| page.title.clone()));
    let page_text = page
        .map(|page| truncate_chars(&page.text, 4_000))
        .unwrap_or_default();
    let label_text = format!("{} {url}", title.as_deref().unwrap_or(""));
    let (relevance, relevance_hints) = vocab::relevance(&format!("{label_text} {page_text}"));

    let mut hints = raw
        .targets
        .iter()
        .filter_map(|label| Target::parse_label(label))
        .chain(relevance_hints)
        .collect::<HashSet<Target>>();
    let officialness = officialness_for_host(&host, context.official_domains);
    let fresh = freshness(
        page.and_then(|page| page.last_modified.as_deref()),
        context.half_life_days,
        context.now,
    );
    let provisional = hints.iter().copied().collect::<Vec<Target>>();
    let evidence = estimate_evidence(source_type, probe, &label_text, &provisional, officialness, fresh);
    if page.is_some() {
        for target in Target::ALL {
            if evidence.coverage_for(target) >= HINT_COVERAGE {
                hints.insert(target);
            }
        }
    }
    let target_hints = Target::ALL
        .into_iter()
        .filter(|target| hints.contains(target))
        .collect::<Vec<Target>>();

    let directness = directness(source_type, &url, probed_type);
    let score = discover_score(&evidence, &target_hints);
    let reject = reject_reason(&url, officialness, relevance, &target_hints, source_type, directness);

    Some(DiscoverCandidate {
        id: candidate_id(&url),
        url,
        source_type,
        target_hints,
        host,
        depth: raw.depth,
        officialness,
        directness,
        relevance,
        score,
        evidence_metrics: evidence,
        rejected: reject.is_some(),
        reject_reason: reject.map(str::to_string),
        title,
    })
}

/// Curates the whole pool. A duplicate URL keeps its best-scoring version; the result is
/// ordered by score.
pub(super) fn curate_pool(pool: &[PoolEntry], context: &CurationContext<'_>) -> Vec<DiscoverCandidate> {
    let mut best: BTreeMap<String, DiscoverCandidate> = BTreeMap::new();
    for entry in pool {
        let Some(candidate) = curate_candidate(&entry.raw, &entry.probe, context) else {
            continue;
        };
        let replace = best
            .get(&candidate.id)
            .map(|current| {
                candidate.score > current.score
                    || (candidate.score == current.score && candidate.depth < current.depth)
            })
            .unwrap_or(true);
        if replace {
            best.insert(candidate.id.clone(), candidate);
        }
    }

    let mut candidates = best.into_values().collect::<Vec<DiscoverCandidate>>();
    candidates.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.id.cmp(&right.id))
    });
    candidates
}

/// Ranked top-N accepted ids for one target, optionally restricted to locked hosts.
pub(super) fn select_top(
    candidates: &[DiscoverCandidate],
    target: Target,
    top_n: usize,
    allowed_hosts: &[String],
) -> Vec<String> {
    let mut eligible = candidates
        .iter()
        .filter(|candidate| !candidate.rejected && candidate.target_hints.contains(&target))
        .filter(|candidate| allowed_hosts.is_empty() || allowed_hosts.contains(&candidate.host))
        .collect::<Vec<&DiscoverCandidate>>();
    eligible.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| {
                right
                    .evidence_metrics
                    .coverage_for(target)
                    .total_cmp(&left.evidence_metrics.coverage_for(target))
            })
            .then_with(|| right.directness.total_cmp(&left.directness))
            .then_with(|| left.id.cmp(&right.id))
    });
    eligible
        .into_iter()
        .take(top_n)
        .map(|candidate| candidate.id.clone())
        .collect()
}

pub(super) fn build_output(
    city: &CityTarget,
    candidates: Vec<DiscoverCandidate>,
    top_n: usize,
    allowed_hosts: &[String],
) -> DiscoverOutputV2 {
    let mut selected = SelectedIds::default();
    for target in Target::ALL {
        selected.set(target, select_top(&candidates, target, top_n, allowed_hosts));
    }
    DiscoverOutputV2 {
        city_id: city.city_id.clone(),
        prefecture_id: city.prefecture_id.clone(),
        official_url: city.official_url.clone(),
        official_domains: city.official_domains.clone(),
        candidates,
        selected,
    }
}
