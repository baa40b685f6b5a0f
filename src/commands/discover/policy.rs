use super::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDecision {
    pub ready: bool,
    pub reason: String,
}

impl StopDecision {
    fn ready(reason: &str) -> Self {
        Self {
            ready: true,
            reason: reason.to_string(),
        }
    }

    fn not_ready(reason: String) -> Self {
        Self {
            ready: false,
            reason,
        }
    }
}

/// Whether the curated output is good enough to stop discovering. The reason names the
/// first unmet condition.
pub fn evaluate_discover_stop(output: &DiscoverOutputV2, policy: &StopPolicy) -> StopDecision {
    match policy.mode {
        StopMode::Coverage => {
            for target in Target::ALL {
                if output.selected.for_target(target).is_empty() {
                    return StopDecision::not_ready(format!("coverage-missing-{target}"));
                }
            }
            StopDecision::ready("coverage-met")
        }
        StopMode::Quality => {
            for target in Target::ALL {
                let Some(primary) = output.primary(target) else {
                    return StopDecision::not_ready(format!("quality-{target}-missing-primary"));
                };
                if target == Target::Schedule
                    && policy.require_machine_readable_schedule
                    && !primary.source_type.is_machine_readable()
                {
                    return StopDecision::not_ready("quality-schedule-not-machine-readable".to_string());
                }
                let evidence = &primary.evidence_metrics;
                if primary.score < policy.min_score {
                    return StopDecision::not_ready(format!(
                        "quality-{target}-score-below-threshold:{:.3}<{:.3}",
                        primary.score, policy.min_score
                    ));
                }
                if evidence.coverage_for(target) < policy.min_coverage {
                    return StopDecision::not_ready(format!(
                        "quality-{target}-coverage-below-threshold:{:.3}<{:.3}",
                        evidence.coverage_for(target),
                        policy.min_coverage
                    ));
                }
                if evidence.cleanup_pass_rate < policy.min_cleanup_pass_rate {
                    return StopDecision::not_ready(format!(
                        "quality-{target}-cleanup-below-threshold:{:.3}<{:.3}",
                        evidence.cleanup_pass_rate, policy.min_cleanup_pass_rate
                    ));
                }
                if evidence.noise_ratio > policy.max_noise_ratio {
                    return StopDecision::not_ready(format!(
                        "quality-{target}-noise-above-threshold:{:.3}>{:.3}",
                        evidence.noise_ratio, policy.max_noise_ratio
                    ));
                }
            }
            StopDecision::ready("quality-met")
        }
    }
}

/// `min(base + (round - 1) * step, max)` in milliseconds; rounds count from 1.
pub fn calculate_discover_round_timeout(base_ms: u64, step_ms: u64, max_ms: u64, round: u32) -> u64 {
    let extra = step_ms.saturating_mul(u64::from(round.saturating_sub(1)));
    base_ms.saturating_add(extra).min(max_ms)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTrust {
    pub host: String,
    pub trust: f64,
    pub count: usize,
    pub rank: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainLock {
    pub locked: bool,
    pub hosts: Vec<String>,
    pub ranking: Vec<HostTrust>,
}

/// Ranks candidate hosts by `trust * 10 + count` and locks onto the best trusted ones.
pub fn compute_domain_lock(
    candidates: &[DiscoverCandidate],
    official_domains: &[String],
    max_hosts: usize,
) -> DomainLock {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for candidate in candidates {
        *counts.entry(candidate.host.as_str()).or_default() += 1;
    }

    let mut ranking = counts
        .into_iter()
        .map(|(host, count)| {
            let trust = officialness_for_host(host, official_domains);
            HostTrust {
                host: host.to_string(),
                trust,
                count,
                rank: trust * 10.0 + count as f64,
            }
        })
        .collect::<Vec<HostTrust>>();
    ranking.sort_by(|left, right| {
        right
            .rank
            .total_cmp(&left.rank)
            .then_with(|| left.host.cmp(&right.host))
    });

    let hosts = ranking
        .iter()
        .filter(|entry| entry.trust >= LOCK_TRUST_THRESHOLD)
        .take(max_hosts.max(1))
        .map(|entry| entry.host.clone())
        .collect::<Vec<String>>();

    DomainLock {
        locked: !hosts.is_empty(),
        hosts,
        ranking,
    }
}

/// Normalises queries (NFKC, lowercase, single spaces) and refuses any query already
/// issued during the run.
#[derive(Debug, Default)]
pub struct QueryPolicy {
    seen: HashSet<String>,
    issued: Vec<String>,
}

impl QueryPolicy {
    pub fn normalize(query: &str) -> String {
        normalize_whitespace(&query.nfkc().collect::<String>().to_lowercase())
    }

    pub fn admit(&mut self, query: &str) -> Option<String> {
        let normalized = Self::normalize(query);
        if normalized.is_empty() || !self.seen.insert(normalized.clone()) {
            return None;
        }
        self.issued.push(normalized.clone());
        Some(normalized)
    }

    pub fn issued(&self) -> &[String] {
        &self.issued
    }
}
