use super::*;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    pub round: u32,
    pub timeout_ms: u64,
    pub emergency: bool,
    pub queries: Vec<String>,
    pub search_hits: usize,
    pub proposed: usize,
    pub new_candidates: usize,
    pub accepted: usize,
    pub tool_calls: usize,
    pub fetches_used: usize,
    pub soft_fail: Option<String>,
    pub domain_locked: bool,
    pub stop: StopDecision,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverReport {
    pub report_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub city_id: String,
    pub prefecture_id: String,
    pub stop_mode: String,
    pub rounds: Vec<RoundReport>,
    pub stop: Option<StopDecision>,
    pub domain_lock: DomainLock,
    pub queries: Vec<String>,
    pub fetches_used: usize,
    pub emergency_used: bool,
    pub pool_size: usize,
    pub error: Option<String>,
}

/// What one model call produced: raw candidates, the pages its tools already fetched,
/// and the soft-failure message when the call did not complete.
struct ModelRound {
    candidates: Vec<RawCandidate>,
    probes: HashMap<String, PageProbe>,
    tool_calls: usize,
    soft_fail: Option<String>,
}

/// Bounded multi-round search for candidate sources. The pool is cumulative: every round
/// re-curates everything seen so far.
pub(super) struct DiscoverEngine<'a> {
    deps: PipelineDeps<'a>,
    ctx: &'a StepContext,
    policy: &'a DiscoverPolicy,
    queries: Mutex<QueryPolicy>,
    budget: FetchBudget,
    pool: Vec<PoolEntry>,
    seen: HashSet<String>,
    missing: Vec<Target>,
    lock: DomainLock,
    rounds: Vec<RoundReport>,
    stop: Option<StopDecision>,
    emergency_used: bool,
    emergency_pending: bool,
}

impl<'a> DiscoverEngine<'a> {
    pub fn new(deps: PipelineDeps<'a>, ctx: &'a StepContext) -> Self {
        let policy = &deps.options.discover;
        Self {
            deps,
            ctx,
            policy,
            queries: Mutex::new(QueryPolicy::default()),
            budget: FetchBudget::new(policy.max_fetches, policy.fetch_cap),
            pool: Vec::new(),
            seen: HashSet::new(),
            missing: Target::ALL.to_vec(),
            lock: DomainLock::default(),
            rounds: Vec::new(),
            stop: None,
            emergency_used: false,
            emergency_pending: false,
        }
    }

    fn city(&self) -> &'a CityTarget {
        &self.deps.options.city
    }

    pub async fn discover(&mut self) -> Result<DiscoverOutputV2, PipelineError> {
        for round in 1..=self.policy.max_rounds {
            self.ctx.check_cancelled()?;
            if let Some(output) = self.round(round).await? {
                return Ok(output);
            }
        }

        // Final pass over everything gathered, in case the last enrichment tipped it.
        let output = self.curated_output();
        let stop = evaluate_discover_stop(&output, &self.policy.stop);
        self.stop = Some(stop.clone());
        if stop.ready {
            info!(reason = %stop.reason, "discover stop condition met on final curation");
            return Ok(output);
        }
        Err(PipelineError::quality(
            "discover-stop",
            format!(
                "{} after {} rounds ({} mode)",
                stop.reason,
                self.policy.max_rounds,
                self.policy.stop.mode.as_str()
            ),
        ))
    }

    /// One round. `Some` when the stop condition is met.
    async fn round(&mut self, round: u32) -> Result<Option<DiscoverOutputV2>, PipelineError> {
        let configured = calculate_discover_round_timeout(
            self.policy.round_timeout_base_ms,
            self.policy.round_timeout_step_ms,
            self.policy.round_timeout_max_ms,
            round,
        );
        let timeout = self.ctx.bounded(Duration::from_millis(configured));
        let emergency = std::mem::take(&mut self.emergency_pending);
        let queries = self.round_queries(round, emergency);
        self.budget.start_round();
        info!(round, timeout_ms = duration_ms(timeout), queries = queries.len(), emergency, "discover round");

        let hits = self.search_all(&queries, timeout).await?;
        let search_hits: usize = hits.iter().map(|(_, results)| results.len()).sum();
        let model_round = self.ask_model(round, &hits, timeout).await?;
        let proposed = model_round.candidates.len();
        let new_candidates = self
            .enrich(model_round.candidates, model_round.probes, timeout)
            .await?;

        let curated = self.curate();
        let accepted = curated
            .iter()
            .filter(|candidate| !candidate.rejected)
            .cloned()
            .collect::<Vec<DiscoverCandidate>>();
        self.lock = compute_domain_lock(
            &accepted,
            &self.city().official_domains,
            self.policy.max_host_switches,
        );

        let mut report = RoundReport {
            round,
            timeout_ms: duration_ms(timeout),
            emergency,
            queries,
            search_hits,
            proposed,
            new_candidates,
            accepted: accepted.len(),
            tool_calls: model_round.tool_calls,
            fetches_used: self.budget.used(),
            soft_fail: model_round.soft_fail,
            domain_locked: self.lock.locked,
            stop: StopDecision {
                ready: false,
                reason: "domain-lock-missing".to_string(),
            },
        };

        if self.policy.require_domain_lock && !self.lock.locked {
            let may_burst = self.policy.domain_lock_failure == DomainLockFailure::EmergencyBurst
                && !self.emergency_used
                && round < self.policy.max_rounds;
            self.record_round(report);
            if may_burst {
                warn!(round, "no trusted host yet; next round is an emergency burst");
                self.emergency_used = true;
                self.emergency_pending = true;
                return Ok(None);
            }
            self.stop = Some(StopDecision {
                ready: false,
                reason: "domain-lock-missing".to_string(),
            });
            return Err(PipelineError::quality(
                "domain-lock",
                format!(
                    "no host reached trust {LOCK_TRUST_THRESHOLD} after round {round} (emergency burst used: {})",
                    self.emergency_used
                ),
            ));
        }

        let output = build_output(self.city(), curated, self.policy.top_n, self.allowed_hosts());
        let stop = evaluate_discover_stop(&output, &self.policy.stop);
        self.missing = Target::ALL
            .into_iter()
            .filter(|target| output.selected.for_target(*target).is_empty())
            .collect();
        report.stop = stop.clone();
        self.record_round(report);
        self.stop = Some(stop.clone());

        if stop.ready {
            info!(round, reason = %stop.reason, "discover stop condition met");
            return Ok(Some(output));
        }
        debug!(round, reason = %stop.reason, "discover stop condition not met");
        Ok(None)
    }

    fn allowed_hosts(&self) -> &[String] {
        if self.policy.require_domain_lock && self.lock.locked {
            &self.lock.hosts
        } else {
            &[]
        }
    }

    fn round_queries(&self, round: u32, emergency: bool) -> Vec<String> {
        let proposed = if emergency {
            emergency_queries(self.city())
        } else if round == 1 {
            initial_queries(self.city())
        } else {
            follow_up_queries(self.city(), &self.missing, &self.lock.hosts)
        };
        let Ok(mut policy) = self.queries.lock() else {
            return Vec::new();
        };
        proposed
            .iter()
            .filter_map(|query| policy.admit(query))
            .collect()
    }

    async fn search_all(
        &self,
        queries: &[String],
        timeout: Duration,
    ) -> Result<Vec<(String, Vec<SearchHit>)>, PipelineError> {
        let mut out = Vec::new();
        for query in queries {
            let limit = self.ctx.bounded(self.deps.options.fetch.timeout.min(timeout));
            match web_search(self.deps.fetcher, query, SEARCH_RESULTS_PER_QUERY, &self.ctx.cancel, limit).await {
                Ok(hits) => out.push((query.clone(), hits)),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => warn!(query = %query, code = err.code(), error = %err, "search failed"),
            }
        }
        Ok(out)
    }

    async fn ask_model(
        &self,
        round: u32,
        hits: &[(String, Vec<SearchHit>)],
        timeout: Duration,
    ) -> Result<ModelRound, PipelineError> {
        let known_candidates = self.curate();
        let known = known_candidates
            .iter()
            .filter(|candidate| !candidate.rejected)
            .collect::<Vec<&DiscoverCandidate>>();
        let prompt = round_prompt(self.city(), round, &self.missing, hits, &known);
        let request = ModelRequest::new("discover", SYSTEM_PROMPT, prompt)
            .with_schema(discover_schema())
            .with_tools(
                &[ToolKind::WebSearch, ToolKind::FetchPage],
                self.policy.max_tool_iterations,
            )
            .with_timeout(timeout);

        let tools = DiscoverTools {
            fetcher: self.deps.fetcher,
            queries: &self.queries,
            budget: &self.budget,
            timeout: self.ctx.bounded(self.deps.options.fetch.timeout.min(timeout)),
            probes: Mutex::new(HashMap::new()),
        };
        let result = bounded_call(
            &self.ctx.cancel,
            timeout,
            "discover-round",
            self.deps.model.generate(&request, Some(&tools as &dyn ToolExecutor), &self.ctx.cancel),
        )
        .await;
        let probes = tools.probes.into_inner().unwrap_or_default();

        let response = match result {
            Ok(response) => response,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                warn!(round, code = err.code(), error = %err, "discover model call failed; salvaging curated pool");
                return Ok(ModelRound {
                    candidates: Vec::new(),
                    probes,
                    tool_calls: 0,
                    soft_fail: Some(format!("{}: {err}", err.code())),
                });
            }
        };

        let candidates = match decode_response::<RawCandidates>(response.structured.as_ref(), &response.text) {
            Ok(decoded) => {
                if decoded.is_tolerant() {
                    debug!(round, "discover answer decoded from free text");
                }
                decoded.into_inner().candidates
            }
            Err(err) => {
                warn!(round, error = %err, "discover answer unparseable; treating as no candidates");
                Vec::new()
            }
        };
        Ok(ModelRound {
            candidates,
            probes,
            tool_calls: response.tool_calls,
            soft_fail: None,
        })
    }

    /// Adds unseen candidates to the pool, fetching each within the fetch budget and
    /// queueing relevant outbound links up to the configured depth.
    async fn enrich(
        &mut self,
        raw: Vec<RawCandidate>,
        mut tool_probes: HashMap<String, PageProbe>,
        timeout: Duration,
    ) -> Result<usize, PipelineError> {
        let mut queue = raw.into_iter().collect::<VecDeque<RawCandidate>>();
        let mut added = 0;
        while let Some(mut candidate) = queue.pop_front() {
            if self.pool.len() >= self.policy.max_candidates {
                debug!(cap = self.policy.max_candidates, "candidate pool full");
                break;
            }
            let Some(canonical) = canonicalize_url(&candidate.url) else {
                debug!(url = %candidate.url, "skipping non-http candidate");
                continue;
            };
            if !self.seen.insert(canonical.clone()) {
                continue;
            }
            candidate.url = canonical.clone();

            let follow = candidate.depth < self.policy.link_depth;
            let probe = match tool_probes.remove(&canonical) {
                Some(page) => Probe::Fetched(page),
                None if self.budget.try_take() => self.probe(&canonical, follow, timeout).await?,
                None => Probe::NotFetched,
            };
            if follow && let Probe::Fetched(page) = &probe {
                for (url, title) in &page.links {
                    queue.push_back(RawCandidate::link(url.clone(), title.clone(), candidate.depth + 1));
                }
            }

            self.pool.push(PoolEntry {
                raw: candidate,
                probe,
            });
            added += 1;
        }
        Ok(added)
    }

    async fn probe(&self, url: &str, collect_links: bool, timeout: Duration) -> Result<Probe, PipelineError> {
        let limit = self.ctx.bounded(self.deps.options.fetch.timeout.min(timeout));
        match self.deps.fetcher.fetch(url, &self.ctx.cancel, limit).await {
            Ok(document) => Ok(Probe::Fetched(probe_document(&document, collect_links))),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => {
                debug!(url = %url, code = err.code(), error = %err, "candidate fetch failed");
                Ok(Probe::Failed)
            }
        }
    }

    fn curate(&self) -> Vec<DiscoverCandidate> {
        let context = CurationContext {
            official_domains: &self.city().official_domains,
            half_life_days: self.policy.freshness_half_life_days,
            now: Utc::now(),
        };
        curate_pool(&self.pool, &context)
    }

    fn curated_output(&self) -> DiscoverOutputV2 {
        build_output(self.city(), self.curate(), self.policy.top_n, self.allowed_hosts())
    }

    fn record_round(&mut self, report: RoundReport) {
        self.ctx.events.emit(
            "discover-round",
            json!({
                "round": report.round,
                "timeoutMs": report.timeout_ms,
                "emergency": report.emergency,
                "newCandidates": report.new_candidates,
                "accepted": report.accepted,
                "softFail": report.soft_fail,
                "ready": report.stop.ready,
                "reason": report.stop.reason,
            }),
        );
        self.rounds.push(report);
    }

    pub fn report(&self, error: Option<&PipelineError>) -> DiscoverReport {
        let queries = self
            .queries
            .lock()
            .map(|policy| policy.issued().to_vec())
            .unwrap_or_default();
        DiscoverReport {
            report_version: REPORT_VERSION,
            run_id: self.deps.run_id.to_string(),
            generated_at: now_utc_string(),
            city_id: self.city().city_id.clone(),
            prefecture_id: self.city().prefecture_id.clone(),
            stop_mode: self.policy.stop.mode.as_str().to_string(),
            rounds: self.rounds.clone(),
            stop: self.stop.clone(),
            domain_lock: self.lock.clone(),
            queries,
            fetches_used: self.budget.used(),
            emergency_used: self.emergency_used,
            pool_size: self.pool.len(),
            error: error.map(ToString::to_string),
        }
    }
}
