use super::*;

/// What a fetch revealed about a candidate.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct PageProbe {
    pub final_url: String,
    pub source_type: SourceType,
    pub mime: Option<String>,
    pub last_modified: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub lines: Vec<String>,
    pub links: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Probe {
    Fetched(PageProbe),
    Failed,
    NotFetched,
}

#[derive(Debug, Clone)]
pub(super) struct PoolEntry {
    pub raw: RawCandidate,
    pub probe: Probe,
}

/// Run-wide and per-round fetch allowance shared by enrichment and the `fetch_page` tool.
#[derive(Debug)]
pub(super) struct FetchBudget {
    max_total: usize,
    round_cap: usize,
    used: AtomicUsize,
    round_used: AtomicUsize,
}

impl FetchBudget {
    pub fn new(max_total: usize, round_cap: usize) -> Self {
        Self {
            max_total,
            round_cap,
            used: AtomicUsize::new(0),
            round_used: AtomicUsize::new(0),
        }
    }

    pub fn try_take(&self) -> bool {
        if self.used.load(Ordering::SeqCst) >= self.max_total
            || self.round_used.load(Ordering::SeqCst) >= self.round_cap
        {
            return false;
        }
        self.used.fetch_add(1, Ordering::SeqCst);
        self.round_used.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn start_round(&self) {
        self.round_used.store(0, Ordering::SeqCst);
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

fn is_binary_type(source_type: SourceType) -> bool {
    matches!(
        source_type,
        SourceType::Pdf | SourceType::Image | SourceType::Xlsx
    )
}

/// Visible text lines of an HTML page plus its title.
pub(super) fn page_text(html: &str) -> (Option<String>, Vec<String>) {
    let document = Html::parse_document(html);
    let title = Selector::parse("title").ok().and_then(|selector| {
        document
            .select(&selector)
            .next()
            .map(|element| normalize_whitespace(&element.text().collect::<String>()))
            .filter(|value| !value.is_empty())
    });

    let mut lines = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|element| matches!(element.name(), "script" | "style" | "noscript" | "title"))
                .unwrap_or(false)
        });
        if hidden {
            continue;
        }
        let line = normalize_whitespace(text);
        if !line.is_empty() {
            lines.push(line);
        }
        if lines.len() >= PROBE_LINES {
            break;
        }
    }
    (title, lines)
}

/// Anchors on a page that look like waste data: a machine-readable file, or link text
/// with waste vocabulary. Utility pages are skipped.
pub(super) fn outbound_links(html: &str, base_url: &str) -> Vec<(String, String)> {
    let Ok(anchor_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&anchor_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(resolved) = base.join(href.trim()).ok().and_then(|url| canonicalize_url(url.as_str()))
        else {
            continue;
        };
        if resolved == base_url || vocab::is_utility_url(&resolved) {
            continue;
        }
        let text = normalize_whitespace(&anchor.text().collect::<Vec<&str>>().join(" "));
        let machine_readable = source_type_from_url(&resolved)
            .map(SourceType::is_machine_readable)
            .unwrap_or(false);
        let (relevance, _) = vocab::relevance(&format!("{text} {resolved}"));
        if !machine_readable && relevance <= 0.0 {
            continue;
        }
        if seen.insert(resolved.clone()) {
            links.push((resolved, text));
        }
        if links.len() >= MAX_OUTBOUND_LINKS {
            break;
        }
    }
    links
}

pub(super) fn probe_document(document: &FetchedDocument, collect_links: bool) -> PageProbe {
    let source_type = document.source_type();
    let (title, text, lines, links) = if is_binary_type(source_type) {
        (None, String::new(), Vec::new(), Vec::new())
    } else {
        let decoded = truncate_chars(&document.text(), PROBE_TEXT_MAX_CHARS);
        if source_type == SourceType::Html {
            let (title, lines) = page_text(&decoded);
            let links = if collect_links {
                outbound_links(&decoded, &document.final_url)
            } else {
                Vec::new()
            };
            (title, lines.join("\n"), lines, links)
        } else {
            let lines = decoded
                .lines()
                .map(normalize_whitespace)
                .filter(|line| !line.is_empty())
                .take(PROBE_LINES)
                .collect::<Vec<String>>();
            (None, decoded, lines, Vec::new())
        }
    };

    PageProbe {
        final_url: document.final_url.clone(),
        source_type,
        mime: document.mime.clone(),
        last_modified: document.last_modified.clone(),
        title,
        text,
        lines,
        links,
    }
}

/// Tool calls made by the discover model. Searches pass through the run's query policy
/// and page fetches draw on the shared fetch budget.
pub(super) struct DiscoverTools<'a> {
    pub fetcher: &'a dyn DocumentFetcher,
    pub queries: &'a Mutex<QueryPolicy>,
    pub budget: &'a FetchBudget,
    pub timeout: Duration,
    pub probes: Mutex<HashMap<String, PageProbe>>,
}

impl DiscoverTools<'_> {
    fn admit(&self, query: &str) -> Option<String> {
        self.queries.lock().ok().and_then(|mut policy| policy.admit(query))
    }

    async fn search(&self, query: &str, cancel: &CancellationToken) -> Result<String, PipelineError> {
        let Some(query) = self.admit(query) else {
            return Ok("query skipped: already searched this run".to_string());
        };
        match web_search(self.fetcher, &query, SEARCH_RESULTS_PER_QUERY, cancel, self.timeout).await {
            Ok(hits) if hits.is_empty() => Ok(format!("no results for \"{query}\"")),
            Ok(hits) => Ok(hits
                .iter()
                .map(|hit| {
                    format!(
                        "{}. {} | {} | {}",
                        hit.rank,
                        hit.url,
                        hit.title.as_deref().unwrap_or(""),
                        hit.snippet.as_deref().unwrap_or("")
                    )
                })
                .collect::<Vec<String>>()
                .join("\n")),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => Ok(format!("search failed: {err}")),
        }
    }

    async fn fetch_page(&self, url: &str, cancel: &CancellationToken) -> Result<String, PipelineError> {
        let Some(canonical) = canonicalize_url(url) else {
            return Ok(format!("not an http(s) URL: {url}"));
        };
        if !self.budget.try_take() {
            return Ok("fetch budget exhausted for this round".to_string());
        }
        match self.fetcher.fetch(&canonical, cancel, self.timeout).await {
            Ok(document) => {
                let probe = probe_document(&document, true);
                let preview = format!(
                    "url: {}\ntype: {}\nstatus: {}\n\n{}",
                    probe.final_url,
                    probe.source_type,
                    document.status,
                    truncate_chars(&probe.text, TOOL_PREVIEW_CHARS)
                );
                if let Ok(mut probes) = self.probes.lock() {
                    probes.insert(canonical, probe);
                }
                Ok(preview)
            }
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(err) => Ok(format!("fetch failed: {err}")),
        }
    }
}

#[async_trait]
impl<'a> ToolExecutor for DiscoverTools<'a> {
    async fn call(
        &self,
        tool: ToolKind,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        match tool {
            ToolKind::WebSearch => {
                let query = arguments.get("query").and_then(Value::as_str).unwrap_or_default();
                self.search(query, cancel).await
            }
            ToolKind::FetchPage => {
                let url = arguments.get("url").and_then(Value::as_str).unwrap_or_default();
                self.fetch_page(url, cancel).await
            }
        }
    }
}
