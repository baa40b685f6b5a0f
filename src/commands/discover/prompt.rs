use super::*;

pub(super) const SYSTEM_PROMPT: &str = "You locate official sources for a Japanese \
municipality's household waste data: the collection schedule (which category is collected on \
which day, per district) and the separation rules (which item goes into which category). \
Prefer machine-readable files (CSV, Excel, JSON) on the municipality's own domain, then its \
HTML pages, then PDFs. Use web_search and fetch_page to verify URLs. Answer only with JSON \
matching the schema.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RawCandidate {
    pub url: String,
    #[serde(default, rename = "type")]
    pub declared_type: Option<String>,
    #[serde(default, alias = "targetHints")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub depth: u32,
}

impl RawCandidate {
    pub fn link(url: String, title: String, depth: u32) -> Self {
        Self {
            url,
            declared_type: None,
            targets: Vec::new(),
            title: Some(title).filter(|value| !value.is_empty()),
            depth,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RawCandidates {
    #[serde(default)]
    pub candidates: Vec<RawCandidate>,
}

pub(super) fn discover_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "candidates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "type": {"type": "string", "enum": ["csv", "xlsx", "pdf", "image", "html", "api", "unknown"]},
                        "targets": {"type": "array", "items": {"type": "string", "enum": ["schedule", "separation"]}},
                        "title": {"type": "string"}
                    },
                    "required": ["url", "targets"]
                }
            }
        },
        "required": ["candidates"]
    })
}

fn place(city: &CityTarget) -> String {
    match &city.prefecture_name {
        Some(prefecture) => format!("{prefecture} {}", city.city_name),
        None => city.city_name.clone(),
    }
}

pub(super) fn initial_queries(city: &CityTarget) -> Vec<String> {
    let place = place(city);
    vec![
        format!("{place} ごみ 収集日 カレンダー"),
        format!("{place} ごみ 分別 品目 一覧"),
        format!("{place} ごみ 収集 オープンデータ csv"),
    ]
}

/// Queries aimed at the targets still missing, restricted to the first locked host.
pub(super) fn follow_up_queries(city: &CityTarget, missing: &[Target], lock_hosts: &[String]) -> Vec<String> {
    let place = place(city);
    let targets = if missing.is_empty() { &Target::ALL[..] } else { missing };
    let mut queries = Vec::new();
    for target in targets {
        match target {
            Target::Schedule => {
                queries.push(format!("{place} ごみ収集カレンダー csv"));
                queries.push(format!("{place} 収集曜日 地区別"));
            }
            Target::Separation => {
                queries.push(format!("{place} ごみ分別 五十音 品目"));
                queries.push(format!("{place} ごみ 分別辞典"));
            }
        }
    }
    match lock_hosts.first() {
        Some(host) => queries
            .into_iter()
            .map(|query| format!("{query} site:{host}"))
            .collect(),
        None => queries,
    }
}

pub(super) fn emergency_queries(city: &CityTarget) -> Vec<String> {
    let mut domains = city.official_domains.clone();
    if domains.is_empty()
        && let Some(host) = city
            .official_url
            .as_deref()
            .and_then(|value| Url::parse(value).ok())
            .and_then(|parsed| parsed.host_str().map(str::to_string))
    {
        domains.push(host);
    }
    domains
        .iter()
        .flat_map(|domain| {
            [
                format!("site:{domain} ごみ 収集日"),
                format!("site:{domain} ごみ 分別"),
            ]
        })
        .collect()
}

pub(super) fn round_prompt(
    city: &CityTarget,
    round: u32,
    missing: &[Target],
    hits: &[(String, Vec<SearchHit>)],
    known: &[&DiscoverCandidate],
) -> String {
    let mut prompt = format!(
        "Municipality: {} (city id {}, prefecture id {})\n",
        place(city),
        city.city_id,
        city.prefecture_id
    );
    if let Some(url) = &city.official_url {
        prompt.push_str(&format!("Official site: {url}\n"));
    }
    if !city.official_domains.is_empty() {
        prompt.push_str(&format!("Official domains: {}\n", city.official_domains.join(", ")));
    }
    prompt.push_str(&format!("Round: {round}\n"));
    if !missing.is_empty() {
        let names = missing.iter().map(|target| target.as_str()).collect::<Vec<&str>>();
        prompt.push_str(&format!("Still missing a good source for: {}\n", names.join(", ")));
    }

    if !known.is_empty() {
        prompt.push_str("\nAlready accepted (do not repeat):\n");
        for candidate in known {
            prompt.push_str(&format!("- {} [{}]\n", candidate.url, candidate.source_type));
        }
    }

    for (query, results) in hits {
        prompt.push_str(&format!("\nSearch results for \"{query}\":\n"));
        for hit in results {
            prompt.push_str(&format!(
                "{}. {} | {} | {}\n",
                hit.rank,
                hit.url,
                hit.title.as_deref().unwrap_or(""),
                hit.snippet.as_deref().unwrap_or("")
            ));
        }
    }

    prompt.push_str(
        "\nReturn {\"candidates\": [{\"url\", \"type\", \"targets\", \"title\"}]} listing the \
best source URLs you found, most useful first.",
    );
    prompt
}
