use std::collections::HashSet;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::PipelineError;
use crate::net::fetch::DocumentFetcher;
use crate::util::normalize_whitespace;

const DDG_HTML_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

pub fn build_serp_url(query: &str) -> Option<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = Url::parse(DDG_HTML_ENDPOINT).ok()?;
    url.query_pairs_mut().append_pair("q", trimmed);
    Some(url.to_string())
}

/// Result links on the HTML endpoint point at `duckduckgo.com/l/?uddg=<target>`.
pub fn decode_redirect(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();

    if host.contains("duckduckgo.com") {
        if !parsed.path().starts_with("/l/") {
            return None;
        }
        let target = parsed
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, value)| value.trim().to_string())?;
        let mut dest = Url::parse(&target).ok()?;
        if !matches!(dest.scheme(), "http" | "https") {
            return None;
        }
        dest.set_fragment(None);
        return Some(dest.to_string());
    }

    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    Some(parsed.to_string())
}

fn text_content(element: ElementRef<'_>) -> String {
    normalize_whitespace(&element.text().collect::<Vec<&str>>().join(" "))
}

pub fn parse_serp(html: &str, limit: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let (Ok(result_sel), Ok(title_sel), Ok(snippet_sel)) = (
        Selector::parse("div.result, div.web-result"),
        Selector::parse("a.result__a, a[href]"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for container in document.select(&result_sel) {
        if out.len() >= limit {
            break;
        }
        let Some(anchor) = container.select(&title_sel).next() else {
            continue;
        };
        let Some(url) = anchor.value().attr("href").and_then(decode_redirect) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }

        let title = Some(text_content(anchor)).filter(|value| !value.is_empty());
        let snippet = container
            .select(&snippet_sel)
            .next()
            .map(text_content)
            .filter(|value| !value.is_empty());
        out.push(SearchHit {
            rank: out.len() + 1,
            url,
            title,
            snippet,
        });
    }
    out
}

/// Runs one web search through the shared fetcher so it obeys the same byte cap and
/// timeout as any other page.
pub async fn web_search(
    fetcher: &dyn DocumentFetcher,
    query: &str,
    limit: usize,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Vec<SearchHit>, PipelineError> {
    let Some(serp_url) = build_serp_url(query) else {
        return Ok(Vec::new());
    };
    let document = fetcher.fetch(&serp_url, cancel, timeout).await?;
    Ok(parse_serp(&document.text(), limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::fetch::testing::StaticFetcher;

    const SERP: &str = r#"
        <html><body>
          <div class="result">
            <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fwww.city.example.lg.jp%2Fgomi%2Fcalendar.csv%23top&rut=x">ごみ収集 カレンダー</a>
            <a class="result__snippet">燃やすごみ 月曜日</a>
          </div>
          <div class="result">
            <a class="result__a" href="https://opendata.example.jp/sorting.html">分別</a>
          </div>
          <div class="result">
            <a class="result__a" href="//duckduckgo.com/y.js?ad=1">ad</a>
          </div>
        </body></html>
    "#;

    #[test]
    fn redirects_are_decoded_and_fragments_dropped() {
        let hits = parse_serp(SERP, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://www.city.example.lg.jp/gomi/calendar.csv");
        assert_eq!(hits[0].title.as_deref(), Some("ごみ収集 カレンダー"));
        assert_eq!(hits[0].snippet.as_deref(), Some("燃やすごみ 月曜日"));
        assert_eq!(hits[1].rank, 2);
    }

    #[test]
    fn limit_is_respected() {
        assert_eq!(parse_serp(SERP, 1).len(), 1);
    }

    #[test]
    fn serp_url_encodes_query() {
        let url = build_serp_url(" 千代田区 ごみ ").unwrap();
        assert!(url.starts_with(DDG_HTML_ENDPOINT));
        assert!(url.contains("q=%E5%8D%83"));
        assert_eq!(build_serp_url("   "), None);
    }

    #[tokio::test]
    async fn web_search_goes_through_fetcher() {
        let serp_url = build_serp_url("gomi").unwrap();
        let fetcher = StaticFetcher::default().with_page(&serp_url, "text/html", SERP);
        let hits = web_search(
            &fetcher,
            "gomi",
            5,
            &CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(fetcher.request_count(), 1);
    }
}
