use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use encoding_rs::{Encoding, SHIFT_JIS, UTF_8};
use regex::Regex;
use reqwest::{Client, StatusCode, header, redirect};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{FetchPolicy, USER_AGENT};
use crate::error::PipelineError;
use crate::model::SourceType;
use crate::runtime::runner::bounded_call;
use crate::util::now_utc_string;

static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#).expect("static regex")
});

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub mime: Option<String>,
    pub charset: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: String,
    pub bytes: Vec<u8>,
}

impl FetchedDocument {
    pub fn text(&self) -> String {
        decode_body(&self.bytes, self.charset.as_deref())
    }

    pub fn source_type(&self) -> SourceType {
        detect_source_type(&self.final_url, self.mime.as_deref(), &self.bytes)
    }
}

/// Anything that can turn a URL into bytes. The HTTP fetcher is the production
/// implementation; tests swap in static pages.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<FetchedDocument, PipelineError>;
}

pub struct HttpFetcher {
    client: Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(policy: &FetchPolicy) -> Result<Self> {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(5))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            max_bytes: policy.max_bytes,
        })
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedDocument, PipelineError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| PipelineError::network(format!("GET {url} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        if let Some(length) = response.content_length()
            && length > self.max_bytes
        {
            return Err(PipelineError::ResponseTooLarge {
                url: url.to_string(),
                limit_bytes: self.max_bytes,
            });
        }

        let final_url = response.url().to_string();
        let headers = response.headers();
        let content_type = header_value(headers, header::CONTENT_TYPE);
        let last_modified = header_value(headers, header::LAST_MODIFIED);
        let (mime, mut charset) = split_content_type(content_type.as_deref());

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| PipelineError::network(format!("reading {url} failed: {err}")))?
        {
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(PipelineError::ResponseTooLarge {
                    url: url.to_string(),
                    limit_bytes: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        if charset.is_none() && mime.as_deref().map(is_html_mime).unwrap_or(true) {
            charset = sniff_meta_charset(&bytes);
        }

        debug!(url, final_url = %final_url, bytes = bytes.len(), "fetched document");
        Ok(FetchedDocument {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            mime,
            charset,
            last_modified,
            fetched_at: now_utc_string(),
            bytes,
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<FetchedDocument, PipelineError> {
        bounded_call(cancel, timeout, "fetch", self.fetch_inner(url)).await
    }
}

fn status_error(url: &str, status: StatusCode) -> PipelineError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return PipelineError::network(format!("GET {url} returned {status}"));
    }
    PipelineError::Pipeline(format!("GET {url} returned {status}"))
}

fn header_value(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn split_content_type(value: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(value) = value else {
        return (None, None);
    };
    let mut parts = value.split(';');
    let mime = parts
        .next()
        .map(|part| part.trim().to_ascii_lowercase())
        .filter(|part| !part.is_empty());
    let charset = parts.find_map(|part| {
        let (key, raw) = part.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| raw.trim().trim_matches('"').to_ascii_lowercase())
    });
    (mime, charset)
}

fn is_html_mime(mime: &str) -> bool {
    mime.contains("html") || mime.starts_with("text/")
}

/// `<meta charset>` or `http-equiv` charset from the first 4 KiB.
pub fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(4096)];
    let ascii = String::from_utf8_lossy(head);
    META_CHARSET
        .captures(&ascii)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().to_ascii_lowercase())
}

/// Declared charset (when recognised and clean), then UTF-8 strict, then Shift_JIS
/// strict, then UTF-8 lossy.
pub fn decode_body(bytes: &[u8], charset: Option<&str>) -> String {
    if let Some(encoding) = charset.and_then(|label| Encoding::for_label(label.as_bytes())) {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return text.into_owned();
        }
    }

    if let Some(text) = UTF_8.decode_without_bom_handling_and_without_replacement(bytes) {
        return text.trim_start_matches('\u{feff}').to_string();
    }

    if let Some(text) = SHIFT_JIS.decode_without_bom_handling_and_without_replacement(bytes) {
        return text.into_owned();
    }

    String::from_utf8_lossy(bytes).into_owned()
}

pub fn source_type_from_url(url: &str) -> Option<SourceType> {
    let path = url::Url::parse(url)
        .map(|parsed| parsed.path().to_ascii_lowercase())
        .unwrap_or_else(|_| url.to_ascii_lowercase());
    let extension = path.rsplit_once('.').map(|(_, ext)| ext)?;
    match extension {
        "csv" | "tsv" => Some(SourceType::Csv),
        "xlsx" | "xls" => Some(SourceType::Xlsx),
        "pdf" => Some(SourceType::Pdf),
        "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(SourceType::Image),
        "json" | "geojson" => Some(SourceType::Api),
        "html" | "htm" | "php" | "aspx" | "jsp" => Some(SourceType::Html),
        _ => None,
    }
}

pub fn source_type_from_mime(mime: &str) -> Option<SourceType> {
    let mime = mime.to_ascii_lowercase();
    if mime.contains("csv") {
        Some(SourceType::Csv)
    } else if mime.contains("spreadsheet") || mime.contains("ms-excel") {
        Some(SourceType::Xlsx)
    } else if mime.contains("pdf") {
        Some(SourceType::Pdf)
    } else if mime.starts_with("image/") {
        Some(SourceType::Image)
    } else if mime.contains("json") {
        Some(SourceType::Api)
    } else if mime.contains("html") {
        Some(SourceType::Html)
    } else {
        None
    }
}

fn source_type_from_bytes(bytes: &[u8]) -> Option<SourceType> {
    let head = &bytes[..bytes.len().min(512)];
    if head.starts_with(b"%PDF") {
        return Some(SourceType::Pdf);
    }
    if head.starts_with(b"PK\x03\x04") {
        return Some(SourceType::Xlsx);
    }
    if head.starts_with(b"\x89PNG") || head.starts_with(b"\xff\xd8\xff") || head.starts_with(b"GIF8")
    {
        return Some(SourceType::Image);
    }
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(SourceType::Api);
    }
    if trimmed.starts_with('<') {
        return Some(SourceType::Html);
    }
    None
}

/// MIME wins over the URL extension, which wins over content sniffing. `text/plain`
/// bodies behind a `.csv` URL stay csv.
pub fn detect_source_type(url: &str, mime: Option<&str>, bytes: &[u8]) -> SourceType {
    let from_mime = mime.and_then(source_type_from_mime);
    let from_url = source_type_from_url(url);
    match (from_mime, from_url) {
        (Some(SourceType::Html), Some(other)) if other != SourceType::Html => {
            source_type_from_bytes(bytes)
                .filter(|sniffed| *sniffed != SourceType::Html)
                .map(|_| other)
                .unwrap_or(SourceType::Html)
        }
        (Some(found), _) => found,
        (None, Some(found)) => found,
        (None, None) => source_type_from_bytes(bytes).unwrap_or(SourceType::Unknown),
    }
}
