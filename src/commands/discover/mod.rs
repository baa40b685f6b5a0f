use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::cli::{DomainLockFailure, StopMode};
use crate::commands::run::PipelineDeps;
use crate::config::{CityTarget, DiscoverPolicy, StopPolicy};
use crate::error::PipelineError;
use crate::llm::json::decode_response;
use crate::llm::{ModelRequest, ToolExecutor, ToolKind};
use crate::model::{
    DISCOVER_WEIGHTS, DiscoverCandidate, DiscoverEvidenceMetrics, DiscoverOutputV2, SelectedIds,
    SourceQualityScore, SourceType, Target, clamp_unit,
};
use crate::net::fetch::{DocumentFetcher, FetchedDocument, source_type_from_url};
use crate::net::search::{SearchHit, web_search};
use crate::runtime::artifacts::{DISCOVER_CANDIDATES, DISCOVER_REPORT, DISCOVER_SELECTED};
use crate::runtime::runner::{StepContext, bounded_call, duration_ms};
use crate::util::{
    normalize_whitespace, now_utc_string, sha256_hex, truncate_chars, write_json_pretty,
    write_ndjson,
};
use crate::vocab;

const REPORT_VERSION: u32 = 1;
const SEARCH_RESULTS_PER_QUERY: usize = 8;
const TOOL_PREVIEW_CHARS: usize = 1_500;
const PROBE_TEXT_MAX_CHARS: usize = 20_000;
const PROBE_LINES: usize = 300;
const MAX_OUTBOUND_LINKS: usize = 20;

const MIN_OFFICIALNESS: f64 = 0.25;
const MIN_RELEVANCE: f64 = 0.2;
const MIN_SCHEDULE_DIRECTNESS: f64 = 0.5;
const HINT_COVERAGE: f64 = 0.5;
const LOCK_TRUST_THRESHOLD: f64 = 0.7;

mod curation;
mod engine;
mod policy;
mod prompt;
mod run;
#[cfg(test)]
mod tests;
mod tools;

pub use curation::{candidate_id, canonicalize_url, officialness_for_host};
use curation::*;
use engine::*;
pub use policy::{
    DomainLock, QueryPolicy, StopDecision, calculate_discover_round_timeout, compute_domain_lock,
    evaluate_discover_stop,
};
use prompt::*;
pub use engine::{DiscoverReport, RoundReport};
pub use run::run;
use tools::*;
