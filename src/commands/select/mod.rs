use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cli::SelectionMode;
use crate::commands::extract::CLEAN_RECORDS_FILE;
use crate::commands::run::PipelineDeps;
use crate::config::{PreflightGate, SelectionPolicy};
use crate::error::PipelineError;
use crate::llm::json::decode_response;
use crate::llm::{ModelClient, ModelRequest};
use crate::model::{
    CleanupReport, CleanupResultRecord, CleanupSourceReport, ExecutionReport, ExtractionPlan,
    PrimarySelectionDecision, RankedSource, SELECTION_WEIGHTS, SelectionReport,
    SourceQualityScore, Target, clamp_unit,
};
use crate::runtime::artifacts::{
    CLEANUP_REPORT, EXECUTION_REPORT, EXTRACTION_PLAN, RunLayout, SELECTION_REPORT,
};
use crate::runtime::runner::StepContext;
use crate::util::{now_utc_string, read_json, read_ndjson, truncate_chars, write_json_pretty};

const REPORT_VERSION: u32 = 1;
const COMPLETENESS_FULL_RECORDS: f64 = 20.0;
const EVIDENCE_SNIPPETS: usize = 3;
const EVIDENCE_SNIPPET_CHARS: usize = 120;

mod choice;
mod preflight;
mod rank;
mod run;
#[cfg(test)]
mod tests;

use choice::*;
pub use preflight::{preflight_reasons, walk_queue};
pub use rank::rank_sources;
use rank::*;
pub use run::{run, select_primary};

/// Everything selection knows about one (source, target) pair.
#[derive(Debug, Clone)]
pub struct SelectionInput<'a> {
    pub cleanup: &'a CleanupSourceReport,
    pub trust_score: f64,
    pub parse_success: f64,
    pub discover_rank: Option<usize>,
}
