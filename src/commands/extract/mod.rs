use std::collections::{BTreeMap, HashSet};
use std::fs;

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::commands::cleanup::{
    GateVerdict, apply_failure_policy, raw_fallback_records, run_cleanup,
};
use crate::commands::plan::capability_chain;
use crate::commands::run::PipelineDeps;
use crate::error::PipelineError;
use crate::model::{
    CleanupReport, CleanupSourceReport, ExecutionReport, ExecutorAttempt, ExecutorType,
    ExtractedRecord, ExtractionPlan, ExtractionTask, GateStatus, RecordOrigin, SourceType, Target,
    TaskExecution, clamp_unit,
};
use crate::net::fetch::{decode_body, sniff_meta_charset, source_type_from_url};
use crate::runtime::artifacts::{CLEANUP_REPORT, EXECUTION_REPORT, EXTRACTION_PLAN};
use crate::runtime::runner::StepContext;
use crate::util::{normalize_whitespace, now_utc_string, read_json, write_json_pretty, write_ndjson};
use crate::vocab;

const REPORT_VERSION: u32 = 1;
const RAW_RECORDS_FILE: &str = "raw.ndjson";
const CANDIDATE_RECORDS_FILE: &str = "candidates.ndjson";
pub const CLEAN_RECORDS_FILE: &str = "clean.ndjson";

/// Links scoring at least this much are followed for one hop.
pub const FOLLOW_LINK_MIN_SCORE: f64 = 0.5;

mod api;
mod csv_table;
mod dispatch;
mod html;
mod run;

pub use run::run;

use api::*;
use csv_table::*;
use dispatch::*;
use html::*;

/// Scored outbound link from an HTML page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCandidate {
    pub url: String,
    pub text: String,
    pub source_type: SourceType,
    pub score: f64,
}

/// Bytes plus the identity every record produced from them carries.
pub(super) struct ExecutorInput<'a> {
    pub source_id: &'a str,
    pub target: Target,
    pub depth: u32,
    pub record_prefix: String,
    pub base_url: &'a str,
    pub local_path: &'a str,
    pub bytes: &'a [u8],
    pub charset: Option<&'a str>,
}

impl ExecutorInput<'_> {
    fn record(
        &self,
        index: usize,
        origin: RecordOrigin,
        fields: BTreeMap<String, String>,
        text: String,
    ) -> ExtractedRecord {
        ExtractedRecord {
            record_id: format!("{}-{:04}", self.record_prefix, index + 1),
            source_id: self.source_id.to_string(),
            target: self.target,
            origin,
            depth: self.depth,
            fields,
            text,
        }
    }

    fn text(&self) -> String {
        decode_body(self.bytes, self.charset)
    }
}

#[derive(Debug, Default)]
pub(super) struct ExecutorOutput {
    pub records: Vec<ExtractedRecord>,
    pub links: Vec<LinkCandidate>,
}
