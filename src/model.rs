use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Schedule,
    Separation,
}

impl Target {
    pub const ALL: [Target; 2] = [Target::Schedule, Target::Separation];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Separation => "separation",
        }
    }

    pub fn parse_label(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "schedule" | "calendar" | "collection" => Some(Self::Schedule),
            "separation" | "sorting" | "rules" => Some(Self::Separation),
            _ => None,
        }
    }

    pub fn required_features(self) -> &'static [&'static str] {
        match self {
            Self::Schedule => &["category", "date-or-weekday"],
            Self::Separation => &["item-name", "category"],
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Csv,
    Xlsx,
    Pdf,
    Image,
    Html,
    Api,
    Unknown,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Html => "html",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse_label(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" | "tsv" => Self::Csv,
            "xlsx" | "xls" | "excel" => Self::Xlsx,
            "pdf" => Self::Pdf,
            "image" | "png" | "jpg" | "jpeg" | "gif" => Self::Image,
            "html" | "htm" | "web" | "page" => Self::Html,
            "api" | "json" => Self::Api,
            _ => Self::Unknown,
        }
    }

    pub fn is_machine_readable(self) -> bool {
        matches!(self, Self::Csv | Self::Xlsx | Self::Api)
    }

    pub fn file_extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Pdf => "pdf",
            Self::Image => "img",
            Self::Html => "html",
            Self::Api => "json",
            Self::Unknown => "bin",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverEvidenceMetrics {
    pub coverage_schedule: f64,
    pub coverage_separation: f64,
    pub noise_ratio: f64,
    pub cleanup_pass_rate: f64,
    pub freshness_score: f64,
    pub parse_success: f64,
    pub officialness: f64,
}

impl DiscoverEvidenceMetrics {
    pub fn coverage_for(&self, target: Target) -> f64 {
        match target {
            Target::Schedule => self.coverage_schedule,
            Target::Separation => self.coverage_separation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverCandidate {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub target_hints: Vec<Target>,
    pub host: String,
    pub depth: u32,
    pub officialness: f64,
    pub directness: f64,
    pub relevance: f64,
    pub score: f64,
    pub evidence_metrics: DiscoverEvidenceMetrics,
    pub rejected: bool,
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectedIds {
    pub schedule: Vec<String>,
    pub separation: Vec<String>,
}

impl SelectedIds {
    pub fn for_target(&self, target: Target) -> &[String] {
        match target {
            Target::Schedule => &self.schedule,
            Target::Separation => &self.separation,
        }
    }

    pub fn set(&mut self, target: Target, ids: Vec<String>) {
        match target {
            Target::Schedule => self.schedule = ids,
            Target::Separation => self.separation = ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverOutputV2 {
    pub city_id: String,
    pub prefecture_id: String,
    pub official_url: Option<String>,
    pub official_domains: Vec<String>,
    pub candidates: Vec<DiscoverCandidate>,
    pub selected: SelectedIds,
}

impl DiscoverOutputV2 {
    pub fn candidate(&self, id: &str) -> Option<&DiscoverCandidate> {
        self.candidates.iter().find(|candidate| candidate.id == id)
    }

    pub fn primary(&self, target: Target) -> Option<&DiscoverCandidate> {
        self.selected
            .for_target(target)
            .first()
            .and_then(|id| self.candidate(id))
    }

    pub fn rank_of(&self, id: &str, target: Target) -> Option<usize> {
        self.selected
            .for_target(target)
            .iter()
            .position(|value| value == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceManifestEntry {
    pub id: String,
    pub url: String,
    pub final_url: String,
    pub local_path: String,
    pub source_type: SourceType,
    pub mime: Option<String>,
    #[serde(default)]
    pub charset: Option<String>,
    pub bytes: u64,
    pub sha256: String,
    pub trust_score: f64,
    pub target_hints: Vec<Target>,
    pub discover_rank: BTreeMap<Target, usize>,
    pub last_modified: Option<String>,
    pub fetched_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFailure {
    pub id: String,
    pub url: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub sources: Vec<SourceManifestEntry>,
    pub failures: Vec<DownloadFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    Csv,
    Xlsx,
    Pdf,
    Image,
    Html,
    Api,
}

impl ExecutorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Pdf => "pdf",
            Self::Image => "image",
            Self::Html => "html",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub id: String,
    pub url: String,
    pub local_path: String,
    pub source_type: SourceType,
    pub mime: Option<String>,
    #[serde(default)]
    pub charset: Option<String>,
    pub trust_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionTask {
    pub task_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub executor_type: ExecutorType,
    pub target: Target,
    pub fallback: Vec<ExecutorType>,
    pub required_features: Vec<String>,
    pub rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionPlan {
    pub plan_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub tasks: Vec<ExtractionTask>,
    pub sources: Vec<SourceDescriptor>,
}

impl ExtractionPlan {
    pub fn source(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|source| source.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordOrigin {
    CsvRow,
    TableRow,
    TextBlock,
    TextLine,
    ApiObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRecord {
    pub record_id: String,
    pub source_id: String,
    pub target: Target,
    pub origin: RecordOrigin,
    pub depth: u32,
    pub fields: BTreeMap<String, String>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupFlag {
    Empty,
    Canonicalized,
    Noise,
    Ambiguous,
    LayoutLike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupAction {
    Keep,
    Rename,
    Drop,
}

impl CleanupAction {
    /// Position along `keep -> rename -> drop`; a record may only move forward.
    pub fn stage(self) -> u8 {
        match self {
            Self::Keep => 0,
            Self::Rename => 1,
            Self::Drop => 2,
        }
    }

    pub fn is_clean(self) -> bool {
        !matches!(self, Self::Drop)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupCandidateRecord {
    pub record_id: String,
    pub source_id: String,
    pub target: Target,
    pub raw_text: String,
    pub canonical_text: String,
    pub fields: BTreeMap<String, String>,
    pub flags: Vec<CleanupFlag>,
}

impl CleanupCandidateRecord {
    pub fn has_flag(&self, flag: CleanupFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResultRecord {
    pub record_id: String,
    pub source_id: String,
    pub target: Target,
    pub action: CleanupAction,
    pub text: String,
    pub confidence: f64,
    pub reason_tags: Vec<String>,
    pub fields: BTreeMap<String, String>,
    pub decided_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupMetrics {
    pub total: usize,
    pub kept: usize,
    pub renamed: usize,
    pub dropped: usize,
    pub clean_count: usize,
    pub noise_count: usize,
    pub pass_rate: f64,
    pub noise_ratio: f64,
    pub schema_signal_rate: f64,
    pub required_field_coverage: f64,
    pub mean_confidence: f64,
    pub degraded: bool,
    pub veto_reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityWeights {
    pub officialness: f64,
    pub parse_success: f64,
    pub schema_coverage: f64,
    pub noise: f64,
    pub cleanup_pass_rate: f64,
    pub freshness: f64,
    pub completeness: f64,
    pub schema_signal_rate: f64,
    pub confidence: f64,
}

pub const DISCOVER_WEIGHTS: QualityWeights = QualityWeights {
    officialness: 0.15,
    parse_success: 0.15,
    schema_coverage: 0.3,
    noise: 0.0,
    cleanup_pass_rate: 0.25,
    freshness: 0.15,
    completeness: 0.0,
    schema_signal_rate: 0.0,
    confidence: 0.0,
};

pub const SELECTION_WEIGHTS: QualityWeights = QualityWeights {
    officialness: 0.2,
    parse_success: 0.15,
    schema_coverage: 0.2,
    noise: 0.1,
    cleanup_pass_rate: 0.15,
    freshness: 0.0,
    completeness: 0.0,
    schema_signal_rate: 0.1,
    confidence: 0.1,
};

impl QualityWeights {
    fn total(&self) -> f64 {
        self.officialness
            + self.parse_success
            + self.schema_coverage
            + self.noise
            + self.cleanup_pass_rate
            + self.freshness
            + self.completeness
            + self.schema_signal_rate
            + self.confidence
    }
}

/// Shared composite used by both discovery ranking and selection ranking; the two stages
/// feed different inputs and weights into the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceQualityScore {
    pub officialness: f64,
    pub parse_success: f64,
    pub schema_coverage: f64,
    pub noise_penalty: f64,
    pub cleanup_pass_rate: f64,
    pub freshness: f64,
    pub completeness: f64,
    pub schema_signal_rate: f64,
    pub confidence: f64,
}

impl SourceQualityScore {
    pub fn weighted(&self, weights: &QualityWeights) -> f64 {
        let total = weights.total();
        if total <= 0.0 {
            return 0.0;
        }

        let sum = clamp_unit(self.officialness) * weights.officialness
            + clamp_unit(self.parse_success) * weights.parse_success
            + clamp_unit(self.schema_coverage) * weights.schema_coverage
            + (1.0 - clamp_unit(self.noise_penalty)) * weights.noise
            + clamp_unit(self.cleanup_pass_rate) * weights.cleanup_pass_rate
            + clamp_unit(self.freshness) * weights.freshness
            + clamp_unit(self.completeness) * weights.completeness
            + clamp_unit(self.schema_signal_rate) * weights.schema_signal_rate
            + clamp_unit(self.confidence) * weights.confidence;

        sum / total
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimarySelectionDecision {
    pub target: Target,
    pub primary_source_id: String,
    pub secondary_source_ids: Vec<String>,
    pub vetoed: bool,
    pub veto_reasons: Vec<String>,
    pub mode: String,
    pub model_choice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorAttempt {
    pub executor: ExecutorType,
    pub status: String,
    pub records: usize,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub task_id: String,
    pub source_id: String,
    pub target: Target,
    pub source_type: SourceType,
    pub executor: Option<ExecutorType>,
    pub attempts: Vec<ExecutorAttempt>,
    pub records: usize,
    pub followed_links: Vec<String>,
    pub parse_success: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub report_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub tasks: Vec<TaskExecution>,
}

impl ExecutionReport {
    pub fn task(&self, source_id: &str, target: Target) -> Option<&TaskExecution> {
        self.tasks
            .iter()
            .find(|task| task.source_id == source_id && task.target == target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateStatus {
    Passed,
    Skipped,
    RawFallback,
}

impl GateStatus {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridOutcome {
    pub reviewed: usize,
    pub chunks_sent: usize,
    pub chunks_failed: usize,
    pub overrides: usize,
    pub blocked: usize,
    pub skipped_over_cap: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSourceReport {
    pub task_id: String,
    pub source_id: String,
    pub target: Target,
    pub source_type: SourceType,
    pub status: GateStatus,
    pub reasons: Vec<String>,
    pub clean_records: usize,
    pub metrics: CleanupMetrics,
    pub hybrid: Option<HybridOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub report_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub sources: Vec<CleanupSourceReport>,
}

impl CleanupReport {
    pub fn accepted(&self, target: Target) -> impl Iterator<Item = &CleanupSourceReport> {
        self.sources
            .iter()
            .filter(move |entry| entry.target == target && entry.status.is_accepted())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedSource {
    pub source_id: String,
    pub rank_score: f64,
    pub quality: SourceQualityScore,
    pub records: usize,
    pub discover_rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionReport {
    pub report_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub decisions: Vec<PrimarySelectionDecision>,
    pub ranked: BTreeMap<Target, Vec<RankedSource>>,
}

impl SelectionReport {
    pub fn decision(&self, target: Target) -> Option<&PrimarySelectionDecision> {
        self.decisions.iter().find(|decision| decision.target == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_sets_sum_to_one() {
        assert!((DISCOVER_WEIGHTS.total() - 1.0).abs() < 1e-9);
        assert!((SELECTION_WEIGHTS.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weighted_score_inverts_noise_penalty() {
        let clean = SourceQualityScore {
            noise_penalty: 0.0,
            ..SourceQualityScore::default()
        };
        let noisy = SourceQualityScore {
            noise_penalty: 1.0,
            ..SourceQualityScore::default()
        };
        assert!(clean.weighted(&SELECTION_WEIGHTS) > noisy.weighted(&SELECTION_WEIGHTS));
        assert_eq!(noisy.weighted(&SELECTION_WEIGHTS), 0.0);
    }

    #[test]
    fn candidate_serializes_type_field_and_camel_case() {
        let candidate = DiscoverCandidate {
            id: "cand-1".to_string(),
            url: "https://www.city.example.lg.jp/gomi.csv".to_string(),
            source_type: SourceType::Csv,
            target_hints: vec![Target::Schedule],
            host: "www.city.example.lg.jp".to_string(),
            depth: 0,
            officialness: 0.9,
            directness: 1.0,
            relevance: 0.8,
            score: 0.7,
            evidence_metrics: DiscoverEvidenceMetrics::default(),
            rejected: false,
            reject_reason: None,
            title: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["type"], "csv");
        assert_eq!(value["targetHints"][0], "schedule");
        assert!(value.get("evidenceMetrics").is_some());
    }
}
