use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "gomidata",
    version,
    about = "Discover, extract and select municipal waste-collection data sources"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Run(RunArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StopMode {
    Coverage,
    Quality,
}

impl StopMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coverage => "coverage",
            Self::Quality => "quality",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum DomainLockFailure {
    FailFast,
    EmergencyBurst,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CleanupMode {
    Deterministic,
    Hybrid,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum FailurePolicy {
    Skip,
    FailRun,
    RawFallback,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum SelectionMode {
    Deterministic,
    LlmFirst,
    Hybrid,
}

impl SelectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::LlmFirst => "llm-first",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StepArg {
    Discover,
    Download,
    ExtractionPlan,
    Extract,
    Select,
    Convert,
    Commit,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long)]
    pub city_id: String,

    #[arg(long)]
    pub prefecture_id: String,

    #[arg(long)]
    pub city_name: String,

    #[arg(long)]
    pub prefecture_name: Option<String>,

    #[arg(long)]
    pub official_url: Option<String>,

    #[arg(long = "official-domain")]
    pub official_domains: Vec<String>,

    #[arg(long, default_value = ".cache/gomidata")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long, value_enum)]
    pub rerun_from: Option<StepArg>,

    #[arg(long, env = "GOMIDATA_MODEL", default_value = "gpt-4.1-mini")]
    pub model: String,

    #[arg(long, env = "GOMIDATA_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    #[arg(long, default_value_t = 900_000)]
    pub total_budget_ms: u64,

    #[arg(long, default_value_t = 3)]
    pub step_max_attempts: u32,

    #[arg(long, default_value_t = 300_000)]
    pub step_timeout_ms: u64,

    #[arg(long, default_value_t = 1_000)]
    pub backoff_base_ms: u64,

    #[arg(long, default_value_t = 15_000)]
    pub backoff_max_ms: u64,

    #[arg(long, default_value_t = 15_000)]
    pub heartbeat_ms: u64,

    #[arg(long, default_value_t = 3)]
    pub discover_max_rounds: u32,

    #[arg(long, default_value_t = 30)]
    pub discover_max_candidates: usize,

    #[arg(long, default_value_t = 12)]
    pub discover_max_fetches: usize,

    #[arg(long, default_value_t = 6)]
    pub discover_fetch_cap: usize,

    #[arg(long, default_value_t = 1)]
    pub discover_link_depth: u32,

    #[arg(long, default_value_t = 3)]
    pub discover_top_n: usize,

    #[arg(long, default_value_t = 35_000)]
    pub discover_round_timeout_base_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    pub discover_round_timeout_step_ms: u64,

    #[arg(long, default_value_t = 90_000)]
    pub discover_round_timeout_max_ms: u64,

    #[arg(long, default_value_t = 6)]
    pub discover_max_tool_iterations: usize,

    #[arg(long, value_enum, default_value_t = StopMode::Quality)]
    pub discover_stop_mode: StopMode,

    #[arg(long, default_value_t = 0.55)]
    pub discover_min_score: f64,

    #[arg(long, default_value_t = 0.4)]
    pub discover_min_coverage: f64,

    #[arg(long, default_value_t = 0.5)]
    pub discover_min_cleanup_pass_rate: f64,

    #[arg(long, default_value_t = 0.5)]
    pub discover_max_noise_ratio: f64,

    #[arg(long, default_value_t = false)]
    pub require_machine_readable_schedule: bool,

    #[arg(long, default_value_t = 365.0)]
    pub freshness_half_life_days: f64,

    #[arg(long, default_value_t = false)]
    pub require_domain_lock: bool,

    #[arg(long, value_enum, default_value_t = DomainLockFailure::EmergencyBurst)]
    pub domain_lock_failure: DomainLockFailure,

    #[arg(long, default_value_t = 2)]
    pub max_host_switches: usize,

    #[arg(long, default_value_t = 20 * 1024 * 1024)]
    pub fetch_max_bytes: u64,

    #[arg(long, default_value_t = 20_000)]
    pub fetch_timeout_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    pub model_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    pub max_follow_links: usize,

    #[arg(long, value_enum, default_value_t = CleanupMode::Hybrid)]
    pub cleanup_mode: CleanupMode,

    #[arg(long, default_value_t = 12_000)]
    pub cleanup_chunk_max_bytes: usize,

    #[arg(long, default_value_t = 8)]
    pub cleanup_max_chunks: usize,

    #[arg(long, default_value_t = 0.3)]
    pub cleanup_min_pass_rate: f64,

    #[arg(long, default_value_t = 0.6)]
    pub cleanup_max_noise_ratio: f64,

    #[arg(long, default_value_t = 0.1)]
    pub cleanup_min_schema_signal_rate: f64,

    #[arg(long, value_enum, default_value_t = FailurePolicy::Skip)]
    pub cleanup_failure_policy: FailurePolicy,

    #[arg(long, default_value_t = false)]
    pub allow_raw_fallback: bool,

    #[arg(long, value_enum, default_value_t = SelectionMode::Hybrid)]
    pub selection_mode: SelectionMode,

    #[arg(long, default_value_t = 3)]
    pub selection_top_k: usize,

    #[arg(long, default_value_t = 0.1)]
    pub selection_hybrid_margin: f64,

    #[arg(long, default_value_t = 0.35)]
    pub selection_min_confidence: f64,

    #[arg(long, default_value_t = 0.55)]
    pub selection_max_noise_penalty: f64,

    #[arg(long, default_value_t = 0.05)]
    pub selection_min_parse_success: f64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/gomidata")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub run_id: Option<String>,
}
