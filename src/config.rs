use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cli::{
    CleanupMode, DomainLockFailure, FailurePolicy, RunArgs, SelectionMode, StopMode,
};

pub const API_KEY_ENV: &str = "GOMIDATA_API_KEY";
pub const FALLBACK_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const USER_AGENT: &str = "gomidata/0.1 (+municipal waste data acquisition)";

#[derive(Debug, Clone)]
pub struct CityTarget {
    pub city_id: String,
    pub prefecture_id: String,
    pub city_name: String,
    pub prefecture_name: Option<String>,
    pub official_url: Option<String>,
    pub official_domains: Vec<String>,
}

#[derive(Clone)]
pub struct ModelSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat: Duration,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_millis(300_000),
            backoff_base_ms: 1_000,
            backoff_max_ms: 15_000,
            heartbeat: Duration::from_millis(15_000),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub mode: StopMode,
    pub min_score: f64,
    pub min_coverage: f64,
    pub min_cleanup_pass_rate: f64,
    pub max_noise_ratio: f64,
    pub require_machine_readable_schedule: bool,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            mode: StopMode::Quality,
            min_score: 0.55,
            min_coverage: 0.4,
            min_cleanup_pass_rate: 0.5,
            max_noise_ratio: 0.5,
            require_machine_readable_schedule: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverPolicy {
    pub max_rounds: u32,
    pub max_candidates: usize,
    pub max_fetches: usize,
    pub fetch_cap: usize,
    pub link_depth: u32,
    pub top_n: usize,
    pub round_timeout_base_ms: u64,
    pub round_timeout_step_ms: u64,
    pub round_timeout_max_ms: u64,
    pub max_tool_iterations: usize,
    pub stop: StopPolicy,
    pub freshness_half_life_days: f64,
    pub require_domain_lock: bool,
    pub domain_lock_failure: DomainLockFailure,
    pub max_host_switches: usize,
}

impl Default for DiscoverPolicy {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_candidates: 30,
            max_fetches: 12,
            fetch_cap: 6,
            link_depth: 1,
            top_n: 3,
            round_timeout_base_ms: 35_000,
            round_timeout_step_ms: 10_000,
            round_timeout_max_ms: 90_000,
            max_tool_iterations: 6,
            stop: StopPolicy::default(),
            freshness_half_life_days: 365.0,
            require_domain_lock: false,
            domain_lock_failure: DomainLockFailure::EmergencyBurst,
            max_host_switches: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub max_bytes: u64,
    pub timeout: Duration,
    pub max_follow_links: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            timeout: Duration::from_millis(20_000),
            max_follow_links: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupGate {
    pub min_pass_rate: f64,
    pub max_noise_ratio: f64,
    pub min_schema_signal_rate: f64,
}

impl Default for CleanupGate {
    fn default() -> Self {
        Self {
            min_pass_rate: 0.3,
            max_noise_ratio: 0.6,
            min_schema_signal_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    pub mode: CleanupMode,
    pub chunk_max_bytes: usize,
    pub max_chunks: usize,
    pub gate: CleanupGate,
    pub failure_policy: FailurePolicy,
    pub allow_raw_fallback: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            mode: CleanupMode::Hybrid,
            chunk_max_bytes: 12_000,
            max_chunks: 8,
            gate: CleanupGate::default(),
            failure_policy: FailurePolicy::Skip,
            allow_raw_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PreflightGate {
    pub min_confidence: f64,
    pub max_noise_penalty: f64,
    pub min_parse_success: f64,
}

impl Default for PreflightGate {
    fn default() -> Self {
        Self {
            min_confidence: 0.35,
            max_noise_penalty: 0.55,
            min_parse_success: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub mode: SelectionMode,
    pub top_k: usize,
    pub hybrid_margin: f64,
    pub preflight: PreflightGate,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Hybrid,
            top_k: 3,
            hybrid_margin: 0.1,
            preflight: PreflightGate::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub city: CityTarget,
    pub cache_root: PathBuf,
    pub data_root: PathBuf,
    pub total_budget_ms: u64,
    pub model: ModelSettings,
    pub step: StepPolicy,
    pub discover: DiscoverPolicy,
    pub fetch: FetchPolicy,
    pub cleanup: CleanupPolicy,
    pub selection: SelectionPolicy,
}

impl PipelineOptions {
    pub fn from_args(args: &RunArgs) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .or_else(|_| std::env::var(FALLBACK_API_KEY_ENV))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let options = Self {
            city: CityTarget {
                city_id: args.city_id.trim().to_string(),
                prefecture_id: args.prefecture_id.trim().to_string(),
                city_name: args.city_name.trim().to_string(),
                prefecture_name: args
                    .prefecture_name
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty()),
                official_url: args.official_url.clone(),
                official_domains: normalize_domains(&args.official_domains, args.official_url.as_deref()),
            },
            cache_root: args.cache_root.clone(),
            data_root: args.data_root.clone(),
            total_budget_ms: args.total_budget_ms,
            model: ModelSettings {
                model: args.model.clone(),
                base_url: args.base_url.trim_end_matches('/').to_string(),
                api_key,
                timeout: Duration::from_millis(args.model_timeout_ms),
            },
            step: StepPolicy {
                max_attempts: args.step_max_attempts,
                timeout: Duration::from_millis(args.step_timeout_ms),
                backoff_base_ms: args.backoff_base_ms,
                backoff_max_ms: args.backoff_max_ms,
                heartbeat: Duration::from_millis(args.heartbeat_ms.max(1)),
            },
            discover: DiscoverPolicy {
                max_rounds: args.discover_max_rounds,
                max_candidates: args.discover_max_candidates,
                max_fetches: args.discover_max_fetches,
                fetch_cap: args.discover_fetch_cap,
                link_depth: args.discover_link_depth,
                top_n: args.discover_top_n,
                round_timeout_base_ms: args.discover_round_timeout_base_ms,
                round_timeout_step_ms: args.discover_round_timeout_step_ms,
                round_timeout_max_ms: args.discover_round_timeout_max_ms,
                max_tool_iterations: args.discover_max_tool_iterations,
                stop: StopPolicy {
                    mode: args.discover_stop_mode,
                    min_score: args.discover_min_score,
                    min_coverage: args.discover_min_coverage,
                    min_cleanup_pass_rate: args.discover_min_cleanup_pass_rate,
                    max_noise_ratio: args.discover_max_noise_ratio,
                    require_machine_readable_schedule: args.require_machine_readable_schedule,
                },
                freshness_half_life_days: args.freshness_half_life_days,
                require_domain_lock: args.require_domain_lock,
                domain_lock_failure: args.domain_lock_failure,
                max_host_switches: args.max_host_switches,
            },
            fetch: FetchPolicy {
                max_bytes: args.fetch_max_bytes,
                timeout: Duration::from_millis(args.fetch_timeout_ms),
                max_follow_links: args.max_follow_links,
            },
            cleanup: CleanupPolicy {
                mode: args.cleanup_mode,
                chunk_max_bytes: args.cleanup_chunk_max_bytes,
                max_chunks: args.cleanup_max_chunks,
                gate: CleanupGate {
                    min_pass_rate: args.cleanup_min_pass_rate,
                    max_noise_ratio: args.cleanup_max_noise_ratio,
                    min_schema_signal_rate: args.cleanup_min_schema_signal_rate,
                },
                failure_policy: args.cleanup_failure_policy,
                allow_raw_fallback: args.allow_raw_fallback,
            },
            selection: SelectionPolicy {
                mode: args.selection_mode,
                top_k: args.selection_top_k,
                hybrid_margin: args.selection_hybrid_margin,
                preflight: PreflightGate {
                    min_confidence: args.selection_min_confidence,
                    max_noise_penalty: args.selection_max_noise_penalty,
                    min_parse_success: args.selection_min_parse_success,
                },
            },
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.city.city_id.is_empty() || self.city.prefecture_id.is_empty() {
            bail!("--city-id and --prefecture-id must not be empty");
        }
        if self.city.city_name.is_empty() {
            bail!("--city-name must not be empty");
        }
        if self.discover.max_rounds == 0 {
            bail!("--discover-max-rounds must be at least 1");
        }
        if self.step.max_attempts == 0 {
            bail!("--step-max-attempts must be at least 1");
        }
        if self.selection.top_k == 0 {
            bail!("--selection-top-k must be at least 1");
        }
        if self.discover.round_timeout_base_ms > self.discover.round_timeout_max_ms {
            bail!(
                "--discover-round-timeout-base-ms ({}) exceeds --discover-round-timeout-max-ms ({})",
                self.discover.round_timeout_base_ms,
                self.discover.round_timeout_max_ms
            );
        }

        let unit_knobs = [
            ("--discover-min-score", self.discover.stop.min_score),
            ("--discover-min-coverage", self.discover.stop.min_coverage),
            (
                "--discover-min-cleanup-pass-rate",
                self.discover.stop.min_cleanup_pass_rate,
            ),
            ("--discover-max-noise-ratio", self.discover.stop.max_noise_ratio),
            ("--cleanup-min-pass-rate", self.cleanup.gate.min_pass_rate),
            ("--cleanup-max-noise-ratio", self.cleanup.gate.max_noise_ratio),
            (
                "--cleanup-min-schema-signal-rate",
                self.cleanup.gate.min_schema_signal_rate,
            ),
            ("--selection-hybrid-margin", self.selection.hybrid_margin),
            (
                "--selection-min-confidence",
                self.selection.preflight.min_confidence,
            ),
            (
                "--selection-max-noise-penalty",
                self.selection.preflight.max_noise_penalty,
            ),
            (
                "--selection-min-parse-success",
                self.selection.preflight.min_parse_success,
            ),
        ];
        for (name, value) in unit_knobs {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }

        if self.discover.freshness_half_life_days <= 0.0 {
            bail!("--freshness-half-life-days must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
impl PipelineOptions {
    /// Defaults for an example city rooted under `root`.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            city: CityTarget {
                city_id: "example-city".to_string(),
                prefecture_id: "example-pref".to_string(),
                city_name: "Example".to_string(),
                prefecture_name: None,
                official_url: Some("https://www.city.example.lg.jp/".to_string()),
                official_domains: vec!["www.city.example.lg.jp".to_string()],
            },
            cache_root: root.join("cache"),
            data_root: root.join("data"),
            total_budget_ms: 0,
            model: ModelSettings {
                model: "test-model".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: None,
                timeout: Duration::from_secs(5),
            },
            step: StepPolicy::default(),
            discover: DiscoverPolicy::default(),
            fetch: FetchPolicy::default(),
            cleanup: CleanupPolicy::default(),
            selection: SelectionPolicy::default(),
        }
    }
}

fn normalize_domains(domains: &[String], official_url: Option<&str>) -> Vec<String> {
    let mut out = domains
        .iter()
        .map(|value| {
            value
                .trim()
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_ascii_lowercase()
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>();

    if let Some(host) = official_url
        .and_then(|value| url::Url::parse(value).ok())
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
        && !out.contains(&host)
    {
        out.push(host);
    }

    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn parse_run(extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "gomidata",
            "run",
            "--city-id",
            "131016",
            "--prefecture-id",
            "13",
            "--city-name",
            "千代田区",
        ];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Run(args) => args,
            Commands::Status(_) => panic!("expected run"),
        }
    }

    #[test]
    fn official_url_host_joins_official_domains() {
        let args = parse_run(&[
            "--official-url",
            "https://www.city.chiyoda.lg.jp/koho/kurashi/gomi/",
            "--official-domain",
            "HTTPS://opendata.example.jp/",
        ]);
        let options = PipelineOptions::from_args(&args).unwrap();
        assert_eq!(
            options.city.official_domains,
            vec![
                "opendata.example.jp".to_string(),
                "www.city.chiyoda.lg.jp".to_string()
            ]
        );
    }

    #[test]
    fn thresholds_outside_unit_interval_are_rejected() {
        let args = parse_run(&["--cleanup-min-pass-rate", "1.5"]);
        let err = PipelineOptions::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("--cleanup-min-pass-rate"));
    }

    #[test]
    fn zero_rounds_is_rejected() {
        let args = parse_run(&["--discover-max-rounds", "0"]);
        assert!(PipelineOptions::from_args(&args).is_err());
    }

    #[test]
    fn debug_output_never_contains_api_key() {
        let settings = ModelSettings {
            model: "m".to_string(),
            base_url: "http://localhost".to_string(),
            api_key: Some("sk-secret".to_string()),
            timeout: Duration::from_secs(1),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("sk-secret"));
    }
}
