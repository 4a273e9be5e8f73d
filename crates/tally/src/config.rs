//! Tally configuration

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tally_lib::{AggregationMode, AggregatorConfig, CustomKind, WatchConfig};

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "TALLY_CONFIG_FILE";

/// Longest server-side watch window the API server accepts
const MAX_SERVER_TIMEOUT_SECS: u64 = 294;

/// How the tally runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// List every kind once and report
    #[default]
    Snapshot,
    /// Watch every kind until interrupted
    Watch,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Snapshot => "snapshot",
            RunMode::Watch => "watch",
        }
    }
}

/// Tally configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TallyConfig {
    /// Cluster label attached to structured log records
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default)]
    pub mode: RunMode,

    /// Kind names to list or watch
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,

    /// Request keys to sum
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    /// Event folding mode; stateful when watching unless set
    #[serde(default)]
    pub aggregation: Option<AggregationMode>,

    /// Estimate per container without requests, by metric key
    #[serde(default = "default_no_request_estimate")]
    pub no_request_estimate: BTreeMap<String, f64>,

    /// Client-side wait for a single watch event before reopening the stream
    #[serde(default = "default_watch_idle_timeout")]
    pub watch_idle_timeout_secs: u64,

    /// Server-side watch window requested on each stream
    #[serde(default = "default_server_timeout")]
    pub server_timeout_secs: u64,

    /// Interval between snapshot logs while watching (0 disables)
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Custom kinds registered by name
    #[serde(default)]
    pub custom_kinds: BTreeMap<String, CustomKind>,
}

fn default_cluster_name() -> String {
    std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "default".to_string())
}

fn default_kinds() -> Vec<String> {
    vec!["pod".to_string()]
}

fn default_metrics() -> Vec<String> {
    vec!["cpu".to_string()]
}

fn default_no_request_estimate() -> BTreeMap<String, f64> {
    BTreeMap::from([("cpu".to_string(), 0.1)])
}

fn default_watch_idle_timeout() -> u64 {
    300
}

fn default_server_timeout() -> u64 {
    290
}

fn default_report_interval() -> u64 {
    60
}

impl TallyConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::from_sources(file.as_deref().map(Path::new), environment())
    }

    fn from_sources(file: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: TallyConfig = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            bail!("at least one kind must be configured");
        }
        if self.metrics.is_empty() {
            bail!("at least one metric must be configured");
        }
        if self.server_timeout_secs == 0 || self.server_timeout_secs > MAX_SERVER_TIMEOUT_SECS {
            bail!(
                "server_timeout_secs must be between 1 and {}, got {}",
                MAX_SERVER_TIMEOUT_SECS,
                self.server_timeout_secs
            );
        }
        if self.watch_idle_timeout_secs < self.server_timeout_secs {
            bail!(
                "watch_idle_timeout_secs ({}) must not be shorter than server_timeout_secs ({})",
                self.watch_idle_timeout_secs,
                self.server_timeout_secs
            );
        }
        if let Some((metric, estimate)) = self
            .no_request_estimate
            .iter()
            .find(|(_, estimate)| !estimate.is_finite() || **estimate < 0.0)
        {
            bail!("no_request_estimate for {} must be a non-negative number, got {}", metric, estimate);
        }
        Ok(())
    }

    pub fn aggregation_mode(&self) -> AggregationMode {
        self.aggregation.unwrap_or(match self.mode {
            RunMode::Snapshot => AggregationMode::Snapshot,
            RunMode::Watch => AggregationMode::Stateful,
        })
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            metrics: self.metrics.clone(),
            mode: self.aggregation_mode(),
            no_request_estimate: self.no_request_estimate.clone(),
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            idle_timeout: Duration::from_secs(self.watch_idle_timeout_secs),
        }
    }

    pub fn report_interval(&self) -> Option<Duration> {
        (self.report_interval_secs > 0).then(|| Duration::from_secs(self.report_interval_secs))
    }
}

/// `TALLY_KINDS=pod,deployment`, `TALLY_NO_REQUEST_ESTIMATE__CPU=0.2`
fn environment() -> config::Environment {
    config::Environment::with_prefix("TALLY")
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("kinds")
        .with_list_parse_key("metrics")
        .try_parsing(true)
}
