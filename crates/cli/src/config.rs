//! Configuration management for the CLI
//!
//! Settings are layered: an optional file (`--config`, or
//! `~/.config/rsz/config.{yaml,toml,json}`), then `RSZ__*` environment
//! variables. Command-line flags are applied on top by the scan command.

use anyhow::{bail, Context, Result};
use scan_lib::{
    ClusterContext, ConcurrencyLimits, GatewayConfig, NamespaceFilter, RetryPolicy, WorkloadKind,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Prefix of configuration environment variables (`RSZ__CONCURRENCY__QUERIES=8`)
pub const ENV_PREFIX: &str = "RSZ";
const ENV_SEPARATOR: &str = "__";

/// CLI configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Clusters scanned when no `--context` is given
    pub clusters: Vec<ClusterConfig>,
    /// Metrics backend for clusters that do not name their own
    pub prometheus_url: Option<Url>,
    pub namespaces: Vec<String>,
    pub selector: Option<String>,
    pub kinds: Vec<WorkloadKind>,
    pub strategy: StrategyConfig,
    pub concurrency: ConcurrencyLimits,
    pub retry: RetryConfig,
    #[serde(with = "duration_str")]
    pub query_timeout: Duration,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_str::option")]
    pub scan_timeout: Option<Duration>,
    #[serde(with = "duration_str::option")]
    pub history: Option<Duration>,
    #[serde(with = "duration_str::option")]
    pub step: Option<Duration>,
    /// Items requested per list call against the cluster API
    pub page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            clusters: Vec::new(),
            prometheus_url: None,
            namespaces: Vec::new(),
            selector: None,
            kinds: Vec::new(),
            strategy: StrategyConfig::default(),
            concurrency: ConcurrencyLimits::default(),
            retry: RetryConfig::default(),
            query_timeout: gateway.query_timeout,
            connect_timeout: gateway.connect_timeout,
            scan_timeout: None,
            history: None,
            step: None,
            page_size: scan_lib::discovery::DEFAULT_PAGE_SIZE,
        }
    }
}

/// One cluster to scan
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    /// Kubeconfig context; the current context (or in-cluster config) when unset
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub prometheus_url: Option<Url>,
    /// Bearer token for the metrics backend
    #[serde(default)]
    pub token: Option<String>,
    /// Environment variable holding the bearer token
    #[serde(default)]
    pub token_env: Option<String>,
    /// Label matchers added to every query, e.g. `cluster: prod-eu`
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Ad-hoc cluster named after a kubeconfig context
    pub fn from_context(context: &str) -> Self {
        Self {
            name: context.to_string(),
            context: Some(context.to_string()),
            prometheus_url: None,
            token: None,
            token_env: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn to_context(&self, fallback_url: Option<&Url>) -> Result<ClusterContext> {
        let url = self
            .prometheus_url
            .as_ref()
            .or(fallback_url)
            .with_context(|| {
                format!(
                    "No Prometheus URL for cluster {} (set clusters[].prometheus_url or --prometheus-url)",
                    self.name
                )
            })?;

        let token = match (&self.token, &self.token_env) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(var)) => Some(std::env::var(var).with_context(|| {
                format!("Token variable {} for cluster {} is not set", var, self.name)
            })?),
            (None, None) => None,
        };

        let mut cluster = ClusterContext::new(&self.name, url.clone());
        cluster.context = self.context.clone();
        cluster.metrics_token = token;
        cluster.metrics_labels = self.labels.clone();
        Ok(cluster)
    }
}

/// Strategy name plus raw settings handed to the strategy registry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub name: String,
    pub settings: serde_json::Value,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "percentile".to_string(),
            settings: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delays(self.base_delay, self.max_delay)
            .with_jitter(self.jitter)
    }
}

impl Config {
    /// Load the file (if any) and environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file {} does not exist", path.display());
                }
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                if let Some(default) = Self::config_path() {
                    builder = builder.add_source(
                        config::File::with_name(&default.to_string_lossy()).required(false),
                    );
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Default configuration file stem, extension picked by the loader
    fn config_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|dir| dir.join("rsz").join("config"))
    }

    /// Clusters named on the command line, or every configured cluster
    ///
    /// A `--context` value matches a configured cluster by name or by
    /// context; anything else becomes an ad-hoc cluster for that context.
    pub fn select_clusters(&self, contexts: &[String]) -> Vec<ClusterConfig> {
        if contexts.is_empty() {
            return self.clusters.clone();
        }

        contexts
            .iter()
            .map(|ctx| {
                self.clusters
                    .iter()
                    .find(|c| &c.name == ctx || c.context.as_deref() == Some(ctx.as_str()))
                    .cloned()
                    .unwrap_or_else(|| ClusterConfig::from_context(ctx))
            })
            .collect()
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            query_timeout: self.query_timeout,
            connect_timeout: self.connect_timeout,
            retry: self.retry.policy(),
            ..GatewayConfig::default()
        }
    }

    pub fn namespace_filter(&self) -> NamespaceFilter {
        NamespaceFilter {
            namespaces: self.namespaces.clone(),
            label_selector: self.selector.clone(),
            kinds: self.kinds.clone(),
        }
    }
}

/// Durations written as humantime strings (`30s`, `14d`)
mod duration_str {
    use serde::{de::Error, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => humantime::parse_duration(&raw)
                    .map(Some)
                    .map_err(D::Error::custom),
                None => Ok(None),
            }
        }
    }
}
