//! `rsz scan`: run one scan and render the report

use anyhow::{bail, Context, Result};
use clap::Args;
use kube::config::{KubeConfigOptions, Kubeconfig};
use scan_lib::{
    KubeDiscoverer, PrometheusGateway, ResourceType, ScanError, ScanMetrics, ScanOrchestrator,
    ScanRequest, ScanStatus,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::config::{ClusterConfig, Config};
use crate::output::{print_error, print_errors, print_report, OutputFormat};

/// Arguments of `rsz scan`
#[derive(Debug, Clone, Default, Args)]
pub struct ScanArgs {
    /// Kubeconfig context or configured cluster name to scan (repeatable)
    #[arg(long = "context", value_name = "CTX")]
    pub contexts: Vec<String>,

    /// Namespace to scan (repeatable; all namespaces when omitted)
    #[arg(long = "namespace", short = 'n', value_name = "NS")]
    pub namespaces: Vec<String>,

    /// Label selector applied to workloads
    #[arg(long, short = 'l', value_name = "SEL")]
    pub selector: Option<String>,

    /// Recommendation strategy (see `rsz strategies`)
    #[arg(long, value_name = "NAME")]
    pub strategy: Option<String>,

    /// Strategy setting, e.g. `cpu_percentile=90` or `bounds.cpu_max=4` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    pub settings: Vec<(String, Value)>,

    /// History window, e.g. `14d`
    #[arg(long, value_parser = humantime::parse_duration)]
    pub history: Option<Duration>,

    /// Query resolution, e.g. `15m`
    #[arg(long, value_parser = humantime::parse_duration)]
    pub step: Option<Duration>,

    /// Deadline for the whole scan, e.g. `10m`
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Resource type to compute (repeatable; cpu and memory when omitted)
    #[arg(long = "resource", value_name = "cpu|memory")]
    pub resources: Vec<ResourceType>,

    /// Prometheus URL for clusters without one configured
    #[arg(long, env = "RSZ_PROMETHEUS_URL")]
    pub prometheus_url: Option<Url>,

    /// Maximum metrics queries in flight
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Write the scan's Prometheus metrics to this file when the scan ends
    #[arg(long, value_name = "PATH")]
    pub metrics_file: Option<PathBuf>,
}

/// Parse a `--set KEY=VALUE` argument; the value is JSON when it parses as such
fn parse_setting(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(format!("invalid setting key `{}`", key));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Merge `--set` overrides into the configured settings, following dotted paths
pub fn apply_settings(base: Value, overrides: &[(String, Value)]) -> Result<Value> {
    let mut settings = match base {
        Value::Null => Value::Object(Default::default()),
        Value::Object(map) => Value::Object(map),
        other => bail!("strategy settings must be a mapping, got {}", other),
    };

    for (path, value) in overrides {
        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path.as_str()),
        };

        let mut node = &mut settings;
        for part in parents.into_iter().flat_map(|p| p.split('.')) {
            node = node
                .as_object_mut()
                .with_context(|| {
                    format!("Cannot set {}: parent of {} is not a mapping", path, part)
                })?
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        node.as_object_mut()
            .with_context(|| format!("Cannot set {}: parent of {} is not a mapping", path, leaf))?
            .insert(leaf.to_string(), value.clone());
    }
    Ok(settings)
}

/// Combine configuration and flags into a scan request
pub fn build_request(
    config: &Config,
    args: &ScanArgs,
    clusters: Vec<scan_lib::ClusterContext>,
) -> Result<ScanRequest> {
    let mut filter = config.namespace_filter();
    if !args.namespaces.is_empty() {
        filter.namespaces = args.namespaces.clone();
    }
    if args.selector.is_some() {
        filter.label_selector = args.selector.clone();
    }

    let resources = if args.resources.is_empty() {
        ResourceType::ALL.to_vec()
    } else {
        args.resources.clone()
    };

    let strategy = args
        .strategy
        .clone()
        .unwrap_or_else(|| config.strategy.name.clone());
    let settings = apply_settings(config.strategy.settings.clone(), &args.settings)?;

    let mut limits = config.concurrency;
    if let Some(queries) = args.concurrency {
        limits.queries = queries;
    }

    let mut request = ScanRequest::new(clusters)
        .with_filter(filter)
        .with_resources(resources)
        .with_strategy(strategy, settings)
        .with_limits(limits);
    request.window = args.history.or(config.history);
    request.step = args.step.or(config.step);
    request.timeout = args.timeout.or(config.scan_timeout);
    Ok(request)
}

/// Dump the process metrics in the Prometheus text format
fn write_metrics(path: &Path) -> Result<()> {
    let text = ScanMetrics::new()
        .export_text()
        .context("Failed to encode metrics")?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))
}

/// Cluster for the current kubeconfig context, or the in-cluster config
fn current_cluster() -> ClusterConfig {
    let name = Kubeconfig::read()
        .ok()
        .and_then(|kc| kc.current_context)
        .unwrap_or_else(|| "in-cluster".to_string());
    ClusterConfig {
        context: None,
        ..ClusterConfig::from_context(&name)
    }
}

async fn kube_client(cluster: &ClusterConfig, kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let options = KubeConfigOptions {
        context: cluster.context.clone(),
        ..Default::default()
    };

    let config = match (kubeconfig, &cluster.context) {
        (Some(path), _) => {
            let raw = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(raw, &options).await?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&options).await?,
        (None, None) => kube::Config::infer().await?,
    };

    kube::Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Run a scan and print the report; returns the report status
pub async fn run(
    args: ScanArgs,
    config_path: Option<PathBuf>,
    kubeconfig: Option<PathBuf>,
    format: OutputFormat,
) -> Result<ScanStatus> {
    let config = Config::load(config_path.as_deref())?;

    let mut selected = config.select_clusters(&args.contexts);
    if selected.is_empty() {
        selected.push(current_cluster());
    }

    let fallback_url = args.prometheus_url.as_ref().or(config.prometheus_url.as_ref());
    let clusters = selected
        .iter()
        .map(|cluster| cluster.to_context(fallback_url))
        .collect::<Result<Vec<_>>>()?;

    // A cluster without a client is reported as a discovery error by the scan
    let mut discoverer = KubeDiscoverer::new().with_page_size(config.page_size);
    for cluster in &selected {
        match kube_client(cluster, kubeconfig.as_deref()).await {
            Ok(client) => discoverer = discoverer.with_client(&cluster.name, client),
            Err(e) => warn!(
                event = "cluster_client_failed",
                cluster = %cluster.name,
                error = %format!("{:#}", e),
                "Failed to load cluster credentials"
            ),
        }
    }

    let gateway = PrometheusGateway::new(config.gateway_config())
        .context("Failed to create metrics client")?;
    let orchestrator = ScanOrchestrator::new(Arc::new(discoverer), Arc::new(gateway));
    let request = build_request(&config, &args, clusters)?;

    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!(event = "scan_interrupt", "Interrupt received, cancelling scan");
    };

    let outcome = orchestrator.run_until(request, interrupted).await;
    if let Some(path) = &args.metrics_file {
        write_metrics(path)?;
        info!(event = "metrics_written", path = %path.display(), "Metrics written");
    }

    match outcome {
        Ok(report) => {
            print_report(&report, format)?;
            Ok(report.status())
        }
        Err(ScanError::AllClustersFailed(errors)) => {
            print_error("Discovery failed for every cluster");
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&errors)?);
            } else {
                print_errors(&errors);
            }
            Ok(ScanStatus::Failed)
        }
        Err(e) => Err(e).context("Scan aborted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.prom");
        write_metrics(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("rightsizer_queries_in_flight"));

        let missing_dir = dir.path().join("nope").join("scan.prom");
        assert!(write_metrics(&missing_dir).is_err());
    }

    #[test]
    fn test_parse_setting() {
        assert_eq!(
            parse_setting("cpu_percentile=90").unwrap(),
            ("cpu_percentile".to_string(), json!(90))
        );
        assert_eq!(
            parse_setting("bounds.cpu_max=1.5").unwrap(),
            ("bounds.cpu_max".to_string(), json!(1.5))
        );
        assert_eq!(
            parse_setting("label=web").unwrap(),
            ("label".to_string(), json!("web"))
        );
        assert!(parse_setting("cpu_percentile").is_err());
        assert!(parse_setting("bounds..cpu_max=1").is_err());
    }

    #[test]
    fn test_apply_settings_nested() {
        let base = json!({"min_samples": 10, "bounds": {"cpu_min": 0.05}});
        let overrides = vec![
            ("bounds.cpu_max".to_string(), json!(4)),
            ("severity.ok_tolerance".to_string(), json!(0.2)),
            ("min_samples".to_string(), json!(50)),
        ];
        let merged = apply_settings(base, &overrides).unwrap();
        assert_eq!(
            merged,
            json!({
                "min_samples": 50,
                "bounds": {"cpu_min": 0.05, "cpu_max": 4},
                "severity": {"ok_tolerance": 0.2}
            })
        );
    }

    #[test]
    fn test_apply_settings_rejects_scalar_parent() {
        let base = json!({"min_samples": 10});
        let overrides = vec![("min_samples.value".to_string(), json!(1))];
        assert!(apply_settings(base, &overrides).is_err());
        assert!(apply_settings(json!(3), &[]).is_err());
        assert_eq!(apply_settings(Value::Null, &[]).unwrap(), json!({}));
    }

    #[test]
    fn test_build_request_flags_override_config() {
        let mut config = Config::default();
        config.namespaces = vec!["from-config".into()];
        config.history = Some(Duration::from_secs(86_400));
        config.strategy.settings = json!({"min_samples": 10});

        let args = ScanArgs {
            namespaces: vec!["shop".into()],
            strategy: Some("simple".into()),
            settings: vec![("memory_buffer_percent".into(), json!(25))],
            step: Some(Duration::from_secs(300)),
            resources: vec![ResourceType::Memory],
            concurrency: Some(2),
            ..ScanArgs::default()
        };

        let cluster = scan_lib::ClusterContext::new("prod", "http://prom:9090".parse().unwrap());
        let request = build_request(&config, &args, vec![cluster]).unwrap();

        assert_eq!(request.namespace_filter.namespaces, vec!["shop".to_string()]);
        assert_eq!(request.strategy_name, "simple");
        assert_eq!(
            request.strategy_settings,
            json!({"min_samples": 10, "memory_buffer_percent": 25})
        );
        assert_eq!(request.window, Some(Duration::from_secs(86_400)));
        assert_eq!(request.step, Some(Duration::from_secs(300)));
        assert_eq!(request.resource_types, vec![ResourceType::Memory]);
        assert_eq!(request.limits.queries, 2);
        assert_eq!(request.timeout, None);
    }
}
