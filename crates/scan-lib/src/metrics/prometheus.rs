//! Prometheus HTTP API client
//!
//! Talks to `/api/v1/query_range` and `/api/v1/query` with a pooled
//! `reqwest` client. Every query is bounded by a timeout and wrapped in
//! the configured [`RetryPolicy`].

use super::{oom_kill_query, usage_query, MetricsGateway, PodSelector, RetryPolicy};
use crate::error::QueryError;
use crate::models::{ClusterContext, MetricSample, QueryWindow, ResourceType, UsageHistory};
use crate::observability::ScanMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Configuration for the Prometheus gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Timeout for a single HTTP request
    pub query_timeout: Duration,
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Idle connections kept per backend host
    pub max_idle_per_host: usize,
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_idle_per_host: 16,
            retry: RetryPolicy::default(),
        }
    }
}

/// [`MetricsGateway`] backed by the Prometheus HTTP API
pub struct PrometheusGateway {
    client: Client,
    config: GatewayConfig,
    metrics: ScanMetrics,
}

impl PrometheusGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, QueryError> {
        let client = Client::builder()
            .timeout(config.query_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()
            .map_err(|e| QueryError::Connection(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            metrics: ScanMetrics::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn range_query(
        &self,
        cluster: &ClusterContext,
        expr: &str,
        window: &QueryWindow,
    ) -> Result<Vec<MetricSample>, QueryError> {
        let params = [
            ("query", expr.to_string()),
            ("start", window.start.timestamp().to_string()),
            ("end", window.end.timestamp().to_string()),
            ("step", format!("{}s", window.step.as_secs().max(1))),
        ];
        match self.post(cluster, "api/v1/query_range", &params).await? {
            PromData::Matrix(series) => flatten_matrix(series),
            other => Err(QueryError::InvalidResponse(format!(
                "expected matrix result, got {}",
                other.type_name()
            ))),
        }
    }

    async fn instant_query(
        &self,
        cluster: &ClusterContext,
        expr: &str,
        at: DateTime<Utc>,
    ) -> Result<f64, QueryError> {
        let params = [
            ("query", expr.to_string()),
            ("time", at.timestamp().to_string()),
        ];
        match self.post(cluster, "api/v1/query", &params).await? {
            PromData::Vector(samples) => {
                let mut total = 0.0;
                for sample in samples {
                    let value = parse_value(&sample.value.1)?;
                    if value.is_finite() {
                        total += value;
                    }
                }
                Ok(total)
            }
            PromData::Scalar((_, value)) => parse_value(&value),
            other => Err(QueryError::InvalidResponse(format!(
                "expected vector result, got {}",
                other.type_name()
            ))),
        }
    }

    async fn post(
        &self,
        cluster: &ClusterContext,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<PromData, QueryError> {
        let url = endpoint(&cluster.metrics_url, path)?;
        let start = Instant::now();

        let mut request = self.client.post(url).form(params);
        if let Some(token) = &cluster.metrics_token {
            request = request.bearer_auth(token);
        }

        let result = self.send(request).await;
        self.metrics
            .observe_query_latency(start.elapsed().as_secs_f64());
        if result.is_err() {
            self.metrics.inc_query_errors();
        }
        result
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<PromData, QueryError> {
        let response = request.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport(e))?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(QueryError::Unauthorized(format!("{}: {}", status, body)))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(QueryError::Backend {
                    status: status.as_u16(),
                    message: body,
                })
            }
            s if s.is_server_error() && serde_json::from_str::<PromResponse>(&body).is_err() => {
                return Err(QueryError::Backend {
                    status: s.as_u16(),
                    message: body,
                })
            }
            _ => {}
        }

        let parsed: PromResponse = serde_json::from_str(&body).map_err(|e| {
            QueryError::InvalidResponse(format!("{} (HTTP {}): {}", e, status, truncate(&body)))
        })?;

        if parsed.status != "success" {
            let message = parsed.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(match parsed.error_type.as_deref() {
                Some("bad_data") => QueryError::Malformed(message),
                Some("timeout") | Some("canceled") => QueryError::Backend {
                    status: status.as_u16(),
                    message,
                },
                _ if status.is_server_error() => QueryError::Backend {
                    status: status.as_u16(),
                    message,
                },
                _ => QueryError::InvalidResponse(message),
            });
        }

        parsed
            .data
            .ok_or_else(|| QueryError::InvalidResponse("response has no data".to_string()))
    }

    fn map_transport(&self, err: reqwest::Error) -> QueryError {
        if err.is_timeout() {
            QueryError::Timeout(self.config.query_timeout)
        } else if err.is_decode() {
            QueryError::InvalidResponse(err.to_string())
        } else {
            QueryError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl MetricsGateway for PrometheusGateway {
    async fn query(
        &self,
        cluster: &ClusterContext,
        selector: &PodSelector,
        resource: ResourceType,
        window: &QueryWindow,
    ) -> Result<UsageHistory, QueryError> {
        if selector.is_empty() {
            debug!(container = %selector.container, "No pods to query");
            return Ok(UsageHistory::empty(
                selector.container.clone(),
                resource,
                window.clone(),
            ));
        }

        let retry = &self.config.retry;
        let expr = usage_query(cluster, selector, resource, window);
        debug!(
            cluster = %cluster.name,
            container = %selector.container,
            query = %expr,
            "Querying usage history"
        );

        let samples = retry
            .run(
                || self.range_query(cluster, &expr, window),
                |_| self.metrics.inc_query_retries(),
            )
            .await?;

        let oom_kills = match resource {
            ResourceType::Memory => {
                let oom_expr = oom_kill_query(cluster, selector, window);
                let count = retry
                    .run(
                        || self.instant_query(cluster, &oom_expr, window.end),
                        |_| self.metrics.inc_query_retries(),
                    )
                    .await?;
                count.max(0.0).round() as u32
            }
            ResourceType::Cpu => 0,
        };

        Ok(UsageHistory {
            container: selector.container.clone(),
            resource,
            samples,
            oom_kills,
            window: window.clone(),
        })
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url, QueryError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|e| QueryError::Malformed(format!("invalid metrics URL: {}", e)))
}

fn parse_value(raw: &str) -> Result<f64, QueryError> {
    raw.parse::<f64>()
        .map_err(|_| QueryError::InvalidResponse(format!("unparsable sample value {:?}", raw)))
}

fn flatten_matrix(series: Vec<RangeSeries>) -> Result<Vec<MetricSample>, QueryError> {
    let mut samples = Vec::new();
    for s in series {
        for (ts, raw) in s.values {
            let value = parse_value(&raw)?;
            // Stale markers and division artefacts show up as NaN/Inf
            if value.is_finite() {
                samples.push(MetricSample {
                    timestamp: ts as i64,
                    value,
                });
            }
        }
    }
    samples.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.value.total_cmp(&b.value))
    });
    Ok(samples)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default, rename = "errorType")]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum PromData {
    Matrix(Vec<RangeSeries>),
    Vector(Vec<InstantSample>),
    Scalar((f64, String)),
    String((f64, String)),
}

impl PromData {
    fn type_name(&self) -> &'static str {
        match self {
            PromData::Matrix(_) => "matrix",
            PromData::Vector(_) => "vector",
            PromData::Scalar(_) => "scalar",
            PromData::String(_) => "string",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct InstantSample {
    value: (f64, String),
}
