//! Historical usage queries against a time-series backend
//!
//! This module provides:
//! - The [`MetricsGateway`] contract used by the scan orchestrator
//! - PromQL rendering for container CPU, memory and OOM-kill queries
//! - A Prometheus HTTP implementation with timeouts and retries

mod prometheus;
mod retry;

pub use self::prometheus::{GatewayConfig, PrometheusGateway};
pub use retry::{RetryPolicy, RetryPredicate};

use crate::error::QueryError;
use crate::models::{
    ClusterContext, ContainerRef, QueryWindow, ResourceType, UsageHistory, WorkloadKind,
};
use async_trait::async_trait;

/// Selects the pods and container whose usage is queried
#[derive(Debug, Clone)]
pub struct PodSelector {
    pub container: ContainerRef,
    /// Pod names observed at discovery
    ///
    /// Only CronJobs fall back to a name pattern when this is empty; any
    /// other workload without pods has nothing to query.
    pub pods: Vec<String>,
}

impl PodSelector {
    pub fn new(container: ContainerRef, pods: Vec<String>) -> Self {
        Self { container, pods }
    }

    /// Regex matching the selected pods, `None` when no pod can belong to the workload
    pub fn pod_pattern(&self) -> Option<String> {
        if !self.pods.is_empty() {
            let names: Vec<String> = self.pods.iter().map(|p| regex::escape(p)).collect();
            return Some(names.join("|"));
        }
        match self.container.kind {
            // <cronjob>-<scheduled minute>-<pod suffix>
            WorkloadKind::CronJob => Some(format!(
                "{}-[0-9]+-[a-z0-9]+",
                regex::escape(&self.container.workload)
            )),
            _ => None,
        }
    }

    /// True when there is nothing to query for this container
    pub fn is_empty(&self) -> bool {
        self.pod_pattern().is_none()
    }

    /// PromQL label matchers, including the cluster's extra matchers
    ///
    /// An empty selector renders `pod=""`, which no container series carries.
    pub fn matchers(&self, cluster: &ClusterContext) -> String {
        let pod = match self.pod_pattern() {
            Some(pattern) => format!("pod=~\"{}\"", escape_label(&pattern)),
            None => "pod=\"\"".to_string(),
        };
        let mut parts = vec![
            format!("namespace=\"{}\"", escape_label(&self.container.namespace)),
            pod,
            format!("container=\"{}\"", escape_label(&self.container.container)),
        ];
        for (name, value) in &cluster.metrics_labels {
            parts.push(format!("{}=\"{}\"", name, escape_label(value)));
        }
        parts.join(", ")
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Range query producing the usage series for a resource type
pub fn usage_query(
    cluster: &ClusterContext,
    selector: &PodSelector,
    resource: ResourceType,
    window: &QueryWindow,
) -> String {
    let matchers = selector.matchers(cluster);
    match resource {
        ResourceType::Cpu => format!(
            "max by (pod) (rate(container_cpu_usage_seconds_total{{{}}}[{}s]))",
            matchers,
            window.step.as_secs().max(60)
        ),
        ResourceType::Memory => format!(
            "max by (pod) (container_memory_working_set_bytes{{{}}})",
            matchers
        ),
    }
}

/// Instant query counting OOM-kill events over the whole window
pub fn oom_kill_query(
    cluster: &ClusterContext,
    selector: &PodSelector,
    window: &QueryWindow,
) -> String {
    format!(
        "sum(increase(container_oom_events_total{{{}}}[{}s]))",
        selector.matchers(cluster),
        window.length().as_secs()
    )
}

/// Contract for fetching usage history of one container
#[async_trait]
pub trait MetricsGateway: Send + Sync {
    /// Fetch the usage history for a resource type over `window`
    ///
    /// A backend failure is an error, never an empty history.
    async fn query(
        &self,
        cluster: &ClusterContext,
        selector: &PodSelector,
        resource: ResourceType,
        window: &QueryWindow,
    ) -> Result<UsageHistory, QueryError>;
}
