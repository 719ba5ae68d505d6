//! Core data models for a right-sizing scan
//!
//! Everything here is scan-scoped: created while a scan runs and dropped
//! once the report has been handed to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// One target cluster and its paired metrics backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterContext {
    pub name: String,
    /// Kubeconfig context used to reach the cluster API
    #[serde(default)]
    pub context: Option<String>,
    /// Base URL of the Prometheus-compatible metrics backend
    pub metrics_url: Url,
    /// Bearer token sent to the metrics backend
    #[serde(default, skip_serializing)]
    pub metrics_token: Option<String>,
    /// Extra label matchers added to every metrics query (e.g. `cluster="prod"`)
    #[serde(default)]
    pub metrics_labels: BTreeMap<String, String>,
}

impl ClusterContext {
    pub fn new(name: impl Into<String>, metrics_url: Url) -> Self {
        Self {
            name: name.into(),
            context: None,
            metrics_url,
            metrics_token: None,
            metrics_labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 5] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
        WorkloadKind::Job,
        WorkloadKind::CronJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource type a recommendation is computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Cpu, ResourceType::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceType::Cpu),
            "memory" | "mem" => Ok(ResourceType::Memory),
            other => Err(format!("unknown resource type: {}", other)),
        }
    }
}

/// Requests and limits currently set in a container spec
///
/// CPU values are in cores, memory values in bytes. `None` means the field
/// is absent from the spec, which is not the same as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_request: Option<f64>,
    pub cpu_limit: Option<f64>,
    pub memory_request: Option<f64>,
    pub memory_limit: Option<f64>,
}

impl ResourceAllocation {
    pub fn request(&self, resource: ResourceType) -> Option<f64> {
        match resource {
            ResourceType::Cpu => self.cpu_request,
            ResourceType::Memory => self.memory_request,
        }
    }

    pub fn limit(&self, resource: ResourceType) -> Option<f64> {
        match resource {
            ResourceType::Cpu => self.cpu_limit,
            ResourceType::Memory => self.memory_limit,
        }
    }

    /// Narrow the allocation down to a single resource type
    pub fn for_resource(&self, resource: ResourceType) -> CurrentResources {
        CurrentResources {
            request: self.request(resource),
            limit: self.limit(resource),
        }
    }
}

/// Current request/limit for one resource type
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentResources {
    pub request: Option<f64>,
    pub limit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub resources: ResourceAllocation,
}

/// A deployable unit discovered in a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub cluster: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub containers: Vec<Container>,
    /// Pod names observed at discovery time
    #[serde(default)]
    pub pods: Vec<String>,
}

impl Workload {
    pub fn container_ref(&self, container: &Container) -> ContainerRef {
        ContainerRef {
            cluster: self.cluster.clone(),
            namespace: self.namespace.clone(),
            kind: self.kind,
            workload: self.name.clone(),
            container: container.name.clone(),
        }
    }
}

/// Identity of a container within the discovered workload set
///
/// Ordered by cluster, namespace, workload and container name; the
/// workload kind only separates same-named workloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef {
    pub cluster: String,
    pub namespace: String,
    pub workload: String,
    pub kind: WorkloadKind,
    pub container: String,
}

impl ContainerRef {
    fn name_order(&self, other: &Self) -> Ordering {
        (&self.cluster, &self.namespace, &self.workload, &self.container).cmp(&(
            &other.cluster,
            &other.namespace,
            &other.workload,
            &other.container,
        ))
    }
}

impl Ord for ContainerRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name_order(other).then(self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for ContainerRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.cluster, self.namespace, self.kind, self.workload, self.container
        )
    }
}

/// Key identifying one unit of work: a container and a resource type
///
/// Report order: cluster, namespace, workload, container, resource, then kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub container: ContainerRef,
    pub resource: ResourceType,
}

impl Ord for ItemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.container
            .name_order(&other.container)
            .then(self.resource.cmp(&other.resource))
            .then(self.container.kind.cmp(&other.container.kind))
    }
}

impl PartialOrd for ItemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.container, self.resource)
    }
}

/// One point of a usage time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub value: f64,
}

/// Time range and resolution of a history query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub step: Duration,
}

impl QueryWindow {
    /// Build a window ending at `end` and covering `length`
    pub fn ending_at(end: DateTime<Utc>, length: Duration, step: Duration) -> Result<Self, String> {
        if length.is_zero() {
            return Err("window length must be positive".to_string());
        }
        if step.is_zero() {
            return Err("step must be positive".to_string());
        }
        if step > length {
            return Err(format!(
                "step ({}) must not exceed window length ({})",
                humantime::format_duration(step),
                humantime::format_duration(length)
            ));
        }
        let too_long = || {
            format!(
                "window length {} reaches past the earliest representable time",
                humantime::format_duration(length)
            )
        };
        let span = chrono::Duration::from_std(length).map_err(|_| too_long())?;
        let start = end.checked_sub_signed(span).ok_or_else(too_long)?;
        Ok(Self { start, end, step })
    }

    pub fn length(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

/// Usage history of one container for one resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageHistory {
    pub container: ContainerRef,
    pub resource: ResourceType,
    /// Samples in ascending timestamp order
    pub samples: Vec<MetricSample>,
    /// OOM-kill events observed in the window
    pub oom_kills: u32,
    pub window: QueryWindow,
}

impl UsageHistory {
    /// History with no samples, for containers that have nothing to query
    pub fn empty(container: ContainerRef, resource: ResourceType, window: QueryWindow) -> Self {
        Self {
            container,
            resource,
            samples: Vec::new(),
            oom_kills: 0,
            window,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn peak(&self) -> Option<f64> {
        self.samples.iter().map(|s| s.value).reduce(f64::max)
    }
}

/// A recommended request or limit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum RecommendedValue {
    Value(f64),
    /// The strategy deliberately recommends leaving the field unset
    Unset,
    /// Not enough data to recommend anything
    Undetermined,
}

impl RecommendedValue {
    pub fn as_value(&self) -> Option<f64> {
        match self {
            RecommendedValue::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_undetermined(&self) -> bool {
        matches!(self, RecommendedValue::Undetermined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Undetermined,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Undetermined => "UNDETERMINED",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy name plus the settings it ran with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub name: String,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub container: ContainerRef,
    pub resource: ResourceType,
    pub request: RecommendedValue,
    pub limit: RecommendedValue,
    pub severity: Severity,
    pub current: CurrentResources,
    pub sample_count: usize,
    pub oom_kills: u32,
    pub strategy: StrategySnapshot,
}

impl Recommendation {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            container: self.container.clone(),
            resource: self.resource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Discovery,
    EmptySelection,
    Connection,
    Query,
    Timeout,
    Strategy,
    Cancelled,
}

/// What a recorded error applies to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum ErrorScope {
    Cluster { cluster: String },
    Item(ItemKey),
}

impl ErrorScope {
    pub fn cluster(&self) -> &str {
        match self {
            ErrorScope::Cluster { cluster } => cluster,
            ErrorScope::Item(key) => &key.container.cluster,
        }
    }
}

/// A failure captured in the report instead of aborting the scan
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemError {
    pub scope: ErrorScope,
    pub kind: ErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn cluster(
        cluster: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            scope: ErrorScope::Cluster {
                cluster: cluster.into(),
            },
            kind,
            message: message.into(),
        }
    }

    pub fn item(key: ItemKey, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            scope: ErrorScope::Item(key),
            kind,
            message: message.into(),
        }
    }
}

/// Overall outcome, used by the boundary layer to pick an exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Every item produced a recommendation
    Complete,
    /// Some items or clusters failed, the rest of the report is usable
    Partial,
    /// Nothing usable was produced
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total_items: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub total_errors: usize,
    pub failed_clusters: usize,
}

/// Scan metadata not derived from individual items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: QueryWindow,
    pub strategy: StrategySnapshot,
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub metadata: ScanMetadata,
    pub recommendations: Vec<Recommendation>,
    pub errors: Vec<ItemError>,
    /// Non-fatal observations, such as a namespace filter matching nothing
    pub notices: Vec<ItemError>,
    pub summary: ScanSummary,
}

impl ScanReport {
    pub fn status(&self) -> ScanStatus {
        if self.errors.is_empty() {
            ScanStatus::Complete
        } else if self.recommendations.is_empty() {
            ScanStatus::Failed
        } else {
            ScanStatus::Partial
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
