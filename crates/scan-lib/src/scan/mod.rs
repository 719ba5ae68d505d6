//! Multi-cluster scan orchestration
//!
//! Provides:
//! - [`ScanRequest`] and [`ConcurrencyLimits`], the inputs of a scan
//! - [`ScanOrchestrator`], which runs discovery, fetch and compute with
//!   bounded concurrency and hands every outcome to the aggregator
//!
//! Failures are isolated: a failed cluster becomes one report entry, a
//! failed container/resource item becomes one report entry, and only
//! configuration errors or a scan where every cluster failed abort.

pub mod aggregator;


pub use aggregator::{aggregate, CompletedItem, ResultAggregator};

use crate::discovery::{NamespaceFilter, WorkloadDiscoverer};
use crate::error::{DiscoveryError, ScanError};
use crate::metrics::{MetricsGateway, PodSelector};
use crate::models::{
    ClusterContext, ErrorKind, ItemError, ItemKey, QueryWindow, ResourceAllocation, ResourceType,
    ScanMetadata, ScanReport, UsageHistory, Workload,
};
use crate::observability::{ScanMetrics, StructuredLogger};
use crate::strategy::{RecommendationStrategy, StrategyRegistry};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Capacity of the worker to aggregator channel
const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Upper bounds on concurrent work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    /// Clusters discovered at the same time
    pub discovery: usize,
    /// Metrics queries in flight at the same time, across all clusters
    pub queries: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            discovery: 4,
            queries: 16,
        }
    }
}

/// Everything a scan needs to know up front
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub clusters: Vec<ClusterContext>,
    pub namespace_filter: NamespaceFilter,
    pub resource_types: Vec<ResourceType>,
    pub strategy_name: String,
    /// Raw strategy settings, `null` for defaults
    pub strategy_settings: serde_json::Value,
    /// History length; the strategy default when unset
    pub window: Option<Duration>,
    /// Query resolution; the strategy default when unset
    pub step: Option<Duration>,
    pub limits: ConcurrencyLimits,
    /// Deadline covering discovery and fetch
    pub timeout: Option<Duration>,
}

impl ScanRequest {
    pub fn new(clusters: Vec<ClusterContext>) -> Self {
        Self {
            clusters,
            namespace_filter: NamespaceFilter::all(),
            resource_types: ResourceType::ALL.to_vec(),
            strategy_name: "percentile".to_string(),
            strategy_settings: serde_json::Value::Null,
            window: None,
            step: None,
            limits: ConcurrencyLimits::default(),
            timeout: None,
        }
    }

    pub fn with_filter(mut self, filter: NamespaceFilter) -> Self {
        self.namespace_filter = filter;
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceType>) -> Self {
        self.resource_types = resources;
        self
    }

    pub fn with_strategy(mut self, name: impl Into<String>, settings: serde_json::Value) -> Self {
        self.strategy_name = name.into();
        self.strategy_settings = settings;
        self
    }

    pub fn with_window(mut self, window: Duration, step: Duration) -> Self {
        self.window = Some(window);
        self.step = Some(step);
        self
    }

    pub fn with_limits(mut self, limits: ConcurrencyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<(), ScanError> {
        if self.clusters.is_empty() {
            return Err(ScanError::InvalidRequest("no clusters to scan".to_string()));
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(ScanError::InvalidRequest(format!(
                    "cluster {} listed more than once",
                    cluster.name
                )));
            }
        }
        if self.resource_types.is_empty() {
            return Err(ScanError::InvalidRequest("no resource types selected".to_string()));
        }
        if self.limits.discovery == 0 || self.limits.queries == 0 {
            return Err(ScanError::InvalidRequest(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ScanError::InvalidRequest("timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Stages of a scan, logged at each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Discovering,
    /// Metrics queries in flight
    Fetching,
    /// Strategy evaluation, run per item right after its query
    Computing,
    Aggregating,
    Done,
    Failed,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Discovering => "discovering",
            ScanPhase::Fetching => "fetching",
            ScanPhase::Computing => "computing",
            ScanPhase::Aggregating => "aggregating",
            ScanPhase::Done => "done",
            ScanPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why outstanding work was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Cancelled,
}

impl Interrupt {
    fn kind(self) -> ErrorKind {
        match self {
            Interrupt::Deadline => ErrorKind::Timeout,
            Interrupt::Cancelled => ErrorKind::Cancelled,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Interrupt::Deadline => "scan deadline reached before this item completed",
            Interrupt::Cancelled => "scan cancelled before this item completed",
        }
    }
}

/// Decrements the in-flight gauge even when the task is aborted mid-query
struct InFlight<'a>(&'a ScanMetrics);

impl<'a> InFlight<'a> {
    fn start(metrics: &'a ScanMetrics) -> Self {
        metrics.query_started();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.query_finished();
    }
}

struct DiscoveryOutcome {
    clusters: Vec<(Arc<ClusterContext>, Vec<Workload>)>,
    /// Clusters recorded as failed (empty selections are not failures)
    failed: usize,
    interrupted: Option<Interrupt>,
}

/// One unit of fetch/compute work
struct WorkItem {
    key: ItemKey,
    cluster: Arc<ClusterContext>,
    selector: PodSelector,
    current: ResourceAllocation,
}

/// Drives a scan from discovery to report
pub struct ScanOrchestrator {
    discoverer: Arc<dyn WorkloadDiscoverer>,
    gateway: Arc<dyn MetricsGateway>,
    registry: StrategyRegistry,
    metrics: ScanMetrics,
}

impl ScanOrchestrator {
    pub fn new(discoverer: Arc<dyn WorkloadDiscoverer>, gateway: Arc<dyn MetricsGateway>) -> Self {
        Self {
            discoverer,
            gateway,
            registry: StrategyRegistry::with_defaults(),
            metrics: ScanMetrics::new(),
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Run a scan to completion (or until its timeout)
    pub async fn run_scan(&self, request: ScanRequest) -> Result<ScanReport, ScanError> {
        self.run_until(request, std::future::pending()).await
    }

    /// Run a scan that stops early when `cancel` resolves
    ///
    /// Items that have not reported when the scan is cancelled or reaches
    /// its deadline are recorded as `Cancelled` or `Timeout` errors.
    pub async fn run_until<F>(
        &self,
        request: ScanRequest,
        cancel: F,
    ) -> Result<ScanReport, ScanError>
    where
        F: Future<Output = ()> + Send,
    {
        let started_at = Utc::now();

        let strategy = self
            .registry
            .resolve(&request.strategy_name, &request.strategy_settings)?;
        request.validate()?;
        let window = QueryWindow::ending_at(
            started_at,
            request.window.unwrap_or_else(|| strategy.history_duration()),
            request.step.unwrap_or_else(|| strategy.timeframe()),
        )
        .map_err(ScanError::InvalidRequest)?;

        let logger = StructuredLogger::new(format!("scan-{}", started_at.timestamp_millis()));
        logger.log_scan_started(
            request.clusters.len(),
            strategy.name(),
            window.length().as_secs(),
        );

        let deadline = request.timeout.map(|t| Instant::now() + t);
        let stop = async move {
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = expiry => Interrupt::Deadline,
                _ = cancel => Interrupt::Cancelled,
            }
        };
        tokio::pin!(stop);

        let mut aggregator =
            ResultAggregator::new().with_observability(logger.clone(), self.metrics.clone());

        logger.log_phase(ScanPhase::Discovering.as_str());
        let discovery = self
            .discover(&request, &mut aggregator, stop.as_mut())
            .await;

        if discovery.failed == request.clusters.len() {
            logger.log_phase(ScanPhase::Failed.as_str());
            return Err(ScanError::AllClustersFailed(aggregator.into_errors()));
        }

        let mut interrupted = discovery.interrupted;
        for (cluster, workloads) in &discovery.clusters {
            logger.log_cluster_discovered(
                &cluster.name,
                workloads.len(),
                workloads.iter().map(|w| w.containers.len()).sum(),
            );
        }

        let items = work_items(&discovery.clusters, &request.resource_types);
        let expected: Vec<ItemKey> = items.iter().map(|i| i.key.clone()).collect();

        let aggregator = if interrupted.is_none() {
            logger.log_phase(ScanPhase::Fetching.as_str());
            let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
            let fan_out = self.fan_out(
                items,
                strategy.clone(),
                &window,
                request.limits.queries,
                tx,
                stop.as_mut(),
            );
            let (outcome, aggregator) = tokio::join!(fan_out, aggregator.collect(rx));
            interrupted = outcome;
            aggregator
        } else {
            aggregator
        };

        logger.log_phase(ScanPhase::Aggregating.as_str());
        let aggregator = match interrupted {
            Some(reason) => aggregator.finish(&expected, reason.kind(), reason.message()),
            None => aggregator.finish(
                &expected,
                ErrorKind::Query,
                "worker task ended without a result",
            ),
        };

        let report = aggregator.into_report(self.metadata(
            started_at,
            window,
            strategy.as_ref(),
            &request,
        ));
        logger.log_phase(ScanPhase::Done.as_str());
        logger.log_scan_finished(&report);
        Ok(report)
    }

    fn metadata(
        &self,
        started_at: chrono::DateTime<Utc>,
        window: QueryWindow,
        strategy: &dyn RecommendationStrategy,
        request: &ScanRequest,
    ) -> ScanMetadata {
        ScanMetadata {
            started_at,
            finished_at: Utc::now(),
            window,
            strategy: strategy.snapshot(),
            clusters: request.clusters.iter().map(|c| c.name.clone()).collect(),
        }
    }

    /// Discover every cluster, bounded by `limits.discovery`
    ///
    /// Failed clusters are recorded in the aggregator; clusters still
    /// pending when the scan is interrupted are recorded with the
    /// interruption kind.
    async fn discover<S>(
        &self,
        request: &ScanRequest,
        aggregator: &mut ResultAggregator,
        mut stop: Pin<&mut S>,
    ) -> DiscoveryOutcome
    where
        S: Future<Output = Interrupt>,
    {
        let permits = Arc::new(Semaphore::new(request.limits.discovery));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for cluster in &request.clusters {
            let cluster = Arc::new(cluster.clone());
            let discoverer = self.discoverer.clone();
            let filter = request.namespace_filter.clone();
            let permits = permits.clone();
            pending.insert(cluster.name.clone());

            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => discoverer.discover(&cluster, &filter).await,
                    Err(_) => Err(DiscoveryError::Unreachable("scan shut down".to_string())),
                };
                (cluster, result)
            });
        }

        let mut discovered = Vec::new();
        let mut failed = 0;
        let mut interrupted = None;
        loop {
            tokio::select! {
                reason = stop.as_mut(), if interrupted.is_none() => {
                    tasks.abort_all();
                    interrupted = Some(reason);
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok((cluster, result))) => {
                        pending.remove(&cluster.name);
                        match result {
                            Ok(workloads) => discovered.push((cluster, workloads)),
                            Err(err @ DiscoveryError::EmptySelection { .. }) => {
                                warn!(
                                    cluster = %cluster.name,
                                    error = %err,
                                    "Namespace filter matched nothing"
                                );
                                aggregator.push_notice(ItemError::cluster(
                                    cluster.name.clone(),
                                    err.kind(),
                                    err.to_string(),
                                ));
                            }
                            Err(err) => {
                                failed += 1;
                                aggregator.push(CompletedItem::Failed(ItemError::cluster(
                                    cluster.name.clone(),
                                    err.kind(),
                                    err.to_string(),
                                )));
                            }
                        }
                    }
                    Some(Err(e)) if e.is_panic() => {
                        warn!(error = %e, "Discovery task panicked");
                    }
                    Some(Err(_)) => {}
                }
            }
        }

        for cluster in pending {
            let (kind, message) = match interrupted {
                Some(reason) => (reason.kind(), reason.message()),
                None => (ErrorKind::Discovery, "discovery task ended without a result"),
            };
            failed += 1;
            aggregator.push(CompletedItem::Failed(ItemError::cluster(cluster, kind, message)));
        }

        discovered.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        DiscoveryOutcome {
            clusters: discovered,
            failed,
            interrupted,
        }
    }

    /// Query and evaluate every item, holding a query permit only while querying
    async fn fan_out<S>(
        &self,
        items: Vec<WorkItem>,
        strategy: Arc<dyn RecommendationStrategy>,
        window: &QueryWindow,
        query_limit: usize,
        tx: mpsc::Sender<CompletedItem>,
        mut stop: Pin<&mut S>,
    ) -> Option<Interrupt>
    where
        S: Future<Output = Interrupt>,
    {
        let permits = Arc::new(Semaphore::new(query_limit));
        let mut tasks = JoinSet::new();

        for item in items {
            let gateway = self.gateway.clone();
            let strategy = strategy.clone();
            let window = window.clone();
            let permits = permits.clone();
            let metrics = self.metrics.clone();
            let tx = tx.clone();

            tasks.spawn(async move {
                let outcome = process_item(item, gateway, strategy, window, permits, metrics).await;
                // The receiver only closes once every sender is gone
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        debug!(tasks = tasks.len(), "Fanned out fetch tasks");

        let mut interrupted = None;
        loop {
            tokio::select! {
                reason = stop.as_mut(), if interrupted.is_none() => {
                    tasks.abort_all();
                    interrupted = Some(reason);
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Err(e)) if e.is_panic() => warn!(error = %e, "Fetch task panicked"),
                    Some(_) => {}
                }
            }
        }
        interrupted
    }
}

async fn process_item(
    item: WorkItem,
    gateway: Arc<dyn MetricsGateway>,
    strategy: Arc<dyn RecommendationStrategy>,
    window: QueryWindow,
    permits: Arc<Semaphore>,
    metrics: ScanMetrics,
) -> CompletedItem {
    let resource = item.key.resource;
    if item.selector.is_empty() {
        trace!(item = %item.key, "No pods to query");
        let history = UsageHistory::empty(item.key.container.clone(), resource, window);
        return evaluate(item, &history, strategy.as_ref());
    }

    let history = {
        let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return CompletedItem::Failed(ItemError::item(
                    item.key,
                    ErrorKind::Cancelled,
                    "query permits closed",
                ))
            }
        };
        let _in_flight = InFlight::start(&metrics);
        trace!(item = %item.key, phase = %ScanPhase::Fetching, "Querying metrics");
        gateway
            .query(&item.cluster, &item.selector, resource, &window)
            .await
    };

    let history = match history {
        Ok(history) => history,
        Err(err) => {
            return CompletedItem::Failed(ItemError::item(item.key, err.kind(), err.to_string()))
        }
    };

    evaluate(item, &history, strategy.as_ref())
}

fn evaluate(
    item: WorkItem,
    history: &UsageHistory,
    strategy: &dyn RecommendationStrategy,
) -> CompletedItem {
    trace!(
        item = %item.key,
        phase = %ScanPhase::Computing,
        samples = history.samples.len(),
        "Evaluating strategy"
    );
    match strategy.recommend(history, &item.current) {
        Ok(rec) => CompletedItem::Recommendation(rec),
        Err(err) => {
            CompletedItem::Failed(ItemError::item(item.key, ErrorKind::Strategy, err.to_string()))
        }
    }
}

fn work_items(
    discovered: &[(Arc<ClusterContext>, Vec<Workload>)],
    resources: &[ResourceType],
) -> Vec<WorkItem> {
    let resources: BTreeSet<ResourceType> = resources.iter().copied().collect();
    let mut items = Vec::new();
    for (cluster, workloads) in discovered {
        for workload in workloads {
            for container in &workload.containers {
                let container_ref = workload.container_ref(container);
                for resource in &resources {
                    items.push(WorkItem {
                        key: ItemKey {
                            container: container_ref.clone(),
                            resource: *resource,
                        },
                        cluster: cluster.clone(),
                        selector: PodSelector {
                            container: container_ref.clone(),
                            pods: workload.pods.clone(),
                        },
                        current: container.resources,
                    });
                }
            }
        }
    }
    items
}
