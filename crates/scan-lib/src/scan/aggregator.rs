//! Result aggregation
//!
//! The aggregator is the only writer of scan results. Worker tasks send
//! [`CompletedItem`]s over a channel; the aggregator drains it, fills in
//! entries for items that never reported and builds a [`ScanReport`] whose
//! order depends only on item keys.

use crate::models::{
    ErrorKind, ErrorScope, ItemError, ItemKey, Recommendation, ScanMetadata, ScanReport,
    ScanSummary,
};
use crate::observability::{ScanMetrics, StructuredLogger};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;

/// Outcome of one (container, resource type) unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum CompletedItem {
    Recommendation(Recommendation),
    Failed(ItemError),
}

impl CompletedItem {
    /// Item key, `None` for cluster-scoped failures
    pub fn key(&self) -> Option<ItemKey> {
        match self {
            CompletedItem::Recommendation(rec) => Some(rec.key()),
            CompletedItem::Failed(err) => match &err.scope {
                ErrorScope::Item(key) => Some(key.clone()),
                ErrorScope::Cluster { .. } => None,
            },
        }
    }
}

#[derive(Default)]
pub struct ResultAggregator {
    recommendations: BTreeMap<ItemKey, Recommendation>,
    errors: Vec<ItemError>,
    notices: Vec<ItemError>,
    reported: BTreeSet<ItemKey>,
    logger: Option<StructuredLogger>,
    metrics: Option<ScanMetrics>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every recorded item and count it in the scan metrics
    pub fn with_observability(mut self, logger: StructuredLogger, metrics: ScanMetrics) -> Self {
        self.logger = Some(logger);
        self.metrics = Some(metrics);
        self
    }

    /// Record one item; a second outcome for an already reported key is ignored
    pub fn push(&mut self, item: CompletedItem) {
        if let Some(key) = item.key() {
            if !self.reported.insert(key) {
                return;
            }
        }

        match item {
            CompletedItem::Recommendation(rec) => {
                if let Some(logger) = &self.logger {
                    logger.log_recommendation(&rec);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_recommendation(rec.severity);
                }
                self.recommendations.insert(rec.key(), rec);
            }
            CompletedItem::Failed(err) => {
                match &err.scope {
                    ErrorScope::Item(_) => {
                        if let Some(logger) = &self.logger {
                            logger.log_item_failed(&err);
                        }
                        if let Some(metrics) = &self.metrics {
                            metrics.inc_failed_items();
                        }
                    }
                    ErrorScope::Cluster { cluster } => {
                        if let Some(logger) = &self.logger {
                            logger.log_cluster_failed(cluster, &err.message);
                        }
                        if let Some(metrics) = &self.metrics {
                            metrics.inc_failed_clusters();
                        }
                    }
                }
                self.errors.push(err);
            }
        }
    }

    /// Record a non-fatal observation (for example an empty namespace selection)
    pub fn push_notice(&mut self, notice: ItemError) {
        self.notices.push(notice);
    }

    /// Drain the channel until every sender is gone
    pub async fn collect(mut self, mut rx: mpsc::Receiver<CompletedItem>) -> Self {
        while let Some(item) = rx.recv().await {
            self.push(item);
        }
        self
    }

    /// Record `kind` for every expected key that never reported
    pub fn finish<'a, I>(mut self, expected: I, kind: ErrorKind, message: &str) -> Self
    where
        I: IntoIterator<Item = &'a ItemKey>,
    {
        for key in expected {
            if !self.reported.contains(key) {
                self.push(CompletedItem::Failed(ItemError::item(
                    key.clone(),
                    kind,
                    message,
                )));
            }
        }
        self
    }

    /// Recorded errors in report order
    pub fn into_errors(self) -> Vec<ItemError> {
        let mut errors = self.errors;
        errors.sort();
        errors
    }

    pub fn reported(&self) -> usize {
        self.reported.len()
    }

    pub fn into_report(self, metadata: ScanMetadata) -> ScanReport {
        let recommendations: Vec<Recommendation> = self.recommendations.into_values().collect();
        let mut errors = self.errors;
        errors.sort();
        let mut notices = self.notices;
        notices.sort();

        let mut by_severity = BTreeMap::new();
        for rec in &recommendations {
            *by_severity.entry(rec.severity).or_insert(0) += 1;
        }
        let failed_clusters = errors
            .iter()
            .filter(|e| matches!(e.scope, ErrorScope::Cluster { .. }))
            .count();
        let item_errors = errors.len() - failed_clusters;

        let summary = ScanSummary {
            total_items: recommendations.len() + item_errors,
            by_severity,
            total_errors: errors.len(),
            failed_clusters,
        };

        ScanReport {
            metadata,
            recommendations,
            errors,
            notices,
            summary,
        }
    }
}

/// Build a report from completed items in any order
pub fn aggregate<I>(items: I, metadata: ScanMetadata) -> ScanReport
where
    I: IntoIterator<Item = CompletedItem>,
{
    let mut aggregator = ResultAggregator::new();
    for item in items {
        aggregator.push(item);
    }
    aggregator.into_report(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ContainerRef, CurrentResources, QueryWindow, RecommendedValue, ResourceType, Severity,
        StrategySnapshot, WorkloadKind,
    };
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn metadata() -> ScanMetadata {
        let end = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        ScanMetadata {
            started_at: end,
            finished_at: end,
            window: QueryWindow::ending_at(end, Duration::from_secs(3600), Duration::from_secs(60))
                .unwrap(),
            strategy: StrategySnapshot {
                name: "percentile".into(),
                settings: serde_json::json!({}),
            },
            clusters: vec!["a".into(), "b".into()],
        }
    }

    fn key(cluster: &str, workload: &str, resource: ResourceType) -> ItemKey {
        ItemKey {
            container: ContainerRef {
                cluster: cluster.into(),
                namespace: "default".into(),
                workload: workload.into(),
                kind: WorkloadKind::Deployment,
                container: "app".into(),
            },
            resource,
        }
    }

    fn rec(key: &ItemKey, severity: Severity) -> CompletedItem {
        CompletedItem::Recommendation(Recommendation {
            container: key.container.clone(),
            resource: key.resource,
            request: RecommendedValue::Value(1.0),
            limit: RecommendedValue::Unset,
            severity,
            current: CurrentResources::default(),
            sample_count: 10,
            oom_kills: 0,
            strategy: metadata().strategy,
        })
    }

    fn items() -> Vec<CompletedItem> {
        vec![
            rec(&key("b", "api", ResourceType::Cpu), Severity::Ok),
            rec(&key("a", "web", ResourceType::Memory), Severity::Warning),
            CompletedItem::Failed(ItemError::item(
                key("a", "api", ResourceType::Memory),
                ErrorKind::Query,
                "bad data",
            )),
            rec(&key("a", "web", ResourceType::Cpu), Severity::Ok),
            CompletedItem::Failed(ItemError::cluster("c", ErrorKind::Discovery, "unreachable")),
            rec(&key("a", "api", ResourceType::Cpu), Severity::Critical),
        ]
    }

    #[test]
    fn test_report_order_follows_item_keys() {
        let report = aggregate(items(), metadata());
        let keys: Vec<String> = report
            .recommendations
            .iter()
            .map(|r| r.key().to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "a/default/Deployment/api/app[cpu]",
                "a/default/Deployment/web/app[cpu]",
                "a/default/Deployment/web/app[memory]",
                "b/default/Deployment/api/app[cpu]",
            ]
        );
        // Cluster scope sorts before item scope
        assert!(matches!(report.errors[0].scope, ErrorScope::Cluster { .. }));
    }

    #[test]
    fn test_shuffled_input_gives_identical_report() {
        let forward = aggregate(items(), metadata());
        let mut reversed_items = items();
        reversed_items.reverse();
        let mut rotated_items = items();
        rotated_items.rotate_left(2);

        let expected = serde_json::to_string(&forward).unwrap();
        let reversed = serde_json::to_string(&aggregate(reversed_items, metadata())).unwrap();
        let rotated = serde_json::to_string(&aggregate(rotated_items, metadata())).unwrap();
        assert_eq!(reversed, expected);
        assert_eq!(rotated, expected);
    }

    #[test]
    fn test_summary_counts() {
        let report = aggregate(items(), metadata());
        assert_eq!(report.summary.total_items, 5);
        assert_eq!(report.summary.total_errors, 2);
        assert_eq!(report.summary.failed_clusters, 1);
        assert_eq!(report.summary.by_severity[&Severity::Ok], 2);
        assert_eq!(report.summary.by_severity[&Severity::Critical], 1);
        assert!(!report.summary.by_severity.contains_key(&Severity::Undetermined));
    }

    #[test]
    fn test_finish_marks_missing_items() {
        let done = key("a", "api", ResourceType::Cpu);
        let missing = key("a", "api", ResourceType::Memory);
        let mut aggregator = ResultAggregator::new();
        aggregator.push(rec(&done, Severity::Ok));

        let report = aggregator
            .finish([&done, &missing], ErrorKind::Timeout, "scan deadline reached")
            .into_report(metadata());

        assert_eq!(report.recommendations.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, ErrorKind::Timeout);
        assert_eq!(report.errors[0].scope, ErrorScope::Item(missing));
    }

    #[test]
    fn test_duplicate_outcome_ignored() {
        let k = key("a", "api", ResourceType::Cpu);
        let mut aggregator = ResultAggregator::new();
        aggregator.push(rec(&k, Severity::Ok));
        aggregator.push(CompletedItem::Failed(ItemError::item(
            k,
            ErrorKind::Timeout,
            "late",
        )));
        assert_eq!(aggregator.reported(), 1);
        let report = aggregator.into_report(metadata());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_collect_drains_channel() {
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            for item in items() {
                tx.send(item).await.unwrap();
            }
        });

        let aggregator = ResultAggregator::new().collect(rx).await;
        producer.await.unwrap();
        assert_eq!(aggregator.into_report(metadata()).recommendations.len(), 4);
    }
}
