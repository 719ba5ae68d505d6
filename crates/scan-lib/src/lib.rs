//! Right-sizing scan engine for Kubernetes workloads
//!
//! This crate provides the core functionality for:
//! - Workload discovery across clusters
//! - Historical CPU/memory usage queries against Prometheus
//! - Pluggable recommendation strategies
//! - Concurrent multi-cluster scans with deterministic reports
//! - Scan observability (metrics and structured logs)

pub mod discovery;
pub mod error;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod scan;
pub mod strategy;

pub use discovery::{KubeDiscoverer, NamespaceFilter, WorkloadDiscoverer};
pub use error::{DiscoveryError, QueryError, ScanError, StrategyConfigError, StrategyError};
pub use metrics::{GatewayConfig, MetricsGateway, PodSelector, PrometheusGateway, RetryPolicy};
pub use models::*;
pub use observability::{ScanMetrics, StructuredLogger};
pub use scan::{ConcurrencyLimits, ScanOrchestrator, ScanPhase, ScanRequest};
pub use strategy::{RecommendationStrategy, StrategyRegistry};
