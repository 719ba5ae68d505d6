//! Recommendation strategies
//!
//! Provides:
//! - The [`RecommendationStrategy`] contract (pure: history in, recommendation out)
//! - [`StrategyRegistry`], an explicit name to factory table
//! - Shared helpers: linear-interpolation percentile, output bounds, settings parsing
//!
//! Strategies own their settings. A registry factory builds an instance once
//! from a raw JSON settings object, validating it, and every recommendation
//! carries a snapshot of those settings.

mod percentile;
mod severity;
mod simple;

pub use percentile::{PercentileSettings, PercentileStrategy};
pub use severity::{SeverityPolicy, DEFAULT_CRITICAL_LIMIT_RATIO, DEFAULT_OK_TOLERANCE};
pub use simple::{SimpleSettings, SimpleStrategy};

use crate::error::{StrategyConfigError, StrategyError};
use crate::models::{
    Recommendation, RecommendedValue, ResourceAllocation, ResourceType, StrategySnapshot,
    UsageHistory,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Default history length (two weeks)
pub const DEFAULT_HISTORY_HOURS: u64 = 336;

/// Longest accepted history length (ten years)
pub const MAX_HISTORY_HOURS: u64 = 87_600;

/// Default query resolution
pub const DEFAULT_TIMEFRAME_MINUTES: u64 = 15;

/// Default minimum number of samples before recommending anything
pub const DEFAULT_MIN_SAMPLES: usize = 100;

/// Smallest CPU request ever recommended (10m)
pub const MIN_CPU_CORES: f64 = 0.01;

/// Smallest memory request ever recommended (100Mi)
pub const MIN_MEMORY_BYTES: f64 = 100.0 * 1024.0 * 1024.0;

/// Computes a recommendation for one container and resource type
///
/// Implementations must be deterministic and free of I/O so they can run
/// on any worker and be tested without a cluster.
pub trait RecommendationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Settings this instance was built with
    fn snapshot(&self) -> StrategySnapshot;

    /// Window length used when the scan request does not set one
    fn history_duration(&self) -> Duration;

    /// Query step used when the scan request does not set one
    fn timeframe(&self) -> Duration;

    fn recommend(
        &self,
        history: &UsageHistory,
        current: &ResourceAllocation,
    ) -> Result<Recommendation, StrategyError>;
}

/// Builds a strategy from raw settings (`null` or a JSON object)
pub type StrategyFactory =
    fn(&serde_json::Value) -> Result<Arc<dyn RecommendationStrategy>, StrategyConfigError>;

/// Table of available strategies, keyed by lowercase name
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `percentile` and `simple` strategies
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PercentileStrategy::NAME, PercentileStrategy::factory);
        registry.register(SimpleStrategy::NAME, SimpleStrategy::factory);
        registry
    }

    /// Add or replace a strategy
    pub fn register(&mut self, name: &str, factory: StrategyFactory) -> &mut Self {
        self.factories.insert(name.to_lowercase(), factory);
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    /// Look up a strategy by name (case-insensitive) and build it
    pub fn resolve(
        &self,
        name: &str,
        settings: &serde_json::Value,
    ) -> Result<Arc<dyn RecommendationStrategy>, StrategyConfigError> {
        let factory =
            self.factories
                .get(&name.to_lowercase())
                .ok_or_else(|| StrategyConfigError::Unknown {
                    name: name.to_string(),
                    available: self.names(),
                })?;
        factory(settings)
    }
}

/// Hard limits applied to every recommended value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceBounds {
    pub cpu_min: f64,
    pub cpu_max: Option<f64>,
    pub memory_min: f64,
    pub memory_max: Option<f64>,
}

impl Default for ResourceBounds {
    fn default() -> Self {
        Self {
            cpu_min: MIN_CPU_CORES,
            cpu_max: None,
            memory_min: MIN_MEMORY_BYTES,
            memory_max: None,
        }
    }
}

impl ResourceBounds {
    pub fn validate(&self) -> Result<(), String> {
        for (name, min, max) in [
            ("cpu", self.cpu_min, self.cpu_max),
            ("memory", self.memory_min, self.memory_max),
        ] {
            if !(min >= 0.0 && min.is_finite()) {
                return Err(format!("bounds.{name}_min must be >= 0, got {min}"));
            }
            if let Some(max) = max {
                if !(max > 0.0) {
                    return Err(format!("bounds.{name}_max must be > 0, got {max}"));
                }
                if min > max {
                    return Err(format!(
                        "bounds.{name}_min ({min}) is greater than bounds.{name}_max ({max})"
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn clamp(&self, resource: ResourceType, value: f64) -> f64 {
        let (min, max) = match resource {
            ResourceType::Cpu => (self.cpu_min, self.cpu_max),
            ResourceType::Memory => (self.memory_min, self.memory_max),
        };
        let value = value.max(min);
        match max {
            Some(max) => value.min(max),
            None => value,
        }
    }

    /// Clamp a request/limit pair, keeping the limit at or above the request
    pub(crate) fn apply(
        &self,
        resource: ResourceType,
        request: f64,
        limit: Option<f64>,
    ) -> (RecommendedValue, RecommendedValue) {
        let request = self.clamp(resource, request);
        let limit = match limit {
            Some(limit) => RecommendedValue::Value(self.clamp(resource, limit).max(request)),
            None => RecommendedValue::Unset,
        };
        (RecommendedValue::Value(request), limit)
    }
}

/// Percentile with linear interpolation between closest ranks
///
/// `p` is in `(0, 100]`; the rank is `p / 100 * (n - 1)`. Returns `None`
/// for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Reject histories the strategies cannot reason about
pub(crate) fn checked_values(history: &UsageHistory) -> Result<Vec<f64>, StrategyError> {
    history
        .samples
        .iter()
        .map(|s| {
            if s.value.is_finite() && s.value >= 0.0 {
                Ok(s.value)
            } else {
                Err(StrategyError::InvalidSample(s.value))
            }
        })
        .collect()
}

/// Deserialize a settings object, treating `null` as "all defaults"
pub(crate) fn parse_settings<T>(
    strategy: &str,
    raw: &serde_json::Value,
) -> Result<T, StrategyConfigError>
where
    T: DeserializeOwned + Default,
{
    if raw.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(raw.clone()).map_err(|e| StrategyConfigError::Invalid {
        strategy: strategy.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn validate_window(history_hours: u64, timeframe_minutes: u64) -> Result<(), String> {
    if history_hours < 1 {
        return Err("history_duration_hours must be >= 1".to_string());
    }
    if history_hours > MAX_HISTORY_HOURS {
        return Err(format!(
            "history_duration_hours must be <= {MAX_HISTORY_HOURS}, got {history_hours}"
        ));
    }
    if timeframe_minutes < 1 {
        return Err("timeframe_minutes must be >= 1".to_string());
    }
    let history_minutes = history_hours
        .checked_mul(60)
        .ok_or_else(|| format!("history_duration_hours ({history_hours}) is out of range"))?;
    if timeframe_minutes > history_minutes {
        return Err(format!(
            "timeframe_minutes ({timeframe_minutes}) exceeds history_duration_hours ({history_hours}h)"
        ));
    }
    Ok(())
}

pub(crate) fn validate_percentile(name: &str, p: f64) -> Result<(), String> {
    if p > 0.0 && p <= 100.0 {
        Ok(())
    } else {
        Err(format!("{name} must be in (0, 100], got {p}"))
    }
}

pub(crate) fn validate_positive(name: &str, value: f64) -> Result<(), String> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(format!("{name} must be > 0, got {value}"))
    }
}

/// Lower bound for a memory limit once OOM kills have been observed
pub(crate) fn oom_floor(current_limit: Option<f64>, peak: f64, factor: f64) -> f64 {
    current_limit.unwrap_or(peak) * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_percentile_linear_interpolation() {
        let values: Vec<f64> = (1..=10).map(|i| (i * 100) as f64).collect();
        assert_eq!(percentile(&values, 90.0), Some(910.0));
        assert_eq!(percentile(&values, 100.0), Some(1000.0));
        assert_eq!(percentile(&values, 50.0), Some(550.0));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.0], 99.0), Some(7.0));
    }

    #[test]
    fn test_percentile_ignores_input_order() {
        let values = [5.0, 1.0, 4.0, 2.0, 3.0];
        assert_eq!(percentile(&values, 50.0), Some(3.0));
    }

    #[test]
    fn test_bounds_clamp() {
        let bounds = ResourceBounds {
            cpu_max: Some(4.0),
            ..Default::default()
        };
        assert_eq!(bounds.clamp(ResourceType::Cpu, 0.001), MIN_CPU_CORES);
        assert_eq!(bounds.clamp(ResourceType::Cpu, 8.0), 4.0);
        assert_eq!(bounds.clamp(ResourceType::Memory, 1.0), MIN_MEMORY_BYTES);

        let (request, limit) = bounds.apply(ResourceType::Cpu, 2.0, Some(1.0));
        assert_eq!(request, RecommendedValue::Value(2.0));
        assert_eq!(limit, RecommendedValue::Value(2.0));
    }

    #[test]
    fn test_bounds_validation() {
        let bad = ResourceBounds {
            memory_min: 10.0,
            memory_max: Some(5.0),
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().contains("memory_min"));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["percentile", "simple"]);
        assert!(registry.contains("Percentile"));

        let strategy = registry.resolve("SIMPLE", &serde_json::Value::Null).unwrap();
        assert_eq!(strategy.name(), "simple");
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry = StrategyRegistry::with_defaults();
        let err = registry
            .resolve("magic", &serde_json::Value::Null)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StrategyConfigError::Unknown { ref available, .. } if available.len() == 2
        ));
    }

    #[test]
    fn test_registry_rejects_unknown_keys() {
        let registry = StrategyRegistry::with_defaults();
        let err = registry
            .resolve("percentile", &json!({"cpu_percentil": 90}))
            .err()
            .unwrap();
        match err {
            StrategyConfigError::Invalid { strategy, reason } => {
                assert_eq!(strategy, "percentile");
                assert!(reason.contains("cpu_percentil"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_registry_custom_strategy() {
        fn build(
            raw: &serde_json::Value,
        ) -> Result<Arc<dyn RecommendationStrategy>, StrategyConfigError> {
            Ok(Arc::new(SimpleStrategy::new(parse_settings("tight", raw)?)?))
        }

        let mut registry = StrategyRegistry::with_defaults();
        registry.register("Tight", build);
        assert_eq!(registry.names(), vec!["percentile", "simple", "tight"]);
        assert!(registry.resolve("tight", &json!({"memory_buffer_percent": 5.0})).is_ok());
    }

    #[test]
    fn test_window_validation() {
        assert!(validate_window(336, 15).is_ok());
        assert!(validate_window(0, 15).is_err());
        assert!(validate_window(1, 0).is_err());
        assert!(validate_window(1, 61).is_err());
        assert!(validate_window(MAX_HISTORY_HOURS, 15).is_ok());
        assert!(validate_window(MAX_HISTORY_HOURS + 1, 15).is_err());
        assert!(validate_window(u64::MAX, u64::MAX).is_err());
    }

    #[test]
    fn test_registry_rejects_huge_history() {
        let registry = StrategyRegistry::with_defaults();
        for name in ["percentile", "simple"] {
            let err = registry
                .resolve(name, &json!({"history_duration_hours": 1_000_000_000_000_000_000u64}))
                .err()
                .unwrap();
            match err {
                StrategyConfigError::Invalid { strategy, reason } => {
                    assert_eq!(strategy, name);
                    assert!(reason.contains("history_duration_hours"), "{reason}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }
}
