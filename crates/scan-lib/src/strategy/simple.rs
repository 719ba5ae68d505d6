//! Threshold-only strategy
//!
//! CPU request at a percentile with no limit; memory request and limit both
//! set to the observed peak plus a fixed buffer.

use super::{
    checked_values, oom_floor, parse_settings, percentile, validate_percentile, validate_positive,
    validate_window, RecommendationStrategy, ResourceBounds, SeverityPolicy,
    DEFAULT_HISTORY_HOURS, DEFAULT_MIN_SAMPLES, DEFAULT_TIMEFRAME_MINUTES,
};
use crate::error::{StrategyConfigError, StrategyError};
use crate::models::{
    Recommendation, RecommendedValue, ResourceAllocation, ResourceType, StrategySnapshot,
    UsageHistory,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimpleSettings {
    pub history_duration_hours: u64,
    pub timeframe_minutes: u64,
    pub min_samples: usize,
    pub cpu_percentile: f64,
    /// Added on top of the memory peak, in percent
    pub memory_buffer_percent: f64,
    pub oom_limit_factor: f64,
    pub bounds: ResourceBounds,
    pub severity: SeverityPolicy,
}

impl Default for SimpleSettings {
    fn default() -> Self {
        Self {
            history_duration_hours: DEFAULT_HISTORY_HOURS,
            timeframe_minutes: DEFAULT_TIMEFRAME_MINUTES,
            min_samples: DEFAULT_MIN_SAMPLES,
            cpu_percentile: 95.0,
            memory_buffer_percent: 15.0,
            oom_limit_factor: 1.25,
            bounds: ResourceBounds::default(),
            severity: SeverityPolicy::default(),
        }
    }
}

impl SimpleSettings {
    pub fn validate(&self) -> Result<(), String> {
        validate_window(self.history_duration_hours, self.timeframe_minutes)?;
        validate_percentile("cpu_percentile", self.cpu_percentile)?;
        if !(self.memory_buffer_percent >= 0.0 && self.memory_buffer_percent.is_finite()) {
            return Err(format!(
                "memory_buffer_percent must be >= 0, got {}",
                self.memory_buffer_percent
            ));
        }
        validate_positive("oom_limit_factor", self.oom_limit_factor)?;
        self.bounds.validate()?;
        self.severity.validate()
    }
}

pub struct SimpleStrategy {
    settings: SimpleSettings,
    snapshot: StrategySnapshot,
}

impl SimpleStrategy {
    pub const NAME: &'static str = "simple";

    pub fn new(settings: SimpleSettings) -> Result<Self, StrategyConfigError> {
        settings
            .validate()
            .map_err(|reason| StrategyConfigError::Invalid {
                strategy: Self::NAME.to_string(),
                reason,
            })?;
        let snapshot = StrategySnapshot {
            name: Self::NAME.to_string(),
            settings: serde_json::to_value(&settings).unwrap_or_default(),
        };
        Ok(Self { settings, snapshot })
    }

    pub(super) fn factory(
        raw: &serde_json::Value,
    ) -> Result<Arc<dyn RecommendationStrategy>, StrategyConfigError> {
        let settings = parse_settings(Self::NAME, raw)?;
        Ok(Arc::new(Self::new(settings)?))
    }
}

impl RecommendationStrategy for SimpleStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn snapshot(&self) -> StrategySnapshot {
        self.snapshot.clone()
    }

    fn history_duration(&self) -> Duration {
        Duration::from_secs(self.settings.history_duration_hours.saturating_mul(3600))
    }

    fn timeframe(&self) -> Duration {
        Duration::from_secs(self.settings.timeframe_minutes.saturating_mul(60))
    }

    fn recommend(
        &self,
        history: &UsageHistory,
        current: &ResourceAllocation,
    ) -> Result<Recommendation, StrategyError> {
        let s = &self.settings;
        let values = checked_values(history)?;
        let resource = history.resource;

        let (request, limit) = if values.is_empty() || values.len() < s.min_samples {
            (RecommendedValue::Undetermined, RecommendedValue::Undetermined)
        } else {
            match resource {
                ResourceType::Cpu => {
                    let request = percentile(&values, s.cpu_percentile).unwrap_or_default();
                    s.bounds.apply(resource, request, None)
                }
                ResourceType::Memory => {
                    let peak = values.iter().copied().fold(0.0, f64::max);
                    let mut value = peak * (1.0 + s.memory_buffer_percent / 100.0);
                    if history.oom_kills > 0 {
                        let floor = oom_floor(current.memory_limit, peak, s.oom_limit_factor);
                        value = value.max(floor);
                    }
                    s.bounds.apply(resource, value, Some(value))
                }
            }
        };

        let current_resources = current.for_resource(resource);
        let severity =
            s.severity
                .classify(resource, request, limit, &current_resources, history.oom_kills);

        Ok(Recommendation {
            container: history.container.clone(),
            resource,
            request,
            limit,
            severity,
            current: current_resources,
            sample_count: values.len(),
            oom_kills: history.oom_kills,
            strategy: self.snapshot.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerRef, MetricSample, QueryWindow, Severity, WorkloadKind};
    use chrono::Utc;
    use serde_json::json;

    fn history(resource: ResourceType, values: &[f64], oom_kills: u32) -> UsageHistory {
        UsageHistory {
            container: ContainerRef {
                cluster: "prod".into(),
                namespace: "jobs".into(),
                workload: "nightly".into(),
                kind: WorkloadKind::CronJob,
                container: "run".into(),
            },
            resource,
            samples: values
                .iter()
                .enumerate()
                .map(|(i, v)| MetricSample {
                    timestamp: i as i64 * 60,
                    value: *v,
                })
                .collect(),
            oom_kills,
            window: QueryWindow::ending_at(
                Utc::now(),
                Duration::from_secs(3600),
                Duration::from_secs(60),
            )
            .unwrap(),
        }
    }

    fn strategy(raw: serde_json::Value) -> SimpleStrategy {
        SimpleStrategy::new(parse_settings(SimpleStrategy::NAME, &raw).unwrap()).unwrap()
    }

    #[test]
    fn test_memory_peak_plus_buffer() {
        let mib = 1024.0 * 1024.0;
        let values = [200.0 * mib, 400.0 * mib, 300.0 * mib];
        let s = strategy(json!({"min_samples": 3, "memory_buffer_percent": 25}));
        let rec = s
            .recommend(&history(ResourceType::Memory, &values, 0), &ResourceAllocation::default())
            .unwrap();
        assert_eq!(rec.request, RecommendedValue::Value(500.0 * mib));
        assert_eq!(rec.limit, RecommendedValue::Value(500.0 * mib));
        assert_eq!(rec.severity, Severity::Warning);
    }

    #[test]
    fn test_cpu_has_no_limit() {
        let s = strategy(json!({"min_samples": 2, "cpu_percentile": 100}));
        let current = ResourceAllocation {
            cpu_request: Some(0.5),
            cpu_limit: Some(1.0),
            ..Default::default()
        };
        let rec = s
            .recommend(&history(ResourceType::Cpu, &[0.2, 0.5], 0), &current)
            .unwrap();
        assert_eq!(rec.request, RecommendedValue::Value(0.5));
        assert_eq!(rec.limit, RecommendedValue::Unset);
        assert_eq!(rec.severity, Severity::Ok);
    }

    #[test]
    fn test_oom_bumps_memory() {
        let gib = 1024.0 * 1024.0 * 1024.0;
        let current = ResourceAllocation {
            memory_limit: Some(2.0 * gib),
            ..Default::default()
        };
        let s = strategy(json!({"min_samples": 1}));
        let rec = s
            .recommend(&history(ResourceType::Memory, &[1.0 * gib], 1), &current)
            .unwrap();
        assert_eq!(rec.limit, RecommendedValue::Value(2.5 * gib));
        assert_eq!(rec.severity, Severity::Critical);
    }

    #[test]
    fn test_undetermined_below_minimum() {
        let s = strategy(json!({"min_samples": 5}));
        let rec = s
            .recommend(
                &history(ResourceType::Cpu, &[0.1, 0.2, 0.3], 0),
                &ResourceAllocation::default(),
            )
            .unwrap();
        assert_eq!(rec.request, RecommendedValue::Undetermined);
        assert_eq!(rec.severity, Severity::Undetermined);
    }

    #[test]
    fn test_negative_buffer_rejected() {
        let settings = SimpleSettings {
            memory_buffer_percent: -5.0,
            ..Default::default()
        };
        assert!(SimpleStrategy::new(settings).is_err());
    }
}
