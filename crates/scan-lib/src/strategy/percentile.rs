//! Percentile-based strategy
//!
//! Requests follow a high percentile of observed usage plus a margin.
//! CPU limits are left unset by default (burstable), memory limits add
//! headroom on top of the request and grow after OOM kills.

use super::{
    checked_values, oom_floor, parse_settings, percentile, validate_percentile,
    validate_positive, validate_window, RecommendationStrategy, ResourceBounds, SeverityPolicy,
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
pub struct PercentileSettings {
    pub history_duration_hours: u64,
    pub timeframe_minutes: u64,
    pub min_samples: usize,
    pub cpu_percentile: f64,
    pub cpu_margin: f64,
    /// Multiplier for the CPU limit; `None` leaves the limit unset
    pub cpu_limit_factor: Option<f64>,
    pub memory_percentile: f64,
    pub memory_margin: f64,
    pub memory_limit_headroom: f64,
    /// Applied to the current limit (or the peak) after OOM kills
    pub oom_limit_factor: f64,
    pub bounds: ResourceBounds,
    pub severity: SeverityPolicy,
}

impl Default for PercentileSettings {
    fn default() -> Self {
        Self {
            history_duration_hours: DEFAULT_HISTORY_HOURS,
            timeframe_minutes: DEFAULT_TIMEFRAME_MINUTES,
            min_samples: DEFAULT_MIN_SAMPLES,
            cpu_percentile: 95.0,
            cpu_margin: 1.15,
            cpu_limit_factor: None,
            memory_percentile: 99.0,
            memory_margin: 1.0,
            memory_limit_headroom: 1.2,
            oom_limit_factor: 1.25,
            bounds: ResourceBounds::default(),
            severity: SeverityPolicy::default(),
        }
    }
}

impl PercentileSettings {
    pub fn validate(&self) -> Result<(), String> {
        validate_window(self.history_duration_hours, self.timeframe_minutes)?;
        validate_percentile("cpu_percentile", self.cpu_percentile)?;
        validate_percentile("memory_percentile", self.memory_percentile)?;
        validate_positive("cpu_margin", self.cpu_margin)?;
        validate_positive("memory_margin", self.memory_margin)?;
        validate_positive("memory_limit_headroom", self.memory_limit_headroom)?;
        validate_positive("oom_limit_factor", self.oom_limit_factor)?;
        if let Some(factor) = self.cpu_limit_factor {
            validate_positive("cpu_limit_factor", factor)?;
        }
        self.bounds.validate()?;
        self.severity.validate()
    }
}

pub struct PercentileStrategy {
    settings: PercentileSettings,
    snapshot: StrategySnapshot,
}

impl PercentileStrategy {
    pub const NAME: &'static str = "percentile";

    pub fn new(settings: PercentileSettings) -> Result<Self, StrategyConfigError> {
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

    pub fn settings(&self) -> &PercentileSettings {
        &self.settings
    }

    pub(super) fn factory(
        raw: &serde_json::Value,
    ) -> Result<Arc<dyn RecommendationStrategy>, StrategyConfigError> {
        let settings = parse_settings(Self::NAME, raw)?;
        Ok(Arc::new(Self::new(settings)?))
    }

    fn compute(
        &self,
        resource: ResourceType,
        values: &[f64],
        oom_kills: u32,
        current: &ResourceAllocation,
    ) -> (RecommendedValue, RecommendedValue) {
        let s = &self.settings;
        if values.is_empty() || values.len() < s.min_samples {
            return (RecommendedValue::Undetermined, RecommendedValue::Undetermined);
        }

        match resource {
            ResourceType::Cpu => {
                let request =
                    percentile(values, s.cpu_percentile).unwrap_or_default() * s.cpu_margin;
                let limit = s.cpu_limit_factor.map(|factor| request * factor);
                s.bounds.apply(resource, request, limit)
            }
            ResourceType::Memory => {
                let request =
                    percentile(values, s.memory_percentile).unwrap_or_default() * s.memory_margin;
                let mut limit = request * s.memory_limit_headroom;
                if oom_kills > 0 {
                    let peak = values.iter().copied().fold(0.0, f64::max);
                    limit = limit.max(oom_floor(current.memory_limit, peak, s.oom_limit_factor));
                }
                s.bounds.apply(resource, request, Some(limit))
            }
        }
    }
}

impl RecommendationStrategy for PercentileStrategy {
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
        let values = checked_values(history)?;
        let resource = history.resource;
        let (request, limit) = self.compute(resource, &values, history.oom_kills, current);
        let current_resources = current.for_resource(resource);
        let severity = self.settings.severity.classify(
            resource,
            request,
            limit,
            &current_resources,
            history.oom_kills,
        );

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
