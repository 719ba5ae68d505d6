//! Severity classification of a recommendation against current settings

use crate::models::{CurrentResources, RecommendedValue, ResourceType, Severity};
use serde::{Deserialize, Serialize};

/// Relative deviation tolerated before a resource is flagged
pub const DEFAULT_OK_TOLERANCE: f64 = 0.10;

/// A current limit below this fraction of the recommended request is critical
pub const DEFAULT_CRITICAL_LIMIT_RATIO: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeverityPolicy {
    pub ok_tolerance: f64,
    pub critical_limit_ratio: f64,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            ok_tolerance: DEFAULT_OK_TOLERANCE,
            critical_limit_ratio: DEFAULT_CRITICAL_LIMIT_RATIO,
        }
    }
}

impl SeverityPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.ok_tolerance >= 0.0 && self.ok_tolerance.is_finite()) {
            return Err(format!(
                "severity.ok_tolerance must be >= 0, got {}",
                self.ok_tolerance
            ));
        }
        if !(self.critical_limit_ratio > 0.0 && self.critical_limit_ratio <= 1.0) {
            return Err(format!(
                "severity.critical_limit_ratio must be in (0, 1], got {}",
                self.critical_limit_ratio
            ));
        }
        Ok(())
    }

    /// Classify a recommendation
    ///
    /// Rules, first match wins:
    /// 1. undetermined request or limit: `Undetermined`
    /// 2. memory with OOM kills, or a current limit below
    ///    `critical_limit_ratio` x recommended request: `Critical`
    /// 3. current request or limit unset while a value is recommended, or
    ///    deviating by more than `ok_tolerance`: `Warning`
    /// 4. otherwise `Ok`
    pub fn classify(
        &self,
        resource: ResourceType,
        request: RecommendedValue,
        limit: RecommendedValue,
        current: &CurrentResources,
        oom_kills: u32,
    ) -> Severity {
        if request.is_undetermined() || limit.is_undetermined() {
            return Severity::Undetermined;
        }

        if resource == ResourceType::Memory && oom_kills > 0 {
            return Severity::Critical;
        }

        if let (Some(current_limit), Some(recommended)) = (current.limit, request.as_value()) {
            if current_limit < self.critical_limit_ratio * recommended {
                return Severity::Critical;
            }
        }

        if self.deviates(current.request, request) || self.deviates(current.limit, limit) {
            return Severity::Warning;
        }

        Severity::Ok
    }

    fn deviates(&self, current: Option<f64>, recommended: RecommendedValue) -> bool {
        let Some(recommended) = recommended.as_value() else {
            return false;
        };
        match current {
            None => true,
            Some(current) if recommended <= 0.0 => current != recommended,
            Some(current) => (current - recommended).abs() / recommended > self.ok_tolerance,
        }
    }
}
