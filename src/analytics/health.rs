use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::settings::HealthConfig;
use crate::models::metrics::{ComponentHealth, HealthStatus};
use crate::models::risk::{FallbackReason, StageReport};

/// Per-component health derived from every invocation's outcome and latency.
pub struct HealthMonitor {
    components: DashMap<String, ComponentHealth>,
    degraded_latency_ms: f64,
    unhealthy_after: u32,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig, names: &[&str]) -> Self {
        let components = DashMap::new();
        for name in names {
            components.insert(name.to_string(), ComponentHealth::unknown(name));
        }
        Self {
            components,
            degraded_latency_ms: config.degraded_latency_ms as f64,
            unhealthy_after: config.unhealthy_after_failures.max(1),
        }
    }

    pub fn record_success(&self, name: &str, elapsed_ms: f64) {
        let mut entry = self
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::unknown(name));

        entry.status = if elapsed_ms <= self.degraded_latency_ms {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        entry.consecutive_failures = 0;
        entry.response_time_ms = elapsed_ms;
        entry.last_check = Some(Utc::now());
    }

    pub fn record_failure(&self, name: &str, elapsed_ms: f64, error: &str) {
        let mut entry = self
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::unknown(name));

        entry.error_count += 1;
        entry.consecutive_failures += 1;
        entry.last_error = Some(error.to_string());
        entry.response_time_ms = elapsed_ms;
        entry.last_check = Some(Utc::now());

        let next = if entry.consecutive_failures >= self.unhealthy_after {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        if next == HealthStatus::Unhealthy && entry.status != HealthStatus::Unhealthy {
            warn!(
                component = name,
                consecutive_failures = entry.consecutive_failures,
                "Component marked unhealthy"
            );
        }
        entry.status = next;
    }

    pub fn record_disabled(&self, name: &str) {
        let mut entry = self
            .components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth::unknown(name));
        entry.status = HealthStatus::Unknown;
        entry.last_check = Some(Utc::now());
    }

    /// Update from a stage report produced by the orchestrator.
    pub fn observe(&self, report: &StageReport) {
        let name = report.stage.name();
        match &report.fallback {
            None => self.record_success(name, report.elapsed_ms),
            Some(FallbackReason::Disabled) => self.record_disabled(name),
            // Stages never ran; the pipeline failure is recorded separately.
            Some(FallbackReason::PipelineFailure) => {
                debug!(component = name, "Skipping health update for pipeline fallback");
            }
            Some(reason) => self.record_failure(name, report.elapsed_ms, &reason.to_string()),
        }
    }

    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components.get(name).map(|c| c.clone())
    }

    pub fn components(&self) -> BTreeMap<String, ComponentHealth> {
        self.components
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn overall(&self) -> HealthStatus {
        HealthStatus::worst(self.components.iter().map(|e| e.value().status))
    }
}
