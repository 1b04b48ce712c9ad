use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the pipeline counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Requests answered with the global fallback result.
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,

    /// Rolling average over the most recent computed (non-cached) requests.
    pub average_processing_time_ms: f64,

    pub stages: BTreeMap<String, StageMetrics>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageMetrics {
    pub invocations: u64,
    pub fallbacks: u64,
    pub timeouts: u64,
    pub average_latency_ms: f64,
}

/// One entry in the bounded error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub component: String,
    pub message: String,
    pub request_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Ordering used for aggregation: higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    pub fn worst<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Unknown)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: f64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ComponentHealth {
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unknown,
            last_check: None,
            response_time_ms: 0.0,
            error_count: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthStatus {
    pub overall_status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub cache_size: usize,
    pub pending_learning_jobs: usize,
    pub processing_metrics: ProcessingMetrics,
    pub last_updated: DateTime<Utc>,
}

impl ServiceHealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.overall_status == HealthStatus::Healthy
    }
}
