//! Decision pipeline: per-attempt fan-out, aggregation, caching, learning
//! and the service facade that owns them.

pub mod cache;
pub mod learning;
pub mod orchestrator;
pub mod scoring;
pub mod service;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

/// Failure classes inside the pipeline. None of these ever reaches the
/// caller of `analyze`; they end up in the error history.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("{component} exceeded its {budget_ms}ms budget")]
    ComponentTimeout {
        component: &'static str,
        budget_ms: u64,
    },

    #[error("{component} failed: {message}")]
    ComponentFailure {
        component: &'static str,
        message: String,
    },

    #[error("risk aggregation failed: {0}")]
    AggregationFailure(String),

    #[error("cached result rejected: {0}")]
    CacheCorruption(String),
}

impl PipelineError {
    /// Short label stored in `ErrorRecord::error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::ComponentTimeout { .. } => "component_timeout",
            PipelineError::ComponentFailure { .. } => "component_failure",
            PipelineError::AggregationFailure(_) => "aggregation_failure",
            PipelineError::CacheCorruption(_) => "cache_corruption",
        }
    }

    pub fn component(&self) -> &'static str {
        match self {
            PipelineError::ComponentTimeout { component, .. }
            | PipelineError::ComponentFailure { component, .. } => component,
            PipelineError::AggregationFailure(_) => "orchestrator",
            PipelineError::CacheCorruption(_) => "cache",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_labels() {
        let err = PipelineError::ComponentTimeout {
            component: "anomaly_detector",
            budget_ms: 1500,
        };
        assert_eq!(err.error_type(), "component_timeout");
        assert_eq!(err.component(), "anomaly_detector");
        assert_eq!(err.to_string(), "anomaly_detector exceeded its 1500ms budget");

        let err = PipelineError::CacheCorruption("risk_score out of range".into());
        assert_eq!(err.component(), "cache");
    }
}
