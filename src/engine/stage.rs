use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::warn;

use super::PipelineError;
use crate::models::risk::{FallbackReason, Stage, StageReport};

/// Output of one analysis stage: either the analyzer's own value or the
/// documented fallback together with the reason it was substituted.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Completed(T),
    Fallback { value: T, reason: FallbackReason },
}

impl<T> StageOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            StageOutcome::Completed(v) | StageOutcome::Fallback { value: v, .. } => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            StageOutcome::Completed(v) | StageOutcome::Fallback { value: v, .. } => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, StageOutcome::Fallback { .. })
    }

    pub fn reason(&self) -> Option<&FallbackReason> {
        match self {
            StageOutcome::Completed(_) => None,
            StageOutcome::Fallback { reason, .. } => Some(reason),
        }
    }

    /// The pipeline error this outcome represents, if it is worth recording.
    /// Disabled stages are configuration, not errors.
    pub fn error(&self, stage: Stage) -> Option<PipelineError> {
        match self.reason()? {
            FallbackReason::Timeout { budget_ms } => Some(PipelineError::ComponentTimeout {
                component: stage.name(),
                budget_ms: *budget_ms,
            }),
            FallbackReason::Failure(message) => Some(PipelineError::ComponentFailure {
                component: stage.name(),
                message: message.clone(),
            }),
            FallbackReason::Panicked => Some(PipelineError::ComponentFailure {
                component: stage.name(),
                message: "analyzer panicked".to_string(),
            }),
            FallbackReason::Disabled | FallbackReason::PipelineFailure => None,
        }
    }
}

/// A finished stage: its outcome plus the report that goes into the result.
#[derive(Debug, Clone)]
pub struct StageRun<T> {
    pub outcome: StageOutcome<T>,
    pub report: StageReport,
}

impl<T> StageRun<T> {
    pub fn disabled(stage: Stage, fallback: T) -> Self {
        Self {
            outcome: StageOutcome::Fallback {
                value: fallback,
                reason: FallbackReason::Disabled,
            },
            report: StageReport {
                stage,
                elapsed_ms: 0.0,
                fallback: Some(FallbackReason::Disabled),
            },
        }
    }
}

/// Run `work` as its own task under `budget`.
///
/// The task is aborted when the budget expires, so a late completion can
/// never race the fallback that was already substituted. Errors and panics
/// inside the task are contained here.
pub async fn run_stage<T, F, D>(stage: Stage, budget: Duration, work: F, fallback: D) -> StageRun<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
    D: FnOnce() -> T,
{
    let start = Instant::now();
    let mut handle = tokio::spawn(work);

    let outcome = match tokio::time::timeout(budget, &mut handle).await {
        Ok(Ok(Ok(value))) => StageOutcome::Completed(value),
        Ok(Ok(Err(e))) => {
            warn!(stage = %stage, error = %format!("{:#}", e), "Analysis stage failed, using fallback");
            StageOutcome::Fallback {
                value: fallback(),
                reason: FallbackReason::Failure(format!("{:#}", e)),
            }
        }
        Ok(Err(join_err)) => {
            warn!(stage = %stage, error = %join_err, "Analysis stage aborted, using fallback");
            let reason = if join_err.is_panic() {
                FallbackReason::Panicked
            } else {
                FallbackReason::Failure("task cancelled".to_string())
            };
            StageOutcome::Fallback {
                value: fallback(),
                reason,
            }
        }
        Err(_) => {
            handle.abort();
            let budget_ms = budget.as_millis() as u64;
            warn!(stage = %stage, budget_ms, "Analysis stage timed out, using fallback");
            StageOutcome::Fallback {
                value: fallback(),
                reason: FallbackReason::Timeout { budget_ms },
            }
        }
    };

    let report = StageReport {
        stage,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        fallback: outcome.reason().cloned(),
    };

    StageRun { outcome, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completed_stage() {
        let run = run_stage(
            Stage::CredentialAnalysis,
            Duration::from_millis(200),
            async { Ok(7u32) },
            || 0,
        )
        .await;
        assert_eq!(run.outcome, StageOutcome::Completed(7));
        assert!(run.report.fallback.is_none());
        assert!(run.outcome.error(Stage::CredentialAnalysis).is_none());
    }

    #[tokio::test]
    async fn test_failed_stage_uses_fallback() {
        let run = run_stage(
            Stage::ThreatIntelligence,
            Duration::from_millis(200),
            async { Err::<u32, _>(anyhow::anyhow!("feed unreachable")) },
            || 42,
        )
        .await;
        assert_eq!(*run.outcome.value(), 42);
        assert!(matches!(run.report.fallback, Some(FallbackReason::Failure(ref m)) if m.contains("feed unreachable")));
        assert!(matches!(
            run.outcome.error(Stage::ThreatIntelligence),
            Some(PipelineError::ComponentFailure { component: "threat_intelligence", .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_aborts_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let run = run_stage(
            Stage::AnomalyDetection,
            Duration::from_millis(20),
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(1u32)
            },
            || 0,
        )
        .await;

        assert_eq!(*run.outcome.value(), 0);
        assert_eq!(run.report.fallback, Some(FallbackReason::Timeout { budget_ms: 20 }));
        assert!(run.report.elapsed_ms < 250.0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let run = run_stage(
            Stage::BehavioralEmbedding,
            Duration::from_millis(200),
            async {
                if true {
                    panic!("model crashed");
                }
                Ok(1u32)
            },
            || 0,
        )
        .await;
        assert_eq!(run.report.fallback, Some(FallbackReason::Panicked));
    }

    #[test]
    fn test_disabled_is_not_an_error() {
        let run = StageRun::disabled(Stage::ThreatIntelligence, 0u32);
        assert!(run.outcome.is_fallback());
        assert!(run.outcome.error(Stage::ThreatIntelligence).is_none());
        assert_eq!(run.report.fallback, Some(FallbackReason::Disabled));
    }
}
