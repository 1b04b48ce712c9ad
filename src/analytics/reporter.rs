use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::settings::MetricsConfig;
use crate::engine::learning::AdaptiveLearningEngine;
use crate::engine::orchestrator::RiskOrchestrator;
use crate::storage::profile::ProfileStore;

/// Periodic reporter: logs a metrics summary and drives cleanup of
/// analyzer state and expired cache entries.
pub struct MetricsReporter {
    orchestrator: RiskOrchestrator,
    learning: Arc<AdaptiveLearningEngine>,
    profiles: Arc<dyn ProfileStore>,
    report_every: Duration,
    cleanup_every: Duration,
}

impl MetricsReporter {
    pub fn new(
        orchestrator: RiskOrchestrator,
        learning: Arc<AdaptiveLearningEngine>,
        profiles: Arc<dyn ProfileStore>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            orchestrator,
            learning,
            profiles,
            report_every: Duration::from_secs(config.report_interval_secs.max(1)),
            cleanup_every: Duration::from_secs(config.cleanup_interval_secs.max(1)),
        }
    }

    /// Run the reporter loop forever. The owner aborts the task on shutdown.
    pub async fn run(&self) {
        let mut report_interval = interval(self.report_every);
        report_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cleanup_interval = interval(self.cleanup_every);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Both intervals fire immediately; skip the empty first report.
        report_interval.tick().await;
        cleanup_interval.tick().await;

        loop {
            tokio::select! {
                _ = report_interval.tick() => {
                    self.report().await;
                }

                _ = cleanup_interval.tick() => {
                    self.orchestrator.cleanup();
                    debug!("Periodic cleanup complete");
                }
            }
        }
    }

    /// Log one summary line of the current metrics.
    pub async fn report(&self) {
        let snapshot = self.orchestrator.metrics().snapshot();
        let learning = self.learning.stats();
        let overall = self.orchestrator.health().overall();

        let profiles = match self.profiles.count().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to count stored profiles: {:#}", e);
                0
            }
        };

        info!(
            total = snapshot.total_requests,
            failed = snapshot.failed_requests,
            cache_hit_rate = snapshot.cache_hit_rate,
            error_rate = snapshot.error_rate,
            avg_ms = snapshot.average_processing_time_ms,
            health = %overall,
            cache_entries = self.orchestrator.cache().len(),
            profiles = profiles,
            profile_updates = learning.profile_updates,
            feedback = learning.feedback_processed,
            dropped_jobs = learning.dropped_jobs,
            "Risk pipeline summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::alerting::LogEventSink;
    use crate::config::settings::Settings;
    use crate::engine::testing::{context, StubAnalyzer, StubSet};

    #[tokio::test]
    async fn test_report_and_cleanup_run() {
        let mut settings = Settings::default();
        settings.cache.ttl_secs = 0;
        let stubs = StubSet::all_ok();
        let backends = stubs.backends();
        let orch = RiskOrchestrator::new(Arc::new(settings.clone()), &backends, Arc::new(LogEventSink)).unwrap();
        let learning = Arc::new(AdaptiveLearningEngine::new(
            &settings.learning,
            backends.profiles.clone(),
            StubAnalyzer::ok(),
        ));

        orch.analyze(&context("sam@example.com", "198.51.100.40")).await;
        assert_eq!(orch.cache().len(), 1);

        let reporter = MetricsReporter::new(orch.clone(), learning, backends.profiles.clone(), &settings.metrics);
        reporter.report().await;

        // Zero TTL: the entry is already stale.
        orch.cleanup();
        assert!(orch.cache().is_empty());
    }
}
