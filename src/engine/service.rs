use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::learning::{AdaptiveLearningEngine, LearningJob, LearningStats};
use super::orchestrator::{AnalysisBackends, RiskOrchestrator};
use crate::analytics::alerting::{build_event_sink, EventSink};
use crate::analytics::reporter::MetricsReporter;
use crate::config::settings::Settings;
use crate::models::context::AuthContext;
use crate::models::feedback::AuthFeedback;
use crate::models::metrics::{ErrorRecord, ProcessingMetrics, ServiceHealthStatus};
use crate::models::risk::AuthAnalysisResult;
use crate::storage::profile::ProfileStore;

#[derive(Default)]
struct Lifecycle {
    sender: Option<mpsc::Sender<LearningJob>>,
    worker: Option<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

/// Entry point for callers: login analysis, learning signals and
/// operational status.
///
/// Background work (the learning worker and the periodic reporter) starts
/// with [`initialize`](Self::initialize) and stops with
/// [`shutdown`](Self::shutdown). Analysis works without either.
pub struct AuthRiskService {
    settings: Arc<Settings>,
    orchestrator: RiskOrchestrator,
    learning: Arc<AdaptiveLearningEngine>,
    profiles: Arc<dyn ProfileStore>,
    lifecycle: Mutex<Lifecycle>,
}

impl AuthRiskService {
    pub fn new(settings: Arc<Settings>, backends: AnalysisBackends) -> Result<Self> {
        let events = build_event_sink(&settings.alerting);
        Self::with_event_sink(settings, backends, events)
    }

    pub fn with_event_sink(
        settings: Arc<Settings>,
        backends: AnalysisBackends,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        settings.validate()?;

        let orchestrator = RiskOrchestrator::new(settings.clone(), &backends, events)?;
        let learning = Arc::new(AdaptiveLearningEngine::new(
            &settings.learning,
            backends.profiles.clone(),
            backends.embedding.clone(),
        ));

        Ok(Self {
            settings,
            orchestrator,
            learning,
            profiles: backends.profiles,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Start the learning worker and the reporter. Calling it again while
    /// running is a no-op. Must be called from within a tokio runtime.
    pub fn initialize(&self) {
        let mut state = self.lifecycle.lock();
        if state.sender.is_some() {
            debug!("Service already initialized");
            return;
        }

        let (tx, rx) = mpsc::channel(self.settings.learning.queue_capacity.max(1));
        state.worker = Some(self.learning.spawn_worker(rx));
        state.sender = Some(tx);

        let reporter = MetricsReporter::new(
            self.orchestrator.clone(),
            self.learning.clone(),
            self.profiles.clone(),
            &self.settings.metrics,
        );
        state.reporter = Some(tokio::spawn(async move {
            reporter.run().await;
        }));

        info!(
            queue_capacity = self.settings.learning.queue_capacity,
            learning = self.learning.enabled(),
            "Auth risk service initialized"
        );
    }

    pub async fn analyze_login_attempt(&self, context: &AuthContext) -> AuthAnalysisResult {
        self.orchestrator.analyze(context).await
    }

    /// Queue an authentication outcome for the user's profile. Without a
    /// running worker the job is spawned on the current runtime, or counted
    /// as dropped when called outside one.
    pub fn update_user_behavioral_profile(&self, user_id: &str, context: &AuthContext, success: bool) {
        self.enqueue(LearningJob::UpdateProfile {
            user_id: user_id.to_string(),
            context: context.clone(),
            success,
        });
    }

    /// Queue feedback about a past decision. Malformed feedback is logged
    /// and dropped.
    pub fn provide_feedback(&self, user_id: &str, context: &AuthContext, feedback: &HashMap<String, Value>) {
        let feedback = match AuthFeedback::from_map(feedback) {
            Ok(f) => f,
            Err(reason) => {
                warn!(user = user_id, request_id = %context.request_id, "Invalid feedback dropped: {}", reason);
                return;
            }
        };
        self.enqueue(LearningJob::Feedback {
            user_id: user_id.to_string(),
            context: context.clone(),
            feedback,
        });
    }

    fn enqueue(&self, job: LearningJob) {
        let sender = self.lifecycle.lock().sender.clone();
        let job = match sender {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    warn!("Learning queue full, dropping job");
                    self.learning.record_dropped();
                    return;
                }
                Err(TrySendError::Closed(job)) => job,
            },
            None => job,
        };

        // No worker running: process it on its own task.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.learning.clone();
                handle.spawn(async move {
                    engine.handle(job).await;
                });
            }
            Err(_) => {
                warn!("No tokio runtime for learning job, dropping it");
                self.learning.record_dropped();
            }
        }
    }

    pub fn get_health_status(&self) -> ServiceHealthStatus {
        let pending_learning_jobs = self
            .lifecycle
            .lock()
            .sender
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);

        ServiceHealthStatus {
            overall_status: self.orchestrator.health().overall(),
            components: self.orchestrator.health().components(),
            cache_size: self.orchestrator.cache().len(),
            pending_learning_jobs,
            processing_metrics: self.orchestrator.metrics().snapshot(),
            last_updated: Utc::now(),
        }
    }

    pub fn get_processing_metrics(&self) -> ProcessingMetrics {
        self.orchestrator.metrics().snapshot()
    }

    pub fn get_error_history(&self, limit: usize) -> Vec<ErrorRecord> {
        self.orchestrator.metrics().get_error_history(limit)
    }

    pub fn learning_stats(&self) -> LearningStats {
        self.learning.stats()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Drain queued learning jobs (bounded by `learning.drain_timeout_secs`),
    /// stop the reporter and clear the result cache.
    pub async fn shutdown(&self) {
        let (sender, worker, reporter) = {
            let mut state = self.lifecycle.lock();
            (state.sender.take(), state.worker.take(), state.reporter.take())
        };

        // Closing the channel lets the worker finish once the queue is empty.
        drop(sender);

        if let Some(mut worker) = worker {
            let drain = Duration::from_secs(self.settings.learning.drain_timeout_secs);
            match tokio::time::timeout(drain, &mut worker).await {
                Ok(_) => debug!("Learning queue drained"),
                Err(_) => {
                    warn!(timeout_secs = drain.as_secs(), "Learning queue drain timed out, aborting worker");
                    worker.abort();
                }
            }
        }

        if let Some(reporter) = reporter {
            reporter.abort();
        }

        self.orchestrator.cache().clear();
        info!("Auth risk service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::analytics::alerting::LogEventSink;
    use crate::engine::testing::{context, StubSet};
    use crate::models::metrics::HealthStatus;
    use crate::models::risk::RiskLevel;
    use crate::storage::memory::MemoryProfileStore;

    fn service(settings: Settings, stubs: &StubSet) -> AuthRiskService {
        AuthRiskService::with_event_sink(Arc::new(settings), stubs.backends(), Arc::new(LogEventSink)).unwrap()
    }

    fn feedback(v: Value) -> HashMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_with_heuristic_backends() {
        let settings = Settings::default();
        let backends = AnalysisBackends::heuristic(&settings, Arc::new(MemoryProfileStore::new())).unwrap();
        let svc = AuthRiskService::with_event_sink(Arc::new(settings), backends, Arc::new(LogEventSink)).unwrap();
        svc.initialize();

        let ctx = context("tara@example.com", "198.51.100.50");
        let result = svc.analyze_login_attempt(&ctx).await;
        assert!(result.validate().is_ok());
        assert_eq!(result.stage_reports.len(), 4);
        assert_eq!(result.fallback_count(), 0);
        assert_eq!(result.request_id, ctx.request_id);

        svc.update_user_behavioral_profile("tara", &ctx, true);
        svc.shutdown().await;
        assert_eq!(svc.learning_stats().profile_updates, 1);
    }

    #[tokio::test]
    async fn test_learned_baseline_reaches_analyzers() {
        let settings = Settings::default();
        let backends = AnalysisBackends::heuristic(&settings, Arc::new(MemoryProfileStore::new())).unwrap();
        let svc = AuthRiskService::with_event_sink(Arc::new(settings), backends, Arc::new(LogEventSink)).unwrap();
        svc.initialize();

        let ctx = context("tara@example.com", "198.51.100.57");
        for _ in 0..5 {
            svc.update_user_behavioral_profile("u-1", &ctx, true);
        }
        svc.shutdown().await;
        assert_eq!(svc.learning_stats().profile_updates, 5);

        let mut next = ctx.clone();
        next.request_id = "after-learning".into();
        let result = svc.analyze_login_attempt(&next).await;
        assert_eq!(result.behavioral_analysis.history_samples, 5);
        assert!(result.behavioral_analysis.is_usual_device);
        assert!(result.embedding_analysis.similarity_to_user_profile > 0.9);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let mut settings = Settings::default();
        settings.service.fallback_risk_score = 0.9;
        let stubs = StubSet::all_ok();
        assert!(AuthRiskService::with_event_sink(Arc::new(settings), stubs.backends(), Arc::new(LogEventSink)).is_err());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        svc.initialize();
        let first = svc.lifecycle.lock().sender.as_ref().map(|tx| tx.max_capacity());
        svc.initialize();
        let second = svc.lifecycle.lock().sender.as_ref().map(|tx| tx.max_capacity());
        assert_eq!(first, second);
        assert!(first.is_some());
        svc.shutdown().await;
        assert!(svc.lifecycle.lock().sender.is_none());
    }

    #[tokio::test]
    async fn test_outcomes_are_drained_on_shutdown() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        svc.initialize();

        let ctx = context("uma@example.com", "198.51.100.51");
        for _ in 0..3 {
            svc.update_user_behavioral_profile("uma", &ctx, true);
        }
        svc.update_user_behavioral_profile("uma", &ctx, false);
        svc.shutdown().await;

        assert_eq!(svc.learning_stats().profile_updates, 4);
        let profile = svc.profiles.load(&ctx.profile_key()).await.unwrap().unwrap();
        assert_eq!(profile.outcomes.len(), 4);
    }

    #[tokio::test]
    async fn test_feedback_moves_bias() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        svc.initialize();

        let ctx = context("vic@example.com", "198.51.100.52");
        svc.provide_feedback("vic", &ctx, &feedback(json!({"is_false_positive": true})));
        svc.shutdown().await;

        let stats = svc.learning_stats();
        assert_eq!(stats.feedback_processed, 1);
        assert_eq!(stats.false_positives, 1);
        let profile = svc.profiles.load(&ctx.profile_key()).await.unwrap().unwrap();
        assert!(profile.calibration_bias < 0.0);
    }

    #[tokio::test]
    async fn test_invalid_feedback_is_dropped() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        svc.initialize();

        let ctx = context("wes@example.com", "198.51.100.53");
        svc.provide_feedback(
            "wes",
            &ctx,
            &feedback(json!({"is_false_positive": true, "is_false_negative": true})),
        );
        svc.provide_feedback("wes", &ctx, &feedback(json!({"confidence": 4.0})));
        svc.shutdown().await;

        assert_eq!(svc.learning_stats().feedback_processed, 0);
        assert!(svc.profiles.load(&ctx.profile_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_jobs() {
        let mut settings = Settings::default();
        settings.learning.queue_capacity = 1;
        let stubs = StubSet::all_ok();
        let svc = service(settings, &stubs);

        // A queue nobody consumes.
        let (tx, _rx) = mpsc::channel(1);
        svc.lifecycle.lock().sender = Some(tx);

        let ctx = context("xena@example.com", "198.51.100.54");
        for _ in 0..3 {
            svc.update_user_behavioral_profile("xena", &ctx, true);
        }

        assert_eq!(svc.learning_stats().dropped_jobs, 2);
        assert_eq!(svc.get_health_status().pending_learning_jobs, 1);
    }

    #[tokio::test]
    async fn test_jobs_without_worker_still_run() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        let ctx = context("yara@example.com", "198.51.100.55");
        svc.update_user_behavioral_profile("yara", &ctx, true);

        for _ in 0..50 {
            if svc.learning_stats().profile_updates == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.learning_stats().profile_updates, 1);
    }

    #[test]
    fn test_learning_outside_runtime_drops_job() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        let ctx = context("yara@example.com", "198.51.100.60");

        svc.update_user_behavioral_profile("yara", &ctx, true);
        svc.provide_feedback("yara", &ctx, &feedback(json!({"is_false_positive": true, "confidence": 0.9})));

        assert_eq!(svc.learning_stats().dropped_jobs, 2);
        assert_eq!(svc.learning_stats().profile_updates, 0);
    }

    #[tokio::test]
    async fn test_health_status_and_shutdown_clear_cache() {
        let stubs = StubSet::all_ok();
        let svc = service(Settings::default(), &stubs);
        svc.initialize();

        let result = svc.analyze_login_attempt(&context("zoe@example.com", "198.51.100.56")).await;
        assert_eq!(result.risk_level, RiskLevel::Low);

        let status = svc.get_health_status();
        assert_eq!(status.components.len(), 5);
        assert_eq!(status.overall_status, HealthStatus::Healthy);
        assert!(status.is_healthy());
        assert_eq!(status.cache_size, 1);
        assert_eq!(status.processing_metrics.total_requests, 1);
        assert_eq!(svc.get_processing_metrics().successful_requests, 1);
        assert!(svc.get_error_history(5).is_empty());

        svc.shutdown().await;
        assert_eq!(svc.get_health_status().cache_size, 0);
    }
}
