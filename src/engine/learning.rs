use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Timelike, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::BehavioralEmbeddingAnalyzer;
use crate::config::settings::LearningConfig;
use crate::models::context::AuthContext;
use crate::models::feedback::{AuthFeedback, FeedbackKind};
use crate::models::profile::{push_bounded, remember, BehavioralProfile, LoginOutcome};
use crate::storage::profile::ProfileStore;

/// Hard cap on stored outcomes; the day window usually trims first.
const MAX_OUTCOMES: usize = 500;

/// Work queued for the background learning worker.
#[derive(Debug, Clone)]
pub enum LearningJob {
    UpdateProfile {
        user_id: String,
        context: AuthContext,
        success: bool,
    },
    Feedback {
        user_id: String,
        context: AuthContext,
        feedback: AuthFeedback,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearningStats {
    pub profile_updates: u64,
    pub feedback_processed: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub confirmed: u64,
    pub dropped_jobs: u64,
    pub failed_jobs: u64,
}

#[derive(Default)]
struct LearningCounters {
    profile_updates: AtomicU64,
    feedback_processed: AtomicU64,
    false_positives: AtomicU64,
    false_negatives: AtomicU64,
    confirmed: AtomicU64,
    dropped_jobs: AtomicU64,
    failed_jobs: AtomicU64,
}

/// Updates behavioral profiles from login outcomes and operator feedback.
///
/// All writes go through one async lock, so the load-modify-save cycle of
/// a profile is never interleaved with another job.
pub struct AdaptiveLearningEngine {
    profiles: Arc<dyn ProfileStore>,
    embedder: Arc<dyn BehavioralEmbeddingAnalyzer>,
    config: LearningConfig,
    counters: LearningCounters,
    write_lock: Mutex<()>,
}

impl AdaptiveLearningEngine {
    pub fn new(
        config: &LearningConfig,
        profiles: Arc<dyn ProfileStore>,
        embedder: Arc<dyn BehavioralEmbeddingAnalyzer>,
    ) -> Self {
        Self {
            profiles,
            embedder,
            config: config.clone(),
            counters: LearningCounters::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record an authentication outcome. Successful logins also extend the
    /// user's baseline.
    ///
    /// Profiles are keyed by `context.profile_key()`, the same key the
    /// analyzers read; `user_id` only labels log lines.
    pub async fn update_profile(&self, user_id: &str, context: &AuthContext, success: bool) -> Result<()> {
        let embedding = if success { self.embed(context).await } else { None };

        let _guard = self.write_lock.lock().await;
        let mut profile = self.load_or_new(&context.profile_key()).await?;
        self.apply_outcome(&mut profile, context, success, embedding);
        self.profiles.save(&profile).await?;

        self.counters.profile_updates.fetch_add(1, Ordering::Relaxed);
        debug!(user = user_id, success, "Behavioral profile updated");
        Ok(())
    }

    /// Adjust the user's calibration bias from feedback about a decision.
    pub async fn process_feedback(
        &self,
        user_id: &str,
        context: &AuthContext,
        feedback: &AuthFeedback,
    ) -> Result<()> {
        let learn_context = feedback.kind == FeedbackKind::FalsePositive
            && feedback.confidence >= self.config.min_feedback_confidence;
        let embedding = if learn_context { self.embed(context).await } else { None };

        let _guard = self.write_lock.lock().await;
        let mut profile = self.load_or_new(&context.profile_key()).await?;
        let step = self.config.bias_step;

        match feedback.kind {
            FeedbackKind::FalsePositive => {
                profile.false_positives += 1;
                profile.calibration_bias -= step;
                if learn_context {
                    self.apply_outcome(&mut profile, context, true, embedding);
                }
                self.counters.false_positives.fetch_add(1, Ordering::Relaxed);
            }
            FeedbackKind::FalseNegative => {
                profile.false_negatives += 1;
                profile.calibration_bias += step;
                self.counters.false_negatives.fetch_add(1, Ordering::Relaxed);
            }
            FeedbackKind::Confirmed => {
                profile.confirmed_decisions += 1;
                self.counters.confirmed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let bound = self.config.max_user_bias.abs();
        profile.calibration_bias = profile.calibration_bias.clamp(-bound, bound);
        profile.updated_at = Utc::now();
        self.profiles.save(&profile).await?;

        self.counters.feedback_processed.fetch_add(1, Ordering::Relaxed);
        info!(
            user = user_id,
            kind = ?feedback.kind,
            bias = profile.calibration_bias,
            source = %feedback.source,
            "Feedback applied"
        );
        Ok(())
    }

    /// Run one job, logging instead of propagating failures.
    pub async fn handle(&self, job: LearningJob) {
        if !self.config.enabled {
            debug!("Adaptive learning disabled, discarding job");
            return;
        }

        let outcome = match &job {
            LearningJob::UpdateProfile {
                user_id,
                context,
                success,
            } => self.update_profile(user_id, context, *success).await,
            LearningJob::Feedback {
                user_id,
                context,
                feedback,
            } => self.process_feedback(user_id, context, feedback).await,
        };

        if let Err(e) = outcome {
            self.counters.failed_jobs.fetch_add(1, Ordering::Relaxed);
            warn!(error = %format!("{:#}", e), "Learning job failed");
        }
    }

    pub fn record_dropped(&self) {
        self.counters.dropped_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LearningStats {
        let c = &self.counters;
        LearningStats {
            profile_updates: c.profile_updates.load(Ordering::Relaxed),
            feedback_processed: c.feedback_processed.load(Ordering::Relaxed),
            false_positives: c.false_positives.load(Ordering::Relaxed),
            false_negatives: c.false_negatives.load(Ordering::Relaxed),
            confirmed: c.confirmed.load(Ordering::Relaxed),
            dropped_jobs: c.dropped_jobs.load(Ordering::Relaxed),
            failed_jobs: c.failed_jobs.load(Ordering::Relaxed),
        }
    }

    /// Drain `rx` until every sender is dropped.
    pub fn spawn_worker(self: &Arc<Self>, mut rx: mpsc::Receiver<LearningJob>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("Adaptive learning worker started");
            while let Some(job) = rx.recv().await {
                engine.handle(job).await;
            }
            info!("Adaptive learning worker stopped");
        })
    }

    async fn load_or_new(&self, key: &str) -> Result<BehavioralProfile> {
        Ok(self
            .profiles
            .load(key)
            .await?
            .unwrap_or_else(|| BehavioralProfile::new(key)))
    }

    async fn embed(&self, context: &AuthContext) -> Option<Vec<f32>> {
        match self.embedder.embed(context).await {
            Ok(analysis) if !analysis.embedding_vector.is_empty() => Some(analysis.embedding_vector),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Could not embed context for profile learning");
                None
            }
        }
    }

    fn apply_outcome(
        &self,
        profile: &mut BehavioralProfile,
        context: &AuthContext,
        success: bool,
        embedding: Option<Vec<f32>>,
    ) {
        let cfg = &self.config;
        let now = Utc::now();

        push_bounded(
            &mut profile.outcomes,
            LoginOutcome {
                timestamp: context.timestamp,
                success,
                ip: context.client_ip.to_string(),
            },
            MAX_OUTCOMES,
        );
        let cutoff = now - Duration::days(cfg.outcome_history_days);
        profile.outcomes.retain(|o| o.timestamp >= cutoff);

        if success {
            profile.hour_histogram[context.timestamp.hour() as usize] += 1;

            if let Some(geo) = &context.geolocation {
                if !geo.country.is_empty() && !profile.knows_country(&geo.country) {
                    profile.known_countries.push(geo.country.to_uppercase());
                }
                remember(&mut profile.known_locations, geo.location_key(), cfg.max_known_locations);
            }
            remember(&mut profile.known_devices, context.device_key(), cfg.max_known_devices);
            remember(
                &mut profile.known_user_agents,
                context.user_agent.clone(),
                cfg.max_known_devices,
            );
            push_bounded(&mut profile.recent_logins, context.timestamp, cfg.max_login_history);

            if let Some(vector) = embedding {
                push_bounded(&mut profile.typical_embeddings, vector, cfg.max_typical_embeddings);
            }
        }

        profile.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::embedding::HashingEmbeddingAnalyzer;
    use crate::config::defaults::{default_embedding_config, default_learning_config};
    use crate::models::context::GeoLocation;
    use crate::storage::memory::MemoryProfileStore;

    fn engine_with(config: LearningConfig) -> (Arc<AdaptiveLearningEngine>, Arc<MemoryProfileStore>) {
        let store = Arc::new(MemoryProfileStore::new());
        let embedder = Arc::new(HashingEmbeddingAnalyzer::new(&default_embedding_config(), store.clone()));
        let engine = Arc::new(AdaptiveLearningEngine::new(&config, store.clone(), embedder));
        (engine, store)
    }

    fn ctx(ip: &str, fingerprint: &str) -> AuthContext {
        let mut ctx = AuthContext::new("henry@example.com", "digest", ip.parse().unwrap(), "Mozilla/5.0");
        ctx.device_fingerprint = Some(fingerprint.into());
        ctx.geolocation = Some(GeoLocation {
            country: "nl".into(),
            region: None,
            city: Some("Utrecht".into()),
            latitude: None,
            longitude: None,
            timezone: None,
            is_usual_location: false,
        });
        ctx
    }

    fn feedback(kind: FeedbackKind, confidence: f64) -> AuthFeedback {
        AuthFeedback {
            kind,
            confidence,
            original_risk_score: Some(0.7),
            source: "operator".into(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_success_learns_baseline() {
        let (engine, store) = engine_with(default_learning_config());
        let c = ctx("198.51.100.1", "fp-1");
        engine.update_profile("henry", &c, true).await.unwrap();

        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert_eq!(p.successful_logins(), 1);
        assert_eq!(p.known_countries, vec!["NL".to_string()]);
        assert!(p.knows_device("fp-1"));
        assert_eq!(p.typical_embeddings.len(), 1);
        assert_eq!(p.outcomes.len(), 1);
        assert_eq!(engine.stats().profile_updates, 1);
    }

    #[tokio::test]
    async fn test_profile_keyed_like_analyzers() {
        let (engine, store) = engine_with(default_learning_config());
        let mut c = ctx("198.51.100.1", "fp-1");
        c.email = " Henry@Example.com ".into();
        engine.update_profile("u-1", &c, true).await.unwrap();

        assert!(store.load("u-1").await.unwrap().is_none());
        assert!(store.load(&c.profile_key()).await.unwrap().is_some());

        // An explicit user id on the context wins on both paths.
        c.user_id = Some("u-1".into());
        engine.update_profile("u-1", &c, true).await.unwrap();
        assert_eq!(store.load("u-1").await.unwrap().unwrap().outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_only_records_outcome() {
        let (engine, store) = engine_with(default_learning_config());
        engine.update_profile("henry", &ctx("198.51.100.1", "fp-1"), false).await.unwrap();

        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert_eq!(p.successful_logins(), 0);
        assert!(p.known_devices.is_empty());
        assert!(p.typical_embeddings.is_empty());
        assert_eq!(p.outcomes.len(), 1);
        assert!(!p.outcomes[0].success);
    }

    #[tokio::test]
    async fn test_profile_lists_stay_bounded() {
        let mut config = default_learning_config();
        config.max_known_devices = 3;
        config.max_typical_embeddings = 2;
        config.max_login_history = 4;
        let (engine, store) = engine_with(config);

        for i in 0..10 {
            let c = ctx("198.51.100.1", &format!("fp-{}", i));
            engine.update_profile("henry", &c, true).await.unwrap();
        }

        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert_eq!(p.known_devices.len(), 3);
        assert!(p.knows_device("fp-9"));
        assert!(!p.knows_device("fp-0"));
        assert_eq!(p.typical_embeddings.len(), 2);
        assert_eq!(p.recent_logins.len(), 4);
        assert_eq!(p.known_countries.len(), 1);
    }

    #[tokio::test]
    async fn test_false_positive_lowers_bias_and_learns() {
        let (engine, store) = engine_with(default_learning_config());
        let c = ctx("198.51.100.7", "fp-new");
        engine
            .process_feedback("henry", &c, &feedback(FeedbackKind::FalsePositive, 0.9))
            .await
            .unwrap();

        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert!((p.calibration_bias + 0.05).abs() < 1e-9);
        assert_eq!(p.false_positives, 1);
        assert!(p.knows_device("fp-new"));

        let stats = engine.stats();
        assert_eq!(stats.false_positives, 1);
        assert_eq!(stats.feedback_processed, 1);
    }

    #[tokio::test]
    async fn test_low_confidence_false_positive_does_not_learn() {
        let (engine, store) = engine_with(default_learning_config());
        engine
            .process_feedback("henry", &ctx("198.51.100.7", "fp-x"), &feedback(FeedbackKind::FalsePositive, 0.2))
            .await
            .unwrap();
        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert!(p.calibration_bias < 0.0);
        assert!(!p.knows_device("fp-x"));
    }

    #[tokio::test]
    async fn test_bias_is_bounded() {
        let (engine, store) = engine_with(default_learning_config());
        let c = ctx("198.51.100.7", "fp-1");
        for _ in 0..10 {
            engine
                .process_feedback("henry", &c, &feedback(FeedbackKind::FalseNegative, 1.0))
                .await
                .unwrap();
        }
        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert!((p.calibration_bias - 0.2).abs() < 1e-9);
        assert_eq!(p.false_negatives, 10);

        for _ in 0..20 {
            engine
                .process_feedback("henry", &c, &feedback(FeedbackKind::FalsePositive, 0.1))
                .await
                .unwrap();
        }
        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert!((p.calibration_bias + 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_confirmed_leaves_bias() {
        let (engine, store) = engine_with(default_learning_config());
        engine
            .process_feedback("henry", &ctx("198.51.100.7", "fp-1"), &feedback(FeedbackKind::Confirmed, 1.0))
            .await
            .unwrap();
        let p = store.load("henry@example.com").await.unwrap().unwrap();
        assert_eq!(p.calibration_bias, 0.0);
        assert_eq!(p.confirmed_decisions, 1);
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let (engine, store) = engine_with(default_learning_config());
        let (tx, rx) = mpsc::channel(16);
        let handle = engine.spawn_worker(rx);

        for i in 0..5 {
            let mut context = ctx("198.51.100.1", "fp-1");
            context.email = format!("user-{}@example.com", i);
            tx.send(LearningJob::UpdateProfile {
                user_id: format!("user-{}", i),
                context,
                success: true,
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.count().await.unwrap(), 5);
        assert_eq!(engine.stats().profile_updates, 5);
    }

    #[tokio::test]
    async fn test_disabled_engine_discards_jobs() {
        let mut config = default_learning_config();
        config.enabled = false;
        let (engine, store) = engine_with(config);
        engine
            .handle(LearningJob::UpdateProfile {
                user_id: "henry".into(),
                context: ctx("198.51.100.1", "fp-1"),
                success: true,
            })
            .await;
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
