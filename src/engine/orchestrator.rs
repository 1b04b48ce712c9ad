use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::cache::{CacheKeyer, CacheLookup, ResultCache};
use super::scoring::{self, FallbackMask};
use super::stage::{run_stage, StageRun};
use super::PipelineError;
use crate::analysis::anomaly::ProfileAnomalyDetector;
use crate::analysis::credential::HeuristicCredentialAnalyzer;
use crate::analysis::embedding::HashingEmbeddingAnalyzer;
use crate::analysis::threat_intel::{IndicatorThreatAnalyzer, LocalIndicatorFeed};
use crate::analysis::{
    AnomalyDetectionEngine, BehavioralEmbeddingAnalyzer, CredentialAnalyzer,
    ThreatIntelligenceAnalyzer,
};
use crate::analytics::alerting::{EventSink, SecurityEvent};
use crate::analytics::collector::MetricsTracker;
use crate::analytics::health::HealthMonitor;
use crate::config::settings::Settings;
use crate::models::analysis::{BehavioralAnalysis, EmbeddingAnalysis, NlpFeatures, ThreatAnalysis};
use crate::models::context::AuthContext;
use crate::models::risk::{AuthAnalysisResult, Stage};
use crate::storage::profile::ProfileStore;

/// Health component name for the pipeline as a whole.
pub const ORCHESTRATOR_COMPONENT: &str = "orchestrator";

/// The concrete stage implementations and the profile store they share.
#[derive(Clone)]
pub struct AnalysisBackends {
    pub credential: Arc<dyn CredentialAnalyzer>,
    pub embedding: Arc<dyn BehavioralEmbeddingAnalyzer>,
    pub anomaly: Arc<dyn AnomalyDetectionEngine>,
    pub threat: Arc<dyn ThreatIntelligenceAnalyzer>,
    pub profiles: Arc<dyn ProfileStore>,
}

impl AnalysisBackends {
    /// The in-process heuristic backends.
    pub fn heuristic(settings: &Settings, profiles: Arc<dyn ProfileStore>) -> Result<Self> {
        let feed = LocalIndicatorFeed::new(&settings.threat_intel);
        if let Some(path) = &settings.threat_intel.indicators_file {
            feed.load_file(path)
                .with_context(|| format!("Failed to load threat indicators from {}", path))?;
        }

        Ok(Self {
            credential: Arc::new(HeuristicCredentialAnalyzer::new()),
            embedding: Arc::new(HashingEmbeddingAnalyzer::new(&settings.embedding, profiles.clone())),
            anomaly: Arc::new(ProfileAnomalyDetector::new(&settings.anomaly, profiles.clone())),
            threat: Arc::new(IndicatorThreatAnalyzer::new(&settings.threat_intel, Arc::new(feed))),
            profiles,
        })
    }
}

/// Runs the four stages for an attempt and turns their outputs into a
/// decision. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct RiskOrchestrator {
    settings: Arc<Settings>,
    credential: Arc<dyn CredentialAnalyzer>,
    embedding: Arc<dyn BehavioralEmbeddingAnalyzer>,
    anomaly: Arc<dyn AnomalyDetectionEngine>,
    threat: Arc<dyn ThreatIntelligenceAnalyzer>,
    keyer: Arc<CacheKeyer>,
    cache: Arc<ResultCache>,
    metrics: Arc<MetricsTracker>,
    health: Arc<HealthMonitor>,
    events: Arc<dyn EventSink>,
}

impl RiskOrchestrator {
    pub fn new(settings: Arc<Settings>, backends: &AnalysisBackends, events: Arc<dyn EventSink>) -> Result<Self> {
        let keyer = CacheKeyer::new(&settings.cache)?;
        let cache = ResultCache::new(&settings.cache);
        let metrics = MetricsTracker::new(&settings.metrics);

        let mut components: Vec<&str> = Stage::ALL.iter().map(Stage::name).collect();
        components.push(ORCHESTRATOR_COMPONENT);
        let health = HealthMonitor::new(&settings.health, &components);

        Ok(Self {
            credential: backends.credential.clone(),
            embedding: backends.embedding.clone(),
            anomaly: backends.anomaly.clone(),
            threat: backends.threat.clone(),
            keyer: Arc::new(keyer),
            cache: Arc::new(cache),
            metrics: Arc::new(metrics),
            health: Arc::new(health),
            events,
            settings,
        })
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn cache_key(&self, context: &AuthContext) -> String {
        self.keyer.key(context)
    }

    /// Periodic maintenance of analyzer state and the cache.
    pub fn cleanup(&self) {
        self.anomaly.cleanup();
        self.threat.cleanup();
        self.cache.purge_expired();
    }

    /// Analyze one attempt. Never fails: stage problems become fallbacks and
    /// pipeline problems become the global fallback result.
    pub async fn analyze(&self, context: &AuthContext) -> AuthAnalysisResult {
        let start = Instant::now();
        let key = self.keyer.key(context);

        match self.cache.get(&key) {
            CacheLookup::Hit(result) => {
                self.metrics.record_cache_hit();
                debug!(request_id = %context.request_id, score = result.risk_score, "Cache hit");
                if result.should_block {
                    self.emit(context, &result);
                }
                return result;
            }
            CacheLookup::Corrupted(reason) => {
                let err = PipelineError::CacheCorruption(reason);
                warn!(request_id = %context.request_id, error = %err, "Discarding cached result");
                self.metrics.record_error(&err, Some(context.request_id.as_str()));
            }
            CacheLookup::Miss => {}
        }

        // The computation runs as its own task so that a panic anywhere in
        // it is caught at the join.
        let this = self.clone();
        let owned = context.clone();
        let joined = tokio::spawn(async move { this.compute(&owned, start).await }).await;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let failure = match joined {
            Ok(Ok(result)) => {
                self.metrics.record_request(elapsed_ms, true);
                self.health.record_success(ORCHESTRATOR_COMPONENT, elapsed_ms);
                self.cache.insert(key, result.clone());
                self.emit(context, &result);
                return result;
            }
            Ok(Err(err)) => err,
            Err(join_err) => PipelineError::AggregationFailure(format!("pipeline task aborted: {}", join_err)),
        };

        error!(
            request_id = %context.request_id,
            error = %failure,
            "Risk pipeline failed, returning fallback decision"
        );
        self.metrics.record_error(&failure, Some(context.request_id.as_str()));
        self.metrics.record_request(elapsed_ms, false);
        self.health
            .record_failure(ORCHESTRATOR_COMPONENT, elapsed_ms, &failure.to_string());

        let result = scoring::fallback_result(
            &context.request_id,
            self.settings.service.fallback_risk_score,
            elapsed_ms,
        );
        self.emit(context, &result);
        result
    }

    async fn compute(&self, context: &AuthContext, start: Instant) -> Result<AuthAnalysisResult, PipelineError> {
        let (credential, embedding, behavioral, threat) = tokio::join!(
            self.credential_stage(context),
            self.embedding_stage(context),
            self.anomaly_stage(context),
            self.threat_stage(context),
        );

        self.observe(&credential, context);
        self.observe(&embedding, context);
        self.observe(&behavioral, context);
        self.observe(&threat, context);

        let mask = FallbackMask {
            credential: credential.outcome.is_fallback(),
            embedding: embedding.outcome.is_fallback(),
            behavioral: behavioral.outcome.is_fallback(),
            threat: threat.outcome.is_fallback(),
        };
        let stage_reports = vec![
            credential.report.clone(),
            embedding.report.clone(),
            behavioral.report.clone(),
            threat.report.clone(),
        ];

        let mut nlp = credential.outcome.into_value();
        let mut embedding = embedding.outcome.into_value();
        let mut behavioral = behavioral.outcome.into_value();
        let mut threat = threat.outcome.into_value();
        nlp.clamp_scores();
        embedding.clamp_scores();
        behavioral.clamp_scores();
        threat.clamp_scores();

        let scoring_config = &self.settings.scoring;
        let risk_score = scoring::aggregate(scoring_config, &nlp, &embedding, &behavioral, &threat)?;

        let anonymized = context.is_tor_exit_node
            || context.is_vpn
            || threat
                .threat_actor_indicators
                .iter()
                .any(|a| a == "tor_user" || a == "vpn_user");
        let decision = scoring::decide(scoring_config, risk_score, anonymized);
        let confidence_score = scoring::confidence(scoring_config, mask, &behavioral);

        let result = AuthAnalysisResult {
            request_id: context.request_id.clone(),
            risk_score,
            risk_level: decision.risk_level,
            should_block: decision.should_block,
            requires_2fa: decision.requires_2fa,
            recommended_actions: decision.recommended_actions,
            confidence_score,
            user_feedback_required: decision.user_feedback_required,
            nlp_features: nlp,
            embedding_analysis: embedding,
            behavioral_analysis: behavioral,
            threat_analysis: threat,
            stage_reports,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            analysis_timestamp: Utc::now(),
        };
        result.validate().map_err(PipelineError::AggregationFailure)?;

        info!(
            request_id = %context.request_id,
            score = result.risk_score,
            level = %result.risk_level,
            confidence = result.confidence_score,
            fallbacks = mask.count(),
            elapsed_ms = result.processing_time_ms,
            "Login attempt analyzed"
        );
        Ok(result)
    }

    fn budget(&self, stage_timeout_ms: u64) -> Duration {
        Duration::from_millis(stage_timeout_ms.min(self.settings.service.max_processing_time_ms))
    }

    async fn credential_stage(&self, context: &AuthContext) -> StageRun<NlpFeatures> {
        let svc = &self.settings.service;
        if !svc.enable_credential_analysis {
            return StageRun::disabled(Stage::CredentialAnalysis, NlpFeatures::fallback());
        }
        let analyzer = self.credential.clone();
        let email = context.email.clone();
        let digest = context.credential_digest.clone();
        run_stage(
            Stage::CredentialAnalysis,
            self.budget(svc.credential_timeout_ms),
            async move { analyzer.analyze(&email, &digest).await },
            NlpFeatures::fallback,
        )
        .await
    }

    async fn embedding_stage(&self, context: &AuthContext) -> StageRun<EmbeddingAnalysis> {
        let svc = &self.settings.service;
        if !svc.enable_embedding_analysis {
            return StageRun::disabled(Stage::BehavioralEmbedding, EmbeddingAnalysis::fallback());
        }
        let analyzer = self.embedding.clone();
        let ctx = context.clone();
        run_stage(
            Stage::BehavioralEmbedding,
            self.budget(svc.embedding_timeout_ms),
            async move {
                let embedding = analyzer.embed(&ctx).await?;
                analyzer.score_anomalies(&ctx, embedding).await
            },
            EmbeddingAnalysis::fallback,
        )
        .await
    }

    async fn anomaly_stage(&self, context: &AuthContext) -> StageRun<BehavioralAnalysis> {
        let svc = &self.settings.service;
        if !svc.enable_anomaly_detection {
            return StageRun::disabled(Stage::AnomalyDetection, BehavioralAnalysis::fallback());
        }
        let analyzer = self.anomaly.clone();
        let ctx = context.clone();
        run_stage(
            Stage::AnomalyDetection,
            self.budget(svc.anomaly_timeout_ms),
            async move { analyzer.detect(&ctx).await },
            BehavioralAnalysis::fallback,
        )
        .await
    }

    async fn threat_stage(&self, context: &AuthContext) -> StageRun<ThreatAnalysis> {
        let svc = &self.settings.service;
        if !svc.enable_threat_intelligence {
            return StageRun::disabled(Stage::ThreatIntelligence, ThreatAnalysis::fallback());
        }
        let analyzer = self.threat.clone();
        let ctx = context.clone();
        run_stage(
            Stage::ThreatIntelligence,
            self.budget(svc.threat_intel_timeout_ms),
            async move { analyzer.analyze(&ctx).await },
            ThreatAnalysis::fallback,
        )
        .await
    }

    fn observe<T>(&self, run: &StageRun<T>, context: &AuthContext) {
        self.metrics.record_stage(&run.report);
        self.health.observe(&run.report);
        if let Some(err) = run.outcome.error(run.report.stage) {
            self.metrics.record_error(&err, Some(context.request_id.as_str()));
        }
    }

    fn emit(&self, context: &AuthContext, result: &AuthAnalysisResult) {
        for event in SecurityEvent::from_decision(context, result) {
            let sink = self.events.clone();
            tokio::spawn(async move {
                sink.publish(&event).await;
            });
        }
    }
}
