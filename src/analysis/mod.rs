//! Pluggable analysis stages.
//!
//! Each stage is a narrow capability trait. The orchestrator only sees these
//! traits; concrete backends (the heuristic ones in this module or an
//! ML-backed service) are chosen at construction time.

pub mod anomaly;
pub mod credential;
pub mod embedding;
pub mod threat_intel;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::analysis::{BehavioralAnalysis, EmbeddingAnalysis, NlpFeatures, ThreatAnalysis};
use crate::models::context::AuthContext;

/// Structural and textual features of an email + credential digest pair.
#[async_trait]
pub trait CredentialAnalyzer: Send + Sync {
    async fn analyze(&self, email: &str, credential_digest: &str) -> Result<NlpFeatures>;
}

/// Vector representation of a login context and its similarity scores.
#[async_trait]
pub trait BehavioralEmbeddingAnalyzer: Send + Sync {
    async fn embed(&self, context: &AuthContext) -> Result<EmbeddingAnalysis>;

    /// Enrich `embedding` with profile and attack-pattern similarity.
    async fn score_anomalies(
        &self,
        context: &AuthContext,
        embedding: EmbeddingAnalysis,
    ) -> Result<EmbeddingAnalysis>;
}

/// Deviation of an attempt from the user's historical baseline.
#[async_trait]
pub trait AnomalyDetectionEngine: Send + Sync {
    async fn detect(&self, context: &AuthContext) -> Result<BehavioralAnalysis>;

    /// Drop expired in-memory state. Called periodically by the reporter.
    fn cleanup(&self) {}
}

/// IP reputation and known attack-pattern matching.
#[async_trait]
pub trait ThreatIntelligenceAnalyzer: Send + Sync {
    async fn analyze(&self, context: &AuthContext) -> Result<ThreatAnalysis>;

    fn cleanup(&self) {}
}
