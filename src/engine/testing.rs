//! Scriptable analyzers for pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::orchestrator::AnalysisBackends;
use crate::analysis::{
    AnomalyDetectionEngine, BehavioralEmbeddingAnalyzer, CredentialAnalyzer,
    ThreatIntelligenceAnalyzer,
};
use crate::models::analysis::{
    BehavioralAnalysis, EmbeddingAnalysis, NlpFeatures, ThreatAnalysis,
};
use crate::models::context::AuthContext;
use crate::storage::memory::MemoryProfileStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Succeed,
    Fail,
    Sleep(Duration),
    Panic,
}

/// One stub that can stand in for any of the four stages. Successful calls
/// return neutral, non-fallback analyses unless an override is set.
pub struct StubAnalyzer {
    behavior: Behavior,
    calls: AtomicUsize,
    threat: Option<ThreatAnalysis>,
    behavioral: Option<BehavioralAnalysis>,
}

impl StubAnalyzer {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            threat: None,
            behavioral: None,
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(Behavior::Succeed)
    }

    pub fn with_threat(threat: ThreatAnalysis) -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::Succeed,
            calls: AtomicUsize::new(0),
            threat: Some(threat),
            behavioral: None,
        })
    }

    pub fn with_behavioral(behavioral: BehavioralAnalysis) -> Arc<Self> {
        Arc::new(Self {
            behavior: Behavior::Succeed,
            calls: AtomicUsize::new(0),
            threat: None,
            behavioral: Some(behavioral),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn act(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => bail!("stub analyzer failure"),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            Behavior::Panic => panic!("stub analyzer panic"),
        }
    }
}

#[async_trait]
impl CredentialAnalyzer for StubAnalyzer {
    async fn analyze(&self, _email: &str, _credential_digest: &str) -> Result<NlpFeatures> {
        self.act().await?;
        let mut nlp = NlpFeatures::fallback();
        nlp.used_fallback = false;
        nlp.model_version = "stub".into();
        Ok(nlp)
    }
}

#[async_trait]
impl BehavioralEmbeddingAnalyzer for StubAnalyzer {
    async fn embed(&self, _context: &AuthContext) -> Result<EmbeddingAnalysis> {
        self.act().await?;
        let mut emb = EmbeddingAnalysis::fallback();
        emb.used_fallback = false;
        emb.embedding_vector = vec![1.0, 0.0];
        emb.model_version = "stub".into();
        Ok(emb)
    }

    async fn score_anomalies(
        &self,
        _context: &AuthContext,
        embedding: EmbeddingAnalysis,
    ) -> Result<EmbeddingAnalysis> {
        Ok(embedding)
    }
}

#[async_trait]
impl AnomalyDetectionEngine for StubAnalyzer {
    async fn detect(&self, _context: &AuthContext) -> Result<BehavioralAnalysis> {
        self.act().await?;
        let mut beh = self.behavioral.clone().unwrap_or_else(BehavioralAnalysis::fallback);
        beh.used_fallback = false;
        Ok(beh)
    }
}

#[async_trait]
impl ThreatIntelligenceAnalyzer for StubAnalyzer {
    async fn analyze(&self, _context: &AuthContext) -> Result<ThreatAnalysis> {
        self.act().await?;
        let mut threat = self.threat.clone().unwrap_or_else(ThreatAnalysis::fallback);
        threat.used_fallback = false;
        Ok(threat)
    }
}

/// The four stubs behind a pipeline, kept so tests can read call counts.
pub struct StubSet {
    pub credential: Arc<StubAnalyzer>,
    pub embedding: Arc<StubAnalyzer>,
    pub anomaly: Arc<StubAnalyzer>,
    pub threat: Arc<StubAnalyzer>,
}

impl StubSet {
    pub fn all_ok() -> Self {
        Self {
            credential: StubAnalyzer::ok(),
            embedding: StubAnalyzer::ok(),
            anomaly: StubAnalyzer::ok(),
            threat: StubAnalyzer::ok(),
        }
    }

    pub fn all(behavior: Behavior) -> Self {
        Self {
            credential: StubAnalyzer::new(behavior),
            embedding: StubAnalyzer::new(behavior),
            anomaly: StubAnalyzer::new(behavior),
            threat: StubAnalyzer::new(behavior),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.credential.calls() + self.embedding.calls() + self.anomaly.calls() + self.threat.calls()
    }

    pub fn backends(&self) -> AnalysisBackends {
        AnalysisBackends {
            credential: self.credential.clone(),
            embedding: self.embedding.clone(),
            anomaly: self.anomaly.clone(),
            threat: self.threat.clone(),
            profiles: Arc::new(MemoryProfileStore::new()),
        }
    }
}

pub fn context(email: &str, ip: &str) -> AuthContext {
    let mut ctx = AuthContext::new(email, "9f86d081884c7d659a2feaa0c55ad015", ip.parse().unwrap(), "Mozilla/5.0 (X11; Linux x86_64)");
    ctx.device_fingerprint = Some(format!("fp-{}", email));
    ctx
}
