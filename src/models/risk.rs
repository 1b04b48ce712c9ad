use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::analysis::{BehavioralAnalysis, EmbeddingAnalysis, NlpFeatures, ThreatAnalysis};

// ---------------------------------------------------------------------------
// Risk level
// ---------------------------------------------------------------------------

pub const MEDIUM_THRESHOLD: f64 = 0.30;
pub const HIGH_THRESHOLD: f64 = 0.60;
pub const CRITICAL_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Fixed partition of `[0, 1]`. Total over all finite inputs.
    pub fn from_score(score: f64) -> Self {
        if score < MEDIUM_THRESHOLD {
            RiskLevel::Low
        } else if score < HIGH_THRESHOLD {
            RiskLevel::Medium
        } else if score < CRITICAL_THRESHOLD {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Security actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityActionType {
    Allow,
    Monitor,
    #[serde(rename = "REQUIRE_2FA")]
    Require2fa,
    Block,
    Alert,
    RequestFeedback,
    ManualReview,
}

impl fmt::Display for SecurityActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityActionType::Allow => write!(f, "ALLOW"),
            SecurityActionType::Monitor => write!(f, "MONITOR"),
            SecurityActionType::Require2fa => write!(f, "REQUIRE_2FA"),
            SecurityActionType::Block => write!(f, "BLOCK"),
            SecurityActionType::Alert => write!(f, "ALERT"),
            SecurityActionType::RequestFeedback => write!(f, "REQUEST_FEEDBACK"),
            SecurityActionType::ManualReview => write!(f, "MANUAL_REVIEW"),
        }
    }
}

/// A recommended response to the attempt. Lower `priority` is more urgent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAction {
    pub action_type: SecurityActionType,
    pub priority: u8,
    pub description: String,
    pub parameters: BTreeMap<String, String>,
    pub automated: bool,
    pub requires_human_review: bool,
}

impl SecurityAction {
    pub fn new(action_type: SecurityActionType, priority: u8, description: impl Into<String>) -> Self {
        Self {
            action_type,
            priority,
            description: description.into(),
            parameters: BTreeMap::new(),
            automated: true,
            requires_human_review: false,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn needs_review(mut self) -> Self {
        self.automated = false;
        self.requires_human_review = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Stage reports
// ---------------------------------------------------------------------------

/// The four independent analysis stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CredentialAnalysis,
    BehavioralEmbedding,
    AnomalyDetection,
    ThreatIntelligence,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::CredentialAnalysis,
        Stage::BehavioralEmbedding,
        Stage::AnomalyDetection,
        Stage::ThreatIntelligence,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::CredentialAnalysis => "credential_analyzer",
            Stage::BehavioralEmbedding => "embedding_analyzer",
            Stage::AnomalyDetection => "anomaly_detector",
            Stage::ThreatIntelligence => "threat_intelligence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a stage's output was replaced by its fallback value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    Timeout { budget_ms: u64 },
    Failure(String),
    Panicked,
    Disabled,
    /// The whole pipeline fell back; the stage may never have run.
    PipelineFailure,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Timeout { budget_ms } => write!(f, "timed out after {}ms", budget_ms),
            FallbackReason::Failure(msg) => write!(f, "failed: {}", msg),
            FallbackReason::Panicked => write!(f, "panicked"),
            FallbackReason::Disabled => write!(f, "disabled"),
            FallbackReason::PipelineFailure => write!(f, "pipeline failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub elapsed_ms: f64,
    /// `None` when the stage completed normally.
    pub fallback: Option<FallbackReason>,
}

// ---------------------------------------------------------------------------
// AuthAnalysisResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAnalysisResult {
    pub request_id: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub should_block: bool,
    pub requires_2fa: bool,
    pub recommended_actions: Vec<SecurityAction>,
    pub confidence_score: f64,
    pub user_feedback_required: bool,
    pub nlp_features: NlpFeatures,
    pub embedding_analysis: EmbeddingAnalysis,
    pub behavioral_analysis: BehavioralAnalysis,
    pub threat_analysis: ThreatAnalysis,
    pub stage_reports: Vec<StageReport>,
    pub processing_time_ms: f64,
    pub analysis_timestamp: DateTime<Utc>,
}

impl AuthAnalysisResult {
    /// Number of stages that ran on their fallback value.
    pub fn fallback_count(&self) -> usize {
        self.stage_reports.iter().filter(|r| r.fallback.is_some()).count()
    }

    pub fn has_action(&self, action: SecurityActionType) -> bool {
        self.recommended_actions.iter().any(|a| a.action_type == action)
    }

    /// Check the result's structural invariants. Used to detect damaged
    /// cache entries before they are handed back to a caller.
    pub fn validate(&self) -> Result<(), String> {
        let unit = |name: &str, v: f64| -> Result<(), String> {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{} out of range: {}", name, v))
            }
        };
        unit("risk_score", self.risk_score)?;
        unit("confidence_score", self.confidence_score)?;

        let nlp = &self.nlp_features;
        unit("credential_similarity", nlp.credential_similarity)?;
        unit("email_unique_token_ratio", nlp.email_features.unique_token_ratio)?;
        unit("credential_unique_token_ratio", nlp.credential_features.unique_token_ratio)?;

        let emb = &self.embedding_analysis;
        unit("similarity_to_user_profile", emb.similarity_to_user_profile)?;
        unit("similarity_to_attack_patterns", emb.similarity_to_attack_patterns)?;
        unit("outlier_score", emb.outlier_score)?;

        let beh = &self.behavioral_analysis;
        unit("time_deviation_score", beh.time_deviation_score)?;
        unit("location_deviation_score", beh.location_deviation_score)?;
        unit("device_deviation_score", beh.device_deviation_score)?;
        unit("login_frequency_anomaly", beh.login_frequency_anomaly)?;
        unit("session_duration_anomaly", beh.session_duration_anomaly)?;
        unit("success_rate_last_30_days", beh.success_rate_last_30_days)?;
        if !beh.calibration_bias.is_finite() {
            return Err(format!("calibration_bias not finite: {}", beh.calibration_bias));
        }

        let threat = &self.threat_analysis;
        unit("ip_reputation_score", threat.ip_reputation_score)?;
        unit("time_pattern_score", threat.brute_force_indicators.time_pattern_score)?;

        if RiskLevel::from_score(self.risk_score) != self.risk_level {
            return Err(format!(
                "risk_level {} does not match score {}",
                self.risk_level, self.risk_score
            ));
        }
        if self.should_block != (self.risk_level == RiskLevel::Critical) {
            return Err("should_block inconsistent with risk level".to_string());
        }
        if self.recommended_actions.is_empty() {
            return Err("no recommended actions".to_string());
        }
        Ok(())
    }
}
