use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Clamp a score into `[0, 1]`. Non-finite input collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Credential text features
// ---------------------------------------------------------------------------

/// Textual features of a single credential field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialFeatures {
    pub token_count: usize,
    pub unique_token_ratio: f64,
    pub entropy_score: f64,
    pub language: String,
    pub suspicious_patterns: bool,
    pub pattern_types: Vec<String>,
}

impl CredentialFeatures {
    pub fn neutral() -> Self {
        Self {
            token_count: 0,
            unique_token_ratio: 0.0,
            entropy_score: 0.0,
            language: "unknown".to_string(),
            suspicious_patterns: false,
            pattern_types: Vec::new(),
        }
    }

    /// `entropy_score` is in bits and has no upper bound.
    pub fn clamp_scores(&mut self) {
        self.unique_token_ratio = clamp_unit(self.unique_token_ratio);
    }
}

/// Features derived from the email + credential digest pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NlpFeatures {
    pub email_features: CredentialFeatures,
    pub credential_features: CredentialFeatures,
    pub credential_similarity: f64,
    pub language_consistency: bool,
    pub processing_time_ms: f64,
    pub used_fallback: bool,
    pub model_version: String,
}

impl NlpFeatures {
    pub fn fallback() -> Self {
        Self {
            email_features: CredentialFeatures::neutral(),
            credential_features: CredentialFeatures::neutral(),
            credential_similarity: 0.0,
            language_consistency: true,
            processing_time_ms: 0.0,
            used_fallback: true,
            model_version: "fallback".to_string(),
        }
    }

    pub fn any_suspicious(&self) -> bool {
        self.email_features.suspicious_patterns || self.credential_features.suspicious_patterns
    }

    /// Force every score into `[0, 1]`; backends are not trusted to.
    pub fn clamp_scores(&mut self) {
        self.email_features.clamp_scores();
        self.credential_features.clamp_scores();
        self.credential_similarity = clamp_unit(self.credential_similarity);
    }
}

// ---------------------------------------------------------------------------
// Behavioral embedding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingAnalysis {
    pub embedding_vector: Vec<f32>,
    pub similarity_to_user_profile: f64,
    pub similarity_to_attack_patterns: f64,
    pub cluster_assignment: Option<String>,
    pub outlier_score: f64,
    pub processing_time_ms: f64,
    pub model_version: String,
    pub used_fallback: bool,
}

impl EmbeddingAnalysis {
    pub fn fallback() -> Self {
        Self {
            embedding_vector: Vec::new(),
            similarity_to_user_profile: 0.0,
            similarity_to_attack_patterns: 0.0,
            cluster_assignment: None,
            outlier_score: 0.0,
            processing_time_ms: 0.0,
            model_version: "fallback".to_string(),
            used_fallback: true,
        }
    }

    pub fn clamp_scores(&mut self) {
        self.similarity_to_user_profile = clamp_unit(self.similarity_to_user_profile);
        self.similarity_to_attack_patterns = clamp_unit(self.similarity_to_attack_patterns);
        self.outlier_score = clamp_unit(self.outlier_score);
    }
}

// ---------------------------------------------------------------------------
// Behavioral anomaly
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralAnalysis {
    pub is_usual_time: bool,
    pub time_deviation_score: f64,
    pub is_usual_location: bool,
    pub location_deviation_score: f64,
    pub is_usual_device: bool,
    pub device_deviation_score: f64,
    pub login_frequency_anomaly: f64,
    pub session_duration_anomaly: f64,
    pub success_rate_last_30_days: f64,
    pub failed_attempts_pattern: BTreeMap<String, u32>,
    /// Number of recorded outcomes backing this analysis.
    pub history_samples: u32,
    /// Per-user score offset learned from operator feedback.
    pub calibration_bias: f64,
    pub used_fallback: bool,
}

impl BehavioralAnalysis {
    /// "Unknown is normal": usual time, location and device with no deviation.
    pub fn fallback() -> Self {
        Self {
            is_usual_time: true,
            time_deviation_score: 0.0,
            is_usual_location: true,
            location_deviation_score: 0.0,
            is_usual_device: true,
            device_deviation_score: 0.0,
            login_frequency_anomaly: 0.0,
            session_duration_anomaly: 0.0,
            success_rate_last_30_days: 1.0,
            failed_attempts_pattern: BTreeMap::new(),
            history_samples: 0,
            calibration_bias: 0.0,
            used_fallback: true,
        }
    }

    /// Clamp the unit scores. `calibration_bias` is signed and bounded by
    /// the learning engine, so it is left alone.
    pub fn clamp_scores(&mut self) {
        self.time_deviation_score = clamp_unit(self.time_deviation_score);
        self.location_deviation_score = clamp_unit(self.location_deviation_score);
        self.device_deviation_score = clamp_unit(self.device_deviation_score);
        self.login_frequency_anomaly = clamp_unit(self.login_frequency_anomaly);
        self.session_duration_anomaly = clamp_unit(self.session_duration_anomaly);
        self.success_rate_last_30_days = clamp_unit(self.success_rate_last_30_days);
    }
}

// ---------------------------------------------------------------------------
// Threat intelligence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BruteForceIndicators {
    pub rapid_attempts: bool,
    pub multiple_ips: bool,
    pub time_pattern_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialStuffingIndicators {
    pub password_reuse: bool,
    pub multiple_accounts: bool,
    pub common_passwords: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountTakeoverIndicators {
    pub location_change: bool,
    pub device_change: bool,
    pub behavior_change: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAnalysis {
    pub ip_reputation_score: f64,
    pub known_attack_patterns: Vec<String>,
    pub threat_actor_indicators: Vec<String>,
    pub brute_force_indicators: BruteForceIndicators,
    pub credential_stuffing_indicators: CredentialStuffingIndicators,
    pub account_takeover_indicators: AccountTakeoverIndicators,
    pub similar_attacks_detected: u32,
    pub attack_campaign_correlation: Option<String>,
    pub used_fallback: bool,
}

impl ThreatAnalysis {
    pub fn fallback() -> Self {
        Self {
            ip_reputation_score: 0.0,
            known_attack_patterns: Vec::new(),
            threat_actor_indicators: Vec::new(),
            brute_force_indicators: BruteForceIndicators::default(),
            credential_stuffing_indicators: CredentialStuffingIndicators::default(),
            account_takeover_indicators: AccountTakeoverIndicators::default(),
            similar_attacks_detected: 0,
            attack_campaign_correlation: None,
            used_fallback: true,
        }
    }

    pub fn clamp_scores(&mut self) {
        self.ip_reputation_score = clamp_unit(self.ip_reputation_score);
        self.brute_force_indicators.time_pattern_score = clamp_unit(self.brute_force_indicators.time_pattern_score);
    }
}
