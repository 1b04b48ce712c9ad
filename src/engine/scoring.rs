use chrono::Utc;

use super::PipelineError;
use crate::config::settings::ScoringConfig;
use crate::models::analysis::{
    clamp_unit, BehavioralAnalysis, EmbeddingAnalysis, NlpFeatures, ThreatAnalysis,
};
use crate::models::risk::{
    AuthAnalysisResult, FallbackReason, RiskLevel, SecurityAction, SecurityActionType, Stage,
    StageReport, MEDIUM_THRESHOLD,
};

/// Confidence reported with the global fallback result.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Weighted sum of the stage outputs plus the user's calibration bias,
/// clamped to `[0, 1]`. Any non-finite term is an aggregation failure.
pub fn aggregate(
    config: &ScoringConfig,
    nlp: &NlpFeatures,
    embedding: &EmbeddingAnalysis,
    behavioral: &BehavioralAnalysis,
    threat: &ThreatAnalysis,
) -> Result<f64, PipelineError> {
    let credential = if nlp.credential_similarity >= config.credential_similarity_threshold {
        nlp.credential_similarity
    } else {
        0.0
    };
    let suspicious = if nlp.any_suspicious() { 1.0 } else { 0.0 };
    let known_patterns = (threat.known_attack_patterns.len() as f64 / 2.0).min(1.0);

    let terms = [
        ("credential_similarity", credential, config.credential_similarity_weight),
        ("suspicious_patterns", suspicious, config.suspicious_pattern_weight),
        ("attack_similarity", embedding.similarity_to_attack_patterns, config.attack_similarity_weight),
        ("outlier", embedding.outlier_score, config.outlier_weight),
        ("time_deviation", behavioral.time_deviation_score, config.time_deviation_weight),
        ("location_deviation", behavioral.location_deviation_score, config.location_deviation_weight),
        ("device_deviation", behavioral.device_deviation_score, config.device_deviation_weight),
        ("frequency", behavioral.login_frequency_anomaly, config.frequency_weight),
        ("ip_reputation", threat.ip_reputation_score, config.ip_reputation_weight),
        ("known_patterns", known_patterns, config.known_pattern_weight),
        ("calibration_bias", behavioral.calibration_bias, 1.0),
    ];

    let mut score = 0.0;
    for (name, value, weight) in terms {
        let term = value * weight;
        if !term.is_finite() {
            return Err(PipelineError::AggregationFailure(format!(
                "non-finite {} term ({} x {})",
                name, value, weight
            )));
        }
        score += term;
    }

    if !score.is_finite() {
        return Err(PipelineError::AggregationFailure(format!("non-finite score {}", score)));
    }
    Ok(score.clamp(0.0, 1.0))
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub risk_level: RiskLevel,
    pub should_block: bool,
    pub requires_2fa: bool,
    pub user_feedback_required: bool,
    pub recommended_actions: Vec<SecurityAction>,
}

/// Borderline scores inside MEDIUM or HIGH ask for confirmation.
pub fn feedback_required(config: &ScoringConfig, level: RiskLevel, score: f64) -> bool {
    matches!(level, RiskLevel::Medium | RiskLevel::High)
        && score >= config.feedback_band_low
        && score <= config.feedback_band_high
}

/// Map a final score to level, flags and the ordered action list.
/// `anonymized` is set when the attempt came through Tor or a VPN.
pub fn decide(config: &ScoringConfig, score: f64, anonymized: bool) -> Decision {
    let risk_level = RiskLevel::from_score(score);
    let user_feedback_required = feedback_required(config, risk_level, score);
    let score_param = format!("{:.3}", score);

    let mut actions = match risk_level {
        RiskLevel::Low => vec![SecurityAction::new(
            SecurityActionType::Allow,
            5,
            "Allow login",
        )],
        RiskLevel::Medium => vec![
            SecurityAction::new(SecurityActionType::Allow, 5, "Allow login"),
            SecurityAction::new(SecurityActionType::Monitor, 3, "Monitor session for unusual activity")
                .with_param("duration_hours", 24),
        ],
        RiskLevel::High => vec![
            SecurityAction::new(
                SecurityActionType::Require2fa,
                2,
                "Require second factor before completing login",
            )
            .with_param("risk_score", &score_param),
            SecurityAction::new(SecurityActionType::Monitor, 3, "Monitor session for unusual activity")
                .with_param("duration_hours", 72),
        ],
        RiskLevel::Critical => vec![SecurityAction::new(
            SecurityActionType::Block,
            1,
            "Block login attempt",
        )
        .with_param("risk_score", &score_param)],
    };

    if anonymized {
        actions.push(
            SecurityAction::new(SecurityActionType::Alert, 2, "Login through anonymizing network")
                .with_param("risk_level", risk_level),
        );
    }
    if user_feedback_required {
        actions.push(
            SecurityAction::new(
                SecurityActionType::RequestFeedback,
                4,
                "Ask the user to confirm this login",
            )
            .with_param("risk_score", &score_param),
        );
    }
    actions.sort_by_key(|a| a.priority);

    Decision {
        risk_level,
        should_block: risk_level == RiskLevel::Critical,
        requires_2fa: risk_level == RiskLevel::High,
        user_feedback_required,
        recommended_actions: actions,
    }
}

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Which stages ran on their fallback value, in `Stage::ALL` order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackMask {
    pub credential: bool,
    pub embedding: bool,
    pub behavioral: bool,
    pub threat: bool,
}

impl FallbackMask {
    pub fn count(&self) -> usize {
        [self.credential, self.embedding, self.behavioral, self.threat]
            .iter()
            .filter(|f| **f)
            .count()
    }
}

pub fn confidence(config: &ScoringConfig, fallbacks: FallbackMask, behavioral: &BehavioralAnalysis) -> f64 {
    let credential = if fallbacks.credential { 0.3 } else { 0.9 };
    let embedding = if fallbacks.embedding { 0.2 } else { 0.9 };
    let behavioral = if fallbacks.behavioral {
        0.3
    } else if behavioral.history_samples >= config.min_history_samples {
        0.85
    } else {
        0.5
    };
    let threat = if fallbacks.threat { 0.3 } else { 0.8 };

    let mean = (credential + embedding + behavioral + threat) / 4.0;
    let ratio = fallbacks.count() as f64 / Stage::ALL.len() as f64;
    clamp_unit(mean * (1.0 - config.fallback_confidence_penalty * ratio))
}

// ---------------------------------------------------------------------------
// Global fallback
// ---------------------------------------------------------------------------

/// The result returned when the pipeline itself fails: fail-open at LOW,
/// flagged for manual review and feedback.
pub fn fallback_result(request_id: &str, fallback_score: f64, processing_time_ms: f64) -> AuthAnalysisResult {
    // Always LOW, even with a misconfigured score.
    let risk_score = clamp_unit(fallback_score).min(MEDIUM_THRESHOLD - 1e-6);

    AuthAnalysisResult {
        request_id: request_id.to_string(),
        risk_score,
        risk_level: RiskLevel::Low,
        should_block: false,
        requires_2fa: false,
        recommended_actions: vec![SecurityAction::new(
            SecurityActionType::ManualReview,
            1,
            "Risk analysis unavailable; review this login manually",
        )
        .with_param("reason", "pipeline_failure")
        .needs_review()],
        confidence_score: FALLBACK_CONFIDENCE,
        user_feedback_required: true,
        nlp_features: NlpFeatures::fallback(),
        embedding_analysis: EmbeddingAnalysis::fallback(),
        behavioral_analysis: BehavioralAnalysis::fallback(),
        threat_analysis: ThreatAnalysis::fallback(),
        stage_reports: Stage::ALL
            .iter()
            .map(|stage| StageReport {
                stage: *stage,
                elapsed_ms: 0.0,
                fallback: Some(FallbackReason::PipelineFailure),
            })
            .collect(),
        processing_time_ms,
        analysis_timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_scoring_config;

    fn neutral() -> (NlpFeatures, EmbeddingAnalysis, BehavioralAnalysis, ThreatAnalysis) {
        let mut nlp = NlpFeatures::fallback();
        nlp.used_fallback = false;
        let mut emb = EmbeddingAnalysis::fallback();
        emb.used_fallback = false;
        let mut beh = BehavioralAnalysis::fallback();
        beh.used_fallback = false;
        let mut threat = ThreatAnalysis::fallback();
        threat.used_fallback = false;
        (nlp, emb, beh, threat)
    }

    #[test]
    fn test_neutral_inputs_score_zero() {
        let config = default_scoring_config();
        let (nlp, emb, beh, threat) = neutral();
        assert_eq!(aggregate(&config, &nlp, &emb, &beh, &threat).unwrap(), 0.0);
    }

    #[test]
    fn test_similarity_below_threshold_ignored() {
        let config = default_scoring_config();
        let (mut nlp, emb, beh, threat) = neutral();
        nlp.credential_similarity = 0.69;
        assert_eq!(aggregate(&config, &nlp, &emb, &beh, &threat).unwrap(), 0.0);
        nlp.credential_similarity = 0.9;
        let score = aggregate(&config, &nlp, &emb, &beh, &threat).unwrap();
        assert!((score - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_everything_maxed_is_critical() {
        let config = default_scoring_config();
        let (mut nlp, mut emb, mut beh, mut threat) = neutral();
        nlp.credential_similarity = 1.0;
        nlp.credential_features.suspicious_patterns = true;
        emb.similarity_to_attack_patterns = 1.0;
        emb.outlier_score = 1.0;
        beh.time_deviation_score = 1.0;
        beh.location_deviation_score = 1.0;
        beh.device_deviation_score = 1.0;
        beh.login_frequency_anomaly = 1.0;
        threat.ip_reputation_score = 1.0;
        threat.known_attack_patterns = vec!["brute_force".into(), "credential_stuffing".into()];

        let score = aggregate(&config, &nlp, &emb, &beh, &threat).unwrap();
        assert!(score >= 0.95);
        assert_eq!(RiskLevel::from_score(score), RiskLevel::Critical);
    }

    #[test]
    fn test_bias_shifts_and_clamps() {
        let config = default_scoring_config();
        let (nlp, emb, mut beh, mut threat) = neutral();
        threat.ip_reputation_score = 0.4;
        beh.calibration_bias = -0.2;
        assert_eq!(aggregate(&config, &nlp, &emb, &beh, &threat).unwrap(), 0.0);
        beh.calibration_bias = 0.1;
        let score = aggregate(&config, &nlp, &emb, &beh, &threat).unwrap();
        assert!((score - 0.16).abs() < 1e-9);
    }

    #[test]
    fn test_nan_weight_is_aggregation_failure() {
        let mut config = default_scoring_config();
        config.outlier_weight = f64::NAN;
        let (nlp, emb, beh, threat) = neutral();
        let err = aggregate(&config, &nlp, &emb, &beh, &threat).unwrap_err();
        assert!(matches!(err, PipelineError::AggregationFailure(_)));
    }

    #[test]
    fn test_decision_low() {
        let d = decide(&default_scoring_config(), 0.10, false);
        assert_eq!(d.risk_level, RiskLevel::Low);
        assert!(!d.should_block && !d.requires_2fa && !d.user_feedback_required);
        assert_eq!(d.recommended_actions[0].action_type, SecurityActionType::Allow);
    }

    #[test]
    fn test_decision_medium_borderline() {
        let d = decide(&default_scoring_config(), 0.55, false);
        assert_eq!(d.risk_level, RiskLevel::Medium);
        assert!(!d.should_block && !d.requires_2fa);
        assert!(d.user_feedback_required);
        let types: Vec<_> = d.recommended_actions.iter().map(|a| a.action_type).collect();
        assert!(types.contains(&SecurityActionType::Allow));
        assert!(types.contains(&SecurityActionType::Monitor));
        assert!(types.contains(&SecurityActionType::RequestFeedback));
    }

    #[test]
    fn test_decision_high_borderline() {
        let d = decide(&default_scoring_config(), 0.75, false);
        assert_eq!(d.risk_level, RiskLevel::High);
        assert!(d.requires_2fa && !d.should_block && d.user_feedback_required);
        assert_eq!(d.recommended_actions[0].action_type, SecurityActionType::Require2fa);
    }

    #[test]
    fn test_decision_high_outside_band() {
        let d = decide(&default_scoring_config(), 0.85, false);
        assert_eq!(d.risk_level, RiskLevel::High);
        assert!(d.requires_2fa && !d.should_block);
        assert!(!d.user_feedback_required);
    }

    #[test]
    fn test_decision_critical() {
        let d = decide(&default_scoring_config(), 0.98, true);
        assert_eq!(d.risk_level, RiskLevel::Critical);
        assert!(d.should_block && !d.requires_2fa && !d.user_feedback_required);
        assert_eq!(d.recommended_actions[0].action_type, SecurityActionType::Block);
        assert!(d
            .recommended_actions
            .iter()
            .any(|a| a.action_type == SecurityActionType::Alert));
    }

    #[test]
    fn test_confidence_drops_with_fallbacks() {
        let config = default_scoring_config();
        let mut beh = BehavioralAnalysis::fallback();
        beh.history_samples = 10;

        let all_ok = confidence(&config, FallbackMask::default(), &beh);
        let one = confidence(
            &config,
            FallbackMask { threat: true, ..Default::default() },
            &beh,
        );
        let all = confidence(
            &config,
            FallbackMask { credential: true, embedding: true, behavioral: true, threat: true },
            &beh,
        );
        assert!((all_ok - 0.8625).abs() < 1e-9);
        assert!(one < all_ok);
        assert!(all < one);
        assert!((0.0..=1.0).contains(&all));

        beh.history_samples = 1;
        assert!(confidence(&config, FallbackMask::default(), &beh) < all_ok);
    }

    #[test]
    fn test_fallback_result_shape() {
        let result = fallback_result("req-1", 0.2, 3.0);
        assert_eq!(result.risk_level, RiskLevel::Low);
        assert!(result.user_feedback_required);
        assert_eq!(result.confidence_score, FALLBACK_CONFIDENCE);
        assert!(result.has_action(SecurityActionType::ManualReview));
        assert!(result.recommended_actions[0].requires_human_review);
        assert_eq!(result.fallback_count(), 4);
        assert!(result.validate().is_ok());

        let misconfigured = fallback_result("req-2", 0.9, 3.0);
        assert_eq!(misconfigured.risk_level, RiskLevel::Low);
        assert!(misconfigured.validate().is_ok());
    }
}
