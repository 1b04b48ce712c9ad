use super::settings::{
    AlertingConfig, AnomalyConfig, CacheConfig, EmbeddingConfig, HealthConfig, LearningConfig,
    LoggingConfig, MetricsConfig, ScoringConfig, ServiceConfig, StorageConfig, ThreatIntelConfig,
};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_service_config() -> ServiceConfig {
    ServiceConfig {
        max_processing_time_ms: default_max_processing_time_ms(),
        credential_timeout_ms: default_credential_timeout_ms(),
        embedding_timeout_ms: default_embedding_timeout_ms(),
        anomaly_timeout_ms: default_anomaly_timeout_ms(),
        threat_intel_timeout_ms: default_threat_intel_timeout_ms(),
        enable_credential_analysis: true,
        enable_embedding_analysis: true,
        enable_anomaly_detection: true,
        enable_threat_intelligence: true,
        fallback_risk_score: 0.0,
    }
}

pub fn default_cache_config() -> CacheConfig {
    CacheConfig {
        enabled: true,
        capacity: default_cache_capacity(),
        ttl_secs: default_cache_ttl_secs(),
        time_bucket_secs: default_cache_time_bucket_secs(),
        key_secret: String::new(),
    }
}

pub fn default_scoring_config() -> ScoringConfig {
    ScoringConfig {
        credential_similarity_weight: default_credential_similarity_weight(),
        credential_similarity_threshold: default_credential_similarity_threshold(),
        suspicious_pattern_weight: default_suspicious_pattern_weight(),
        attack_similarity_weight: default_attack_similarity_weight(),
        outlier_weight: default_outlier_weight(),
        time_deviation_weight: default_time_deviation_weight(),
        location_deviation_weight: default_location_deviation_weight(),
        device_deviation_weight: default_device_deviation_weight(),
        frequency_weight: default_frequency_weight(),
        ip_reputation_weight: default_ip_reputation_weight(),
        known_pattern_weight: default_known_pattern_weight(),
        feedback_band_low: default_feedback_band_low(),
        feedback_band_high: default_feedback_band_high(),
        min_history_samples: default_min_history_samples(),
        fallback_confidence_penalty: default_fallback_confidence_penalty(),
    }
}

pub fn default_embedding_config() -> EmbeddingConfig {
    EmbeddingConfig {
        dimension: default_embedding_dimension(),
        cold_start_outlier_score: default_cold_start_outlier_score(),
        cluster_threshold: default_cluster_threshold(),
    }
}

pub fn default_anomaly_config() -> AnomalyConfig {
    AnomalyConfig {
        frequency_window_secs: default_frequency_window_secs(),
        ip_attempt_threshold: default_ip_attempt_threshold(),
        user_attempt_threshold: default_user_attempt_threshold(),
        night_start_hour: default_night_start_hour(),
        night_end_hour: default_night_end_hour(),
        unknown_location_score: default_unknown_location_score(),
        new_country_score: default_new_country_score(),
    }
}

pub fn default_threat_intel_config() -> ThreatIntelConfig {
    ThreatIntelConfig {
        tor_detection: true,
        tor_score: default_tor_score(),
        vpn_score: default_vpn_score(),
        indicators_file: None,
        window_secs: default_threat_window_secs(),
        brute_force_attempts: default_brute_force_attempts(),
        stuffing_accounts_threshold: default_stuffing_accounts_threshold(),
        distributed_ip_threshold: default_distributed_ip_threshold(),
    }
}

pub fn default_learning_config() -> LearningConfig {
    LearningConfig {
        enabled: true,
        queue_capacity: default_learning_queue_capacity(),
        bias_step: default_bias_step(),
        max_user_bias: default_max_user_bias(),
        min_feedback_confidence: default_min_feedback_confidence(),
        max_known_locations: default_max_known_locations(),
        max_known_devices: default_max_known_devices(),
        max_login_history: default_max_login_history(),
        max_typical_embeddings: default_max_typical_embeddings(),
        outcome_history_days: default_outcome_history_days(),
        drain_timeout_secs: default_drain_timeout_secs(),
    }
}

pub fn default_health_config() -> HealthConfig {
    HealthConfig {
        degraded_latency_ms: default_degraded_latency_ms(),
        unhealthy_after_failures: default_unhealthy_after_failures(),
    }
}

pub fn default_metrics_config() -> MetricsConfig {
    MetricsConfig {
        processing_window: default_processing_window(),
        error_history_size: default_error_history_size(),
        report_interval_secs: default_report_interval_secs(),
        cleanup_interval_secs: default_cleanup_interval_secs(),
    }
}

pub fn default_storage_config() -> StorageConfig {
    StorageConfig {
        backend: default_storage_backend(),
        sqlite_path: default_sqlite_path(),
    }
}

pub fn default_alerting_config() -> AlertingConfig {
    AlertingConfig {
        enabled: false,
        webhook_url: None,
        timeout_secs: default_alert_timeout_secs(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file: default_log_file(),
        json: false,
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub fn default_true() -> bool {
    true
}

pub fn default_max_processing_time_ms() -> u64 {
    5000
}

pub fn default_credential_timeout_ms() -> u64 {
    1000
}

pub fn default_embedding_timeout_ms() -> u64 {
    2000
}

pub fn default_anomaly_timeout_ms() -> u64 {
    1500
}

pub fn default_threat_intel_timeout_ms() -> u64 {
    2500
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub fn default_cache_capacity() -> usize {
    10_000
}

pub fn default_cache_ttl_secs() -> u64 {
    3600
}

pub fn default_cache_time_bucket_secs() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

pub fn default_credential_similarity_weight() -> f64 {
    0.10
}

pub fn default_credential_similarity_threshold() -> f64 {
    0.70
}

pub fn default_suspicious_pattern_weight() -> f64 {
    0.05
}

pub fn default_attack_similarity_weight() -> f64 {
    0.15
}

pub fn default_outlier_weight() -> f64 {
    0.10
}

pub fn default_time_deviation_weight() -> f64 {
    0.05
}

pub fn default_location_deviation_weight() -> f64 {
    0.10
}

pub fn default_device_deviation_weight() -> f64 {
    0.05
}

pub fn default_frequency_weight() -> f64 {
    0.10
}

pub fn default_ip_reputation_weight() -> f64 {
    0.15
}

pub fn default_known_pattern_weight() -> f64 {
    0.15
}

pub fn default_feedback_band_low() -> f64 {
    0.45
}

pub fn default_feedback_band_high() -> f64 {
    0.80
}

pub fn default_min_history_samples() -> u32 {
    5
}

pub fn default_fallback_confidence_penalty() -> f64 {
    0.5
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

pub fn default_embedding_dimension() -> usize {
    128
}

pub fn default_cold_start_outlier_score() -> f64 {
    0.3
}

pub fn default_cluster_threshold() -> f64 {
    0.6
}

// ---------------------------------------------------------------------------
// Anomaly detection
// ---------------------------------------------------------------------------

pub fn default_frequency_window_secs() -> u64 {
    900
}

pub fn default_ip_attempt_threshold() -> usize {
    10
}

pub fn default_user_attempt_threshold() -> usize {
    5
}

pub fn default_night_start_hour() -> u32 {
    22
}

pub fn default_night_end_hour() -> u32 {
    6
}

pub fn default_unknown_location_score() -> f64 {
    0.5
}

pub fn default_new_country_score() -> f64 {
    0.7
}

// ---------------------------------------------------------------------------
// Threat intelligence
// ---------------------------------------------------------------------------

pub fn default_tor_score() -> f64 {
    0.6
}

pub fn default_vpn_score() -> f64 {
    0.2
}

pub fn default_threat_window_secs() -> u64 {
    900
}

pub fn default_brute_force_attempts() -> usize {
    10
}

pub fn default_stuffing_accounts_threshold() -> usize {
    5
}

pub fn default_distributed_ip_threshold() -> usize {
    5
}

// ---------------------------------------------------------------------------
// Learning
// ---------------------------------------------------------------------------

pub fn default_learning_queue_capacity() -> usize {
    1024
}

pub fn default_bias_step() -> f64 {
    0.05
}

pub fn default_max_user_bias() -> f64 {
    0.2
}

pub fn default_min_feedback_confidence() -> f64 {
    0.5
}

pub fn default_max_known_locations() -> usize {
    20
}

pub fn default_max_known_devices() -> usize {
    10
}

pub fn default_max_login_history() -> usize {
    50
}

pub fn default_max_typical_embeddings() -> usize {
    50
}

pub fn default_outcome_history_days() -> i64 {
    30
}

pub fn default_drain_timeout_secs() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Health / metrics
// ---------------------------------------------------------------------------

pub fn default_degraded_latency_ms() -> u64 {
    1000
}

pub fn default_unhealthy_after_failures() -> u32 {
    3
}

pub fn default_processing_window() -> usize {
    1000
}

pub fn default_error_history_size() -> usize {
    100
}

pub fn default_report_interval_secs() -> u64 {
    60
}

pub fn default_cleanup_interval_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Storage / alerting / logging
// ---------------------------------------------------------------------------

pub fn default_storage_backend() -> String {
    "memory".to_string()
}

pub fn default_sqlite_path() -> String {
    "/var/lib/loginguard/profiles.db".to_string()
}

pub fn default_alert_timeout_secs() -> u64 {
    10
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_file() -> String {
    "/var/log/loginguard/loginguard.log".to_string()
}
