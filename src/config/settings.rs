use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;

use super::defaults;

/// Top-level configuration for the loginguard risk pipeline.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_service_config")]
    pub service: ServiceConfig,

    #[serde(default = "defaults::default_cache_config")]
    pub cache: CacheConfig,

    #[serde(default = "defaults::default_scoring_config")]
    pub scoring: ScoringConfig,

    #[serde(default = "defaults::default_embedding_config")]
    pub embedding: EmbeddingConfig,

    #[serde(default = "defaults::default_anomaly_config")]
    pub anomaly: AnomalyConfig,

    #[serde(default = "defaults::default_threat_intel_config")]
    pub threat_intel: ThreatIntelConfig,

    #[serde(default = "defaults::default_learning_config")]
    pub learning: LearningConfig,

    #[serde(default = "defaults::default_health_config")]
    pub health: HealthConfig,

    #[serde(default = "defaults::default_metrics_config")]
    pub metrics: MetricsConfig,

    #[serde(default = "defaults::default_storage_config")]
    pub storage: StorageConfig,

    #[serde(default = "defaults::default_alerting_config")]
    pub alerting: AlertingConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        settings
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path))?;
        Ok(settings)
    }

    /// Reject configurations that would break scoring invariants.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        let weights = [
            ("credential_similarity_weight", s.credential_similarity_weight),
            ("suspicious_pattern_weight", s.suspicious_pattern_weight),
            ("attack_similarity_weight", s.attack_similarity_weight),
            ("outlier_weight", s.outlier_weight),
            ("time_deviation_weight", s.time_deviation_weight),
            ("location_deviation_weight", s.location_deviation_weight),
            ("device_deviation_weight", s.device_deviation_weight),
            ("frequency_weight", s.frequency_weight),
            ("ip_reputation_weight", s.ip_reputation_weight),
            ("known_pattern_weight", s.known_pattern_weight),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                bail!("scoring.{} must be a non-negative finite number, got {}", name, w);
            }
        }

        if !(0.0..=1.0).contains(&s.feedback_band_low)
            || !(0.0..=1.0).contains(&s.feedback_band_high)
            || s.feedback_band_low > s.feedback_band_high
        {
            bail!(
                "scoring feedback band [{}, {}] must be an ordered range inside [0, 1]",
                s.feedback_band_low,
                s.feedback_band_high
            );
        }

        // The global fallback is always reported as LOW.
        let fallback = self.service.fallback_risk_score;
        if !(0.0..0.30).contains(&fallback) {
            bail!(
                "service.fallback_risk_score must be in [0, 0.30) so it maps to LOW, got {}",
                fallback
            );
        }

        let svc = &self.service;
        if svc.max_processing_time_ms == 0
            || svc.credential_timeout_ms == 0
            || svc.embedding_timeout_ms == 0
            || svc.anomaly_timeout_ms == 0
            || svc.threat_intel_timeout_ms == 0
        {
            bail!("service timeouts must be greater than zero");
        }

        if self.cache.enabled && self.cache.capacity == 0 {
            bail!("cache.capacity must be greater than zero when the cache is enabled");
        }
        if self.cache.time_bucket_secs == 0 {
            bail!("cache.time_bucket_secs must be greater than zero");
        }
        if self.embedding.dimension == 0 {
            bail!("embedding.dimension must be greater than zero");
        }
        if self.learning.queue_capacity == 0 {
            bail!("learning.queue_capacity must be greater than zero");
        }

        match self.storage.backend.as_str() {
            "memory" | "sqlite" => {}
            other => bail!("storage.backend must be \"memory\" or \"sqlite\", got {:?}", other),
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: defaults::default_service_config(),
            cache: defaults::default_cache_config(),
            scoring: defaults::default_scoring_config(),
            embedding: defaults::default_embedding_config(),
            anomaly: defaults::default_anomaly_config(),
            threat_intel: defaults::default_threat_intel_config(),
            learning: defaults::default_learning_config(),
            health: defaults::default_health_config(),
            metrics: defaults::default_metrics_config(),
            storage: defaults::default_storage_config(),
            alerting: defaults::default_alerting_config(),
            logging: defaults::default_logging_config(),
        }
    }
}

/// Pipeline timing budgets, stage switches and the global fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "defaults::default_max_processing_time_ms")]
    pub max_processing_time_ms: u64,

    #[serde(default = "defaults::default_credential_timeout_ms")]
    pub credential_timeout_ms: u64,

    #[serde(default = "defaults::default_embedding_timeout_ms")]
    pub embedding_timeout_ms: u64,

    #[serde(default = "defaults::default_anomaly_timeout_ms")]
    pub anomaly_timeout_ms: u64,

    #[serde(default = "defaults::default_threat_intel_timeout_ms")]
    pub threat_intel_timeout_ms: u64,

    #[serde(default = "defaults::default_true")]
    pub enable_credential_analysis: bool,

    #[serde(default = "defaults::default_true")]
    pub enable_embedding_analysis: bool,

    #[serde(default = "defaults::default_true")]
    pub enable_anomaly_detection: bool,

    #[serde(default = "defaults::default_true")]
    pub enable_threat_intelligence: bool,

    #[serde(default)]
    pub fallback_risk_score: f64,
}

/// Decision cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "defaults::default_true")]
    pub enabled: bool,

    #[serde(default = "defaults::default_cache_capacity")]
    pub capacity: usize,

    #[serde(default = "defaults::default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Width of the time bucket folded into the cache key.
    #[serde(default = "defaults::default_cache_time_bucket_secs")]
    pub time_bucket_secs: u64,

    /// HMAC secret for cache keys. A random one is generated when empty.
    #[serde(default)]
    pub key_secret: String,
}

/// Aggregation weights and decision tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "defaults::default_credential_similarity_weight")]
    pub credential_similarity_weight: f64,

    #[serde(default = "defaults::default_credential_similarity_threshold")]
    pub credential_similarity_threshold: f64,

    #[serde(default = "defaults::default_suspicious_pattern_weight")]
    pub suspicious_pattern_weight: f64,

    #[serde(default = "defaults::default_attack_similarity_weight")]
    pub attack_similarity_weight: f64,

    #[serde(default = "defaults::default_outlier_weight")]
    pub outlier_weight: f64,

    #[serde(default = "defaults::default_time_deviation_weight")]
    pub time_deviation_weight: f64,

    #[serde(default = "defaults::default_location_deviation_weight")]
    pub location_deviation_weight: f64,

    #[serde(default = "defaults::default_device_deviation_weight")]
    pub device_deviation_weight: f64,

    #[serde(default = "defaults::default_frequency_weight")]
    pub frequency_weight: f64,

    #[serde(default = "defaults::default_ip_reputation_weight")]
    pub ip_reputation_weight: f64,

    #[serde(default = "defaults::default_known_pattern_weight")]
    pub known_pattern_weight: f64,

    #[serde(default = "defaults::default_feedback_band_low")]
    pub feedback_band_low: f64,

    #[serde(default = "defaults::default_feedback_band_high")]
    pub feedback_band_high: f64,

    #[serde(default = "defaults::default_min_history_samples")]
    pub min_history_samples: u32,

    #[serde(default = "defaults::default_fallback_confidence_penalty")]
    pub fallback_confidence_penalty: f64,
}

/// Hashing embedding backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "defaults::default_embedding_dimension")]
    pub dimension: usize,

    #[serde(default = "defaults::default_cold_start_outlier_score")]
    pub cold_start_outlier_score: f64,

    #[serde(default = "defaults::default_cluster_threshold")]
    pub cluster_threshold: f64,
}

/// Profile-based anomaly detection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "defaults::default_frequency_window_secs")]
    pub frequency_window_secs: u64,

    #[serde(default = "defaults::default_ip_attempt_threshold")]
    pub ip_attempt_threshold: usize,

    #[serde(default = "defaults::default_user_attempt_threshold")]
    pub user_attempt_threshold: usize,

    #[serde(default = "defaults::default_night_start_hour")]
    pub night_start_hour: u32,

    #[serde(default = "defaults::default_night_end_hour")]
    pub night_end_hour: u32,

    #[serde(default = "defaults::default_unknown_location_score")]
    pub unknown_location_score: f64,

    #[serde(default = "defaults::default_new_country_score")]
    pub new_country_score: f64,
}

/// Local indicator feed and attack-pattern detection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreatIntelConfig {
    #[serde(default = "defaults::default_true")]
    pub tor_detection: bool,

    #[serde(default = "defaults::default_tor_score")]
    pub tor_score: f64,

    #[serde(default = "defaults::default_vpn_score")]
    pub vpn_score: f64,

    /// Optional JSON file of indicators loaded at start-up.
    #[serde(default)]
    pub indicators_file: Option<String>,

    #[serde(default = "defaults::default_threat_window_secs")]
    pub window_secs: u64,

    #[serde(default = "defaults::default_brute_force_attempts")]
    pub brute_force_attempts: usize,

    #[serde(default = "defaults::default_stuffing_accounts_threshold")]
    pub stuffing_accounts_threshold: usize,

    #[serde(default = "defaults::default_distributed_ip_threshold")]
    pub distributed_ip_threshold: usize,
}

/// Adaptive learning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "defaults::default_true")]
    pub enabled: bool,

    #[serde(default = "defaults::default_learning_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "defaults::default_bias_step")]
    pub bias_step: f64,

    #[serde(default = "defaults::default_max_user_bias")]
    pub max_user_bias: f64,

    #[serde(default = "defaults::default_min_feedback_confidence")]
    pub min_feedback_confidence: f64,

    #[serde(default = "defaults::default_max_known_locations")]
    pub max_known_locations: usize,

    #[serde(default = "defaults::default_max_known_devices")]
    pub max_known_devices: usize,

    #[serde(default = "defaults::default_max_login_history")]
    pub max_login_history: usize,

    #[serde(default = "defaults::default_max_typical_embeddings")]
    pub max_typical_embeddings: usize,

    #[serde(default = "defaults::default_outcome_history_days")]
    pub outcome_history_days: i64,

    /// How long `shutdown` waits for queued learning jobs to drain.
    #[serde(default = "defaults::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// Component health thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "defaults::default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,

    #[serde(default = "defaults::default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,
}

/// Metrics retention and reporting cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "defaults::default_processing_window")]
    pub processing_window: usize,

    #[serde(default = "defaults::default_error_history_size")]
    pub error_history_size: usize,

    #[serde(default = "defaults::default_report_interval_secs")]
    pub report_interval_secs: u64,

    #[serde(default = "defaults::default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

/// Profile storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `memory` or `sqlite`.
    #[serde(default = "defaults::default_storage_backend")]
    pub backend: String,

    #[serde(default = "defaults::default_sqlite_path")]
    pub sqlite_path: String,
}

/// Security event delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "defaults::default_alert_timeout_secs")]
    pub timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,

    #[serde(default)]
    pub json: bool,
}
