use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Timelike, Weekday};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::BehavioralEmbeddingAnalyzer;
use crate::config::settings::EmbeddingConfig;
use crate::models::analysis::{clamp_unit, EmbeddingAnalysis};
use crate::models::context::AuthContext;
use crate::storage::profile::ProfileStore;

const MODEL_VERSION: &str = "feature-hash-v1";

const SCRIPTED_AGENTS: &[&str] = &[
    "curl", "python", "wget", "go-http", "java/", "okhttp", "scrapy", "httpclient", "bot",
    "headless",
];

/// Token sets describing known attack shapes, embedded at construction.
const ATTACK_PROTOTYPES: &[(&str, &[&str])] = &[
    (
        "credential_stuffing",
        &["failed:many", "threat:medium", "ua_family:script", "device:missing", "geo:unknown"],
    ),
    (
        "brute_force",
        &["failed:excessive", "threat:high", "ua_family:script", "device:missing", "night_time"],
    ),
    (
        "account_takeover",
        &["vpn_connection", "failed:few", "threat:medium", "device:missing", "night_time"],
    ),
    (
        "tor_abuse",
        &["tor_exit", "threat:high", "failed:many", "device:missing", "geo:unknown"],
    ),
];

// ---------------------------------------------------------------------------
// HashingEmbeddingAnalyzer
// ---------------------------------------------------------------------------

/// Embeds a login context by feature-hashing descriptive tokens into a
/// signed, L2-normalized vector. Contexts that share tokens (same country,
/// same hour, same device) land close together.
pub struct HashingEmbeddingAnalyzer {
    profiles: Arc<dyn ProfileStore>,
    attack_centroids: Vec<(String, Vec<f32>)>,
    config: EmbeddingConfig,
}

impl HashingEmbeddingAnalyzer {
    pub fn new(config: &EmbeddingConfig, profiles: Arc<dyn ProfileStore>) -> Self {
        let attack_centroids = ATTACK_PROTOTYPES
            .iter()
            .map(|(name, tokens)| {
                let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
                (name.to_string(), hash_embedding(&tokens, config.dimension))
            })
            .collect();

        Self {
            profiles,
            attack_centroids,
            config: config.clone(),
        }
    }

    /// Nearest attack centroid and its similarity.
    fn nearest_attack(&self, vector: &[f32]) -> (Option<&str>, f64) {
        let mut best: (Option<&str>, f64) = (None, 0.0);
        for (name, centroid) in &self.attack_centroids {
            let sim = clamp_unit(cosine_similarity(vector, centroid));
            if sim > best.1 {
                best = (Some(name.as_str()), sim);
            }
        }
        best
    }
}

#[async_trait]
impl BehavioralEmbeddingAnalyzer for HashingEmbeddingAnalyzer {
    async fn embed(&self, context: &AuthContext) -> Result<EmbeddingAnalysis> {
        let start = Instant::now();
        let tokens = context_tokens(context);
        let vector = hash_embedding(&tokens, self.config.dimension);

        Ok(EmbeddingAnalysis {
            embedding_vector: vector,
            similarity_to_user_profile: 0.0,
            similarity_to_attack_patterns: 0.0,
            cluster_assignment: None,
            outlier_score: 0.0,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            model_version: MODEL_VERSION.to_string(),
            used_fallback: false,
        })
    }

    async fn score_anomalies(
        &self,
        context: &AuthContext,
        mut embedding: EmbeddingAnalysis,
    ) -> Result<EmbeddingAnalysis> {
        let start = Instant::now();
        let profile = self.profiles.load(&context.profile_key()).await?;

        let vector = &embedding.embedding_vector;
        let history: Vec<&Vec<f32>> = profile
            .as_ref()
            .map(|p| {
                p.typical_embeddings
                    .iter()
                    .filter(|e| e.len() == vector.len())
                    .collect()
            })
            .unwrap_or_default();

        if history.is_empty() {
            embedding.similarity_to_user_profile = 0.0;
            embedding.outlier_score = clamp_unit(self.config.cold_start_outlier_score);
        } else {
            let best = history
                .iter()
                .map(|h| clamp_unit(cosine_similarity(vector, h)))
                .fold(0.0_f64, f64::max);
            embedding.similarity_to_user_profile = best;
            embedding.outlier_score = clamp_unit(1.0 - best);
        }

        let (cluster, attack_sim) = self.nearest_attack(vector);
        embedding.similarity_to_attack_patterns = attack_sim;
        embedding.cluster_assignment = cluster
            .filter(|_| attack_sim >= self.config.cluster_threshold)
            .map(str::to_string);
        embedding.processing_time_ms += start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            request_id = %context.request_id,
            profile_similarity = embedding.similarity_to_user_profile,
            attack_similarity = attack_sim,
            outlier = embedding.outlier_score,
            cluster = ?embedding.cluster_assignment,
            "Embedding analysis complete"
        );

        Ok(embedding)
    }
}

// ---------------------------------------------------------------------------
// Feature hashing
// ---------------------------------------------------------------------------

fn is_scripted_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    ua.trim().is_empty() || SCRIPTED_AGENTS.iter().any(|s| ua.contains(s))
}

/// Descriptive tokens for a login context.
pub fn context_tokens(ctx: &AuthContext) -> Vec<String> {
    let mut tokens = Vec::with_capacity(16);
    let ts = ctx.timestamp;
    let hour = ts.hour();
    let weekday = ts.weekday();
    let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);

    tokens.push(format!("domain:{}", ctx.email_domain().to_lowercase()));
    tokens.push(format!("hour:{}", hour));
    tokens.push(format!("weekday:{}", weekday));
    if weekend {
        tokens.push("weekend".to_string());
    } else if (9..=17).contains(&hour) {
        tokens.push("business_hours".to_string());
    }
    if !(6..=22).contains(&hour) {
        tokens.push("night_time".to_string());
    }

    match &ctx.geolocation {
        Some(geo) => {
            tokens.push(format!("country:{}", geo.country.to_uppercase()));
            if let Some(tz) = &geo.timezone {
                tokens.push(format!("tz:{}", tz));
            }
        }
        None => tokens.push("geo:unknown".to_string()),
    }

    let ua_digest = Sha256::digest(ctx.user_agent.as_bytes());
    tokens.push(format!("ua:{:02x}{:02x}{:02x}{:02x}", ua_digest[0], ua_digest[1], ua_digest[2], ua_digest[3]));
    if is_scripted_agent(&ctx.user_agent) {
        tokens.push("ua_family:script".to_string());
    }

    match &ctx.device_fingerprint {
        Some(fp) if !fp.is_empty() => tokens.push(format!("device:{}", fp)),
        _ => tokens.push("device:missing".to_string()),
    }

    if ctx.is_tor_exit_node {
        tokens.push("tor_exit".to_string());
    }
    if ctx.is_vpn {
        tokens.push("vpn_connection".to_string());
    }

    let threat = if ctx.threat_intel_score > 0.7 {
        "threat:high"
    } else if ctx.threat_intel_score > 0.3 {
        "threat:medium"
    } else {
        "threat:low"
    };
    tokens.push(threat.to_string());

    let failed = match ctx.previous_failed_attempts {
        0 => "failed:none",
        1..=2 => "failed:few",
        3..=9 => "failed:many",
        _ => "failed:excessive",
    };
    tokens.push(failed.to_string());

    tokens
}

/// Signed feature hashing into `dimension` buckets, L2-normalized.
pub fn hash_embedding(tokens: &[String], dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension.max(1)];
    for token in tokens {
        let digest = Sha256::digest(token.as_bytes());
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(idx_bytes) % vector.len() as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_embedding_config;
    use crate::models::context::GeoLocation;
    use crate::models::profile::BehavioralProfile;
    use crate::storage::memory::MemoryProfileStore;
    use chrono::{TimeZone, Utc};

    fn office_login() -> AuthContext {
        let mut ctx = AuthContext::new(
            "carol@example.com",
            "digest",
            "198.51.100.20".parse().unwrap(),
            "Mozilla/5.0 (Macintosh) Safari/605.1",
        );
        ctx.timestamp = Utc.with_ymd_and_hms(2024, 4, 9, 10, 15, 0).unwrap();
        ctx.device_fingerprint = Some("fp-carol-laptop".into());
        ctx.geolocation = Some(GeoLocation {
            country: "NL".into(),
            region: None,
            city: Some("Utrecht".into()),
            latitude: None,
            longitude: None,
            timezone: Some("Europe/Amsterdam".into()),
            is_usual_location: false,
        });
        ctx
    }

    fn tor_attack() -> AuthContext {
        let mut ctx = AuthContext::new(
            "carol@example.com",
            "digest",
            "203.0.113.66".parse().unwrap(),
            "python-requests/2.31",
        );
        ctx.timestamp = Utc.with_ymd_and_hms(2024, 4, 9, 3, 0, 0).unwrap();
        ctx.is_tor_exit_node = true;
        ctx.threat_intel_score = 0.9;
        ctx.previous_failed_attempts = 6;
        ctx
    }

    #[test]
    fn test_hash_embedding_is_deterministic_and_normalized() {
        let tokens = context_tokens(&office_login());
        let a = hash_embedding(&tokens, 64);
        let b = hash_embedding(&tokens, 64);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cold_start_uses_configured_outlier() {
        let config = default_embedding_config();
        let analyzer = HashingEmbeddingAnalyzer::new(&config, Arc::new(MemoryProfileStore::new()));
        let ctx = office_login();
        let emb = analyzer.embed(&ctx).await.unwrap();
        let scored = analyzer.score_anomalies(&ctx, emb).await.unwrap();
        assert_eq!(scored.similarity_to_user_profile, 0.0);
        assert_eq!(scored.outlier_score, config.cold_start_outlier_score);
        assert!(!scored.used_fallback);
    }

    #[tokio::test]
    async fn test_known_context_is_not_an_outlier() {
        let config = default_embedding_config();
        let store = Arc::new(MemoryProfileStore::new());
        let analyzer = HashingEmbeddingAnalyzer::new(&config, store.clone());
        let ctx = office_login();

        let mut profile = BehavioralProfile::new(ctx.profile_key());
        let baseline = analyzer.embed(&ctx).await.unwrap();
        profile.typical_embeddings.push_back(baseline.embedding_vector);
        store.save(&profile).await.unwrap();

        let emb = analyzer.embed(&ctx).await.unwrap();
        let scored = analyzer.score_anomalies(&ctx, emb).await.unwrap();
        assert!(scored.similarity_to_user_profile > 0.99);
        assert!(scored.outlier_score < 0.01);
    }

    #[tokio::test]
    async fn test_attack_context_is_closer_to_attack_centroids() {
        let config = default_embedding_config();
        let analyzer = HashingEmbeddingAnalyzer::new(&config, Arc::new(MemoryProfileStore::new()));

        let benign_ctx = office_login();
        let benign = analyzer.embed(&benign_ctx).await.unwrap();
        let benign = analyzer.score_anomalies(&benign_ctx, benign).await.unwrap();

        let attack_ctx = tor_attack();
        let attack = analyzer.embed(&attack_ctx).await.unwrap();
        let attack = analyzer.score_anomalies(&attack_ctx, attack).await.unwrap();

        assert!(attack.similarity_to_attack_patterns > benign.similarity_to_attack_patterns);
        assert!(attack.similarity_to_attack_patterns > 0.4);
        assert!(benign.cluster_assignment.is_none());
    }
}
