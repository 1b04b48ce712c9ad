use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::CredentialAnalyzer;
use crate::models::analysis::{CredentialFeatures, NlpFeatures};

const MODEL_VERSION: &str = "heuristic-1.0";

const KEYBOARD_WALKS: &[&str] = &["qwerty", "asdf", "zxcv", "qazwsx", "1234", "abcd"];

const WEAK_WORDS: &[&str] = &[
    "password", "pass", "123", "admin", "user", "login", "welcome", "qwerty", "abc", "test",
    "demo",
];

/// Markers that describe the encoding of a field rather than a weakness.
/// Opaque digests are routinely hex or base64, so these never make a field
/// suspicious on their own.
const ENCODING_MARKERS: &[&str] = &["hex_encoded", "base64_encoded", "url_encoded"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Email,
    Credential,
}

// ---------------------------------------------------------------------------
// HeuristicCredentialAnalyzer
// ---------------------------------------------------------------------------

/// Rule-based credential text analysis: token statistics, entropy and a set
/// of weak-pattern detectors. Keeps no state and retains no input.
#[derive(Debug, Default)]
pub struct HeuristicCredentialAnalyzer;

impl HeuristicCredentialAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn analyze_field(&self, text: &str, field: Field) -> CredentialFeatures {
        let tokens = tokenize(text);
        let unique: HashSet<&str> = tokens.iter().copied().collect();
        let unique_token_ratio = if tokens.is_empty() {
            0.0
        } else {
            unique.len() as f64 / tokens.len() as f64
        };

        let entropy = shannon_entropy(text);
        let pattern_types = detect_patterns(text, entropy, field);
        let suspicious_patterns = pattern_types
            .iter()
            .any(|p| !ENCODING_MARKERS.contains(&p.as_str()));

        CredentialFeatures {
            token_count: tokens.len(),
            unique_token_ratio,
            entropy_score: entropy,
            language: detect_language(text).to_string(),
            suspicious_patterns,
            pattern_types,
        }
    }
}

#[async_trait]
impl CredentialAnalyzer for HeuristicCredentialAnalyzer {
    async fn analyze(&self, email: &str, credential_digest: &str) -> Result<NlpFeatures> {
        let start = Instant::now();

        let email_features = self.analyze_field(email, Field::Email);
        let mut credential_features = self.analyze_field(credential_digest, Field::Credential);

        for pattern in cross_field_patterns(email, credential_digest) {
            if !credential_features.pattern_types.contains(&pattern) {
                credential_features.pattern_types.push(pattern);
            }
            credential_features.suspicious_patterns = true;
        }

        let credential_similarity = credential_similarity(email, credential_digest);
        let language_consistency = email_features.language == credential_features.language
            || email_features.language == "unknown"
            || credential_features.language == "unknown";

        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        debug!(
            similarity = credential_similarity,
            email_patterns = ?email_features.pattern_types,
            credential_patterns = ?credential_features.pattern_types,
            "Credential analysis complete"
        );

        Ok(NlpFeatures {
            email_features,
            credential_features,
            credential_similarity,
            language_consistency,
            processing_time_ms,
            used_fallback: false,
            model_version: MODEL_VERSION.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Text statistics
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Shannon entropy of the character distribution, in bits.
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

fn detect_language(text: &str) -> &'static str {
    if text.trim().is_empty() {
        "unknown"
    } else if text.is_ascii() {
        "en"
    } else {
        "multi"
    }
}

fn detect_patterns(text: &str, entropy: f64, field: Field) -> Vec<String> {
    let mut patterns = Vec::new();
    let lower = text.to_lowercase();
    let len = text.chars().count();
    if len == 0 {
        return patterns;
    }

    if KEYBOARD_WALKS.iter().any(|w| lower.contains(w)) {
        patterns.push("keyboard_pattern".to_string());
    }
    // Email addresses legitimately contain words like "user" or "test".
    let subject = match field {
        Field::Email => lower.split('@').next().unwrap_or(""),
        Field::Credential => lower.as_str(),
    };
    if WEAK_WORDS.iter().any(|w| subject.contains(w)) {
        patterns.push("common_password".to_string());
    }

    if entropy < 1.0 {
        patterns.push("low_entropy".to_string());
    } else if entropy < 2.0 && len > 4 {
        patterns.push("moderate_low_entropy".to_string());
    }

    let mut freq: HashMap<char, usize> = HashMap::new();
    for c in text.chars() {
        *freq.entry(c).or_insert(0) += 1;
    }
    let max_freq = freq.values().copied().max().unwrap_or(0);
    if len >= 4 && max_freq as f64 / len as f64 >= 0.5 {
        patterns.push("character_dominance".to_string());
    }

    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    if digits as f64 / len as f64 > 0.7 {
        patterns.push("numeric_dominance".to_string());
    }

    if field == Field::Credential {
        let specials = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
            .count();
        if specials as f64 / len as f64 > 0.3 {
            patterns.push("high_special_chars".to_string());
        }

        if len >= 16 && text.chars().all(|c| c.is_ascii_hexdigit()) {
            patterns.push("hex_encoded".to_string());
        } else if len >= 16
            && len % 4 == 0
            && text
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
        {
            patterns.push("base64_encoded".to_string());
        }
        if is_url_encoded(text) {
            patterns.push("url_encoded".to_string());
        }
    }

    patterns
}

fn is_url_encoded(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.windows(3).any(|w| {
        w[0] == b'%' && (w[1] as char).is_ascii_hexdigit() && (w[2] as char).is_ascii_hexdigit()
    })
}

// ---------------------------------------------------------------------------
// Cross-field checks
// ---------------------------------------------------------------------------

fn split_email(email: &str) -> (String, String) {
    let lower = email.trim().to_lowercase();
    match lower.split_once('@') {
        Some((local, domain)) => {
            let stem = domain.split('.').next().unwrap_or("").to_string();
            (local.to_string(), stem)
        }
        None => (lower, String::new()),
    }
}

/// Jaccard similarity of the character sets of the email local part and the
/// credential, raised to at least 0.8 when the credential embeds the local part.
pub fn credential_similarity(email: &str, credential: &str) -> f64 {
    let (local, _) = split_email(email);
    let credential = credential.to_lowercase();
    if local.is_empty() || credential.is_empty() {
        return 0.0;
    }

    let a: HashSet<char> = local.chars().collect();
    let b: HashSet<char> = credential.chars().collect();
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    let mut sim = if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    };

    if local.chars().count() >= 3 && credential.contains(&local) {
        sim = sim.max(0.8);
    }
    sim.clamp(0.0, 1.0)
}

fn cross_field_patterns(email: &str, credential: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let (local, stem) = split_email(email);
    let credential_lower = credential.to_lowercase();

    let reused = [local.as_str(), stem.as_str()]
        .iter()
        .any(|part| part.chars().count() > 3 && credential_lower.contains(part));
    if reused {
        patterns.push("credential_reuse_pattern".to_string());
    }

    let at_count = email.matches('@').count();
    if email.trim().chars().count() < 6 || credential.chars().count() < 10 || at_count != 1 {
        patterns.push("weak_combination".to_string());
    }

    patterns
}
