use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::ThreatIntelligenceAnalyzer;
use crate::config::settings::ThreatIntelConfig;
use crate::models::analysis::{
    clamp_unit, AccountTakeoverIndicators, BruteForceIndicators, CredentialStuffingIndicators,
    ThreatAnalysis,
};
use crate::models::context::AuthContext;
use crate::storage::memory::WindowStore;

// ---------------------------------------------------------------------------
// Indicator types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Ip,
    Cidr,
    UserAgent,
    EmailDomain,
    CredentialDigest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Suspicious,
    Malicious,
    Critical,
}

impl Severity {
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Suspicious => 0.3,
            Severity::Malicious => 0.6,
            Severity::Critical => 0.8,
        }
    }
}

/// One entry of the indicator database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatIndicator {
    pub kind: IndicatorKind,
    pub value: String,
    pub severity: Severity,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_confidence() -> f64 {
    1.0
}

fn default_source() -> String {
    "local".to_string()
}

impl ThreatIndicator {
    pub fn new(kind: IndicatorKind, value: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind,
            value: value.into(),
            severity,
            confidence: 1.0,
            tags: Vec::new(),
            campaign_id: None,
            source: default_source(),
            expires_at: None,
        }
    }

    pub fn score(&self) -> f64 {
        clamp_unit(self.severity.weight() * self.confidence)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Everything the feed knows about one attempt.
#[derive(Debug, Clone, Default)]
pub struct FeedVerdict {
    pub matches: Vec<ThreatIndicator>,
    pub tor_exit: bool,
}

/// Source of reputation data. Implementations may call out to a remote
/// service; the analyzer only needs a verdict per attempt.
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    async fn lookup(&self, context: &AuthContext) -> Result<FeedVerdict>;

    fn cleanup(&self) {}
}

// ---------------------------------------------------------------------------
// LocalIndicatorFeed
// ---------------------------------------------------------------------------

/// Well-known Tor exit ranges (representative sample).
const TOR_EXIT_RANGES: &[&str] = &[
    "185.220.100.0/22",
    "199.249.230.0/24",
    "109.70.100.0/24",
    "162.247.74.0/24",
    "204.85.191.0/24",
    "171.25.193.0/24",
];

/// In-process indicator database keyed by indicator kind.
pub struct LocalIndicatorFeed {
    ips: DashMap<IpAddr, ThreatIndicator>,
    cidrs: DashMap<IpNet, ThreatIndicator>,
    user_agents: DashMap<String, ThreatIndicator>,
    email_domains: DashMap<String, ThreatIndicator>,
    credential_digests: DashMap<String, ThreatIndicator>,
    tor_ranges: Vec<IpNet>,
}

impl LocalIndicatorFeed {
    pub fn new(config: &ThreatIntelConfig) -> Self {
        let tor_ranges = if config.tor_detection {
            TOR_EXIT_RANGES.iter().filter_map(|r| r.parse().ok()).collect()
        } else {
            Vec::new()
        };

        let feed = Self {
            ips: DashMap::new(),
            cidrs: DashMap::new(),
            user_agents: DashMap::new(),
            email_domains: DashMap::new(),
            credential_digests: DashMap::new(),
            tor_ranges,
        };
        feed.load_builtin();

        info!(
            "Threat indicator feed initialized ({} indicators, {} tor ranges)",
            feed.len(),
            feed.tor_ranges.len()
        );
        feed
    }

    /// Indicators shipped with the binary: tooling commonly seen in
    /// credential attacks.
    fn load_builtin(&self) {
        let tools = [
            ("sentry mba", Severity::Critical, "credential_stuffing"),
            ("openbullet", Severity::Critical, "credential_stuffing"),
            ("hydra", Severity::Malicious, "brute_force"),
            ("medusa", Severity::Malicious, "brute_force"),
            ("masscan", Severity::Suspicious, "scanner"),
            ("zgrab", Severity::Suspicious, "scanner"),
        ];
        for (ua, severity, tag) in tools {
            let mut indicator = ThreatIndicator::new(IndicatorKind::UserAgent, ua, severity);
            indicator.tags.push(tag.to_string());
            indicator.source = "builtin".to_string();
            self.add(indicator);
        }
    }

    /// Insert or replace an indicator. Invalid IP/CIDR values are skipped.
    pub fn add(&self, indicator: ThreatIndicator) -> bool {
        let value = indicator.value.trim().to_lowercase();
        match indicator.kind {
            IndicatorKind::Ip => match value.parse::<IpAddr>() {
                Ok(ip) => {
                    self.ips.insert(ip, indicator);
                }
                Err(_) => {
                    warn!(value = %indicator.value, "Skipping invalid IP indicator");
                    return false;
                }
            },
            IndicatorKind::Cidr => match value.parse::<IpNet>() {
                Ok(net) => {
                    self.cidrs.insert(net.trunc(), indicator);
                }
                Err(_) => {
                    warn!(value = %indicator.value, "Skipping invalid CIDR indicator");
                    return false;
                }
            },
            IndicatorKind::UserAgent => {
                self.user_agents.insert(value, indicator);
            }
            IndicatorKind::EmailDomain => {
                self.email_domains.insert(value, indicator);
            }
            IndicatorKind::CredentialDigest => {
                self.credential_digests.insert(value, indicator);
            }
        }
        true
    }

    /// Load a JSON array of indicators. Returns how many were accepted.
    pub fn load_file(&self, path: &str) -> Result<usize> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read indicator file: {}", path))?;
        let indicators: Vec<ThreatIndicator> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse indicator file: {}", path))?;

        let mut accepted = 0;
        for indicator in indicators {
            if self.add(indicator) {
                accepted += 1;
            }
        }
        info!("Loaded {} threat indicators from {}", accepted, path);
        Ok(accepted)
    }

    pub fn is_tor_exit(&self, ip: &IpAddr) -> bool {
        self.tor_ranges.iter().any(|net| net.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.ips.len()
            + self.cidrs.len()
            + self.user_agents.len()
            + self.email_domains.len()
            + self.credential_digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ThreatFeed for LocalIndicatorFeed {
    async fn lookup(&self, context: &AuthContext) -> Result<FeedVerdict> {
        let now = Utc::now();
        let mut matches = Vec::new();
        let mut push = |indicator: &ThreatIndicator| {
            if !indicator.is_expired(now) {
                matches.push(indicator.clone());
            }
        };

        if let Some(entry) = self.ips.get(&context.client_ip) {
            push(entry.value());
        }
        for entry in self.cidrs.iter() {
            if entry.key().contains(&context.client_ip) {
                push(entry.value());
            }
        }

        let ua = context.user_agent.to_lowercase();
        for entry in self.user_agents.iter() {
            if !entry.key().is_empty() && ua.contains(entry.key().as_str()) {
                push(entry.value());
            }
        }

        let domain = context.email_domain().to_lowercase();
        if let Some(entry) = self.email_domains.get(&domain) {
            push(entry.value());
        }

        let digest = context.credential_digest.trim().to_lowercase();
        if let Some(entry) = self.credential_digests.get(&digest) {
            push(entry.value());
        }

        Ok(FeedVerdict {
            matches,
            tor_exit: self.is_tor_exit(&context.client_ip),
        })
    }

    fn cleanup(&self) {
        let now = Utc::now();
        self.ips.retain(|_, i| !i.is_expired(now));
        self.cidrs.retain(|_, i| !i.is_expired(now));
        self.user_agents.retain(|_, i| !i.is_expired(now));
        self.email_domains.retain(|_, i| !i.is_expired(now));
        self.credential_digests.retain(|_, i| !i.is_expired(now));
    }
}

// ---------------------------------------------------------------------------
// IndicatorThreatAnalyzer
// ---------------------------------------------------------------------------

/// Combines feed verdicts with sliding-window attack detection.
pub struct IndicatorThreatAnalyzer {
    feed: Arc<dyn ThreatFeed>,
    /// IP -> attempted accounts.
    by_ip: WindowStore,
    /// account -> source IPs.
    by_account: WindowStore,
    /// credential fingerprint -> accounts it was tried against.
    by_credential: WindowStore,
    config: ThreatIntelConfig,
}

impl IndicatorThreatAnalyzer {
    pub fn new(config: &ThreatIntelConfig, feed: Arc<dyn ThreatFeed>) -> Self {
        Self {
            feed,
            by_ip: WindowStore::new(config.window_secs),
            by_account: WindowStore::new(config.window_secs),
            by_credential: WindowStore::new(config.window_secs),
            config: config.clone(),
        }
    }
}

/// Short non-reversible tag for a credential digest, so raw digests are not
/// kept in memory longer than the request.
fn credential_tag(digest: &str) -> String {
    let hash = Sha256::digest(digest.as_bytes());
    hash[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Stable campaign id for a source network (/24 for v4, /48 for v6).
fn network_campaign_id(ip: &IpAddr) -> String {
    let network = match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}::/48", s[0], s[1], s[2])
        }
    };
    let hash = Sha256::digest(network.as_bytes());
    let suffix: String = hash[..4].iter().map(|b| format!("{:02x}", b)).collect();
    format!("campaign-{}", suffix)
}

fn time_pattern_score(mean_interval: Option<f64>, attempts: usize) -> f64 {
    match mean_interval {
        Some(gap) if attempts >= 3 => {
            if gap < 2.0 {
                1.0
            } else if gap < 10.0 {
                0.6
            } else if gap < 60.0 {
                0.3
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

#[async_trait]
impl ThreatIntelligenceAnalyzer for IndicatorThreatAnalyzer {
    async fn analyze(&self, context: &AuthContext) -> Result<ThreatAnalysis> {
        let verdict = self.feed.lookup(context).await?;
        let now = context.timestamp;
        let account = context.normalized_email();
        let ip = context.client_ip.to_string();

        let (ip_attempts, accounts_from_ip) = self.by_ip.record(&ip, now, &account);
        let (account_attempts, ips_for_account) = self.by_account.record(&account, now, &ip);
        let (_, accounts_for_credential) =
            self.by_credential
                .record(&credential_tag(&context.credential_digest), now, &account);

        let tor = context.is_tor_exit_node || verdict.tor_exit;

        // Noisy-or over independent signals keeps the result inside [0, 1].
        let mut signals = vec![clamp_unit(context.threat_intel_score)];
        signals.extend(
            verdict
                .matches
                .iter()
                .filter(|m| matches!(m.kind, IndicatorKind::Ip | IndicatorKind::Cidr | IndicatorKind::UserAgent))
                .map(ThreatIndicator::score),
        );
        if tor && self.config.tor_detection {
            signals.push(clamp_unit(self.config.tor_score));
        }
        if context.is_vpn {
            signals.push(clamp_unit(self.config.vpn_score));
        }
        let ip_reputation_score =
            clamp_unit(1.0 - signals.iter().fold(1.0, |acc, s| acc * (1.0 - s)));

        let brute_force_indicators = BruteForceIndicators {
            rapid_attempts: account_attempts >= self.config.brute_force_attempts
                || ip_attempts >= self.config.brute_force_attempts,
            multiple_ips: ips_for_account >= self.config.distributed_ip_threshold,
            time_pattern_score: time_pattern_score(
                self.by_account.mean_interval_secs(&account, now),
                account_attempts,
            ),
        };

        let credential_stuffing_indicators = CredentialStuffingIndicators {
            password_reuse: accounts_for_credential >= 3,
            multiple_accounts: accounts_from_ip >= self.config.stuffing_accounts_threshold,
            common_passwords: verdict
                .matches
                .iter()
                .any(|m| m.kind == IndicatorKind::CredentialDigest),
        };

        let account_takeover_indicators = AccountTakeoverIndicators {
            location_change: context
                .geolocation
                .as_ref()
                .is_some_and(|g| !g.is_usual_location),
            device_change: context.device_fingerprint.as_deref().map_or(true, str::is_empty),
            behavior_change: context.previous_failed_attempts >= 3 && (tor || context.is_vpn),
        };

        let mut patterns = Vec::new();
        if brute_force_indicators.rapid_attempts || brute_force_indicators.multiple_ips {
            patterns.push("brute_force".to_string());
        }
        if credential_stuffing_indicators.multiple_accounts
            || credential_stuffing_indicators.password_reuse
        {
            patterns.push("credential_stuffing".to_string());
        }
        let ato_signals = [
            account_takeover_indicators.location_change,
            account_takeover_indicators.device_change,
            account_takeover_indicators.behavior_change,
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if ato_signals >= 2 && (context.previous_failed_attempts > 0 || tor || context.is_vpn) {
            patterns.push("account_takeover".to_string());
        }
        if tor && context.previous_failed_attempts > 0 {
            patterns.push("tor_abuse".to_string());
        }
        if verdict.matches.iter().any(|m| {
            matches!(m.kind, IndicatorKind::Ip | IndicatorKind::Cidr) && m.severity >= Severity::Malicious
        }) {
            patterns.push("known_malicious_ip".to_string());
        }

        let mut actors = BTreeSet::new();
        for m in &verdict.matches {
            for tag in &m.tags {
                match tag.to_lowercase().as_str() {
                    "apt" => actors.insert("apt_group".to_string()),
                    "botnet" => actors.insert("botnet".to_string()),
                    "scanner" => actors.insert("scanner".to_string()),
                    "credential_stuffing" => actors.insert("stuffing_toolkit".to_string()),
                    "brute_force" => actors.insert("brute_force_toolkit".to_string()),
                    _ => false,
                };
            }
        }
        if tor {
            actors.insert("tor_user".to_string());
        }
        if context.is_vpn {
            actors.insert("vpn_user".to_string());
        }

        let similar_attacks_detected = if patterns.is_empty() {
            0
        } else {
            accounts_from_ip.saturating_sub(1) as u32
        };

        let attack_campaign_correlation = verdict
            .matches
            .iter()
            .find_map(|m| m.campaign_id.clone())
            .or_else(|| {
                credential_stuffing_indicators
                    .multiple_accounts
                    .then(|| network_campaign_id(&context.client_ip))
            });

        debug!(
            request_id = %context.request_id,
            ip = %context.client_ip,
            reputation = ip_reputation_score,
            patterns = ?patterns,
            indicator_matches = verdict.matches.len(),
            "Threat analysis complete"
        );

        Ok(ThreatAnalysis {
            ip_reputation_score,
            known_attack_patterns: patterns,
            threat_actor_indicators: actors.into_iter().collect(),
            brute_force_indicators,
            credential_stuffing_indicators,
            account_takeover_indicators,
            similar_attacks_detected,
            attack_campaign_correlation,
            used_fallback: false,
        })
    }

    fn cleanup(&self) {
        self.by_ip.cleanup();
        self.by_account.cleanup();
        self.by_credential.cleanup();
        self.feed.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_threat_intel_config;
    use chrono::Duration;

    fn attempt(email: &str, ip: &str) -> AuthContext {
        let mut ctx = AuthContext::new(email, "0f0e0d0c0b0a", ip.parse().unwrap(), "Mozilla/5.0");
        ctx.device_fingerprint = Some("fp".into());
        ctx
    }

    fn analyzer_with(feed: LocalIndicatorFeed) -> IndicatorThreatAnalyzer {
        IndicatorThreatAnalyzer::new(&default_threat_intel_config(), Arc::new(feed))
    }

    #[tokio::test]
    async fn test_clean_attempt_is_neutral() {
        let analyzer = analyzer_with(LocalIndicatorFeed::new(&default_threat_intel_config()));
        let result = analyzer.analyze(&attempt("erin@example.com", "198.51.100.9")).await.unwrap();
        assert_eq!(result.ip_reputation_score, 0.0);
        assert!(result.known_attack_patterns.is_empty());
        assert!(result.attack_campaign_correlation.is_none());
        assert!(!result.used_fallback);
    }

    #[tokio::test]
    async fn test_cidr_indicator_scores_and_tags() {
        let feed = LocalIndicatorFeed::new(&default_threat_intel_config());
        let mut indicator = ThreatIndicator::new(IndicatorKind::Cidr, "203.0.113.0/24", Severity::Malicious);
        indicator.confidence = 0.5;
        indicator.tags = vec!["botnet".into()];
        indicator.campaign_id = Some("camp-7".into());
        assert!(feed.add(indicator));

        let analyzer = analyzer_with(feed);
        let result = analyzer.analyze(&attempt("erin@example.com", "203.0.113.77")).await.unwrap();
        assert!((result.ip_reputation_score - 0.3).abs() < 1e-9);
        assert!(result.known_attack_patterns.contains(&"known_malicious_ip".to_string()));
        assert!(result.threat_actor_indicators.contains(&"botnet".to_string()));
        assert_eq!(result.attack_campaign_correlation.as_deref(), Some("camp-7"));
    }

    #[tokio::test]
    async fn test_tor_range_detected() {
        let feed = LocalIndicatorFeed::new(&default_threat_intel_config());
        assert!(feed.is_tor_exit(&"185.220.101.4".parse().unwrap()));
        let analyzer = analyzer_with(feed);
        let mut ctx = attempt("erin@example.com", "185.220.101.4");
        ctx.previous_failed_attempts = 2;
        let result = analyzer.analyze(&ctx).await.unwrap();
        assert!((result.ip_reputation_score - 0.6).abs() < 1e-9);
        assert!(result.known_attack_patterns.contains(&"tor_abuse".to_string()));
        assert!(result.threat_actor_indicators.contains(&"tor_user".to_string()));
    }

    #[tokio::test]
    async fn test_credential_stuffing_from_one_ip() {
        let analyzer = analyzer_with(LocalIndicatorFeed::new(&default_threat_intel_config()));
        let start = Utc::now();
        let mut last = None;
        for i in 0..6 {
            let mut ctx = attempt(&format!("victim{}@example.com", i), "192.0.2.50");
            ctx.credential_digest = format!("digest-{}", i);
            ctx.timestamp = start + Duration::seconds(i);
            last = Some(analyzer.analyze(&ctx).await.unwrap());
        }
        let result = last.unwrap();
        assert!(result.credential_stuffing_indicators.multiple_accounts);
        assert!(result.known_attack_patterns.contains(&"credential_stuffing".to_string()));
        assert_eq!(result.similar_attacks_detected, 5);
        let campaign = result.attack_campaign_correlation.unwrap();
        assert!(campaign.starts_with("campaign-"));
        assert_eq!(campaign, network_campaign_id(&"192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_brute_force_rapid_attempts() {
        let analyzer = analyzer_with(LocalIndicatorFeed::new(&default_threat_intel_config()));
        let start = Utc::now();
        let mut last = None;
        for i in 0..10 {
            let mut ctx = attempt("frank@example.com", "192.0.2.60");
            ctx.timestamp = start + Duration::milliseconds(500 * i);
            last = Some(analyzer.analyze(&ctx).await.unwrap());
        }
        let result = last.unwrap();
        assert!(result.brute_force_indicators.rapid_attempts);
        assert_eq!(result.brute_force_indicators.time_pattern_score, 1.0);
        assert!(result.known_attack_patterns.contains(&"brute_force".to_string()));
    }

    #[tokio::test]
    async fn test_builtin_tool_user_agent() {
        let analyzer = analyzer_with(LocalIndicatorFeed::new(&default_threat_intel_config()));
        let mut ctx = attempt("gina@example.com", "198.51.100.31");
        ctx.user_agent = "OpenBullet/1.4".into();
        let result = analyzer.analyze(&ctx).await.unwrap();
        assert!((result.ip_reputation_score - 0.8).abs() < 1e-9);
        assert!(result.threat_actor_indicators.contains(&"stuffing_toolkit".to_string()));
    }

    #[test]
    fn test_expired_indicators_are_cleaned() {
        let feed = LocalIndicatorFeed::new(&default_threat_intel_config());
        let before = feed.len();
        let mut indicator = ThreatIndicator::new(IndicatorKind::Ip, "192.0.2.99", Severity::Suspicious);
        indicator.expires_at = Some(Utc::now() - Duration::minutes(1));
        feed.add(indicator);
        assert_eq!(feed.len(), before + 1);
        ThreatFeed::cleanup(&feed);
        assert_eq!(feed.len(), before);
    }

    #[test]
    fn test_invalid_network_indicator_rejected() {
        let feed = LocalIndicatorFeed::new(&default_threat_intel_config());
        assert!(!feed.add(ThreatIndicator::new(IndicatorKind::Cidr, "not-a-cidr", Severity::Critical)));
        assert!(!feed.add(ThreatIndicator::new(IndicatorKind::Ip, "999.1.1.1", Severity::Critical)));
    }
}
