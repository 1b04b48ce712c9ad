use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Timelike, Weekday};
use tracing::debug;

use super::AnomalyDetectionEngine;
use crate::config::settings::AnomalyConfig;
use crate::models::analysis::{clamp_unit, BehavioralAnalysis};
use crate::models::context::AuthContext;
use crate::models::profile::BehavioralProfile;
use crate::storage::memory::WindowStore;
use crate::storage::profile::ProfileStore;

/// Look-back used for the success rate and failure pattern.
const OUTCOME_WINDOW_DAYS: i64 = 30;

/// A profile needs this many successful logins before its hours count.
const MIN_TIME_BASELINE: u32 = 3;

/// Scores deviation from the user's stored baseline, falling back to
/// population heuristics (night-time, weekend, anonymizers) when there is no
/// history yet.
pub struct ProfileAnomalyDetector {
    profiles: Arc<dyn ProfileStore>,
    ip_attempts: WindowStore,
    user_attempts: WindowStore,
    config: AnomalyConfig,
}

impl ProfileAnomalyDetector {
    pub fn new(config: &AnomalyConfig, profiles: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles,
            ip_attempts: WindowStore::new(config.frequency_window_secs),
            user_attempts: WindowStore::new(config.frequency_window_secs),
            config: config.clone(),
        }
    }

    fn is_night(&self, hour: u32) -> bool {
        hour < self.config.night_end_hour || hour > self.config.night_start_hour
    }

    fn time_deviation(&self, ctx: &AuthContext, profile: Option<&BehavioralProfile>) -> f64 {
        let hour = ctx.timestamp.hour();

        if let Some(p) = profile.filter(|p| p.successful_logins() >= MIN_TIME_BASELINE) {
            let typical = p.typical_hours();
            let near_typical = typical.iter().any(|h| {
                let diff = (*h as i32 - hour as i32).rem_euclid(24);
                diff <= 1 || diff >= 23
            });
            return if near_typical { 0.0 } else { 0.6 };
        }

        let mut score = 0.0;
        if self.is_night(hour) {
            score += 0.3;
        }
        if matches!(ctx.timestamp.weekday(), Weekday::Sat | Weekday::Sun) {
            score += 0.1;
        }
        score
    }

    fn location_deviation(&self, ctx: &AuthContext, profile: Option<&BehavioralProfile>) -> f64 {
        let geo = match &ctx.geolocation {
            Some(g) => g,
            None => return 0.1,
        };
        if geo.is_usual_location {
            return 0.0;
        }

        match profile.filter(|p| !p.known_locations.is_empty()) {
            Some(p) if p.knows_location(&geo.location_key()) => 0.0,
            Some(p) if p.knows_country(&geo.country) => self.config.unknown_location_score * 0.5,
            Some(_) => self.config.new_country_score,
            None => self.config.unknown_location_score,
        }
    }

    fn device_deviation(&self, ctx: &AuthContext, profile: Option<&BehavioralProfile>) -> f64 {
        let mut score = 0.0;
        if ctx.is_tor_exit_node {
            score += 0.6;
        }
        if ctx.is_vpn {
            score += 0.3;
        }

        let has_fingerprint = ctx.device_fingerprint.as_deref().is_some_and(|f| !f.is_empty());
        if !has_fingerprint {
            score += 0.1;
        }

        match profile {
            Some(p) => {
                if !p.known_devices.is_empty() && !p.knows_device(&ctx.device_key()) {
                    score += 0.2;
                }
                if !p.known_user_agents.is_empty() && !p.knows_user_agent(&ctx.user_agent) {
                    score += 0.2;
                }
            }
            None => {
                let ua = ctx.user_agent.to_lowercase();
                if ua.trim().is_empty() || ua.contains("curl") || ua.contains("python") || ua.contains("bot") {
                    score += 0.2;
                }
            }
        }

        clamp_unit(score)
    }

    fn frequency_anomaly(&self, ip_attempts: usize, user_attempts: usize, prior_failures: u32) -> f64 {
        let mut score = 0.0;
        let ip_limit = self.config.ip_attempt_threshold;
        if ip_attempts > ip_limit {
            score += ((ip_attempts - ip_limit) as f64 / 20.0).min(1.0) * 0.6;
        }
        let user_limit = self.config.user_attempt_threshold;
        if user_attempts > user_limit {
            score += ((user_attempts - user_limit) as f64 / 10.0).min(1.0) * 0.4;
        }
        if prior_failures > 0 {
            score += (prior_failures as f64 / 10.0).min(1.0) * 0.3;
        }
        clamp_unit(score)
    }
}

#[async_trait]
impl AnomalyDetectionEngine for ProfileAnomalyDetector {
    async fn detect(&self, context: &AuthContext) -> Result<BehavioralAnalysis> {
        let key = context.profile_key();
        let profile = self.profiles.load(&key).await?;
        let profile = profile.as_ref();

        let ip = context.client_ip.to_string();
        let (ip_count, _) = self.ip_attempts.record(&ip, context.timestamp, &key);
        let (user_count, _) = self.user_attempts.record(&key, context.timestamp, &ip);

        let time_deviation_score = clamp_unit(self.time_deviation(context, profile));
        let location_deviation_score = clamp_unit(self.location_deviation(context, profile));
        let device_deviation_score = self.device_deviation(context, profile);
        let login_frequency_anomaly =
            self.frequency_anomaly(ip_count, user_count, context.previous_failed_attempts);

        let (success_rate, failure_pattern, samples, bias) = match profile {
            Some(p) => (
                p.success_rate(context.timestamp, OUTCOME_WINDOW_DAYS),
                p.failure_pattern(context.timestamp, OUTCOME_WINDOW_DAYS),
                p.outcomes_since(context.timestamp, OUTCOME_WINDOW_DAYS).count() as u32,
                p.calibration_bias,
            ),
            None => (1.0, Default::default(), 0, 0.0),
        };

        debug!(
            request_id = %context.request_id,
            time = time_deviation_score,
            location = location_deviation_score,
            device = device_deviation_score,
            frequency = login_frequency_anomaly,
            ip_attempts = ip_count,
            user_attempts = user_count,
            "Anomaly detection complete"
        );

        Ok(BehavioralAnalysis {
            is_usual_time: time_deviation_score < 0.3,
            time_deviation_score,
            is_usual_location: location_deviation_score < 0.3,
            location_deviation_score,
            is_usual_device: device_deviation_score < 0.3,
            device_deviation_score,
            login_frequency_anomaly,
            // No session telemetry reaches the pipeline at login time.
            session_duration_anomaly: 0.0,
            success_rate_last_30_days: success_rate,
            failed_attempts_pattern: failure_pattern,
            history_samples: samples,
            calibration_bias: bias,
            used_fallback: false,
        })
    }

    fn cleanup(&self) {
        self.ip_attempts.cleanup();
        self.user_attempts.cleanup();
    }
}
