use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single recorded authentication outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub ip: String,
}

/// Historical baseline for one user, read by the anomaly and embedding
/// stages and written by adaptive learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralProfile {
    pub user_id: String,
    /// Successful logins per hour of day (UTC).
    pub hour_histogram: [u32; 24],
    pub known_countries: Vec<String>,
    pub known_locations: VecDeque<String>,
    pub known_devices: VecDeque<String>,
    pub known_user_agents: VecDeque<String>,
    pub recent_logins: VecDeque<DateTime<Utc>>,
    pub outcomes: VecDeque<LoginOutcome>,
    pub typical_embeddings: VecDeque<Vec<f32>>,
    pub calibration_bias: f64,
    pub false_positives: u32,
    pub false_negatives: u32,
    pub confirmed_decisions: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BehavioralProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            hour_histogram: [0; 24],
            known_countries: Vec::new(),
            known_locations: VecDeque::new(),
            known_devices: VecDeque::new(),
            known_user_agents: VecDeque::new(),
            recent_logins: VecDeque::new(),
            outcomes: VecDeque::new(),
            typical_embeddings: VecDeque::new(),
            calibration_bias: 0.0,
            false_positives: 0,
            false_negatives: 0,
            confirmed_decisions: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn successful_logins(&self) -> u32 {
        self.hour_histogram.iter().sum()
    }

    /// Hours that account for at least 5% of successful logins.
    pub fn typical_hours(&self) -> Vec<u32> {
        let total = self.successful_logins();
        if total == 0 {
            return Vec::new();
        }
        let min_count = ((total as f64) * 0.05).ceil().max(1.0) as u32;
        (0..24u32)
            .filter(|h| self.hour_histogram[*h as usize] >= min_count)
            .collect()
    }

    pub fn knows_location(&self, key: &str) -> bool {
        self.known_locations.iter().any(|l| l == key)
    }

    pub fn knows_country(&self, country: &str) -> bool {
        self.known_countries.iter().any(|c| c.eq_ignore_ascii_case(country))
    }

    pub fn knows_device(&self, key: &str) -> bool {
        self.known_devices.iter().any(|d| d == key)
    }

    pub fn knows_user_agent(&self, ua: &str) -> bool {
        self.known_user_agents.iter().any(|u| u == ua)
    }

    /// Outcomes recorded within the last `days`.
    pub fn outcomes_since(&self, now: DateTime<Utc>, days: i64) -> impl Iterator<Item = &LoginOutcome> {
        let cutoff = now - Duration::days(days);
        self.outcomes.iter().filter(move |o| o.timestamp >= cutoff)
    }

    /// Success ratio over the window, 1.0 when there is no data.
    pub fn success_rate(&self, now: DateTime<Utc>, days: i64) -> f64 {
        let (mut total, mut ok) = (0u32, 0u32);
        for o in self.outcomes_since(now, days) {
            total += 1;
            if o.success {
                ok += 1;
            }
        }
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    /// Failed attempts bucketed by `hour_XX` and `ip:<addr>` within the window.
    pub fn failure_pattern(&self, now: DateTime<Utc>, days: i64) -> BTreeMap<String, u32> {
        use chrono::Timelike;

        let mut pattern = BTreeMap::new();
        for o in self.outcomes_since(now, days).filter(|o| !o.success) {
            *pattern.entry(format!("hour_{:02}", o.timestamp.hour())).or_insert(0) += 1;
            *pattern.entry(format!("ip:{}", o.ip)).or_insert(0) += 1;
        }
        pattern
    }
}

/// Push onto a bounded deque, dropping the oldest entries past `max`.
pub fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, max: usize) {
    queue.push_back(item);
    while queue.len() > max {
        queue.pop_front();
    }
}

/// Insert a value if absent (refreshing its recency if present), bounded.
pub fn remember<T: PartialEq>(queue: &mut VecDeque<T>, item: T, max: usize) {
    if let Some(pos) = queue.iter().position(|existing| *existing == item) {
        queue.remove(pos);
    }
    push_bounded(queue, item, max);
}
