use std::collections::{HashSet, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::profile::ProfileStore;
use crate::models::profile::BehavioralProfile;

// ---------------------------------------------------------------------------
// AttemptWindow
// ---------------------------------------------------------------------------

/// Time-ordered attempts tagged with a label (an email, an IP...), trimmed to
/// a fixed look-back window measured in attempt time.
#[derive(Debug, Clone)]
pub struct AttemptWindow {
    events: VecDeque<(DateTime<Utc>, String)>,
    window: Duration,
}

impl AttemptWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            events: VecDeque::new(),
            window: Duration::seconds(window_secs as i64),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, label: &str) {
        self.events.push_back((at, label.to_string()));
        self.trim(at);
    }

    /// Attempts within the window ending at `now`.
    pub fn count(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.events.iter().filter(|(ts, _)| *ts >= cutoff && *ts <= now).count()
    }

    /// Distinct labels within the window ending at `now`.
    pub fn distinct(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.events
            .iter()
            .filter(|(ts, _)| *ts >= cutoff && *ts <= now)
            .map(|(_, l)| l.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Mean gap between consecutive attempts in the window, if there are two or more.
    pub fn mean_interval_secs(&self, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - self.window;
        let stamps: Vec<_> = self
            .events
            .iter()
            .filter(|(ts, _)| *ts >= cutoff && *ts <= now)
            .map(|(ts, _)| *ts)
            .collect();
        if stamps.len() < 2 {
            return None;
        }
        let span = (stamps[stamps.len() - 1] - stamps[0]).num_milliseconds() as f64 / 1000.0;
        Some(span.max(0.0) / (stamps.len() - 1) as f64)
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some(front) = self.events.front() {
            if front.0 < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WindowStore
// ---------------------------------------------------------------------------

/// Concurrent map of attempt windows keyed by source (IP, user, ...).
pub struct WindowStore {
    windows: DashMap<String, AttemptWindow>,
    window_secs: u64,
}

impl WindowStore {
    pub fn new(window_secs: u64) -> Self {
        Self {
            windows: DashMap::new(),
            window_secs,
        }
    }

    /// Record an attempt and return `(count, distinct_labels)` for the key.
    pub fn record(&self, key: &str, at: DateTime<Utc>, label: &str) -> (usize, usize) {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| AttemptWindow::new(self.window_secs));
        entry.record(at, label);
        (entry.count(at), entry.distinct(at))
    }

    pub fn mean_interval_secs(&self, key: &str, now: DateTime<Utc>) -> Option<f64> {
        self.windows.get(key).and_then(|w| w.mean_interval_secs(now))
    }

    /// Drop windows whose attempts are all older than the look-back.
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.windows.retain(|_, w| {
            w.trim(now);
            !w.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MemoryProfileStore
// ---------------------------------------------------------------------------

/// Process-local profile store. Profiles are lost on restart.
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: DashMap<String, BehavioralProfile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self, user_id: &str) -> Result<Option<BehavioralProfile>> {
        Ok(self.profiles.get(user_id).map(|p| p.clone()))
    }

    async fn save(&self, profile: &BehavioralProfile) -> Result<()> {
        self.profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.profiles.len())
    }
}
