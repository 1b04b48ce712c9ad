use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::settings::MetricsConfig;
use crate::engine::PipelineError;
use crate::models::metrics::{ErrorRecord, ProcessingMetrics, StageMetrics};
use crate::models::risk::{FallbackReason, Stage, StageReport};

/// Latency samples kept per stage for the rolling average.
const STAGE_LATENCY_WINDOW: usize = 256;

#[derive(Default)]
struct StageCounters {
    invocations: AtomicU64,
    fallbacks: AtomicU64,
    timeouts: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
}

/// Request counters, rolling latency windows and a bounded error history.
///
/// Counters are plain atomics; the windows sit behind short-lived mutexes so
/// concurrent requests never contend for more than a push.
pub struct MetricsTracker {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,

    processing_times: Mutex<VecDeque<f64>>,
    processing_window: usize,

    stages: DashMap<Stage, StageCounters>,

    errors: Mutex<VecDeque<ErrorRecord>>,
    error_capacity: usize,
}

fn push_window(window: &mut VecDeque<f64>, value: f64, max: usize) {
    window.push_back(value);
    while window.len() > max {
        window.pop_front();
    }
}

fn mean(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

impl MetricsTracker {
    pub fn new(config: &MetricsConfig) -> Self {
        let stages = DashMap::new();
        for stage in Stage::ALL {
            stages.insert(stage, StageCounters::default());
        }

        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            processing_times: Mutex::new(VecDeque::with_capacity(config.processing_window)),
            processing_window: config.processing_window.max(1),
            stages,
            errors: Mutex::new(VecDeque::with_capacity(config.error_history_size)),
            error_capacity: config.error_history_size.max(1),
        }
    }

    /// Record a computed request. `success` is false when the global
    /// fallback result was returned.
    pub fn record_request(&self, processing_time_ms: f64, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        push_window(
            &mut self.processing_times.lock(),
            processing_time_ms,
            self.processing_window,
        );
    }

    pub fn record_cache_hit(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage(&self, report: &StageReport) {
        let counters = self.stages.entry(report.stage).or_default();
        match &report.fallback {
            Some(FallbackReason::Disabled) => return,
            Some(FallbackReason::Timeout { .. }) => {
                counters.timeouts.fetch_add(1, Ordering::Relaxed);
                counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
        counters.invocations.fetch_add(1, Ordering::Relaxed);
        push_window(&mut counters.latencies.lock(), report.elapsed_ms, STAGE_LATENCY_WINDOW);
    }

    pub fn record_error(&self, error: &PipelineError, request_id: Option<&str>) {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            error_type: error.error_type().to_string(),
            component: error.component().to_string(),
            message: error.to_string(),
            request_id: request_id.map(str::to_string),
        };
        let mut errors = self.errors.lock();
        errors.push_back(record);
        while errors.len() > self.error_capacity {
            errors.pop_front();
        }
    }

    /// Most recent errors, newest first.
    pub fn get_error_history(&self, limit: usize) -> Vec<ErrorRecord> {
        self.errors.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn snapshot(&self) -> ProcessingMetrics {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        let stages: BTreeMap<String, StageMetrics> = self
            .stages
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().name().to_string(),
                    StageMetrics {
                        invocations: c.invocations.load(Ordering::Relaxed),
                        fallbacks: c.fallbacks.load(Ordering::Relaxed),
                        timeouts: c.timeouts.load(Ordering::Relaxed),
                        average_latency_ms: mean(&c.latencies.lock()),
                    },
                )
            })
            .collect();

        ProcessingMetrics {
            total_requests: total,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: failed,
            cache_hits: hits,
            cache_hit_rate: rate(hits),
            error_rate: rate(failed),
            average_processing_time_ms: mean(&self.processing_times.lock()),
            stages,
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_metrics_config;

    #[test]
    fn test_counters_and_rates() {
        let metrics = MetricsTracker::new(&default_metrics_config());
        metrics.record_request(10.0, true);
        metrics.record_request(30.0, false);
        metrics.record_cache_hit();
        metrics.record_cache_hit();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 4);
        assert_eq!(snap.successful_requests, 3);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_hit_rate, 0.5);
        assert_eq!(snap.error_rate, 0.25);
        assert_eq!(snap.average_processing_time_ms, 20.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = MetricsTracker::new(&default_metrics_config()).snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.cache_hit_rate, 0.0);
        assert_eq!(snap.stages.len(), 4);
    }

    #[test]
    fn test_processing_window_is_rolling() {
        let mut config = default_metrics_config();
        config.processing_window = 2;
        let metrics = MetricsTracker::new(&config);
        metrics.record_request(100.0, true);
        metrics.record_request(10.0, true);
        metrics.record_request(20.0, true);
        assert_eq!(metrics.snapshot().average_processing_time_ms, 15.0);
    }

    #[test]
    fn test_stage_counters() {
        let metrics = MetricsTracker::new(&default_metrics_config());
        metrics.record_stage(&StageReport {
            stage: Stage::ThreatIntelligence,
            elapsed_ms: 4.0,
            fallback: None,
        });
        metrics.record_stage(&StageReport {
            stage: Stage::ThreatIntelligence,
            elapsed_ms: 6.0,
            fallback: Some(FallbackReason::Timeout { budget_ms: 5 }),
        });
        metrics.record_stage(&StageReport {
            stage: Stage::ThreatIntelligence,
            elapsed_ms: 0.0,
            fallback: Some(FallbackReason::Disabled),
        });

        let snap = metrics.snapshot();
        let threat = &snap.stages["threat_intelligence"];
        assert_eq!(threat.invocations, 2);
        assert_eq!(threat.fallbacks, 1);
        assert_eq!(threat.timeouts, 1);
        assert_eq!(threat.average_latency_ms, 5.0);
    }

    #[test]
    fn test_error_history_ring_buffer() {
        let mut config = default_metrics_config();
        config.error_history_size = 3;
        let metrics = MetricsTracker::new(&config);
        for i in 0..5 {
            metrics.record_error(
                &PipelineError::AggregationFailure(format!("boom {}", i)),
                Some(&format!("req-{}", i)),
            );
        }

        let history = metrics.get_error_history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].request_id.as_deref(), Some("req-4"));
        assert_eq!(history[2].request_id.as_deref(), Some("req-2"));
        assert_eq!(history[0].error_type, "aggregation_failure");
        assert_eq!(metrics.get_error_history(1).len(), 1);
    }
}
