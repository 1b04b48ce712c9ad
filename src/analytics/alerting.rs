use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::settings::AlertingConfig;
use crate::models::context::AuthContext;
use crate::models::risk::{AuthAnalysisResult, RiskLevel};

/// Security-relevant decision handed to the audit / notification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SecurityEvent {
    LoginBlocked {
        request_id: String,
        client_ip: String,
        email_domain: String,
        risk_score: f64,
        attack_patterns: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    FeedbackRequested {
        request_id: String,
        user: String,
        risk_score: f64,
        risk_level: RiskLevel,
        timestamp: DateTime<Utc>,
    },
}

impl SecurityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SecurityEvent::LoginBlocked { .. } => "login_blocked",
            SecurityEvent::FeedbackRequested { .. } => "feedback_requested",
        }
    }

    /// Events implied by a decision.
    pub fn from_decision(context: &AuthContext, result: &AuthAnalysisResult) -> Vec<SecurityEvent> {
        let mut events = Vec::new();
        if result.should_block {
            events.push(SecurityEvent::LoginBlocked {
                request_id: result.request_id.clone(),
                client_ip: context.client_ip.to_string(),
                email_domain: context.email_domain().to_lowercase(),
                risk_score: result.risk_score,
                attack_patterns: result.threat_analysis.known_attack_patterns.clone(),
                timestamp: Utc::now(),
            });
        }
        if result.user_feedback_required {
            events.push(SecurityEvent::FeedbackRequested {
                request_id: result.request_id.clone(),
                user: context.profile_key(),
                risk_score: result.risk_score,
                risk_level: result.risk_level,
                timestamp: Utc::now(),
            });
        }
        events
    }
}

/// Receiver of security events. Delivery is best-effort and must never
/// block a decision.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &SecurityEvent);
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: &SecurityEvent) {
        match event {
            SecurityEvent::LoginBlocked {
                request_id,
                client_ip,
                risk_score,
                ..
            } => {
                warn!(request_id = %request_id, ip = %client_ip, score = risk_score, "Login blocked");
            }
            SecurityEvent::FeedbackRequested {
                request_id,
                risk_score,
                risk_level,
                ..
            } => {
                info!(request_id = %request_id, score = risk_score, level = %risk_level, "Feedback requested");
            }
        }
    }
}

/// POSTs each event as JSON to a webhook.
pub struct WebhookEventSink {
    url: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl WebhookEventSink {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(5))
            .build_http();
        Self {
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
            client,
        }
    }
}

#[async_trait]
impl EventSink for WebhookEventSink {
    async fn publish(&self, event: &SecurityEvent) {
        let payload = serde_json::json!({
            "source": "loginguard",
            "payload": event,
        });

        let req = match hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
        {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to build event request: {}", e);
                return;
            }
        };

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => {
                info!(
                    status = resp.status().as_u16(),
                    event = event.name(),
                    "Security event delivered to webhook"
                );
            }
            Ok(Err(e)) => {
                warn!(error = %e, event = event.name(), "Failed to deliver security event");
            }
            Err(_) => {
                warn!(event = event.name(), "Security event webhook timed out");
            }
        }
    }
}

/// Pick the sink configured under `[alerting]`.
pub fn build_event_sink(config: &AlertingConfig) -> Arc<dyn EventSink> {
    match &config.webhook_url {
        Some(url) if config.enabled && !url.is_empty() => {
            info!(url = %url, "Security events delivered to webhook");
            Arc::new(WebhookEventSink::new(url.clone(), config.timeout_secs))
        }
        _ => Arc::new(LogEventSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scoring::fallback_result;

    fn ctx() -> AuthContext {
        AuthContext::new("Dana@Example.org", "digest", "192.0.2.10".parse().unwrap(), "Mozilla/5.0")
    }

    #[test]
    fn test_events_from_decision() {
        let mut result = fallback_result("req-9", 0.0, 1.0);
        let events = SecurityEvent::from_decision(&ctx(), &result);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "feedback_requested");

        result.should_block = true;
        result.user_feedback_required = false;
        let events = SecurityEvent::from_decision(&ctx(), &result);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SecurityEvent::LoginBlocked { email_domain, client_ip, .. } => {
                assert_eq!(email_domain, "example.org");
                assert_eq!(client_ip, "192.0.2.10");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let events = SecurityEvent::from_decision(&ctx(), &fallback_result("req-1", 0.0, 1.0));
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["event"], "feedback_requested");
        assert_eq!(json["risk_level"], "LOW");
        assert_eq!(json["user"], "dana@example.org");
    }

    #[tokio::test]
    async fn test_webhook_failure_is_contained() {
        let sink = WebhookEventSink::new("http://127.0.0.1:9/hook", 1);
        let events = SecurityEvent::from_decision(&ctx(), &fallback_result("req-2", 0.0, 1.0));
        sink.publish(&events[0]).await;
    }
}
