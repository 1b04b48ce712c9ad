use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// The attempt was flagged but turned out legitimate.
    FalsePositive,
    /// The attempt was allowed but turned out malicious.
    FalseNegative,
    /// The decision was right.
    Confirmed,
}

/// Operator or user feedback about a past decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFeedback {
    pub kind: FeedbackKind,
    pub confidence: f64,
    pub original_risk_score: Option<f64>,
    pub source: String,
    pub notes: Option<String>,
}

impl AuthFeedback {
    /// Parse the loosely typed feedback map accepted at the service boundary.
    ///
    /// Recognised keys: `is_false_positive`, `is_false_negative`,
    /// `confidence`, `original_risk_score`, `source`, `notes`.
    pub fn from_map(map: &HashMap<String, Value>) -> Result<Self, String> {
        let flag = |key: &str| map.get(key).and_then(Value::as_bool).unwrap_or(false);
        let fp = flag("is_false_positive");
        let fn_ = flag("is_false_negative");

        let kind = match (fp, fn_) {
            (true, true) => return Err("feedback cannot be both false positive and false negative".into()),
            (true, false) => FeedbackKind::FalsePositive,
            (false, true) => FeedbackKind::FalseNegative,
            (false, false) => FeedbackKind::Confirmed,
        };

        let confidence = match map.get("confidence") {
            None | Some(Value::Null) => 1.0,
            Some(v) => v
                .as_f64()
                .filter(|c| (0.0..=1.0).contains(c))
                .ok_or_else(|| format!("confidence must be a number in [0, 1], got {}", v))?,
        };

        let original_risk_score = match map.get("original_risk_score") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .filter(|s| (0.0..=1.0).contains(s))
                    .ok_or_else(|| format!("original_risk_score must be in [0, 1], got {}", v))?,
            ),
        };

        Ok(Self {
            kind,
            confidence,
            original_risk_score,
            source: map
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("user")
                .to_string(),
            notes: map.get("notes").and_then(Value::as_str).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> HashMap<String, Value> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_parse_false_positive() {
        let fb = AuthFeedback::from_map(&map(json!({
            "is_false_positive": true,
            "confidence": 0.9,
            "original_risk_score": 0.72,
            "source": "security_team"
        })))
        .unwrap();
        assert_eq!(fb.kind, FeedbackKind::FalsePositive);
        assert_eq!(fb.confidence, 0.9);
        assert_eq!(fb.original_risk_score, Some(0.72));
        assert_eq!(fb.source, "security_team");
    }

    #[test]
    fn test_parse_defaults_to_confirmed() {
        let fb = AuthFeedback::from_map(&HashMap::new()).unwrap();
        assert_eq!(fb.kind, FeedbackKind::Confirmed);
        assert_eq!(fb.confidence, 1.0);
        assert_eq!(fb.source, "user");
    }

    #[test]
    fn test_rejects_contradictory_or_out_of_range() {
        assert!(AuthFeedback::from_map(&map(json!({
            "is_false_positive": true,
            "is_false_negative": true
        })))
        .is_err());
        assert!(AuthFeedback::from_map(&map(json!({ "confidence": 1.5 }))).is_err());
        assert!(AuthFeedback::from_map(&map(json!({ "confidence": "high" }))).is_err());
    }
}
