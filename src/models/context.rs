use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Geolocation resolved for the client IP by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub timezone: Option<String>,
    /// Caller-side verdict that this is one of the user's usual locations.
    #[serde(default)]
    pub is_usual_location: bool,
}

impl GeoLocation {
    /// Coarse `country/region/city` key used to remember known locations.
    pub fn location_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.country.to_uppercase(),
            self.region.as_deref().unwrap_or("-"),
            self.city.as_deref().unwrap_or("-"),
        )
    }
}

/// A single login attempt as seen by the pipeline.
///
/// The credential is an opaque digest computed by the caller; the raw
/// password never reaches this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    pub email: String,
    pub credential_digest: String,
    pub client_ip: IpAddr,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub geolocation: Option<GeoLocation>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    #[serde(default)]
    pub is_tor_exit_node: bool,
    #[serde(default)]
    pub is_vpn: bool,
    #[serde(default)]
    pub threat_intel_score: f64,
    #[serde(default)]
    pub previous_failed_attempts: u32,
}

impl AuthContext {
    pub fn new(
        email: impl Into<String>,
        credential_digest: impl Into<String>,
        client_ip: IpAddr,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            credential_digest: credential_digest.into(),
            client_ip,
            user_agent: user_agent.into(),
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            geolocation: None,
            device_fingerprint: None,
            is_tor_exit_node: false,
            is_vpn: false,
            threat_intel_score: 0.0,
            previous_failed_attempts: 0,
        }
    }

    /// Key under which the behavioral profile for this attempt is stored.
    pub fn profile_key(&self) -> String {
        match &self.user_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.normalized_email(),
        }
    }

    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }

    /// Domain part of the email, empty when there is none.
    pub fn email_domain(&self) -> &str {
        self.email.trim().rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Identifier for the client device: the fingerprint when supplied,
    /// otherwise the user agent.
    pub fn device_key(&self) -> String {
        match &self.device_fingerprint {
            Some(fp) if !fp.is_empty() => fp.clone(),
            _ => format!("ua:{}", self.user_agent),
        }
    }
}
