//! Pinned server keys and enrollment credentials

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on claim polling attempts
pub const MAX_CLAIM_ATTEMPTS: u32 = 100;

/// Upper bound on the total claim polling time (seconds)
pub const MAX_CLAIM_LIFETIME_SECS: u64 = 3600;

/// A pinned server public key
///
/// Deliberately not X.509: the client trusts a small set of keys it was
/// handed at enrollment or fetched from the certificate URL, keyed by hash.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MiniServerCertificate {
    #[serde(alias = "PublicKeyHash")]
    pub public_key_hash: String,

    #[serde(alias = "PublicKeyPem", alias = "PublicKey", alias = "publicKey")]
    pub public_key_pem: String,

    #[serde(alias = "Obtained")]
    pub obtained: DateTime<Utc>,

    #[serde(alias = "Expiry")]
    pub expiry: DateTime<Utc>,
}

impl MiniServerCertificate {
    /// Usable only while `now < expiry`
    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Utc::now())
    }

    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

/// Long-lived credential bundle produced by a successful claim
///
/// The caller owns persistence; the connection only hands back updated
/// copies through the rekey callback.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedClientData {
    #[serde(alias = "JWT", alias = "Jwt")]
    pub jwt: String,

    #[serde(alias = "ServerUrl")]
    pub server_url: String,

    #[serde(default, alias = "CertificateUrl")]
    pub certificate_url: String,

    #[serde(default, alias = "ServerCertificates")]
    pub server_certificates: Vec<MiniServerCertificate>,

    #[serde(default, alias = "LocalEncryptionKey")]
    pub local_encryption_key: Option<String>,
}

/// Short-lived registration data, shown to a human while waiting for a claim
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientData {
    #[serde(alias = "ClaimLink")]
    pub claim_link: String,

    #[serde(alias = "StatusLink")]
    pub status_link: String,

    #[serde(default = "default_retry_seconds", alias = "RetrySeconds")]
    pub retry_seconds: u64,

    #[serde(default = "default_max_retries", alias = "MaxRetries")]
    pub max_retries: u32,

    #[serde(default = "default_max_lifetime", alias = "MaxLifetimeSeconds")]
    pub max_lifetime_seconds: u64,
}

fn default_retry_seconds() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    MAX_CLAIM_ATTEMPTS
}

fn default_max_lifetime() -> u64 {
    MAX_CLAIM_LIFETIME_SECS
}

impl RegisterClientData {
    /// Polling attempts, clamped to `1..=100`
    pub fn claim_attempts(&self) -> u32 {
        self.max_retries.clamp(1, MAX_CLAIM_ATTEMPTS)
    }

    /// Overall polling deadline, clamped to `1..=3600` seconds
    pub fn claim_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds.clamp(1, MAX_CLAIM_LIFETIME_SECS))
    }

    /// Delay between polls (at least one second)
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_seconds.max(1))
    }
}

/// Response of the registration endpoint
///
/// The endpoint answers with final credentials when the machine was
/// pre-claimed, and with claim links otherwise. The shapes are told apart
/// only by which keys are present.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RegistrationResponse {
    Claimed(ClaimedClientData),
    Pending(RegisterClientData),
}

/// Response of the claim status endpoint
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimStatusResponse {
    #[serde(default, alias = "Success")]
    pub success: bool,

    #[serde(default, alias = "StatusMessage", alias = "message", alias = "Message")]
    pub status_message: Option<String>,

    #[serde(default, alias = "JWT", alias = "Jwt")]
    pub jwt: Option<String>,

    #[serde(default, alias = "ServerUrl")]
    pub server_url: Option<String>,

    #[serde(default, alias = "CertificateUrl")]
    pub certificate_url: Option<String>,

    #[serde(default, alias = "ServerCertificates")]
    pub server_certificates: Vec<MiniServerCertificate>,

    #[serde(default, alias = "LocalEncryptionKey")]
    pub local_encryption_key: Option<String>,
}

impl ClaimStatusResponse {
    /// Credentials, if the machine has been claimed
    pub fn into_claimed(self) -> Option<ClaimedClientData> {
        if !self.success {
            return None;
        }

        match (self.jwt, self.server_url) {
            (Some(jwt), Some(server_url)) if !jwt.is_empty() && !server_url.is_empty() => {
                Some(ClaimedClientData {
                    jwt,
                    server_url,
                    certificate_url: self.certificate_url.unwrap_or_default(),
                    server_certificates: self.server_certificates,
                    local_encryption_key: self.local_encryption_key,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn certificate(expiry: DateTime<Utc>) -> MiniServerCertificate {
        MiniServerCertificate {
            public_key_hash: "h1".to_string(),
            public_key_pem: "-----BEGIN PUBLIC KEY-----".to_string(),
            obtained: expiry - TimeDelta::days(30),
            expiry,
        }
    }

    #[test]
    fn test_certificate_expiry() {
        let now = Utc::now();
        let cert = certificate(now + TimeDelta::hours(1));
        assert!(!cert.has_expired_at(now));
        assert!(cert.has_expired_at(now + TimeDelta::hours(1)));
        assert!(cert.has_expired_at(now + TimeDelta::hours(2)));
    }

    #[test]
    fn test_registration_pending_shape() {
        let raw = r#"{"claimLink":"https://x/claim/1","statusLink":"https://x/status/1","retrySeconds":2,"maxRetries":3,"maxLifetimeSeconds":30}"#;
        let response: RegistrationResponse = serde_json::from_str(raw).unwrap();
        let RegistrationResponse::Pending(data) = response else {
            panic!("expected pending registration");
        };
        assert_eq!(data.claim_attempts(), 3);
        assert_eq!(data.retry_interval(), Duration::from_secs(2));
        assert_eq!(data.claim_lifetime(), Duration::from_secs(30));
    }

    #[test]
    fn test_registration_claimed_shape() {
        let raw = r#"{"jwt":"token","serverUrl":"wss://x/ws","certificateUrl":"https://x/certs","serverCertificates":[]}"#;
        let response: RegistrationResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(response, RegistrationResponse::Claimed(ref c) if c.jwt == "token"));
    }

    #[test]
    fn test_registration_unknown_shape() {
        let result = serde_json::from_str::<RegistrationResponse>(r#"{"error":"nope"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_claim_bounds_clamped() {
        let data = RegisterClientData {
            claim_link: String::new(),
            status_link: String::new(),
            retry_seconds: 0,
            max_retries: 0,
            max_lifetime_seconds: 100_000,
        };
        assert_eq!(data.claim_attempts(), 1);
        assert_eq!(data.claim_lifetime(), Duration::from_secs(3600));
        assert_eq!(data.retry_interval(), Duration::from_secs(1));

        let many = RegisterClientData {
            max_retries: 1000,
            ..data
        };
        assert_eq!(many.claim_attempts(), 100);
    }

    #[test]
    fn test_claim_status() {
        let pending: ClaimStatusResponse =
            serde_json::from_str(r#"{"success":false,"statusMessage":"not claimed"}"#).unwrap();
        assert_eq!(pending.status_message.as_deref(), Some("not claimed"));
        assert!(pending.into_claimed().is_none());

        let claimed: ClaimStatusResponse = serde_json::from_str(
            r#"{"Success":true,"JWT":"t","ServerUrl":"wss://x","CertificateUrl":"https://x/c"}"#,
        )
        .unwrap();
        let data = claimed.into_claimed().unwrap();
        assert_eq!(data.jwt, "t");
        assert_eq!(data.certificate_url, "https://x/c");
    }
}
