//! Certificate set validation utilities

use crate::MiniServerCertificate;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Reasons a certificate record is rejected
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Certificate has no public key hash")]
    MissingHash,

    #[error("Certificate has no PEM encoded public key")]
    MissingPublicKey,

    #[error("Certificate expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Certificate validity window is inverted")]
    InvertedValidity,
}

const PEM_MARKER: &str = "-----BEGIN";

/// Validate a single certificate record against `now`
pub fn validate_certificate(
    cert: &MiniServerCertificate,
    now: DateTime<Utc>,
) -> Result<(), ValidationError> {
    if cert.public_key_hash.trim().is_empty() {
        return Err(ValidationError::MissingHash);
    }

    if !cert.public_key_pem.trim_start().starts_with(PEM_MARKER) {
        return Err(ValidationError::MissingPublicKey);
    }

    if cert.obtained > cert.expiry {
        return Err(ValidationError::InvertedValidity);
    }

    if cert.has_expired_at(now) {
        return Err(ValidationError::Expired(cert.expiry));
    }

    Ok(())
}

/// Keep only well-formed, unexpired certificates
pub fn usable_certificates(
    certs: impl IntoIterator<Item = MiniServerCertificate>,
    now: DateTime<Utc>,
) -> Vec<MiniServerCertificate> {
    certs
        .into_iter()
        .filter(|cert| validate_certificate(cert, now).is_ok())
        .collect()
}

/// Find an unexpired certificate by key hash
pub fn find_certificate<'a>(
    certs: &'a [MiniServerCertificate],
    hash: &str,
    now: DateTime<Utc>,
) -> Option<&'a MiniServerCertificate> {
    certs
        .iter()
        .find(|cert| cert.public_key_hash == hash && !cert.has_expired_at(now))
}
