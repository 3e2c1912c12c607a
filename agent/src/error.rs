//! Error taxonomy of the remote-control channel

use remotectl_crypto::{KeyError, TransportError};
use remotectl_protocol::EnvelopeError;
use remotectl_transport::WssClientError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Malformed envelope JSON or fields
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Cryptographic or decode failure of a transport token
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Well-formed message that is not allowed in the current state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Welcome named a key that is not pinned or has expired
    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Claim failed: {0}")]
    ClaimFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<EnvelopeError> for RemoteError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::InvalidEnvelope(reason) => Self::InvalidEnvelope(reason),
        }
    }
}

impl From<TransportError> for RemoteError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidMessage(reason) => Self::InvalidMessage(reason),
            TransportError::EncodeFailed(reason) => Self::InvalidMessage(reason),
        }
    }
}

impl From<KeyError> for RemoteError {
    fn from(e: KeyError) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}

impl From<WssClientError> for RemoteError {
    fn from(e: WssClientError) -> Self {
        Self::Socket(e.to_string())
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;
