//! RSA key management

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default modulus size for client keys
pub const DEFAULT_KEY_BITS: usize = 2048;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key deserialization failed: {0}")]
    KeyDeserializationFailed(String),

    #[error("Key serialization failed: {0}")]
    KeySerializationFailed(String),
}

/// RSA key pair held by one connection
///
/// Messages addressed to the client are encrypted to this public key,
/// which is announced in the auth handshake.
#[derive(Clone)]
pub struct ClientKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for ClientKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKeyPair")
            .field("public_key_hash", &self.public_key_hash())
            .finish_non_exhaustive()
    }
}

impl ClientKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        Self::generate_with_bits(DEFAULT_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    /// Create from a PKCS#8 PEM private key
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| KeyError::KeyDeserializationFailed(e.to_string()))?;
        Ok(Self::from_private_key(private_key))
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Export the private key as PKCS#8 PEM
    pub fn private_key_pem(&self) -> Result<String, KeyError> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| KeyError::KeySerializationFailed(e.to_string()))
    }

    /// Export the public key as SubjectPublicKeyInfo PEM
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        ServerPublicKey::from(self.public_key.clone()).to_pem()
    }

    pub fn public_key_hash(&self) -> String {
        ServerPublicKey::from(self.public_key.clone()).hash()
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }
}

/// A pinned peer public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPublicKey {
    key: RsaPublicKey,
}

impl From<RsaPublicKey> for ServerPublicKey {
    fn from(key: RsaPublicKey) -> Self {
        Self { key }
    }
}

impl ServerPublicKey {
    /// Parse a SubjectPublicKeyInfo PEM
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        RsaPublicKey::from_public_key_pem(pem.trim())
            .map(Self::from)
            .map_err(|e| KeyError::KeyDeserializationFailed(e.to_string()))
    }

    pub fn to_pem(&self) -> Result<String, KeyError> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::KeySerializationFailed(e.to_string()))
    }

    /// Lowercase hex SHA-256 of the DER encoded SubjectPublicKeyInfo
    pub fn hash(&self) -> String {
        match self.key.to_public_key_der() {
            Ok(der) => hex::encode(Sha256::digest(der.as_bytes())),
            Err(_) => String::new(),
        }
    }

    pub fn key(&self) -> &RsaPublicKey {
        &self.key
    }
}
