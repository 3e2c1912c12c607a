//! Compact transport tokens
//!
//! Every envelope travels as its own token: either signed with the
//! sender's key (RS256, three parts) or encrypted to the recipient's key
//! (RSA-OAEP-256 + A256CBC-HS512, five parts). There is no session key;
//! each message stands alone against the long-lived pinned keys.

use crate::aes::{Aes256CbcHmacCipher, IV_LEN, TAG_LEN};
use crate::keys::{ClientKeyPair, ServerPublicKey};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::rngs::OsRng;
use remotectl_protocol::Envelope;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const SIGNING_ALGORITHM: &str = "RS256";
pub const KEY_WRAP_ALGORITHM: &str = "RSA-OAEP-256";
pub const CONTENT_ALGORITHM: &str = "A256CBC-HS512";
pub const TOKEN_VERSION: &str = "1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Any structural or cryptographic failure while decoding a token
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Encoding failed: {0}")]
    EncodeFailed(String),
}

fn invalid(reason: impl std::fmt::Display) -> TransportError {
    TransportError::InvalidMessage(reason.to_string())
}

/// Protected header carried by every token
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc: Option<String>,

    /// "true" for encrypted tokens, "false" for signed ones
    pub encrypted: String,

    pub version: String,
}

impl TokenHeader {
    fn signed() -> Self {
        Self {
            alg: SIGNING_ALGORITHM.to_string(),
            enc: None,
            encrypted: "false".to_string(),
            version: TOKEN_VERSION.to_string(),
        }
    }

    fn encrypted() -> Self {
        Self {
            alg: KEY_WRAP_ALGORITHM.to_string(),
            enc: Some(CONTENT_ALGORITHM.to_string()),
            encrypted: "true".to_string(),
            version: TOKEN_VERSION.to_string(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.eq_ignore_ascii_case("true")
    }

    fn encode(&self) -> Result<String, TransportError> {
        let json =
            serde_json::to_vec(self).map_err(|e| TransportError::EncodeFailed(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    fn decode(part: &str) -> Result<Self, TransportError> {
        let bytes = URL_SAFE_NO_PAD.decode(part).map_err(invalid)?;
        serde_json::from_slice(&bytes).map_err(invalid)
    }
}

/// Read the header of a token without verifying anything
pub fn peek_header(token: &str) -> Result<TokenHeader, TransportError> {
    let first = token
        .split('.')
        .next()
        .ok_or_else(|| invalid("empty token"))?;
    TokenHeader::decode(first)
}

/// Sign an envelope with the sender's private key
pub fn sign_message(envelope: &Envelope, key: &ClientKeyPair) -> Result<String, TransportError> {
    sign_with(envelope, key.private_key())
}

fn sign_with(envelope: &Envelope, key: &RsaPrivateKey) -> Result<String, TransportError> {
    let header = TokenHeader::signed().encode()?;
    let payload = URL_SAFE_NO_PAD.encode(envelope.to_json());
    let signing_input = format!("{}.{}", header, payload);

    let signature = SigningKey::<Sha256>::new(key.clone()).sign(signing_input.as_bytes());

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Verify a signed token against the sender's public key
pub fn parse_signed(token: &str, key: &ServerPublicKey) -> Result<Envelope, TransportError> {
    verify_with(token, key.key())
}

fn verify_with(token: &str, key: &RsaPublicKey) -> Result<Envelope, TransportError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_part, payload_part, signature_part] = parts.as_slice() else {
        return Err(invalid(format!(
            "signed token has {} parts, expected 3",
            parts.len()
        )));
    };

    let header = TokenHeader::decode(header_part)?;
    if header.alg != SIGNING_ALGORITHM || header.is_encrypted() {
        return Err(invalid(format!("unexpected signing header: {}", header.alg)));
    }

    let signature_bytes = URL_SAFE_NO_PAD.decode(signature_part).map_err(invalid)?;
    let signature = Signature::try_from(signature_bytes.as_slice()).map_err(invalid)?;
    let signing_input = format!("{}.{}", header_part, payload_part);

    VerifyingKey::<Sha256>::new(key.clone())
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| invalid("signature verification failed"))?;

    let payload = URL_SAFE_NO_PAD.decode(payload_part).map_err(invalid)?;
    let json = String::from_utf8(payload).map_err(invalid)?;
    Envelope::parse(&json).map_err(invalid)
}

/// Encrypt an envelope to the recipient's public key
pub fn encrypt_message(
    envelope: &Envelope,
    key: &ServerPublicKey,
) -> Result<String, TransportError> {
    encrypt_with(envelope, key.key())
}

fn encrypt_with(envelope: &Envelope, key: &RsaPublicKey) -> Result<String, TransportError> {
    let header = TokenHeader::encrypted().encode()?;

    let cek = Aes256CbcHmacCipher::generate_key();
    let wrapped_key = key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &cek)
        .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;

    let sealed = Aes256CbcHmacCipher::new(&cek)
        .and_then(|cipher| cipher.encrypt(header.as_bytes(), envelope.to_json().as_bytes()))
        .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;

    Ok([
        header,
        URL_SAFE_NO_PAD.encode(wrapped_key),
        URL_SAFE_NO_PAD.encode(sealed.iv),
        URL_SAFE_NO_PAD.encode(&sealed.ciphertext),
        URL_SAFE_NO_PAD.encode(sealed.tag),
    ]
    .join("."))
}

/// Decrypt a token addressed to our key pair
pub fn parse_encrypted(token: &str, key: &ClientKeyPair) -> Result<Envelope, TransportError> {
    decrypt_with(token, key.private_key())
}

fn decrypt_with(token: &str, key: &RsaPrivateKey) -> Result<Envelope, TransportError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_part, key_part, iv_part, ciphertext_part, tag_part] = parts.as_slice() else {
        return Err(invalid(format!(
            "encrypted token has {} parts, expected 5",
            parts.len()
        )));
    };

    let header = TokenHeader::decode(header_part)?;
    if header.alg != KEY_WRAP_ALGORITHM
        || header.enc.as_deref() != Some(CONTENT_ALGORITHM)
        || !header.is_encrypted()
    {
        return Err(invalid(format!("unexpected encryption header: {}", header.alg)));
    }

    let wrapped_key = URL_SAFE_NO_PAD.decode(key_part).map_err(invalid)?;
    let iv = URL_SAFE_NO_PAD.decode(iv_part).map_err(invalid)?;
    let ciphertext = URL_SAFE_NO_PAD.decode(ciphertext_part).map_err(invalid)?;
    let tag = URL_SAFE_NO_PAD.decode(tag_part).map_err(invalid)?;

    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(invalid("malformed iv or tag"));
    }

    let cek = key
        .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
        .map_err(|_| invalid("key unwrap failed"))?;

    let plaintext = Aes256CbcHmacCipher::new(&cek)
        .and_then(|cipher| cipher.decrypt(header_part.as_bytes(), &iv, &ciphertext, &tag))
        .map_err(invalid)?;

    let json = String::from_utf8(plaintext).map_err(invalid)?;
    Envelope::parse(&json).map_err(invalid)
}

/// Server side of the codec
///
/// The management service holds a key pair too; this lets tools and tests
/// play the server role with the same wire format.
pub mod peer {
    use super::*;

    /// Encrypt an envelope to a client's announced public key
    pub fn encrypt_to_client(
        envelope: &Envelope,
        client_public_key_pem: &str,
    ) -> Result<String, TransportError> {
        let key = ServerPublicKey::from_pem(client_public_key_pem)
            .map_err(|e| TransportError::EncodeFailed(e.to_string()))?;
        encrypt_message(envelope, &key)
    }

    /// Decrypt a client token with the server's key pair
    pub fn decrypt_from_client(
        token: &str,
        server_key: &ClientKeyPair,
    ) -> Result<Envelope, TransportError> {
        parse_encrypted(token, server_key)
    }
}
