//! remotectl Crypto - Message-level signing and encryption
//!
//! This crate provides:
//! - RSA key pairs with PEM import/export and key hashing
//! - RS256 signed compact tokens
//! - RSA-OAEP-256 + A256CBC-HS512 encrypted compact tokens
//! - AES-256-CBC + HMAC-SHA-512 content encryption

mod aes;
mod keys;
mod token;

pub use aes::*;
pub use keys::*;
pub use token::*;

#[cfg(test)]
pub(crate) mod test_keys {
    use crate::ClientKeyPair;
    use std::sync::OnceLock;

    static CLIENT: OnceLock<ClientKeyPair> = OnceLock::new();
    static SERVER: OnceLock<ClientKeyPair> = OnceLock::new();

    pub fn client() -> &'static ClientKeyPair {
        CLIENT.get_or_init(|| ClientKeyPair::generate().unwrap())
    }

    pub fn server() -> &'static ClientKeyPair {
        SERVER.get_or_init(|| ClientKeyPair::generate().unwrap())
    }
}
