//! AES-256-CBC with HMAC-SHA-512 authentication (A256CBC-HS512)

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha512 = Hmac<Sha512>;

/// Content encryption key length: MAC key || AES key
pub const CEK_LEN: usize = 64;

/// CBC initialisation vector length
pub const IV_LEN: usize = 16;

/// Authentication tag length (left half of the HMAC-SHA-512 output)
pub const TAG_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum AesError {
    #[error("Invalid key length: expected 64, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid IV length: expected 16, got {0}")]
    InvalidIvLength(usize),

    #[error("Authentication tag mismatch")]
    TagMismatch,

    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Output of an authenticated encryption
#[derive(Debug, Clone)]
pub struct SealedContent {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// AES-256-CBC + HMAC-SHA-512 cipher wrapper
pub struct Aes256CbcHmacCipher {
    mac_key: [u8; 32],
    enc_key: [u8; 32],
}

impl Aes256CbcHmacCipher {
    /// Create a cipher from a 64-byte content encryption key
    pub fn new(cek: &[u8]) -> Result<Self, AesError> {
        if cek.len() != CEK_LEN {
            return Err(AesError::InvalidKeyLength(cek.len()));
        }

        let mut mac_key = [0u8; 32];
        let mut enc_key = [0u8; 32];
        mac_key.copy_from_slice(&cek[..32]);
        enc_key.copy_from_slice(&cek[32..]);

        Ok(Self { mac_key, enc_key })
    }

    /// Generate a random content encryption key
    pub fn generate_key() -> [u8; CEK_LEN] {
        let mut key = [0u8; CEK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    }

    /// Encrypt with a random IV, authenticating `aad` alongside the ciphertext
    pub fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> Result<SealedContent, AesError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.enc_key, &iv)
            .map_err(|_| AesError::InvalidIvLength(iv.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let tag = self.compute_tag(aad, &iv, &ciphertext);

        Ok(SealedContent {
            iv,
            ciphertext,
            tag,
        })
    }

    /// Verify the tag in constant time, then decrypt
    pub fn decrypt(
        &self,
        aad: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        tag: &[u8],
    ) -> Result<Vec<u8>, AesError> {
        if iv.len() != IV_LEN {
            return Err(AesError::InvalidIvLength(iv.len()));
        }
        if tag.len() != TAG_LEN {
            return Err(AesError::TagMismatch);
        }

        self.mac(aad, iv, ciphertext)
            .verify_truncated_left(tag)
            .map_err(|_| AesError::TagMismatch)?;

        Aes256CbcDec::new_from_slices(&self.enc_key, iv)
            .map_err(|_| AesError::InvalidIvLength(iv.len()))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| AesError::DecryptionFailed)
    }

    fn mac(&self, aad: &[u8], iv: &[u8], ciphertext: &[u8]) -> HmacSha512 {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC can take key of any size");
        let aad_bits = (aad.len() as u64) * 8;

        mac.update(aad);
        mac.update(iv);
        mac.update(ciphertext);
        mac.update(&aad_bits.to_be_bytes());
        mac
    }

    fn compute_tag(&self, aad: &[u8], iv: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let full = self.mac(aad, iv, ciphertext).finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&full[..TAG_LEN]);
        tag
    }
}
