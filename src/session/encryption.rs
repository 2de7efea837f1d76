//! Cookie encryption at rest
//!
//! Uses AES-256-GCM. Each sealed value carries its own random nonce as
//! `base64(nonce).base64(ciphertext)`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-256-GCM nonce size (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;
/// AES-256 key size (256 bits = 32 bytes)
const KEY_SIZE: usize = 32;

#[derive(Clone)]
pub struct CookieCipher {
    cipher: Aes256Gcm,
}

impl CookieCipher {
    /// Create a cipher from raw key material.
    ///
    /// Exactly 32 bytes are used as-is; anything else is hashed with SHA-256
    /// so passphrases work too.
    pub fn new(key: &[u8]) -> Result<Self> {
        let mut key_bytes = [0u8; KEY_SIZE];
        if key.len() == KEY_SIZE {
            key_bytes.copy_from_slice(key);
        } else {
            key_bytes.copy_from_slice(&Sha256::digest(key));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Accepts a base64 encoded 32-byte key, or any other string as a passphrase
    pub fn from_config_key(key: &str) -> Result<Self> {
        match BASE64.decode(key.trim()) {
            Ok(bytes) if bytes.len() == KEY_SIZE => Self::new(&bytes),
            _ => Self::new(key.as_bytes()),
        }
    }

    /// Generate a random base64 key (for initial setup)
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(format!("{}.{}", BASE64.encode(nonce_bytes), BASE64.encode(ciphertext)))
    }

    pub fn open(&self, sealed: &str) -> Result<String> {
        let (nonce_b64, data_b64) = sealed
            .split_once('.')
            .ok_or_else(|| anyhow!("Sealed value is missing its nonce"))?;
        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| anyhow!("Invalid nonce: {}", e))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce length: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }
        let ciphertext = BASE64
            .decode(data_b64)
            .map_err(|e| anyhow!("Invalid encrypted data: {}", e))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| anyhow!("Invalid UTF-8 in decrypted data: {}", e))
    }
}

// Implement Debug without exposing the cipher
impl std::fmt::Debug for CookieCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieCipher")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = CookieCipher::from_config_key(&CookieCipher::generate_key()).unwrap();
        let sealed = cipher.seal("uid=1; pass=secret").unwrap();
        assert!(!sealed.contains("secret"));
        assert_eq!(cipher.open(&sealed).unwrap(), "uid=1; pass=secret");
    }

    #[test]
    fn test_same_value_seals_differently() {
        let cipher = CookieCipher::new(b"a passphrase").unwrap();
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.open(&a).unwrap(), cipher.open(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = CookieCipher::new(b"key one").unwrap();
        let b = CookieCipher::new(b"key two").unwrap();
        let sealed = a.seal("secret").unwrap();
        assert!(b.open(&sealed).is_err());
        assert!(a.open("garbage").is_err());
    }
}
