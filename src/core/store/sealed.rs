use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hmac::Mac;
use sha2::Sha256;

use crate::core::error::StoreError;

type HmacSha256 = hmac::Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// Seals bot configuration blobs at rest.
///
/// The key is HMAC-SHA256(hostname + username) under a fixed context label,
/// so the daemon and the runner processes it spawns derive the same key
/// without ever writing it to disk.
pub struct Sealer {
    cipher: Aes256Gcm,
}

fn derive_key() -> Result<[u8; 32], StoreError> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let username = whoami::username();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(b"botdeck-config-v1")
        .map_err(|e| StoreError::Seal(e.to_string()))?;
    mac.update(hostname.as_bytes());
    mac.update(username.as_bytes());

    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

impl Sealer {
    pub fn new() -> Result<Self, StoreError> {
        let key = derive_key()?;
        Self::with_key(&key)
    }

    pub fn with_key(key: &[u8; 32]) -> Result<Self, StoreError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| StoreError::Seal(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Returns base64(nonce || ciphertext).
    pub fn seal(&self, config: &serde_json::Value) -> Result<String, StoreError> {
        let plaintext = serde_json::to_vec(config)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| StoreError::Seal(format!("encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&combined))
    }

    pub fn unseal(&self, encoded: &str) -> Result<serde_json::Value, StoreError> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::Seal(format!("base64 decode failed: {}", e)))?;
        if combined.len() <= NONCE_LEN {
            return Err(StoreError::Seal("sealed value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StoreError::Seal(format!("decryption failed: {}", e)))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seal_unseal_roundtrip() {
        let sealer = Sealer::new().unwrap();
        let config = json!({ "token": "abc.def.ghi", "replies": [] });
        let sealed = sealer.seal(&config).unwrap();
        assert!(!sealed.contains("abc.def.ghi"));
        assert_eq!(sealer.unseal(&sealed).unwrap(), config);
    }

    #[test]
    fn sealing_twice_uses_fresh_nonces() {
        let sealer = Sealer::new().unwrap();
        let config = json!({ "token": "same" });
        assert_ne!(sealer.seal(&config).unwrap(), sealer.seal(&config).unwrap());
    }

    #[test]
    fn unseal_with_wrong_key_fails() {
        let a = Sealer::with_key(&[1u8; 32]).unwrap();
        let b = Sealer::with_key(&[2u8; 32]).unwrap();
        let sealed = a.seal(&json!({ "k": "v" })).unwrap();
        assert!(matches!(b.unseal(&sealed), Err(StoreError::Seal(_))));
    }

    #[test]
    fn unseal_rejects_garbage() {
        let sealer = Sealer::new().unwrap();
        assert!(sealer.unseal("not-valid-base64!!!").is_err());
        let short = base64::engine::general_purpose::STANDARD.encode(b"short");
        assert!(sealer.unseal(&short).is_err());
    }
}
