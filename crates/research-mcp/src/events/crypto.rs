//! Authenticated encryption for stored event messages.
//!
//! Encrypted messages are wrapped into a sentinel JSON-RPC shape
//! `{method: "__encrypted", params: {iv, ct, authTag, algo}}` so the store
//! layout stays uniform. Decryption is authenticated; a failed tag check is
//! an error, never a plaintext fallback.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

/// Sentinel method name marking an encrypted payload.
pub const ENCRYPTED_METHOD: &str = "__encrypted";

const ALGO: &str = "aes-256-gcm";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encryption failure.
#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (bad key or tampered ciphertext)")]
    Decrypt,

    #[error("malformed encrypted envelope: {0}")]
    Envelope(String),
}

/// AES-256-GCM codec over JSON messages.
#[derive(Clone)]
pub struct EventCipher {
    key: [u8; 32],
}

impl EventCipher {
    /// Build from a hex-encoded 256-bit key.
    ///
    /// # Errors
    ///
    /// Returns error when the key is not 64 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        if hex.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 64 hex chars, got {}",
                hex.len()
            )));
        }
        let mut key = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| CryptoError::InvalidKey("non-ascii".into()))?;
            key[i] = u8::from_str_radix(s, 16)
                .map_err(|_| CryptoError::InvalidKey(format!("bad hex at byte {i}")))?;
        }
        Ok(Self { key })
    }

    /// Wrap a message into the encrypted sentinel envelope.
    pub fn encrypt(&self, message: &serde_json::Value) -> Result<serde_json::Value, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let plaintext = serde_json::to_vec(message).map_err(|_| CryptoError::Encrypt)?;
        let sealed =
            cipher.encrypt(Nonce::from_slice(&iv), plaintext.as_ref()).map_err(|_| CryptoError::Encrypt)?;

        // aes-gcm appends the tag to the ciphertext.
        let (ct, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(serde_json::json!({
            "method": ENCRYPTED_METHOD,
            "params": {
                "iv": BASE64.encode(iv),
                "ct": BASE64.encode(ct),
                "authTag": BASE64.encode(tag),
                "algo": ALGO,
            }
        }))
    }

    /// Unwrap an encrypted sentinel envelope back into the original message.
    pub fn decrypt(&self, envelope: &serde_json::Value) -> Result<serde_json::Value, CryptoError> {
        let params = envelope
            .get("params")
            .and_then(|p| p.as_object())
            .ok_or_else(|| CryptoError::Envelope("missing params".into()))?;

        let algo = params.get("algo").and_then(|v| v.as_str()).unwrap_or_default();
        if algo != ALGO {
            return Err(CryptoError::Envelope(format!("unsupported algo '{algo}'")));
        }

        let field = |name: &str| -> Result<Vec<u8>, CryptoError> {
            let encoded = params
                .get(name)
                .and_then(|v| v.as_str())
                .ok_or_else(|| CryptoError::Envelope(format!("missing {name}")))?;
            BASE64.decode(encoded).map_err(|_| CryptoError::Envelope(format!("bad base64 in {name}")))
        };

        let iv = field("iv")?;
        let ct = field("ct")?;
        let tag = field("authTag")?;
        if iv.len() != NONCE_LEN {
            return Err(CryptoError::Envelope("bad iv length".into()));
        }

        let mut sealed = ct;
        sealed.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext =
            cipher.decrypt(Nonce::from_slice(&iv), sealed.as_ref()).map_err(|_| CryptoError::Decrypt)?;

        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::Envelope("plaintext not JSON".into()))
    }
}

/// Whether a stored message is the encrypted sentinel.
#[must_use]
pub fn is_encrypted(message: &serde_json::Value) -> bool {
    message.get("method").and_then(|m| m.as_str()) == Some(ENCRYPTED_METHOD)
}

impl std::fmt::Debug for EventCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCipher").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    const KEY_B: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    #[test]
    fn test_roundtrip() {
        let cipher = EventCipher::from_hex(KEY_A).unwrap();
        let message = serde_json::json!({"jsonrpc": "2.0", "result": {"n": 1}, "id": 5});

        let envelope = cipher.encrypt(&message).unwrap();
        assert!(is_encrypted(&envelope));
        assert_eq!(cipher.decrypt(&envelope).unwrap(), message);
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = EventCipher::from_hex(KEY_A).unwrap();
        let b = EventCipher::from_hex(KEY_B).unwrap();

        let envelope = a.encrypt(&serde_json::json!({"secret": true})).unwrap();
        assert!(matches!(b.decrypt(&envelope), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = EventCipher::from_hex(KEY_A).unwrap();
        let mut envelope = cipher.encrypt(&serde_json::json!({"n": 1})).unwrap();

        envelope["params"]["ct"] = serde_json::json!(BASE64.encode(b"tampered"));
        assert!(cipher.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(EventCipher::from_hex("deadbeef").is_err());
        assert!(EventCipher::from_hex(&"zz".repeat(32)).is_err());
    }
}
