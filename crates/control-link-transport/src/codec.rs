//! Message codec with an optional encryption envelope.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand_core::{OsRng, RngCore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{credentials::EncryptionKey, protocol::ControlMessage};

const NONCE_LEN: usize = 12;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
    #[error("Encryption requested but no key is loaded")]
    NoKey,
}

/// Symmetric cipher used for the envelope.
pub trait Cipher: Send + Sync {
    /// Encrypt bytes.
    ///
    /// # Errors
    /// Returns error if encryption fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decrypt bytes.
    ///
    /// # Errors
    /// Returns error if the ciphertext is malformed or fails authentication.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// ChaCha20-Poly1305 keyed by the SHA-256 of the key material.
///
/// Output layout: nonce (12 bytes) + ciphertext with tag.
pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    /// Derive a cipher from key material.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let digest = Sha256::digest(key.expose().as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&digest)),
        }
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CodecError::Decrypt);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CodecError::Decrypt)
    }
}

/// How an inbound message arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// No envelope.
    Plain,
    /// Envelope unwrapped successfully.
    Encrypted,
    /// Looked like an envelope but could not be unwrapped; passed through as-is.
    Undecryptable,
}

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: Value,
    pub envelope: Envelope,
}

/// Wraps and unwraps payloads.
///
/// Decoding is lenient: an envelope that cannot be unwrapped is treated as
/// plaintext so peers on either side of a key rotation keep talking.
#[derive(Clone, Default)]
pub struct MessageCodec {
    cipher: Option<Arc<dyn Cipher>>,
}

impl std::fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCodec")
            .field("has_cipher", &self.cipher.is_some())
            .finish()
    }
}

impl MessageCodec {
    /// Codec without a key; encodes plaintext only.
    #[must_use]
    pub fn plain() -> Self {
        Self { cipher: None }
    }

    /// Codec with a cipher.
    #[must_use]
    pub fn with_cipher(cipher: Arc<dyn Cipher>) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    /// Codec for optional key material.
    #[must_use]
    pub fn from_key(key: Option<&EncryptionKey>) -> Self {
        key.map_or_else(Self::plain, |key| {
            Self::with_cipher(Arc::new(ChaChaCipher::new(key)))
        })
    }

    /// Whether a key is loaded.
    #[must_use]
    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize a message, wrapping it when `encrypt` is set.
    ///
    /// # Errors
    /// Returns error if serialization or encryption fails, or no key is loaded.
    pub fn encode(&self, message: &Value, encrypt: bool) -> Result<String, CodecError> {
        let plaintext = serde_json::to_string(message)?;
        if !encrypt {
            return Ok(plaintext);
        }
        let cipher = self.cipher.as_ref().ok_or(CodecError::NoKey)?;
        let sealed = cipher.encrypt(plaintext.as_bytes())?;
        let envelope = ControlMessage::Encrypted {
            payload: BASE64.encode(sealed),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse an inbound frame, unwrapping an envelope when possible.
    ///
    /// # Errors
    /// Returns error only if the frame is not JSON.
    pub fn decode(&self, text: &str) -> Result<Decoded, CodecError> {
        let value: Value = serde_json::from_str(text)?;

        let payload = match (value.get("type").and_then(Value::as_str), value.get("payload")) {
            (Some("encrypted"), Some(Value::String(payload))) => payload,
            _ => {
                return Ok(Decoded {
                    message: value,
                    envelope: Envelope::Plain,
                });
            }
        };

        match self.unwrap_payload(payload) {
            Ok(message) => Ok(Decoded {
                message,
                envelope: Envelope::Encrypted,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Undecryptable envelope, treating as plaintext");
                Ok(Decoded {
                    message: value,
                    envelope: Envelope::Undecryptable,
                })
            }
        }
    }

    fn unwrap_payload(&self, payload: &str) -> Result<Value, CodecError> {
        let cipher = self.cipher.as_ref().ok_or(CodecError::NoKey)?;
        let sealed = BASE64.decode(payload)?;
        let plaintext = cipher.decrypt(&sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Value {
        json!({
            "command_id": "cmd-1",
            "success": true,
            "result": { "title": "Example", "links": [1, 2, 3] },
            "error": null,
            "timestamp": 1_700_000_000_000_i64
        })
    }

    fn keyed(material: &str) -> MessageCodec {
        MessageCodec::from_key(Some(&EncryptionKey::new(material)))
    }

    #[test]
    fn test_roundtrip_plaintext() {
        let codec = MessageCodec::plain();
        let text = codec.encode(&sample(), false).unwrap();
        let decoded = codec.decode(&text).unwrap();
        assert_eq!(decoded.message, sample());
        assert_eq!(decoded.envelope, Envelope::Plain);
    }

    #[test]
    fn test_roundtrip_encrypted() {
        let codec = keyed("shared-secret");
        let text = codec.encode(&sample(), true).unwrap();
        assert!(!text.contains("cmd-1"));

        let wire: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(wire["type"], "encrypted");

        let decoded = codec.decode(&text).unwrap();
        assert_eq!(decoded.message, sample());
        assert_eq!(decoded.envelope, Envelope::Encrypted);
    }

    #[test]
    fn test_roundtrip_assorted_values() {
        let plain = MessageCodec::plain();
        let codec = keyed("shared-secret");
        let cases = [
            Value::Null,
            json!(true),
            json!(0),
            json!(-42),
            json!(u64::MAX),
            json!(1.5),
            json!(""),
            json!("héllo wörld ✓ 日本語 🚀"),
            json!("line\nbreak\t\"quoted\""),
            json!([]),
            json!({}),
            json!([[1, [2, [3, []]]], { "a": [null, false] }]),
            json!({ "nested": { "deeper": { "list": ["x", { "y": {} }] } } }),
            json!({ "type": "encrypted", "payload": "x" }),
        ];

        for case in cases {
            let text = plain.encode(&case, false).unwrap();
            assert_eq!(plain.decode(&text).unwrap().message, case, "plaintext: {case}");

            let text = codec.encode(&case, true).unwrap();
            let decoded = codec.decode(&text).unwrap();
            assert_eq!(decoded.envelope, Envelope::Encrypted, "encrypted: {case}");
            assert_eq!(decoded.message, case, "encrypted: {case}");
        }
    }

    #[test]
    fn test_lookalike_plaintext_passes_through_keyed_codec() {
        let codec = keyed("shared-secret");
        let lookalike = json!({ "type": "encrypted", "payload": "x" });
        let decoded = codec.decode(&lookalike.to_string()).unwrap();
        assert_eq!(decoded.envelope, Envelope::Undecryptable);
        assert_eq!(decoded.message, lookalike);
    }

    #[test]
    fn test_wrong_key_falls_back_to_plaintext() {
        let sender = keyed("old-key");
        let receiver = keyed("new-key");
        let text = sender.encode(&sample(), true).unwrap();

        let decoded = receiver.decode(&text).unwrap();
        assert_eq!(decoded.envelope, Envelope::Undecryptable);
        assert_eq!(decoded.message["type"], "encrypted");
    }

    #[test]
    fn test_plaintext_accepted_by_keyed_codec() {
        let codec = keyed("k");
        let decoded = codec.decode(r#"{"command_id":"a","type":"click"}"#).unwrap();
        assert_eq!(decoded.envelope, Envelope::Plain);
        assert_eq!(decoded.message["type"], "click");
    }

    #[test]
    fn test_encrypt_without_key_is_error() {
        let codec = MessageCodec::plain();
        assert!(matches!(codec.encode(&sample(), true), Err(CodecError::NoKey)));
    }

    #[test]
    fn test_non_json_is_error() {
        let codec = MessageCodec::plain();
        assert!(matches!(codec.decode("not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_truncated_ciphertext_is_rejected() {
        let cipher = ChaChaCipher::new(&EncryptionKey::new("k"));
        assert!(matches!(cipher.decrypt(&[1, 2, 3]), Err(CodecError::Decrypt)));
    }
}
