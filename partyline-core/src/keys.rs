//! Symmetric media-key bootstrap
//!
//! The offeror generates a fresh 32-byte key and ships it to the answerer in
//! a KEY_EXCHANGE envelope before offering; the answerer imports it and
//! acknowledges with ENCRYPTION_ENABLED. Every operation here is fallible by
//! contract and callers fall back to an unencrypted session on failure;
//! key exchange must never block call setup.

use bytes::Bytes;
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the media master key in bytes
pub const MEDIA_KEY_LEN: usize = 32;

/// Key bootstrap errors
#[derive(Error, Debug)]
pub enum KeyError {
    /// The OS random source failed
    #[error("key generation failed: {0}")]
    Generate(String),

    /// A KEY_EXCHANGE payload was not a string
    #[error("key payload is not a base64 string")]
    PayloadShape,

    /// Key material was not valid base64
    #[error("key material is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Key material had the wrong length
    #[error("key material has length {0}, expected {MEDIA_KEY_LEN}")]
    Length(usize),
}

/// Symmetric media master key for one peer session
///
/// Zeroized on drop. The coordinator only transports it; deriving per-frame
/// transform keys is the media layer's concern.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MediaKey {
    bytes: [u8; MEDIA_KEY_LEN],
}

impl MediaKey {
    /// View the raw key material
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        write!(f, "MediaKey([redacted; {MEDIA_KEY_LEN}])")
    }
}

/// Generate a fresh media key from the OS random source
///
/// # Errors
///
/// Returns [`KeyError::Generate`] if the OS random source fails.
pub fn generate() -> Result<MediaKey, KeyError> {
    let mut bytes = [0u8; MEDIA_KEY_LEN];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| KeyError::Generate(e.to_string()))?;
    Ok(MediaKey { bytes })
}

/// Export a key as raw bytes for transport
///
/// # Errors
///
/// Infallible today; kept fallible because callers must treat every step of
/// the bootstrap as best-effort.
pub fn export(key: &MediaKey) -> Result<Bytes, KeyError> {
    Ok(Bytes::copy_from_slice(&key.bytes))
}

/// Import a key from raw transported bytes
///
/// # Errors
///
/// Returns [`KeyError::Length`] if the material is not exactly
/// [`MEDIA_KEY_LEN`] bytes.
pub fn import(material: &[u8]) -> Result<MediaKey, KeyError> {
    if material.len() != MEDIA_KEY_LEN {
        return Err(KeyError::Length(material.len()));
    }
    let mut bytes = [0u8; MEDIA_KEY_LEN];
    bytes.copy_from_slice(material);
    Ok(MediaKey { bytes })
}

/// Encode a key as the KEY_EXCHANGE envelope payload (base64 text)
///
/// # Errors
///
/// Propagates export failures.
pub fn encode_payload(key: &MediaKey) -> Result<Value, KeyError> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let material = export(key)?;
    Ok(Value::String(STANDARD.encode(material)))
}

/// Decode a KEY_EXCHANGE envelope payload back into a key
///
/// # Errors
///
/// Returns [`KeyError`] if the payload is not a string, not base64, or the
/// decoded material has the wrong length.
pub fn decode_payload(data: &Value) -> Result<MediaKey, KeyError> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let text = data.as_str().ok_or(KeyError::PayloadShape)?;
    let material = STANDARD.decode(text)?;
    import(&material)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_keys_differ() {
        let a = generate().unwrap();
        let b = generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), MEDIA_KEY_LEN);
    }

    #[test]
    fn export_then_import_preserves_material() {
        let key = generate().unwrap();
        let material = export(&key).unwrap();
        let restored = import(&material).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn payload_round_trip() {
        let key = generate().unwrap();
        let payload = encode_payload(&key).unwrap();
        assert!(payload.is_string());
        let restored = decode_payload(&payload).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn import_rejects_wrong_length() {
        assert!(matches!(import(&[0u8; 16]), Err(KeyError::Length(16))));
        assert!(matches!(import(&[0u8; 64]), Err(KeyError::Length(64))));
    }

    #[test]
    fn decode_rejects_non_string_payload() {
        assert!(matches!(
            decode_payload(&json!({"key": "nope"})),
            Err(KeyError::PayloadShape)
        ));
    }

    #[test]
    fn decode_rejects_garbage_base64() {
        assert!(matches!(
            decode_payload(&json!("%%% not base64 %%%")),
            Err(KeyError::Decode(_))
        ));
    }

    #[test]
    fn debug_output_redacts_material() {
        let key = generate().unwrap();
        let printed = format!("{key:?}");
        assert!(printed.contains("redacted"));
        use base64::{engine::general_purpose::STANDARD, Engine};
        assert!(!printed.contains(&STANDARD.encode(key.as_bytes())));
    }
}
