//! Identity key and signature value types.
//!
//! Keys and signatures travel hex-encoded so checkpoints and session
//! payloads stay plain JSON. The signing itself lives behind the `Signer`
//! and `SignatureVerifier` traits in flowkeep-core.

use serde::{Deserialize, Serialize};

use std::fmt;

/// Hex-encoded public key of a signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub String);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.0)
    }

    /// First 8 hex characters, for logs and tables.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signature together with the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature {
    pub by: PublicKey,
    /// Hex-encoded signature bytes.
    pub bytes: String,
}

impl DigitalSignature {
    pub fn new(by: PublicKey, bytes: &[u8]) -> Self {
        Self {
            by,
            bytes: hex::encode(bytes),
        }
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_hex_roundtrip() {
        let key = PublicKey::from_bytes(&[0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert_eq!(key.to_string(), "deadbeef01");
        assert_eq!(key.short(), "deadbeef");
        assert_eq!(key.to_bytes().unwrap(), vec![0xde, 0xad, 0xbe, 0xef, 0x01]);
    }

    #[test]
    fn signature_with_bad_hex_fails_to_decode() {
        let sig = DigitalSignature {
            by: PublicKey::from_bytes(&[1, 2]),
            bytes: "zz".to_string(),
        };
        assert!(sig.signature_bytes().is_err());
    }
}
