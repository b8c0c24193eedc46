//! Ed25519 signing identity and signature verification.
//!
//! Implements the `Signer` and `SignatureVerifier` ports from
//! `flowkeep-core` with `ed25519-dalek`. A node's secret key is kept as a
//! hex-encoded 32-byte seed in `{data_dir}/identity.key`.

use std::path::Path;

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use flowkeep_core::identity::{SignatureVerifier, Signer};
use flowkeep_types::identity::{DigitalSignature, PublicKey};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

/// File name of the secret seed inside the data directory.
pub const IDENTITY_FILE: &str = "identity.key";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("key file is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("secret key must be 32 bytes, got {0}")]
    Length(usize),
}

// ---------------------------------------------------------------------------
// Ed25519Identity
// ---------------------------------------------------------------------------

/// An Ed25519 key pair usable as a `Signer`.
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    /// Fresh key pair from the OS random number generator.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::from_secret(&secret)
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Load the key stored at `path`, generating and saving a new one if
    /// the file does not exist yet.
    pub async fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let bytes = hex::decode(content.trim())?;
                let secret: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::Length(bytes.len()))?;
                tracing::debug!(path = %path.display(), "loaded identity key");
                Ok(Self::from_secret(&secret))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, hex::encode(identity.signing_key.to_bytes())).await?;
                restrict_permissions(path).await?;
                tracing::info!(
                    path = %path.display(),
                    key = identity.public_key().short(),
                    "generated new identity key"
                );
                Ok(identity)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl Signer for Ed25519Identity {
    fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.signing_key.verifying_key().as_bytes())
    }

    fn sign(&self, bytes: &[u8]) -> DigitalSignature {
        use ed25519_dalek::Signer as _;
        let signature = self.signing_key.sign(bytes);
        DigitalSignature::new(self.public_key(), &signature.to_bytes())
    }
}

// ---------------------------------------------------------------------------
// Ed25519Verifier
// ---------------------------------------------------------------------------

/// Verifies Ed25519 signatures against hex-encoded public keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, signature: &DigitalSignature, bytes: &[u8], key: &PublicKey) -> bool {
        if signature.by != *key {
            return false;
        }

        let Some(verifying_key) = key
            .to_bytes()
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
            .and_then(|b| VerifyingKey::from_bytes(&b).ok())
        else {
            tracing::debug!(key = key.short(), "malformed public key");
            return false;
        };
        let Some(sig_bytes) = signature
            .signature_bytes()
            .ok()
            .and_then(|b| <[u8; 64]>::try_from(b.as_slice()).ok())
        else {
            tracing::debug!(key = key.short(), "malformed signature bytes");
            return false;
        };

        use ed25519_dalek::Verifier;
        verifying_key
            .verify(bytes, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Ed25519Identity::from_secret(&[42u8; 32]);
        let key = identity.public_key();
        assert_eq!(key.0.len(), 64);

        let sig = identity.sign(b"transaction bytes");
        assert_eq!(sig.by, key);
        assert!(Ed25519Verifier.verify(&sig, b"transaction bytes", &key));
        assert!(!Ed25519Verifier.verify(&sig, b"tampered bytes", &key));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let oracle = Ed25519Identity::from_secret(&[1u8; 32]);
        let other = Ed25519Identity::from_secret(&[2u8; 32]);
        let sig = oracle.sign(b"payload");

        assert!(!Ed25519Verifier.verify(&sig, b"payload", &other.public_key()));

        // Claiming the other key does not help either
        let forged = DigitalSignature {
            by: other.public_key(),
            bytes: sig.bytes.clone(),
        };
        assert!(!Ed25519Verifier.verify(&forged, b"payload", &other.public_key()));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let identity = Ed25519Identity::from_secret(&[3u8; 32]);
        let sig = DigitalSignature {
            by: identity.public_key(),
            bytes: "abcd".to_string(),
        };
        assert!(!Ed25519Verifier.verify(&sig, b"payload", &identity.public_key()));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(
            Ed25519Identity::generate().public_key(),
            Ed25519Identity::generate().public_key()
        );
    }

    #[tokio::test]
    async fn test_load_or_generate_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join(IDENTITY_FILE);

        let first = Ed25519Identity::load_or_generate(&path).await.unwrap();
        assert!(path.exists());
        let second = Ed25519Identity::load_or_generate(&path).await.unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[tokio::test]
    async fn test_load_rejects_short_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IDENTITY_FILE);
        tokio::fs::write(&path, "deadbeef").await.unwrap();

        let err = Ed25519Identity::load_or_generate(&path).await.err().unwrap();
        assert!(matches!(err, IdentityError::Length(4)));
    }
}
