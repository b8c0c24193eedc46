//! Signing and verification ports.
//!
//! The engine never touches key material directly. Flows verify
//! counterparty signatures through `SignatureVerifier`; responders such as
//! the oracle sign through `Signer`. flowkeep-infra provides Ed25519
//! implementations.

use flowkeep_types::identity::{DigitalSignature, PublicKey};

/// A signing identity.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, bytes: &[u8]) -> DigitalSignature;
}

/// Checks signatures produced by some `Signer`.
pub trait SignatureVerifier: Send + Sync {
    /// `true` if `signature` is a valid signature of `bytes` by `key`.
    fn verify(&self, signature: &DigitalSignature, bytes: &[u8], key: &PublicKey) -> bool;
}

/// Verifier used when none is configured. Accepts nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllVerifier;

impl SignatureVerifier for RejectAllVerifier {
    fn verify(&self, _signature: &DigitalSignature, _bytes: &[u8], key: &PublicKey) -> bool {
        tracing::warn!(key = key.short(), "no signature verifier configured, rejecting signature");
        false
    }
}
