//! Cryptographic operations: checkpoint digests and Ed25519 identities.

pub mod digest;
pub mod ed25519;
