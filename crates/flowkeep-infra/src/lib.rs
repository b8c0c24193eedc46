//! Infrastructure layer for flowkeep.
//!
//! Contains implementations of the ports defined in `flowkeep-core`: the
//! SQLite checkpoint store and hospital repository, Ed25519 signing and
//! verification, and the `flowkeep.toml` configuration loader.

pub mod config;
pub mod crypto;
pub mod sqlite;
