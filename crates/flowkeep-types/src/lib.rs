//! Shared domain types for flowkeep.
//!
//! This crate contains the data model of the durable workflow engine:
//! checkpoints, sessions, hospital cases, run status, engine events,
//! configuration, identity keys and the oracle/transaction payloads used by
//! the rates-fix protocol.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, hex.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod hospital;
pub mod identity;
pub mod oracle;
pub mod run;
pub mod session;
pub mod transaction;
