//! Business logic and repository trait definitions for flowkeep.
//!
//! This crate defines the "ports" (checkpoint and hospital repositories,
//! transport, identity) that the infrastructure layer implements, and the
//! engine built on them: the flow state machine, the hospital, the session
//! hub and the rates-fix oracle protocol. It depends only on
//! `flowkeep-types` -- never on `flowkeep-infra` or any database/IO crate.

pub mod event;
pub mod flow;
pub mod hospital;
pub mod identity;
pub mod oracle;
pub mod repository;
pub mod session;
