//! Rates-fix oracle protocol.
//!
//! `RatesFixFlow` asks an oracle for a rate, checks it against the expected
//! value, embeds it in a transaction and gets the oracle to sign that
//! transaction. `OracleService` is the in-process counterparty.

pub mod flow;
pub mod service;

use flowkeep_types::identity::PublicKey;
use flowkeep_types::oracle::{FixOf, Rate};
use thiserror::Error;

use crate::flow::FlowError;

pub use flow::{RatesFixFlow, TransactionHook};
pub use service::OracleService;

/// Business failures of the rates-fix protocol. None of them is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// The returned rate is further from the expected one than the tolerance.
    #[error("fix out of range by {by_amount}")]
    FixOutOfRange { by_amount: Rate },

    #[error("oracle returned a fix for {got}, expected {expected}")]
    UnexpectedFixMismatch { expected: FixOf, got: FixOf },

    #[error("oracle has no fix for {0}")]
    UnknownFix(FixOf),

    #[error("transaction signed by {got}, expected oracle key {expected}")]
    SignerMismatch { expected: PublicKey, got: PublicKey },

    #[error("oracle signature does not verify over the transaction")]
    InvalidSignature,

    #[error("oracle refused to sign: {0}")]
    SigningRefused(String),
}

impl From<OracleError> for FlowError {
    fn from(err: OracleError) -> Self {
        FlowError::rejected(err)
    }
}
