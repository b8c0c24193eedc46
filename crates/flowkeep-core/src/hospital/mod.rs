//! Failure handling for runs.
//!
//! The `HospitalPolicy` classifies a failure and decides its disposition;
//! the `Hospital` keeps the per-run case record, notifies observers and
//! hands the disposition back to the state machine, which acts on it.

pub mod policy;
pub mod ward;

pub use policy::{Disposition, HospitalPolicy};
pub use ward::Hospital;
