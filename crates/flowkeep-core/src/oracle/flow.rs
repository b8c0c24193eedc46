//! The client side of the rates-fix protocol.

use std::sync::Arc;

use flowkeep_types::identity::PublicKey;
use flowkeep_types::oracle::{Fix, FixOf, FixQuery, OracleRequest, QueryReply, Rate, SignReply, SignRequest};
use flowkeep_types::session::{PartyId, SessionId};
use flowkeep_types::transaction::{Command, CommandData, SignedTransaction, Transaction};
use serde::{Deserialize, Serialize};

use super::OracleError;
use crate::flow::{FlowAction, FlowContext, FlowError, FlowLogic, FlowRegistry, Resumed, SuspendOn};

/// Adjusts the transaction after the fix is embedded and before it goes to
/// the oracle for signing. Must not block.
pub trait TransactionHook: Send + Sync {
    fn before_signing(&self, tx: &mut Transaction, fix: &Fix) -> Result<(), FlowError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum Step {
    Start,
    AwaitingFix { session: SessionId },
    AwaitingSignature { session: SessionId },
    Done,
}

/// Query an oracle for a rate fix, embed it and obtain the oracle's signature.
///
/// Completes with the `SignedTransaction`.
#[derive(Serialize, Deserialize)]
pub struct RatesFixFlow {
    tx: Transaction,
    oracle: PartyId,
    oracle_key: PublicKey,
    fix_of: FixOf,
    expected_rate: Rate,
    rate_tolerance: Rate,
    step: Step,
    #[serde(skip)]
    hook: Option<Arc<dyn TransactionHook>>,
}

impl RatesFixFlow {
    pub fn new(
        tx: Transaction,
        oracle: PartyId,
        oracle_key: PublicKey,
        fix_of: FixOf,
        expected_rate: Rate,
        rate_tolerance: Rate,
    ) -> Self {
        Self {
            tx,
            oracle,
            oracle_key,
            fix_of,
            expected_rate,
            rate_tolerance,
            step: Step::Start,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn TransactionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Register the flow so restored instances get `hook` back.
    pub fn register(registry: &mut FlowRegistry, hook: Option<Arc<dyn TransactionHook>>) {
        registry.register_with::<RatesFixFlow, _>(move |flow| flow.hook = hook.clone());
    }

    fn query(&mut self, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        let session = ctx.new_session();
        let request = OracleRequest::Query(FixQuery {
            fix_of: self.fix_of.clone(),
            reply_to: ctx.party().clone(),
            session,
        });
        self.step = Step::AwaitingFix { session };
        Ok(FlowAction::suspend(SuspendOn::SendAndReceive {
            to: self.oracle.clone(),
            session,
            payload: serde_json::to_value(request)?,
        }))
    }

    fn accept_fix(&mut self, reply: QueryReply, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        let fix = match reply {
            QueryReply::Fix { fix } => fix,
            QueryReply::UnknownFix { fix_of } => return Err(OracleError::UnknownFix(fix_of).into()),
        };
        if fix.of != self.fix_of {
            return Err(OracleError::UnexpectedFixMismatch {
                expected: self.fix_of.clone(),
                got: fix.of,
            }
            .into());
        }

        let difference = fix.value.abs_diff(self.expected_rate);
        if difference > self.rate_tolerance {
            return Err(OracleError::FixOutOfRange {
                by_amount: difference - self.rate_tolerance,
            }
            .into());
        }

        self.tx.add_command(Command::new(
            CommandData::Fix(fix.clone()),
            vec![self.oracle_key.clone()],
        ));
        if let Some(hook) = &self.hook {
            hook.before_signing(&mut self.tx, &fix)?;
        }

        let session = ctx.new_session();
        let request = OracleRequest::Sign(SignRequest {
            tx: self.tx.clone(),
            reply_to: ctx.party().clone(),
            session,
        });
        self.step = Step::AwaitingSignature { session };
        Ok(FlowAction::suspend(SuspendOn::SendAndReceive {
            to: self.oracle.clone(),
            session,
            payload: serde_json::to_value(request)?,
        }))
    }

    fn accept_signature(&mut self, reply: SignReply, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        let signature = match reply {
            SignReply::Signed { signature } => signature,
            SignReply::Refused { reason } => return Err(OracleError::SigningRefused(reason).into()),
        };
        if signature.by != self.oracle_key {
            return Err(OracleError::SignerMismatch {
                expected: self.oracle_key.clone(),
                got: signature.by,
            }
            .into());
        }
        let bytes = self.tx.signing_bytes()?;
        if !ctx.verify(&signature, &bytes, &self.oracle_key) {
            return Err(OracleError::InvalidSignature.into());
        }

        self.step = Step::Done;
        let signed = SignedTransaction::new(self.tx.clone()).with_signature(signature);
        FlowAction::complete(&signed)
    }
}

impl FlowLogic for RatesFixFlow {
    const NAME: &'static str = "rates_fix";

    fn advance(&mut self, resumed: Resumed, ctx: &FlowContext) -> Result<FlowAction, FlowError> {
        match (self.step.clone(), resumed) {
            (Step::Start, Resumed::Start) => self.query(ctx),
            (Step::AwaitingFix { .. }, resumed @ Resumed::Message(_)) => {
                let reply = resumed.payload()?;
                self.accept_fix(reply, ctx)
            }
            (Step::AwaitingSignature { .. }, resumed @ Resumed::Message(_)) => {
                let reply = resumed.payload()?;
                self.accept_signature(reply, ctx)
            }
            (step, resumed) => Err(FlowError::UnexpectedPayload(format!(
                "{resumed:?} while in step {step:?}"
            ))),
        }
    }
}
