//! In-process oracle responder.

use std::collections::HashMap;
use std::sync::Arc;

use flowkeep_types::oracle::{Fix, FixOf, OracleRequest, QueryReply, SignReply};
use flowkeep_types::session::{PartyId, SessionEnd, SessionOpened};
use flowkeep_types::transaction::Transaction;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::Signer;
use crate::session::SessionError;
use crate::session::hub::SessionHub;

/// Answers fix queries from a table of known fixes and signs transactions
/// whose fix commands agree with that table.
pub struct OracleService {
    party: PartyId,
    signer: Arc<dyn Signer>,
    fixes: HashMap<FixOf, Fix>,
    hub: Arc<SessionHub>,
}

impl OracleService {
    pub fn new(party: PartyId, signer: Arc<dyn Signer>, hub: Arc<SessionHub>) -> Self {
        Self {
            party,
            signer,
            fixes: HashMap::new(),
            hub,
        }
    }

    pub fn with_fix(mut self, fix: Fix) -> Self {
        self.fixes.insert(fix.of.clone(), fix);
        self
    }

    pub fn party(&self) -> &PartyId {
        &self.party
    }

    pub fn query(&self, fix_of: &FixOf) -> QueryReply {
        match self.fixes.get(fix_of) {
            Some(fix) => QueryReply::Fix { fix: fix.clone() },
            None => QueryReply::UnknownFix {
                fix_of: fix_of.clone(),
            },
        }
    }

    /// Sign `tx` if it carries at least one fix and every fix is one this
    /// oracle attests.
    pub fn sign(&self, tx: &Transaction) -> SignReply {
        let mut fixes = tx.commands.iter().filter_map(|command| command.fix()).peekable();
        if fixes.peek().is_none() {
            return SignReply::Refused {
                reason: "transaction carries no fix".to_string(),
            };
        }
        if let Some(unknown) = fixes.find(|fix| self.fixes.get(&fix.of) != Some(*fix)) {
            return SignReply::Refused {
                reason: format!("fix {} = {} is not attested", unknown.of, unknown.value),
            };
        }

        match tx.signing_bytes() {
            Ok(bytes) => SignReply::Signed {
                signature: self.signer.sign(&bytes),
            },
            Err(e) => SignReply::Refused {
                reason: format!("cannot encode transaction: {e}"),
            },
        }
    }

    fn handle(&self, request: OracleRequest) -> serde_json::Result<serde_json::Value> {
        match request {
            OracleRequest::Query(query) => serde_json::to_value(self.query(&query.fix_of)),
            OracleRequest::Sign(request) => serde_json::to_value(self.sign(&request.tx)),
        }
    }

    /// Serve sessions opened to this oracle's party until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut opened = self.hub.register_responder(self.party.clone());
        tokio::spawn(async move {
            info!(party = %self.party, fixes = self.fixes.len(), "oracle serving");
            loop {
                let notice = tokio::select! {
                    _ = cancel.cancelled() => break,
                    notice = opened.recv() => match notice {
                        Some(notice) => notice,
                        None => break,
                    },
                };
                let oracle = self.clone();
                tokio::spawn(async move { oracle.serve(notice).await });
            }
            self.hub.unregister_responder(&self.party);
            info!(party = %self.party, "oracle stopped");
        })
    }

    /// Answer the single request of one session, then close our end.
    async fn serve(&self, notice: SessionOpened) {
        let end = notice.acceptor_end();
        match self.respond(&end).await {
            Ok(()) => debug!(%end, initiator = %notice.initiator, "oracle replied"),
            Err(e) => {
                warn!(%end, initiator = %notice.initiator, error = %e, "oracle could not serve session");
            }
        }
        self.hub.close(&end);
    }

    async fn respond(&self, end: &SessionEnd) -> Result<(), SessionError> {
        let message = self.hub.receive_raw(end).await?;
        let unexpected = |e: serde_json::Error| SessionError::UnexpectedPayload {
            session: end.session,
            detail: e.to_string(),
        };
        let request: OracleRequest = serde_json::from_value(message.payload).map_err(unexpected)?;
        let reply = self.handle(request).map_err(unexpected)?;
        self.hub.send(end, &message.from, reply)
    }
}
