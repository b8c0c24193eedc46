//! Minimal transaction model used by the rates-fix protocol.
//!
//! A transaction is a list of output states plus commands, each command
//! naming the keys that must sign it. Ledger validation is not modelled;
//! the engine only needs stable signing bytes and signature attachment.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::collections::BTreeSet;

use crate::identity::{DigitalSignature, PublicKey};
use crate::oracle::Fix;

/// Data carried by a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandData {
    /// An oracle-attested rate.
    Fix(Fix),
    /// Any other application command.
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub data: CommandData,
    pub signers: Vec<PublicKey>,
}

impl Command {
    pub fn new(data: CommandData, signers: Vec<PublicKey>) -> Self {
        Self { data, signers }
    }

    pub fn fix(&self) -> Option<&Fix> {
        match &self.data {
            CommandData::Fix(fix) => Some(fix),
            CommandData::Custom { .. } => None,
        }
    }
}

/// An unsigned, in-progress transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    #[serde(default)]
    pub outputs: Vec<serde_json::Value>,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            outputs: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn add_command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn add_output(&mut self, output: serde_json::Value) -> &mut Self {
        self.outputs.push(output);
        self
    }

    /// Every key named as a signer by any command, deduplicated.
    pub fn required_signers(&self) -> BTreeSet<PublicKey> {
        self.commands
            .iter()
            .flat_map(|c| c.signers.iter().cloned())
            .collect()
    }

    /// Canonical bytes that signatures are computed over.
    ///
    /// serde_json writes struct fields in declaration order and JSON objects
    /// in key order, so equal transactions produce equal bytes.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// A transaction with signatures attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub signatures: Vec<DigitalSignature>,
}

impl SignedTransaction {
    pub fn new(tx: Transaction) -> Self {
        Self {
            tx,
            signatures: Vec::new(),
        }
    }

    pub fn with_signature(mut self, signature: DigitalSignature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Required signers that have not signed yet.
    pub fn missing_signers(&self) -> BTreeSet<PublicKey> {
        let mut missing = self.tx.required_signers();
        for sig in &self.signatures {
            missing.remove(&sig.by);
        }
        missing
    }
}
