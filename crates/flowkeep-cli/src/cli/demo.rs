//! `flowkeep demo`: the rates-fix flow end to end.
//!
//! Starts a `RatesFixFlow` for the bank party and an oracle on the same
//! session hub, then prints the signed transaction. With `--no-oracle` the
//! run is left suspended on its query so that `flowkeep recover` can finish
//! it from the stored checkpoint in a later process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use console::style;
use flowkeep_core::flow::FlowError;
use flowkeep_core::identity::Signer;
use flowkeep_core::oracle::{RatesFixFlow, TransactionHook};
use flowkeep_types::checkpoint::SuspensionKind;
use flowkeep_types::oracle::{Fix, Rate};
use flowkeep_types::run::RunStatus;
use flowkeep_types::session::PartyId;
use flowkeep_types::transaction::Transaction;
use tokio_util::sync::CancellationToken;

use super::output::{print_outcome, spawn_event_log};
use super::{FixArgs, wait_outcome};
use crate::state::{AppState, ORACLE};

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub fix: FixArgs,

    /// Rate the bank expects.
    #[arg(long, default_value = "0.05")]
    pub expected: Rate,

    /// Largest accepted distance between the expected and the fixed rate.
    #[arg(long, default_value = "0.001")]
    pub tolerance: Rate,

    /// Reload the run from its checkpoint after every suspension.
    #[arg(long)]
    pub reload: bool,

    /// Do not start the oracle; leave the run suspended for `recover`.
    #[arg(long)]
    pub no_oracle: bool,

    /// Seconds to wait for the run to settle.
    #[arg(long, default_value = "30")]
    pub timeout: u64,
}

/// Records the agreed rate as a transaction output before the oracle signs.
pub struct FixedRateOutput;

impl TransactionHook for FixedRateOutput {
    fn before_signing(&self, tx: &mut Transaction, fix: &Fix) -> Result<(), FlowError> {
        tx.add_output(serde_json::json!({
            "fixed_rate": fix.value,
            "of": fix.of.to_string(),
        }));
        Ok(())
    }
}

pub async fn run_demo(state: &AppState, args: DemoArgs, json: bool) -> Result<()> {
    let mut config = state.config.clone();
    config.reload_checkpoint_after_suspend |= args.reload;

    let engine = state.engine(config);
    let event_log = (!json).then(|| spawn_event_log(engine.subscribe()));
    let cancel = CancellationToken::new();
    if !args.no_oracle {
        state.serve_oracle(&engine, args.fix.fix(), cancel.clone());
    }

    let flow = RatesFixFlow::new(
        Transaction::new(),
        PartyId::new(ORACLE),
        state.identity.public_key(),
        args.fix.fix_of(),
        args.expected,
        args.tolerance,
    )
    .with_hook(Arc::new(FixedRateOutput));
    let run_id = engine.start(flow).await?;

    if args.no_oracle {
        let parked = RunStatus::Suspended(SuspensionKind::SendAndReceive);
        if let Some(mut status) = engine.watch_status(run_id) {
            tokio::time::timeout(Duration::from_secs(args.timeout), status.wait_for(|s| *s == parked))
                .await
                .map_err(|_| anyhow::anyhow!("run {run_id} never reached the oracle query"))??;
        }
        engine.shutdown().await;
        if let Some(log) = event_log {
            log.abort();
        }

        if json {
            println!("{}", serde_json::json!({"run_id": run_id, "status": parked}));
        } else {
            println!();
            println!(
                "  {} Run {} is suspended on its oracle query",
                style("‖").yellow().bold(),
                style(run_id).cyan()
            );
            println!("  Finish it with: {}", style("flowkeep recover").yellow());
            println!();
        }
        return Ok(());
    }

    let outcome = wait_outcome(&engine, run_id, args.timeout).await;
    let reloads = engine.reload_count(run_id);
    cancel.cancel();
    engine.shutdown().await;
    if let Some(log) = event_log {
        log.abort();
    }

    print_outcome(run_id, &outcome?, reloads, json)
}
