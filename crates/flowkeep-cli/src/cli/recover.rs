//! `flowkeep recover`: drive stored runs after a restart.

use anyhow::Result;
use clap::Args;
use console::style;
use tokio_util::sync::CancellationToken;

use super::output::{print_outcome, spawn_event_log};
use super::{FixArgs, wait_outcome};
use crate::state::AppState;

#[derive(Args, Debug, Clone)]
pub struct RecoverArgs {
    #[command(flatten)]
    pub fix: FixArgs,

    /// Seconds to wait for each recovered run to settle.
    #[arg(long, default_value = "30")]
    pub timeout: u64,
}

pub async fn recover(state: &AppState, args: RecoverArgs, json: bool) -> Result<()> {
    let engine = state.engine(state.config.clone());
    let event_log = (!json).then(|| spawn_event_log(engine.subscribe()));
    let cancel = CancellationToken::new();
    state.serve_oracle(&engine, args.fix.fix(), cancel.clone());

    let report = match engine.recover().await {
        Ok(report) => report,
        Err(e) => {
            cancel.cancel();
            engine.shutdown().await;
            return Err(e.into());
        }
    };

    if !json {
        println!();
        println!(
            "  {} Recovered {} run{}: {} resumed, {} restarted, {} held, {} already completed",
            style("↻").cyan().bold(),
            style(report.total()).bold(),
            if report.total() == 1 { "" } else { "s" },
            report.resumed.len(),
            report.restarted.len(),
            style(report.observed.len()).yellow(),
            report.completed.len(),
        );
    }

    let mut outcomes = Vec::new();
    for run_id in report.resumed.iter().chain(&report.restarted) {
        let outcome = wait_outcome(&engine, *run_id, args.timeout).await;
        let reloads = engine.reload_count(*run_id);
        match outcome {
            Ok(outcome) if json => outcomes.push(serde_json::json!({
                "run_id": run_id,
                "outcome": outcome,
                "reloads": reloads,
            })),
            Ok(outcome) => print_outcome(*run_id, &outcome, reloads, false)?,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "recovered run did not settle");
                if !json {
                    println!("  {} {e}", style("✗").red());
                }
            }
        }
    }

    cancel.cancel();
    engine.shutdown().await;
    if let Some(log) = event_log {
        log.abort();
    }

    if json {
        let value = serde_json::json!({
            "resumed": report.resumed,
            "restarted": report.restarted,
            "observed": report.observed,
            "completed": report.completed,
            "skipped": report.skipped,
            "outcomes": outcomes,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if report.total() == 0 {
        println!("  {} Nothing to recover", style("i").blue().bold());
        println!();
    }
    Ok(())
}
