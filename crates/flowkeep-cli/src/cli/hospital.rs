//! Hospital commands: list cases, release or discard runs held for
//! observation.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowkeep_core::repository::hospital::HospitalRepository;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::output::{format_case_state, format_relative_time, print_outcome, spawn_event_log};
use super::{FixArgs, wait_outcome};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum HospitalCommand {
    /// List hospital cases, most recent first.
    #[command(alias = "ls")]
    List,

    /// Drive a run held for observation again from its checkpoint.
    Release {
        /// Run id.
        run_id: Uuid,

        #[command(flatten)]
        fix: FixArgs,

        /// Seconds to wait for the run to settle.
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Give up on a run held for observation and delete its checkpoint.
    Discard {
        /// Run id.
        run_id: Uuid,
    },
}

pub async fn handle(state: &AppState, action: HospitalCommand, json: bool) -> Result<()> {
    match action {
        HospitalCommand::List => list_cases(state, json).await,
        HospitalCommand::Release {
            run_id,
            fix,
            timeout,
        } => release(state, run_id, fix, timeout, json).await,
        HospitalCommand::Discard { run_id } => discard(state, run_id, json).await,
    }
}

async fn list_cases(state: &AppState, json: bool) -> Result<()> {
    let cases = state.cases.list_cases().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&cases)?);
        return Ok(());
    }

    if cases.is_empty() {
        println!();
        println!("  {} The hospital is empty", style("✓").green().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").fg(Color::White),
        Cell::new("State").fg(Color::White),
        Cell::new("Class").fg(Color::White),
        Cell::new("Retries").fg(Color::White),
        Cell::new("Cause").fg(Color::White),
        Cell::new("Admitted").fg(Color::White),
    ]);

    for case in &cases {
        table.add_row(vec![
            Cell::new(case.run_id).fg(Color::Cyan),
            Cell::new(format_case_state(case.state)),
            Cell::new(case.class),
            Cell::new(case.attempt_count),
            Cell::new(&case.cause),
            Cell::new(format_relative_time(&case.admitted_at)).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn release(state: &AppState, run_id: Uuid, fix: FixArgs, timeout: u64, json: bool) -> Result<()> {
    let engine = state.engine(state.config.clone());
    let event_log = (!json).then(|| spawn_event_log(engine.subscribe()));
    let cancel = CancellationToken::new();
    state.serve_oracle(&engine, fix.fix(), cancel.clone());

    let result = match engine.release(run_id).await {
        Ok(()) => wait_outcome(&engine, run_id, timeout).await,
        Err(e) => Err(e.into()),
    };
    let reloads = engine.reload_count(run_id);

    cancel.cancel();
    engine.shutdown().await;
    if let Some(log) = event_log {
        log.abort();
    }
    print_outcome(run_id, &result?, reloads, json)
}

async fn discard(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let engine = state.engine(state.config.clone());
    let result = engine.discard(run_id).await;
    engine.shutdown().await;
    result?;

    if json {
        println!("{}", serde_json::json!({"discarded": true, "run_id": run_id}));
    } else {
        println!(
            "  {} Discarded run {} and deleted its checkpoint",
            style("✓").green().bold(),
            style(run_id).cyan()
        );
    }
    Ok(())
}
