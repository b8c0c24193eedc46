//! Checkpoint inspection commands: list, show, delete.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowkeep_core::repository::checkpoint::CheckpointStore;
use flowkeep_core::repository::hospital::HospitalRepository;
use flowkeep_types::hospital::CaseState;
use uuid::Uuid;

use super::output::{format_kind, format_relative_time, preview};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List stored checkpoints, oldest run first.
    #[command(alias = "ls")]
    List,

    /// Print a checkpoint as JSON.
    Show {
        /// Run id.
        run_id: Uuid,
    },

    /// Delete a run's checkpoint so it is never resumed.
    #[command(alias = "rm")]
    Delete {
        /// Run id.
        run_id: Uuid,

        /// Delete even if the run is held for observation.
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle(state: &AppState, action: CheckpointCommand, json: bool) -> Result<()> {
    match action {
        CheckpointCommand::List => list_checkpoints(state, json).await,
        CheckpointCommand::Show { run_id } => show_checkpoint(state, run_id, json).await,
        CheckpointCommand::Delete { run_id, force } => {
            delete_checkpoint(state, run_id, force, json).await
        }
    }
}

async fn list_checkpoints(state: &AppState, json: bool) -> Result<()> {
    let summaries = state.checkpoints.list_summaries().await?;

    if json {
        let rows: Vec<_> = summaries
            .iter()
            .map(|s| {
                serde_json::json!({
                    "run_id": s.run_id,
                    "sequence_number": s.sequence_number,
                    "flow_name": s.flow_name,
                    "kind": s.kind,
                    "updated_at": s.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!();
        println!(
            "  {} No stored checkpoints. Start a run with: {}",
            style("i").blue().bold(),
            style("flowkeep demo").yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Run").fg(Color::White),
        Cell::new("Flow").fg(Color::White),
        Cell::new("Seq").fg(Color::White),
        Cell::new("Waiting on").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for summary in &summaries {
        table.add_row(vec![
            Cell::new(summary.run_id).fg(Color::Cyan),
            Cell::new(&summary.flow_name),
            Cell::new(summary.sequence_number),
            Cell::new(format_kind(summary.kind)),
            Cell::new(format_relative_time(&summary.updated_at)).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} checkpoint{}",
        style(summaries.len()).bold(),
        if summaries.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

async fn show_checkpoint(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let Some(checkpoint) = state.checkpoints.get(&run_id).await? else {
        bail!("no checkpoint stored for run {run_id}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Run").bold(), style(checkpoint.run_id).cyan());
    println!("  Flow:       {}", checkpoint.flow_name);
    println!("  Sequence:   {}", checkpoint.sequence_number);
    println!("  Waiting on: {}", format_kind(checkpoint.kind()));
    println!("  Idempotent: {}", checkpoint.idempotent);
    println!("  Sessions:   {}", checkpoint.sessions.len());
    println!("  Taken:      {}", checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  State:      {}", preview(&checkpoint.state, 100));
    println!();
    Ok(())
}

async fn delete_checkpoint(state: &AppState, run_id: Uuid, force: bool, json: bool) -> Result<()> {
    let case = state.cases.get_case(&run_id).await?;
    if let Some(case) = case.as_ref().filter(|c| c.state == CaseState::Observation) {
        if !force {
            bail!(
                "run {run_id} is held for observation ({}); use `flowkeep hospital discard {run_id}` or pass --force",
                case.cause
            );
        }
    }

    let deleted = state.checkpoints.delete(&run_id).await?;
    if case.is_some() {
        state.cases.delete_case(&run_id).await?;
    }

    if json {
        println!("{}", serde_json::json!({"deleted": deleted, "run_id": run_id}));
    } else if deleted {
        println!("  {} Deleted checkpoint of run {}", style("✓").green().bold(), style(run_id).cyan());
    } else {
        println!("  {} No checkpoint stored for run {}", style("i").blue().bold(), style(run_id).cyan());
    }
    Ok(())
}
