//! Shared rendering helpers: run outcomes, engine events and styled labels.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowkeep_types::checkpoint::SuspensionKind;
use flowkeep_types::event::EngineEvent;
use flowkeep_types::hospital::CaseState;
use flowkeep_types::run::RunOutcome;
use flowkeep_types::transaction::SignedTransaction;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Print a run's terminal outcome.
pub fn print_outcome(run_id: Uuid, outcome: &RunOutcome, reloads: Option<u32>, json: bool) -> anyhow::Result<()> {
    if json {
        let value = serde_json::json!({
            "run_id": run_id,
            "outcome": outcome,
            "reloads": reloads,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    match outcome {
        RunOutcome::Completed { result } => {
            println!(
                "  {} Run {} completed",
                style("✓").green().bold(),
                style(run_id).cyan()
            );
            match serde_json::from_value::<SignedTransaction>(result.clone()) {
                Ok(signed) => print_transaction(&signed),
                Err(_) => println!("  Result: {}", preview(result, 80)),
            }
        }
        RunOutcome::Discarded { cause } => {
            println!("  {} Run {} discarded", style("✗").red().bold(), style(run_id).cyan());
            println!("  Cause: {}", style(cause).red());
        }
        RunOutcome::Observation { cause } => {
            println!(
                "  {} Run {} held for observation",
                style("!").yellow().bold(),
                style(run_id).cyan()
            );
            println!("  Cause: {}", style(cause).yellow());
            println!(
                "  Release with {} or drop with {}",
                style(format!("flowkeep hospital release {run_id}")).yellow(),
                style(format!("flowkeep hospital discard {run_id}")).yellow()
            );
        }
        RunOutcome::Halted => {
            println!("  {} Engine halted before run {} finished", style("✗").red().bold(), style(run_id).cyan());
        }
    }
    if let Some(reloads) = reloads.filter(|n| *n > 0) {
        println!("  Reloaded from checkpoint {} time{}", reloads, if reloads == 1 { "" } else { "s" });
    }
    println!();
    Ok(())
}

fn print_transaction(signed: &SignedTransaction) {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Part").fg(Color::White),
        Cell::new("Detail").fg(Color::White),
    ]);

    for command in &signed.tx.commands {
        let detail = match command.fix() {
            Some(fix) => format!("{} = {}", fix.of, fix.value),
            None => preview(&serde_json::to_value(&command.data).unwrap_or_default(), 60),
        };
        table.add_row(vec![Cell::new("command").fg(Color::Cyan), Cell::new(detail)]);
    }
    for output in &signed.tx.outputs {
        table.add_row(vec![Cell::new("output"), Cell::new(preview(output, 60))]);
    }
    for signature in &signed.signatures {
        table.add_row(vec![
            Cell::new("signature").fg(Color::Green),
            Cell::new(format!("by {}", signature.by.short())),
        ]);
    }

    println!();
    println!("  Transaction {}", style(signed.tx.id).dim());
    println!("{table}");
}

/// Log engine events to stderr as they happen, until aborted.
pub fn spawn_event_log(mut events: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => eprintln!("  {} {}", style("·").dim(), describe_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn describe_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::RunStarted { run_id, flow_name, .. } => {
            format!("started {flow_name} run {}", short_id(run_id))
        }
        EngineEvent::CheckpointPersisted {
            run_id,
            sequence_number,
            kind,
        } => format!("checkpoint #{sequence_number} ({kind}) for {}", short_id(run_id)),
        EngineEvent::RunReloaded { run_id, reload_count } => {
            format!("reloaded {} from checkpoint (reload {reload_count})", short_id(run_id))
        }
        EngineEvent::RunCompleted {
            run_id, duration_ms, ..
        } => format!("completed {} in {duration_ms}ms", short_id(run_id)),
        EngineEvent::RetryScheduled {
            run_id,
            attempt,
            delay_ms,
            cause,
        } => format!("retry {attempt} of {} in {delay_ms}ms: {cause}", short_id(run_id)),
        EngineEvent::RunDiscarded { run_id, cause } => {
            format!("discarded {}: {cause}", short_id(run_id))
        }
        EngineEvent::RunObserved { run_id, cause } => {
            format!("holding {} for observation: {cause}", short_id(run_id))
        }
        EngineEvent::RunCancelled { run_id } => format!("cancelled {}", short_id(run_id)),
        EngineEvent::InvariantViolated { detail } => format!("engine halted: {detail}"),
    }
}

// --- Formatting helpers ---

/// Last 12 hex digits of a run id; UUIDv7 prefixes are mostly timestamp.
pub fn short_id(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple[simple.len() - 12..].to_string()
}

pub fn format_kind(kind: SuspensionKind) -> String {
    match kind {
        SuspensionKind::Completed => format!("{}", style(kind).green()),
        SuspensionKind::Initial => format!("{}", style(kind).dim()),
        _ => format!("{}", style(kind).cyan()),
    }
}

pub fn format_case_state(state: CaseState) -> String {
    match state {
        CaseState::Observation => format!("{}", style("● observation").yellow()),
        CaseState::Retrying | CaseState::Admitted => format!("{}", style(format!("○ {state}")).cyan()),
        CaseState::Resolved => format!("{}", style("✓ resolved").green()),
        CaseState::Discarded => format!("{}", style("✗ discarded").red()),
    }
}

pub fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let diff = chrono::Utc::now() - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}

/// Compact one-line rendering of a JSON value.
pub fn preview(value: &serde_json::Value, max_len: usize) -> String {
    let s = match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "...".to_string()),
    };

    if s.chars().count() > max_len {
        let cut: String = s.chars().take(max_len).collect();
        format!("{cut}...")
    } else {
        s
    }
}
