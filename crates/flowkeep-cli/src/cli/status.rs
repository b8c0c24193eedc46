//! Engine status dashboard command.

use std::collections::BTreeMap;

use anyhow::Result;
use console::style;
use flowkeep_core::identity::Signer;
use flowkeep_core::repository::hospital::HospitalRepository;
use flowkeep_types::hospital::CaseState;

use crate::state::AppState;

/// Display checkpoint and hospital counts, configuration and identity.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let summaries = state.checkpoints.list_summaries().await?;
    let cases = state.cases.list_cases().await?;

    let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
    for summary in &summaries {
        *by_kind.entry(summary.kind.to_string()).or_default() += 1;
    }
    let observed = cases
        .iter()
        .filter(|c| c.state == CaseState::Observation)
        .count();
    let key = state.identity.public_key();
    let config = &state.config;

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "public_key": key,
            "checkpoints": {
                "total": summaries.len(),
                "by_kind": by_kind,
            },
            "hospital": {
                "cases": cases.len(),
                "observation": observed,
            },
            "engine": config,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("  {} flowkeep v{}", style("⚡").bold(), env!("CARGO_PKG_VERSION"));
    println!();

    println!("  {}", style("── Checkpoints ──").dim());
    println!("  Total:    {}", style(summaries.len()).bold());
    for (kind, count) in &by_kind {
        println!("  {:<9} {}", format!("{kind}:"), count);
    }
    println!();

    println!("  {}", style("── Hospital ──").dim());
    println!("  Cases:       {}", cases.len());
    if observed > 0 {
        println!("  Observation: {}", style(observed).yellow().bold());
    } else {
        println!("  Observation: {}", style(0).green());
    }
    println!();

    println!("  {}", style("── Engine ──").dim());
    println!("  Reload after suspend: {}", config.reload_checkpoint_after_suspend);
    println!("  Max retries:          {}", config.max_retry_attempts);
    println!(
        "  Retry backoff:        {}ms (max {}ms)",
        config.retry_backoff_ms, config.retry_backoff_max_ms
    );
    println!(
        "  Session timeout:      {}",
        config
            .session_timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "none".to_string())
    );
    println!("  Keep completed:       {}", config.checkpoint_retention_on_completion);
    println!("  Settled runs kept:    {}", config.settled_run_retention);
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!("  Database: {}", style("SQLite (WAL mode)").dim());
    println!("  Identity: {}", style(key.short()).cyan());
    println!();
    Ok(())
}
