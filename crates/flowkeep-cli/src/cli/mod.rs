//! CLI command definitions for the `flowkeep` binary.
//!
//! Uses clap derive macros for argument parsing. Resource commands follow a
//! noun-verb pattern (e.g., `flowkeep checkpoints list`,
//! `flowkeep hospital release <run-id>`).

pub mod checkpoints;
pub mod demo;
pub mod hospital;
pub mod output;
pub mod recover;
pub mod status;

use std::time::Duration;

use anyhow::anyhow;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use flowkeep_types::oracle::{Fix, FixOf, Rate};
use flowkeep_types::run::RunOutcome;
use uuid::Uuid;

use crate::state::Engine;

/// Durable, checkpointed workflows with an oracle rate-fix demo.
#[derive(Parser)]
#[command(name = "flowkeep", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for engine debug logs, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the rates-fix flow against an in-process oracle.
    Demo(demo::DemoArgs),

    /// Drive every stored run after a restart.
    Recover(recover::RecoverArgs),

    /// Inspect stored checkpoints.
    #[command(alias = "cp")]
    Checkpoints {
        #[command(subcommand)]
        action: checkpoints::CheckpointCommand,
    },

    /// Inspect hospital cases and act on runs held for observation.
    Hospital {
        #[command(subcommand)]
        action: hospital::HospitalCommand,
    },

    /// Engine status dashboard.
    Status,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// The rate the in-process oracle attests.
#[derive(Args, Debug, Clone)]
pub struct FixArgs {
    /// Rate name.
    #[arg(long, default_value = "LIBOR")]
    pub fix_name: String,

    /// Rate tenor.
    #[arg(long, default_value = "3M")]
    pub tenor: String,

    /// Day the rate is fixed for (YYYY-MM-DD).
    #[arg(long, default_value = "2016-03-16")]
    pub day: NaiveDate,

    /// Value the oracle reports.
    #[arg(long, default_value = "0.0502")]
    pub rate: Rate,
}

impl FixArgs {
    pub fn fix_of(&self) -> FixOf {
        FixOf::new(self.fix_name.clone(), self.day, self.tenor.clone())
    }

    pub fn fix(&self) -> Fix {
        Fix {
            of: self.fix_of(),
            value: self.rate,
        }
    }
}

/// Wait for a run's outcome, giving up after `timeout_secs`.
pub async fn wait_outcome(engine: &Engine, run_id: Uuid, timeout_secs: u64) -> anyhow::Result<RunOutcome> {
    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), engine.wait(run_id))
        .await
        .map_err(|_| anyhow!("run {run_id} did not settle within {timeout_secs}s"))??;
    Ok(outcome)
}
