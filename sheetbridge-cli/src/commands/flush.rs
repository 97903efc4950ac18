//! `sheetbridge flush` and `sheetbridge requeue-dead`.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;

use sheetbridge_daemon::{request_flush, request_requeue_dead};

/// Arguments for `sheetbridge flush`.
#[derive(Args, Debug)]
pub struct FlushArgs {
    /// Emit the raw flush report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl FlushArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let outcome = super::daemon_call(request_flush(&home), "failed to flush")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).context("failed to render flush report")?
            );
            return Ok(());
        }
        println!("{}", summarize_flush(&outcome));
        Ok(())
    }
}

/// Arguments for `sheetbridge requeue-dead`.
#[derive(Args, Debug)]
pub struct RequeueDeadArgs {}

impl RequeueDeadArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let data = super::daemon_call(
            request_requeue_dead(&home),
            "failed to requeue dead letters",
        )?;
        let requeued = data["requeued"].as_u64().unwrap_or(0);
        println!("requeued {requeued} dead-lettered update(s)");
        Ok(())
    }
}

fn summarize_flush(outcome: &Value) -> String {
    if outcome["outcome"] == "skipped" {
        return "flush skipped: another flush is in progress".yellow().to_string();
    }
    let count = |name: &str| outcome[name].as_u64().unwrap_or(0);
    let line = format!(
        "flushed {} update(s): {} applied, {} stale, {} failed, {} propagated",
        count("batch"),
        count("applied"),
        count("stale"),
        count("failed"),
        count("propagated"),
    );
    if count("failed") > 0 || count("propagation_failures") > 0 {
        line.red().to_string()
    } else {
        line.green().to_string()
    }
}
