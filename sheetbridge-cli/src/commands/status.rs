//! `sheetbridge status`: queue, history and subscriber visibility.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use sheetbridge_daemon::request_status;
use sheetbridge_sync::{EngineStatus, FlushReport};

/// Arguments for `sheetbridge status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    started_at: String,
    default_collection: String,
    engine: EngineStatus,
}

#[derive(Tabled)]
struct CollectionRow {
    #[tabled(rename = "collection")]
    collection: String,
    #[tabled(rename = "retained changes")]
    retained: usize,
    #[tabled(rename = "last version")]
    last_version: u64,
    #[tabled(rename = "subscribers")]
    subscribers: usize,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let data = super::daemon_call(request_status(&home), "failed to query daemon status")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        let reply: StatusReply =
            serde_json::from_value(data).context("unexpected status response from daemon")?;
        print_table(reply);
        Ok(())
    }
}

fn print_table(reply: StatusReply) {
    let engine = reply.engine;
    let tracked = engine
        .tracked_records
        .map(|count| count.to_string())
        .unwrap_or_else(|| "unavailable".to_string());
    println!(
        "SheetBridge v{} | up since {} | default collection {}",
        env!("CARGO_PKG_VERSION"),
        reply.started_at,
        reply.default_collection,
    );

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    println!(
        "queue {}  {}  records {}  locks {}  dead letters {}",
        engine.queue_depth,
        flush_indicator(engine.flush_in_progress),
        tracked,
        engine.active_locks,
        dead_letter_label(engine.dead_letters),
    );
    println!(
        "subscribers {}  connects {}  sent {}  evicted {}",
        engine.subscribers.total_subscribers,
        engine.subscribers.total_connects,
        engine.subscribers.messages_sent,
        engine.subscribers.evictions,
    );
    if let Some(report) = engine.last_flush.as_ref() {
        println!("last flush: {}", describe_flush(report));
    }
    println!("{separator}");

    let rows = collection_rows(&engine);
    if rows.is_empty() {
        println!("No collections have recorded changes yet.");
        return;
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if engine.dead_letters > 0 {
        println!("Run 'sheetbridge requeue-dead' to retry dead-lettered updates.");
    }
}

fn collection_rows(engine: &EngineStatus) -> Vec<CollectionRow> {
    let names: BTreeSet<&str> = engine
        .collections
        .keys()
        .chain(engine.subscribers.collections.keys())
        .map(String::as_str)
        .collect();

    names
        .into_iter()
        .map(|name| {
            let history = engine.collections.get(name);
            CollectionRow {
                collection: name.to_string(),
                retained: history.map_or(0, |h| h.retained),
                last_version: history.map_or(0, |h| h.last_version),
                subscribers: engine
                    .subscribers
                    .collections
                    .get(name)
                    .copied()
                    .unwrap_or(0),
            }
        })
        .collect()
}

fn flush_indicator(in_progress: bool) -> String {
    if in_progress {
        "■ flushing".yellow().bold().to_string()
    } else {
        "■ idle".green().bold().to_string()
    }
}

fn dead_letter_label(count: usize) -> String {
    if count == 0 {
        count.to_string()
    } else {
        count.to_string().red().bold().to_string()
    }
}

fn describe_flush(report: &FlushReport) -> String {
    format!(
        "{} | {} applied, {} stale, {} failed, {} propagated in {}ms",
        report.started_at.to_rfc3339(),
        report.applied,
        report.stale,
        report.failed,
        report.propagated,
        report.duration_ms,
    )
}
