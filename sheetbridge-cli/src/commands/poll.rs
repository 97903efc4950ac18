//! `sheetbridge poll`: list changes newer than a version.

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use sheetbridge_core::VersionedChange;
use sheetbridge_daemon::request_poll;

/// Arguments for `sheetbridge poll`.
#[derive(Args, Debug)]
pub struct PollArgs {
    /// Collection to read (defaults to the configured one).
    #[arg(long)]
    pub collection: Option<String>,

    /// Only changes with a version greater than this.
    #[arg(long, default_value_t = 0)]
    pub since: u64,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct PollReply {
    collection: String,
    changes: Vec<VersionedChange>,
    last_version: u64,
}

#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "version")]
    version: u64,
    #[tabled(rename = "key")]
    key: String,
    #[tabled(rename = "origin")]
    origin: &'static str,
    #[tabled(rename = "recorded")]
    recorded_at: String,
    #[tabled(rename = "fields")]
    fields: String,
}

impl PollArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let data = super::daemon_call(
            request_poll(&home, self.collection, self.since),
            "failed to poll changes",
        )?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).context("failed to render poll JSON")?
            );
            return Ok(());
        }

        let reply: PollReply =
            serde_json::from_value(data).context("unexpected poll response from daemon")?;
        print_table(reply);
        Ok(())
    }
}

fn print_table(reply: PollReply) {
    println!(
        "{} | {} change(s) | last version {}",
        reply.collection,
        reply.changes.len(),
        reply.last_version
    );
    if reply.changes.is_empty() {
        return;
    }

    let rows: Vec<ChangeRow> = reply.changes.into_iter().map(change_row).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn change_row(change: VersionedChange) -> ChangeRow {
    let fields = change
        .fields
        .iter()
        .map(|(name, value)| match value {
            serde_json::Value::String(text) => format!("{name}={text}"),
            other => format!("{name}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ");
    ChangeRow {
        version: change.version,
        key: change.key.0,
        origin: if change.external { "sheet" } else { "client" },
        recorded_at: change.recorded_at.to_rfc3339(),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn change_row_renders_fields_inline() {
        let change = VersionedChange {
            key: "DH001".into(),
            fields: [
                ("quantity".to_string(), json!(2)),
                ("status".to_string(), json!("open")),
            ]
            .into_iter()
            .collect(),
            version: 7,
            recorded_at: Utc::now(),
            external: true,
        };
        let row = change_row(change);
        assert_eq!(row.origin, "sheet");
        assert_eq!(row.fields, "quantity=2, status=open");
    }
}
