//! `sheetbridge write` and `sheetbridge ingest`: submit one update to the daemon.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::Value;

use sheetbridge_core::FieldMap;
use sheetbridge_daemon::{request_ingest, request_write};

/// Arguments for `sheetbridge write`.
#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Business key of the record.
    pub key: String,

    /// Field assignment using storage keys, e.g. `status=shipped`. Repeatable.
    #[arg(long = "field", short = 'f', value_name = "KEY=VALUE", required = true)]
    pub fields: Vec<String>,

    /// Target collection (defaults to the configured one).
    #[arg(long)]
    pub collection: Option<String>,
}

impl WriteArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let fields = parse_fields(&self.fields)?;
        let outcome = super::daemon_call(
            request_write(&home, self.collection, self.key, fields),
            "failed to submit write",
        )?;
        print_value(&outcome)
    }
}

/// Arguments for `sheetbridge ingest`.
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Business key of the sheet row.
    pub key: String,

    /// Cell assignment using sheet labels, e.g. `"Status=Shipped"`. Repeatable.
    #[arg(long = "field", short = 'f', value_name = "LABEL=VALUE", required = true)]
    pub fields: Vec<String>,

    /// Sheet the row belongs to (defaults to the configured collection).
    #[arg(long)]
    pub collection: Option<String>,

    /// When the edit happened, RFC 3339. Defaults to now.
    #[arg(long)]
    pub timestamp: Option<String>,
}

impl IngestArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let fields = parse_fields(&self.fields)?;
        let timestamp = self
            .timestamp
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;
        let outcome = super::daemon_call(
            request_ingest(&home, self.collection, self.key, fields, timestamp),
            "failed to submit change notification",
        )?;
        print_value(&outcome)
    }
}

pub(crate) fn parse_fields(assignments: &[String]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for assignment in assignments {
        let (name, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{assignment}'"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("empty field name in '{assignment}'"));
        }
        fields.insert(name.to_string(), parse_value(raw));
    }
    Ok(fields)
}

/// Numbers, booleans and JSON literals keep their type; anything else is text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("invalid --timestamp '{raw}', expected RFC 3339"))
}

fn print_value(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon response")?
    );
    Ok(())
}
