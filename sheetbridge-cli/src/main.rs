//! SheetBridge: keep a spreadsheet and a record store in step.
//!
//! # Usage
//!
//! ```text
//! sheetbridge init
//! sheetbridge daemon start|stop|status
//! sheetbridge write <key> --field status=shipped [--collection <name>]
//! sheetbridge ingest <key> --field "Status=Shipped" [--timestamp <rfc3339>]
//! sheetbridge poll [--collection <name>] [--since <version>] [--json]
//! sheetbridge subscribe [--collection <name>] [--count <n>]
//! sheetbridge flush
//! sheetbridge requeue-dead
//! sheetbridge status [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    flush::{FlushArgs, RequeueDeadArgs},
    init::InitArgs,
    poll::PollArgs,
    status::StatusArgs,
    subscribe::SubscribeArgs,
    write::{IngestArgs, WriteArgs},
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "sheetbridge",
    version,
    about = "Two-way sync between a spreadsheet and a record store",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default config.yaml if none exists.
    Init(InitArgs),

    /// Run or control the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Queue a client write (storage keys, trusted).
    Write(WriteArgs),

    /// Submit a sheet change notification (sheet labels, freshness-guarded).
    Ingest(IngestArgs),

    /// List changes newer than a version.
    Poll(PollArgs),

    /// Stream change events for a collection.
    Subscribe(SubscribeArgs),

    /// Run one flush cycle now.
    Flush(FlushArgs),

    /// Put dead-lettered updates back in the queue.
    RequeueDead(RequeueDeadArgs),

    /// Show queue, store and subscriber state.
    Status(StatusArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Write(args) => args.run(),
        Commands::Ingest(args) => args.run(),
        Commands::Poll(args) => args.run(),
        Commands::Subscribe(args) => args.run(),
        Commands::Flush(args) => args.run(),
        Commands::RequeueDead(args) => args.run(),
        Commands::Status(args) => args.run(),
    }
}
