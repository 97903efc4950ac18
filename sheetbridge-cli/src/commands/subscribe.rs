//! `sheetbridge subscribe`: stream hub events as JSON lines.

use anyhow::Result;
use clap::Args;

use sheetbridge_daemon::subscribe;
use sheetbridge_sync::HubEvent;

/// Arguments for `sheetbridge subscribe`.
#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Collection to follow (defaults to the configured one).
    #[arg(long)]
    pub collection: Option<String>,

    /// Stop after this many change events.
    #[arg(long)]
    pub count: Option<usize>,

    /// Also print heartbeat events.
    #[arg(long)]
    pub heartbeats: bool,
}

impl SubscribeArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let mut seen = 0usize;
        let mut render_error = None;

        let result = subscribe(&home, self.collection, |event| {
            if matches!(event, HubEvent::Heartbeat { .. }) && !self.heartbeats {
                return true;
            }
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => {
                    render_error = Some(err);
                    return false;
                }
            }
            if matches!(event, HubEvent::Change { .. }) {
                seen += 1;
            }
            self.count.map_or(true, |limit| seen < limit)
        });

        super::daemon_call(result, "subscription failed")?;
        if let Some(err) = render_error {
            return Err(err.into());
        }
        Ok(())
    }
}
