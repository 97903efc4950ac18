//! `sheetbridge init`

use anyhow::{Context, Result};
use clap::Args;

use sheetbridge_core::config;

/// Write `~/.sheetbridge/config.yaml` with defaults.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Print the resulting configuration.
    #[arg(long)]
    pub show: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let existed = config::config_path_at(&home).exists();
        let (config, path) = config::init_at(&home)
            .with_context(|| format!("failed to initialise {}", home.display()))?;

        if existed {
            println!("✓ Using existing config at {}", path.display());
        } else {
            println!("✓ Wrote default config to {}", path.display());
        }
        println!(
            "  default collection '{}', {} mapped column(s), flush every {} ms",
            config.default_collection,
            config.mappings.len(),
            config.flush_interval_ms
        );

        if self.show {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("failed to render config")?
            );
        }
        Ok(())
    }
}
