use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "guild-defense-bot", version, about = "Guild defense alert tracker for Discord")]
pub struct Cli {
    /// YAML configuration file; defaults to `config.yaml` when present.
    #[arg(short, long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Overrides `logging.level` from the configuration.
    #[arg(long)]
    pub log_level: Option<String>,
}
