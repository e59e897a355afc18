//! Command-line surface of `otx-connector`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "otx-connector")]
#[command(about = "AlienVault OTX pulse import connector", long_about = None, version)]
pub struct Cli {
    /// YAML config layers in merge order (later overrides earlier).
    /// Defaults to ./config.yml when present.
    #[arg(long = "config", value_name = "PATH", global = true)]
    pub config: Vec<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the connector (default).
    Run {
        /// Run a single tick and exit, regardless of connector.run_and_terminate.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Resolve configuration, print the config hash and redacted snapshot, then exit.
    CheckConfig,

    /// Work log utilities
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AuditCmd {
    /// List work units that were opened and never closed.
    OpenUnits {
        #[arg(long, default_value = "state/work.jsonl")]
        work_log: PathBuf,
    },

    /// Verify the work log hash chain.
    Verify {
        #[arg(long, default_value = "state/work.jsonl")]
        work_log: PathBuf,
    },
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.cmd.clone().unwrap_or(Commands::Run { once: false })
    }
}
