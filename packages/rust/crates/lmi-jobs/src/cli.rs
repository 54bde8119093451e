use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lmi-jobs")]
#[command(about = "Inspect jobs persisted by an OpenLMI job manager profile.")]
pub(crate) struct Cli {
    /// Override config directory (holds `openlmi/lmi-jobs.yaml`).
    #[arg(long, global = true)]
    pub(crate) conf: Option<PathBuf>,

    /// Job storage root; defaults to the configured one.
    #[arg(long, global = true)]
    pub(crate) storage_root: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// List persisted jobs of a profile, in submission order.
    List {
        /// Profile name (e.g. Software).
        #[arg(long)]
        profile: String,
    },
    /// Print one persisted job as JSON.
    Show {
        /// Profile name (e.g. Software).
        #[arg(long)]
        profile: String,

        /// Job number.
        number: u64,
    },
}
