use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "convoy", version, about = "declarative multi-host deployment")]
pub struct Args {
    #[arg(long, default_value = "convoy.toml")]
    pub config: PathBuf,
    /// Worker count for command trees, local and remote.
    #[arg(long, default_value_t = 5)]
    pub workers: usize,
    /// Agent binary to upload to managed hosts. Defaults to the
    /// `convoy-agent` next to this executable.
    #[arg(long)]
    pub agent_bin: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Drive every resource of an environment to its declared state.
    Deploy {
        environment: String,
        /// Decommission unused instances instead of just reporting them.
        #[arg(long)]
        allow_decommission: bool,
    },
    /// Run a package command against its target servers.
    Run {
        environment: String,
        command: String,
        /// Override the command's target selector.
        #[arg(long)]
        target: Option<String>,
        /// Extra arguments appended to the rendered command line.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Open an interactive shell on a resource.
    Ssh {
        environment: String,
        resource: String,
    },
    /// Open a named package tunnel and keep it up until interrupted.
    Tunnel {
        environment: String,
        tunnel: String,
        /// Resource to tunnel through; the first matching server otherwise.
        #[arg(long)]
        resource: Option<String>,
    },
}
