use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

fn get_version() -> &'static str {
    const BASE_VERSION: &str = env!("CARGO_PKG_VERSION");

    if let Some(tag) = option_env!("UPDRAFT_GIT_TAG") {
        return tag;
    }

    let commit = option_env!("UPDRAFT_GIT_COMMIT").unwrap_or("unknown");
    let version = format!("v{}-{}", BASE_VERSION, commit);
    Box::leak(version.into_boxed_str())
}

#[derive(Parser)]
#[command(name = "updraft")]
#[command(about = "Checks for a newer release, downloads it and hands over to the installer")]
#[command(version = get_version(), propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (use multiple times for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce output to errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where to look for releases and how to find the installed version.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Metadata endpoint URL, tried in order (repeat or separate with commas)
    #[arg(long = "endpoint", value_delimiter = ',')]
    pub endpoints: Vec<String>,

    /// Installed executable whose version resource is read when --local-version is absent
    #[arg(long)]
    pub exe: Option<PathBuf>,

    /// Installed version, e.g. 1.4.2
    #[arg(long)]
    pub local_version: Option<String>,

    /// Network timeout in seconds (overrides the network_timeout_secs setting)
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check for a newer release and install it
    #[command(
        after_help = "Examples:\n  updraft update --endpoint https://example.com/update.json --pids 4120 --exe ./app\n  updraft update --endpoint https://a/u.json,https://b/u.json --pids 4120,4121 --local-version 1.2 -y"
    )]
    Update {
        #[command(flatten)]
        target: TargetArgs,

        /// Process ids to stop before the installer starts
        #[arg(long, value_delimiter = ',')]
        pids: Option<Vec<u32>>,

        /// Install without asking for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Only report whether a newer release exists
    Check {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Manage updraft's configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the current version
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration setting
    Get {
        /// Key to get (if omitted, shows all settings)
        key: Option<String>,
    },
    /// Set a configuration setting
    Set {
        /// Key and value (e.g., 'network-timeout-secs=10')
        key_value: String,
    },
    /// Reset a configuration setting to its default
    Unset {
        /// Key to unset (e.g., 'workspace-root')
        key: String,
    },
    /// Show full configuration
    Show {
        /// Output format (json, yaml, plain)
        #[arg(long, default_value = "json")]
        format: String,
    },
}
