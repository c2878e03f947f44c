use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use disasterlink_core::Priority;

#[derive(Parser)]
#[command(name = "dlink")]
#[command(about = "Raise SOS alerts and queue messages, even without a connection")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local ledger database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name for remote authority configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Remote authority base URL (overrides profile and DLINK_REMOTE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub remote_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Raise, inspect and update SOS alerts
    Alert {
        #[command(subcommand)]
        command: AlertCommands,
    },
    /// Queue outbound messages
    #[command(alias = "msg")]
    Message {
        #[command(subcommand)]
        command: MessageCommands,
    },
    /// Push pending changes to the remote authority and pull updates
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and dismiss sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Show engine status and pending work
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the foreground while connectivity comes and goes
    Watch {
        /// Seconds between connectivity probes
        #[arg(long, default_value = "5", value_name = "SECS")]
        interval: u64,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum AlertCommands {
    /// Raise a new SOS alert
    #[command(alias = "new")]
    Create {
        /// Alert message (read from stdin when omitted)
        message: Vec<String>,
        /// Latitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        /// Longitude in degrees
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        /// Optional street address
        #[arg(long)]
        address: Option<String>,
        /// Alert priority
        #[arg(short, long, value_enum, default_value_t = PriorityArg::High)]
        priority: PriorityArg,
    },
    /// List alerts, newest first
    List {
        /// Number of alerts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a single alert
    Show {
        /// Alert ID or unique ID prefix
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark an alert resolved
    Resolve {
        /// Alert ID or unique ID prefix
        id: String,
    },
    /// Cancel an alert raised by mistake
    Cancel {
        /// Alert ID or unique ID prefix
        id: String,
    },
    /// Change the priority of an active alert
    Escalate {
        /// Alert ID or unique ID prefix
        id: String,
        /// New priority
        #[arg(value_enum)]
        priority: PriorityArg,
    },
}

#[derive(Subcommand)]
pub enum MessageCommands {
    /// Queue a message for delivery
    Queue {
        /// Recipient address or handle
        recipient: String,
        /// Message body (read from stdin when omitted)
        body: Vec<String>,
    },
    /// List queued messages, newest first
    List {
        /// Number of messages to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List sync conflicts
    List {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Include dismissed conflicts
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Acknowledge a conflict
    Dismiss {
        /// Conflict ID
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Profile name to initialize
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
        /// Remote authority base URL
        #[arg(long, value_name = "URL")]
        remote_url: Option<String>,
        /// Ledger database path for this profile
        #[arg(long, value_name = "PATH")]
        db_path: Option<PathBuf>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Print the resolved profile
    Show {
        /// Optional profile override
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Self::Low,
            PriorityArg::Medium => Self::Medium,
            PriorityArg::High => Self::High,
            PriorityArg::Critical => Self::Critical,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
