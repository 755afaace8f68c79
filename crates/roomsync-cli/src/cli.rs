use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use roomsync_core::{Priority, ResourceKey, ResourceKind};

#[derive(Parser)]
#[command(name = "roomsync")]
#[command(about = "Keep a local mirror of multiplayer rooms and their scores fresh")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue a refresh of one resource and wait for it to finish
    Sync {
        /// Resource kind
        #[arg(value_enum)]
        kind: KindArg,
        /// Upstream room id
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        id: i64,
        /// Skip the cooldown and staleness checks (quota still applies)
        #[arg(long)]
        force: bool,
        /// Scheduling priority recorded with the job
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        /// Print the job id without waiting for the result. The process still
        /// lets the job finish, up to the shutdown grace, before exiting
        #[arg(long)]
        no_wait: bool,
    },
    /// Show whether a resource is syncing and when it last synced
    Status {
        /// Resource kind
        #[arg(value_enum)]
        kind: KindArg,
        /// Upstream room id
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show this month's usage report
    Usage {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show quota status per dimension
    Quota {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run maintenance loops and keep watched resources fresh until Ctrl-C
    Serve {
        /// Resource to keep fresh, as `kind:id` (repeatable)
        #[arg(long = "watch", value_name = "KIND:ID", value_parser = parse_resource)]
        watch: Vec<ResourceKey>,
        /// Seconds between refresh requests for watched resources
        #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
        watch_interval_secs: u64,
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
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Challenge,
    Room,
}

impl KindArg {
    pub const fn key(self, id: i64) -> ResourceKey {
        let kind = match self {
            Self::Challenge => ResourceKind::Challenge,
            Self::Room => ResourceKind::Room,
        };
        ResourceKey::new(kind, id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Self::Low,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::High => Self::High,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

pub fn parse_resource(value: &str) -> Result<ResourceKey, String> {
    value.parse::<ResourceKey>().map_err(|error| error.to_string())
}
