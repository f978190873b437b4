use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Resolve account usernames to their reported location.
#[derive(Parser, Debug)]
#[command(name = "accountgeo", version, about, long_about = None)]
pub struct Args {
    /// Optional TOML config file; `ACCOUNTGEO_*` environment variables override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log formatter to use
    #[arg(long, value_enum, global = true, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Resolve one or more usernames, printing one JSON line per name
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
        /// Ignore cached locations and fetch again
        #[arg(long)]
        force: bool,
    },
    /// Show what is cached for a username without fetching
    Peek { name: String },
    /// Remove one username from the cache, or everything when none is given
    Clear { name: Option<String> },
    /// Print cache statistics
    Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable output for development
    Pretty,
    /// One JSON object per line
    Json,
}

const fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}
