use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// `ServerMaid` - keeps Discord channels tidy by enforcing per-channel
/// message limits.
#[derive(Parser, Debug)]
#[command(name = "servermaid")]
#[command(version)]
#[command(about = "Per-channel message retention for Discord.", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.servermaid/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to Discord and enforce retention on every new message
    Run,

    /// Manage a channel: keep at most MAX_MESSAGES, then run an initial cleanup
    Configure {
        /// Server (guild) id
        #[arg(long)]
        server: String,

        /// Channel id
        #[arg(long)]
        channel: String,

        /// Messages to keep
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        max_messages: u32,

        /// Never delete pinned messages
        #[arg(long)]
        keep_pinned: bool,
    },

    /// Stop managing a channel
    Remove {
        #[arg(long)]
        server: String,

        #[arg(long)]
        channel: String,
    },

    /// List managed channels of a server
    List {
        #[arg(long)]
        server: String,
    },

    /// Run one enforcement pass now
    Enforce {
        #[arg(long)]
        server: String,

        #[arg(long)]
        channel: String,
    },
}
