//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - servers: list configured tool servers
//! - tools: connect to a server and list its tools
//! - call: invoke a tool
//! - log: read a workspace event log

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Conduit - talk to external tool servers and audit every call
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace directory whose event log records this session
    #[arg(short, long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Workspace directory, defaulting to the current directory
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List configured tool servers
    Servers,

    /// Connect to a server and list its tools
    Tools {
        /// Server name from the config
        server: String,
    },

    /// Call a tool on a server
    Call {
        /// Server name from the config
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Print records from the workspace event log
    Log {
        /// Byte offset to resume from
        #[arg(short, long, default_value_t = 0)]
        offset: u64,
    },
}
