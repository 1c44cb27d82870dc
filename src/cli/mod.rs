//! CLI module for conduit - command-line interface and subcommands.
//!
//! Provides subcommands for inspecting configured tool servers, calling
//! tools, and reading the workspace event log.

pub mod commands;

pub use commands::Cli;
