//! Command line.

/// Argument parsing and subcommands.
pub mod cli;
