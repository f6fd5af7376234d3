//! CLI module for hilloop - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
