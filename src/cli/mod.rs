//! Command-line interface

pub mod commands;

use clap::{Parser, Subcommand};
use commands::{CompileCommand, RunCommand};

/// Deterministic pipeline compiler and runner
#[derive(Debug, Parser)]
#[command(name = "omlrun")]
#[command(version)]
#[command(about = "Compile declarative pipelines and run them locally or in a sandbox", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile a pipeline spec into a manifest
    Compile(CompileCommand),

    /// Run a compiled manifest
    Run(RunCommand),

    /// Sandbox runner entry; spawned by the remote adapter, not for users
    #[command(name = "__sandbox", hide = true)]
    Sandbox,
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }
}
