//! Command-line interface definitions for the `rigger` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `rigger` binary.
#[derive(Debug, Parser)]
#[command(
    name = "rigger",
    about = "Provision test infrastructure, drive the installer wizard and keep its state",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// State file recording the infrastructure between runs.
    #[arg(
        long,
        global = true,
        env = "RIGGER_STATE_FILE",
        default_value = "rigger.state.json",
        value_name = "PATH"
    )]
    pub(crate) state_file: String,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `rigger` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create or resume the infrastructure.
    #[command(name = "up", about = "Create fresh infrastructure or resume the recorded one")]
    Up(UpCommand),
    /// Print the recorded infrastructure.
    #[command(name = "status", about = "Print the recorded infrastructure as JSON")]
    Status(StatusCommand),
    /// Run a command on the nodes.
    #[command(name = "run", about = "Run a command on every allocated node, or on all nodes")]
    Run(RunCommand),
    /// Release or destroy the infrastructure.
    #[command(name = "down", about = "Close sessions and optionally destroy the infrastructure")]
    Down(DownCommand),
}

/// Kind of infrastructure created by `rigger up --init`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum InitKind {
    /// Provision nodes with the configured backend.
    Local,
    /// Use the configured Ops Center.
    Remote,
}

/// Arguments for the `rigger up` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct UpCommand {
    /// Create fresh infrastructure instead of resuming the recorded one.
    #[arg(long, value_enum, value_name = "KIND")]
    pub(crate) init: Option<InitKind>,
    /// Do not echo installer output.
    #[arg(long)]
    pub(crate) no_echo: bool,
    /// Return once the wizard URL is known instead of waiting for Ctrl-C.
    ///
    /// The installer stops when `rigger` exits, so the wizard is only
    /// reachable while `up` keeps running.
    #[arg(long)]
    pub(crate) detach: bool,
}

/// Arguments for the `rigger status` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct StatusCommand {
    /// Also query the installed cluster on the first node.
    #[arg(long)]
    pub(crate) cluster: bool,
}

/// Arguments for the `rigger run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Command to execute on the nodes (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `rigger down` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DownCommand {
    /// Destroy the nodes and remove the state file.
    #[arg(long)]
    pub(crate) destroy: bool,
}
