use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "entire",
    version,
    about = "Session capture for AI coding agents, checkpointed onto git"
)]
pub struct Cli {
    /// Force debug logging regardless of settings.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Hook entry points, invoked by agents and by git.
    ///
    /// Agents: `entire hooks <agent> <verb>` with the payload on stdin
    /// (one legacy agent passes it as the final argument).  Git:
    /// `entire hooks git <verb> [args…]`.
    Hooks {
        /// Agent name, or `git` for VCS hooks.
        target: String,
        /// The hook verb.
        verb: String,
        /// Verb arguments (git hooks) or the legacy payload argument.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// List session records for this repository.
    Sessions,
    /// List condensed checkpoints, or show one by ID.
    Checkpoints {
        /// Checkpoint ID to show in full.
        id: Option<String>,
    },
    /// Run the cleanup sweepers (stale sessions, orphaned shadow
    /// references, orphaned checkpoints).
    Gc,
}
