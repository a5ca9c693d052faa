//! Command-line interface definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "notesync")]
#[command(about = "Offline-first client for the notes/files service")]
#[command(version)]
pub struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/notesync/config.yaml)
  #[arg(short, long, global = true)]
  pub config: Option<PathBuf>,

  /// Do not contact the server; writes are queued until the next online run
  #[arg(long, global = true)]
  pub offline: bool,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  pub verbose: bool,

  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Create an account and sign in
  Register {
    username: String,
    /// Read the password from the first line of stdin instead of NOTESYNC_PASSWORD
    #[arg(long)]
    password_stdin: bool,
  },
  /// Sign in and remember the session
  Login {
    username: String,
    /// Read the password from the first line of stdin instead of NOTESYNC_PASSWORD
    #[arg(long)]
    password_stdin: bool,
  },
  /// Forget the session, the local cache and any queued writes
  Logout,
  /// Show connectivity, session and queued writes
  Status,
  /// Replay queued writes now
  Sync,
  /// Manage text entries
  #[command(subcommand, visible_alias = "e")]
  Entries(EntriesCommand),
  /// Manage uploaded files
  #[command(subcommand, visible_alias = "f")]
  Files(FilesCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum EntriesCommand {
  #[command(visible_alias = "ls")]
  List,
  Add { text: String },
  Edit { id: i64, text: String },
  #[command(visible_alias = "delete")]
  Rm { id: i64 },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum FilesCommand {
  #[command(visible_alias = "ls")]
  List,
  /// Set a file's description; omit the text to clear it
  Describe { id: i64, description: Option<String> },
  #[command(visible_alias = "delete")]
  Rm { id: i64 },
}
