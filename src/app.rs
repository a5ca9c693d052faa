use color_eyre::{eyre::eyre, Result};
use std::io::{BufRead, Write};
use std::sync::Arc;

use crate::commands::{Command, EntriesCommand, FilesCommand};
use crate::config::Config;
use crate::engine::SyncEngine;
use crate::gateway::HttpGateway;
use crate::mutation::MutationOutcome;
use crate::notes::{Entry, FileMetadata, NotesClient};
use crate::persist::{KeyValueStore, NoopKeyStore, SqliteKeyStore};
use crate::query::CollectionState;

/// Command-line application state
pub struct App {
  client: NotesClient,
  server_url: String,
}

impl App {
  pub fn new(config: &Config, offline: bool) -> Result<Self> {
    let gateway = HttpGateway::new(&config.server.url, config.request_timeout())?;
    let store: Arc<dyn KeyValueStore> = if config.persistence.enabled {
      Arc::new(SqliteKeyStore::open(&config.store_path()?)?)
    } else {
      Arc::new(NoopKeyStore)
    };

    let engine = SyncEngine::new(Arc::new(gateway), store, config.engine_settings(offline));
    if let Some(token) = Config::get_token() {
      engine.session().override_token(token);
    }

    Ok(Self::with_client(NotesClient::new(engine), &config.server.url))
  }

  pub fn with_client(client: NotesClient, server_url: &str) -> Self {
    Self {
      client,
      server_url: server_url.to_string(),
    }
  }

  /// Restore, reconnect and replay, run `command`, then flush.
  pub async fn run(&self, command: Command) -> Result<()> {
    let engine = self.client.engine();
    engine.init().await;

    let stdout = std::io::stdout();
    let result = self.execute(command, &mut stdout.lock()).await;

    engine.teardown();
    result
  }

  pub async fn execute<W: Write>(&self, command: Command, out: &mut W) -> Result<()> {
    match command {
      Command::Register {
        username,
        password_stdin,
      } => {
        let password = read_password(password_stdin)?;
        self.client.register(&username, &password).await?;
        writeln!(out, "Registered and signed in as {}", username)?;
      }
      Command::Login {
        username,
        password_stdin,
      } => {
        let password = read_password(password_stdin)?;
        self.client.login(&username, &password).await?;
        writeln!(out, "Signed in as {}", username)?;
      }
      Command::Logout => {
        self.client.logout();
        writeln!(out, "Signed out; local data cleared")?;
      }
      Command::Status => self.status(out)?,
      Command::Sync => self.sync(out).await?,
      Command::Entries(cmd) => self.entries(cmd, out).await?,
      Command::Files(cmd) => self.files(cmd, out).await?,
    }
    Ok(())
  }

  fn status<W: Write>(&self, out: &mut W) -> Result<()> {
    let engine = self.client.engine();
    let coordinator = engine.coordinator();
    let paused = coordinator.paused();

    writeln!(out, "server:   {}", self.server_url)?;
    writeln!(
      out,
      "network:  {}",
      if engine.is_online() { "online" } else { "offline" }
    )?;
    writeln!(
      out,
      "session:  {}",
      if engine.session().is_authenticated() {
        "signed in"
      } else {
        "signed out"
      }
    )?;
    writeln!(out, "queued:   {}", paused.len())?;
    for mutation in &paused {
      writeln!(
        out,
        "  {} {} {} (queued {})",
        mutation.id,
        mutation.method,
        mutation.endpoint,
        mutation.created_at.format("%Y-%m-%d %H:%M")
      )?;
    }
    if let Some(error) = coordinator.last_error() {
      writeln!(out, "last error: {}", error)?;
    }
    Ok(())
  }

  async fn sync<W: Write>(&self, out: &mut W) -> Result<()> {
    let engine = self.client.engine();
    if !engine.is_online() {
      writeln!(
        out,
        "Offline: {} write(s) queued",
        engine.coordinator().paused().len()
      )?;
      return Ok(());
    }
    let report = engine.coordinator().resume_paused().await;
    writeln!(
      out,
      "Synced {} write(s), {} rejected, {} still queued",
      report.committed, report.failed, report.remaining
    )?;
    Ok(())
  }

  async fn entries<W: Write>(&self, cmd: EntriesCommand, out: &mut W) -> Result<()> {
    match cmd {
      EntriesCommand::List => {
        let state = self.client.list_entries().await;
        let entries = self.require_data(state, out)?;
        if entries.is_empty() {
          writeln!(out, "No entries")?;
        }
        for entry in entries {
          writeln!(out, "{}", format_entry(&entry))?;
        }
      }
      EntriesCommand::Add { text } => {
        let outcome = self.client.create_entry(&text).await;
        report(outcome, "Entry created", out)?;
      }
      EntriesCommand::Edit { id, text } => {
        let outcome = self.client.update_entry(id, &text).await;
        report(outcome, "Entry updated", out)?;
      }
      EntriesCommand::Rm { id } => {
        let outcome = self.client.delete_entry(id).await;
        report(outcome, "Entry deleted", out)?;
      }
    }
    Ok(())
  }

  async fn files<W: Write>(&self, cmd: FilesCommand, out: &mut W) -> Result<()> {
    match cmd {
      FilesCommand::List => {
        let state = self.client.list_files().await;
        let files = self.require_data(state, out)?;
        if files.is_empty() {
          writeln!(out, "No files")?;
        }
        for file in files {
          writeln!(out, "{}", format_file(&file))?;
        }
      }
      FilesCommand::Describe { id, description } => {
        let outcome = self
          .client
          .update_file_description(id, description.as_deref())
          .await;
        report(outcome, "Description updated", out)?;
      }
      FilesCommand::Rm { id } => {
        let outcome = self.client.delete_file(id).await;
        report(outcome, "File deleted", out)?;
      }
    }
    Ok(())
  }

  /// Unwrap a listing, noting when it is served from a stale cache.
  fn require_data<T, W: Write>(&self, state: CollectionState<Vec<T>>, out: &mut W) -> Result<Vec<T>> {
    let CollectionState {
      data,
      error,
      is_stale,
      ..
    } = state;

    match data {
      Some(items) => {
        if let Some(error) = error {
          writeln!(out, "(showing cached data: {})", error)?;
        } else if is_stale {
          writeln!(out, "(showing cached data)")?;
        }
        Ok(items)
      }
      None if !self.client.engine().session().is_authenticated() => Err(eyre!(
        "Not signed in. Run `notesync login <username>` first."
      )),
      None => Err(eyre!(
        "Nothing cached yet: {}",
        error.unwrap_or_else(|| "server unreachable".to_string())
      )),
    }
  }
}

fn report<W: Write>(outcome: MutationOutcome, done: &str, out: &mut W) -> Result<()> {
  match outcome {
    MutationOutcome::Committed => writeln!(out, "{}", done)?,
    MutationOutcome::Queued => writeln!(out, "{} locally; queued until the server is reachable", done)?,
    MutationOutcome::Failed(message) => return Err(eyre!("{}", message)),
  }
  Ok(())
}

fn format_entry(entry: &Entry) -> String {
  let marker = if entry.is_pending() { " (pending)" } else { "" };
  format!("{:>6}  {}{}", entry.id, entry.text, marker)
}

fn format_file(file: &FileMetadata) -> String {
  let mut line = format!(
    "{:>6}  {}  {}  {}",
    file.id,
    file.original_name,
    format_size(file.size),
    file.created_at.format("%Y-%m-%d")
  );
  if let Some(description) = &file.description {
    line.push_str("  ");
    line.push_str(description);
  }
  line
}

fn format_size(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
  let mut size = bytes as f64;
  let mut unit = 0;
  while size >= 1024.0 && unit < UNITS.len() - 1 {
    size /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} {}", bytes, UNITS[0])
  } else {
    format!("{:.1} {}", size, UNITS[unit])
  }
}

fn read_password(from_stdin: bool) -> Result<String> {
  if !from_stdin {
    return Config::get_password();
  }
  let mut line = String::new();
  std::io::stdin()
    .lock()
    .read_line(&mut line)
    .map_err(|e| eyre!("Failed to read password from stdin: {}", e))?;
  let password = line.trim_end_matches(['\r', '\n']).to_string();
  if password.is_empty() {
    return Err(eyre!("Empty password"));
  }
  Ok(password)
}
