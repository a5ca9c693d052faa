use clap::Parser;
use color_eyre::Result;

use notesync::app::App;
use notesync::commands::Cli;
use notesync::config::Config;
use notesync::logging;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();

  // Load configuration
  let config = Config::load(cli.config.as_deref())?;

  let _guard = logging::init(&logging::log_dir()?, cli.verbose)?;
  tracing::debug!(url = %config.server.url, offline = cli.offline, "starting");

  let app = App::new(&config, cli.offline)?;
  app.run(cli.command).await?;

  Ok(())
}
