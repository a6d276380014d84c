use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing::info;

use shopfloor::config::Config;
use shopfloor::logging;
use shopfloor::replay::Replay;

#[derive(Parser, Debug)]
#[command(name = "shopfloor")]
#[command(about = "Replay dashboard sessions against the shopfloor cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shopfloor/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run a YAML session script against in-memory remotes and print the report
  Replay {
    script: PathBuf,
  },
  /// Print the effective configuration
  Config,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Hold the guard so buffered log lines are flushed on exit
  let _log_guard = logging::init(&config.logging)?;

  match args.command {
    Command::Replay { script } => {
      let parsed = Replay::load_script(&script)?;
      info!(script = %script.display(), steps = parsed.steps.len(), "starting replay");
      let mut replay = Replay::new(&config);
      let reports = replay.run(&parsed, &config).await?;
      print!("{}", serde_yaml::to_string(&reports)?);
    }
    Command::Config => {
      print!("{}", config.to_yaml()?);
    }
  }

  Ok(())
}
