//! WFGame CLI
//!
//! Terminal console for the WFGame AI realtime channels: tail the
//! notification stream or watch a task replay room.

mod cmd_config;
mod cmd_notify;
mod cmd_room;
mod config;
mod logging;
mod paths;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use wfgame_realtime::{AccessToken, CredentialProvider, StaticCredentials};

use crate::config::{CliConfig, Overrides};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "wfgame")]
#[command(about = "WFGame AI realtime console", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    /// Data directory (config, logs)
    #[arg(long, global = true, env = "WFGAME_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Console backend base URL
    #[arg(long, global = true)]
    server: Option<String>,

    /// Access token for the notification stream
    #[arg(long, global = true)]
    token: Option<String>,

    /// Socket.IO host override
    #[arg(long, global = true)]
    socket_host: Option<String>,

    /// Socket.IO port override
    #[arg(long, global = true)]
    socket_port: Option<u16>,

    /// Mirror warnings and errors to stderr
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the notification stream
    Notify {
        /// Events to subscribe to (defaults to the common business events)
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// Print one JSON object per event instead of formatted lines
        #[arg(long)]
        json: bool,
    },
    /// Watch a replay room
    Room {
        /// Room name (task execution id)
        room: String,

        /// Write every replay frame into this directory
        #[arg(long)]
        save_frames: Option<PathBuf>,

        /// Print one JSON object per event instead of formatted lines
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved configuration
    Config,
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            server_url: self.server.clone(),
            token: self.token.clone(),
            socket_host: self.socket_host.clone(),
            socket_port: self.socket_port,
        }
    }
}

fn credentials(config: &CliConfig) -> Arc<dyn CredentialProvider> {
    match config.token.as_deref() {
        Some(token) if !token.is_empty() => {
            Arc::new(StaticCredentials::new(AccessToken::new(token)))
        }
        _ => Arc::new(StaticCredentials::anonymous()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "wfgame", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref())?;
    paths::ensure_dirs()?;
    let _logging = logging::init_logging(cli.log_stderr)?;

    let config = CliConfig::resolve(&paths::config_path(), &cli.overrides())?;
    tracing::info!(
        component = "cli",
        event = "cli.started",
        version = VERSION,
        data_dir = %data_dir.display(),
        server_url = %config.realtime.server_url,
        "wfgame started"
    );

    match cli.command {
        Commands::Notify { events, json } => {
            cmd_notify::run(&config, credentials(&config), &events, json).await
        }
        Commands::Room {
            room,
            save_frames,
            json,
        } => cmd_room::run(&config, &room, save_frames, json).await,
        Commands::Config => cmd_config::run(&config, &data_dir),
        Commands::Completions { .. } => Ok(()),
    }
}
