mod bots;
mod serve;
pub(crate) mod terminal;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::core::bot::BotId;
use crate::host::{Host, NativeHost, resolve_data_dir};

/// Self-hosted supervisor for chat platform bots.
#[derive(Parser, Debug)]
#[command(name = "botdeck", version, about)]
pub struct Cli {
    /// Data directory holding botdeck.toml and the bot database.
    /// Defaults to $BOTDECK_DATA_DIR, then ~/.botdeck.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor daemon and its HTTP API.
    Serve {
        /// Override api.host from botdeck.toml.
        #[arg(long)]
        host: Option<String>,
        /// Override api.port from botdeck.toml.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run a single bot in the foreground. Started by the supervisor.
    #[command(hide = true)]
    RunBot {
        #[arg(long)]
        bot_id: String,
    },

    /// Manage bots on a running daemon.
    #[command(subcommand)]
    Bot(bots::BotCommands),
}

impl Cli {
    fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| resolve_data_dir(NativeHost::data_dir()))
    }
}

/// Parses the command line and runs it. Returns the process exit code.
pub async fn run_main() -> Result<i32> {
    let cli = Cli::parse();
    let data_dir = cli.resolved_data_dir();

    match cli.command {
        Commands::Serve { host, port } => {
            serve::run_serve(data_dir, host, port).await?;
            Ok(0)
        }
        Commands::RunBot { bot_id } => {
            Ok(crate::runner::run_bot(BotId::from(bot_id), &data_dir).await)
        }
        Commands::Bot(command) => {
            bots::run_bot_command(command, &data_dir).await?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bot::{BotType, Platform};

    #[test]
    fn parses_runner_invocation() {
        let cli = Cli::try_parse_from([
            "botdeck",
            "run-bot",
            "--bot-id",
            "b-1",
            "--data-dir",
            "/tmp/deck",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/deck")));
        assert!(matches!(cli.command, Commands::RunBot { ref bot_id } if bot_id == "b-1"));
    }

    #[test]
    fn run_bot_requires_an_id() {
        assert!(Cli::try_parse_from(["botdeck", "run-bot"]).is_err());
    }

    #[test]
    fn parses_serve_overrides() {
        let cli =
            Cli::try_parse_from(["botdeck", "serve", "--host", "0.0.0.0", "--port", "8080"])
                .unwrap();
        match cli.command {
            Commands::Serve { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(8080));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_bot_add() {
        let cli = Cli::try_parse_from([
            "botdeck",
            "bot",
            "add",
            "--name",
            "guard",
            "--platform",
            "discord",
            "--type",
            "moderation",
            "--config",
            r#"{"token":"a.b.c"}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Bot(bots::BotCommands::Add {
                name,
                platform,
                bot_type,
                config,
                ..
            }) => {
                assert_eq!(name, "guard");
                assert_eq!(platform, Platform::Discord);
                assert_eq!(bot_type, BotType::Moderation);
                assert!(config.is_some());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn unknown_platform_is_rejected() {
        assert!(
            Cli::try_parse_from(["botdeck", "bot", "add", "--name", "x", "--platform", "irc"])
                .is_err()
        );
    }
}
