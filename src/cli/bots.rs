use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use console::style;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

use super::terminal;
use crate::config::BotdeckConfig;
use crate::core::bot::{BotType, Platform};

#[derive(Subcommand, Debug)]
pub enum BotCommands {
    /// List configured bots with their status.
    List,

    /// Register a new bot. It starts offline.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        platform: Platform,
        #[arg(long = "type", default_value = "standard")]
        bot_type: BotType,
        /// Platform configuration as inline JSON.
        #[arg(long, conflicts_with = "config_file")]
        config: Option<String>,
        /// Platform configuration read from a JSON file.
        #[arg(long)]
        config_file: Option<PathBuf>,
    },

    Start {
        id: String,
    },

    Stop {
        id: String,
    },

    Restart {
        id: String,
    },

    /// Stop a bot and remove it.
    Delete {
        id: String,
    },

    /// Show stored status and live process details.
    Status {
        id: String,
    },
}

/// Thin JSON client for the daemon API.
struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl ApiClient {
    fn new(config: &BotdeckConfig) -> Self {
        let host = match config.api.host.as_str() {
            "0.0.0.0" => "127.0.0.1",
            "::" => "[::1]",
            other => other,
        };
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{}:{}/api", host, config.api.port),
            token: config.api.token.clone(),
        }
    }

    async fn send(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req
            .send()
            .await
            .with_context(|| format!("cannot reach {} (is `botdeck serve` running?)", self.base))?;
        let status = res.status();
        let payload: Value = res
            .json()
            .await
            .with_context(|| format!("unexpected response from {} ({})", url, status))?;
        check_success(payload)
    }
}

fn check_success(payload: Value) -> Result<Value> {
    if payload["success"].as_bool() == Some(true) {
        return Ok(payload);
    }
    let mut message = payload["error"]
        .as_str()
        .unwrap_or("request failed")
        .to_string();
    if let Some(tail) = payload["stderr_tail"].as_array()
        && !tail.is_empty()
    {
        message.push_str("\n--- last stderr lines ---");
        for line in tail.iter().filter_map(|l| l.as_str()) {
            message.push('\n');
            message.push_str(line);
        }
    }
    Err(anyhow!(message))
}

fn read_config(config: Option<String>, config_file: Option<PathBuf>) -> Result<Value> {
    let raw = match (config, config_file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => return Ok(json!({})),
    };
    let value: Value = serde_json::from_str(&raw).context("bot config is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("bot config must be a JSON object");
    }
    Ok(value)
}

fn print_bot_row(bot: &Value) {
    println!(
        "  {:<38} {:<20} {:<10} {:<10} {:<10} {}",
        style(bot["id"].as_str().unwrap_or("?")).dim(),
        bot["name"].as_str().unwrap_or("?"),
        bot["platform"].as_str().unwrap_or("?"),
        bot["bot_type"].as_str().unwrap_or("?"),
        terminal::status_badge(bot["status"].as_str().unwrap_or("?")),
        terminal::state_badge(bot["state"].as_str().unwrap_or("?")),
    );
}

pub async fn run_bot_command(command: BotCommands, data_dir: &Path) -> Result<()> {
    let config = BotdeckConfig::load(data_dir).await?;
    let client = ApiClient::new(&config);
    use reqwest::Method;

    match command {
        BotCommands::List => {
            let res = client.send(Method::GET, "/bots", None).await?;
            let bots = res["bots"].as_array().cloned().unwrap_or_default();
            if bots.is_empty() {
                terminal::print_info("No bots configured. Add one with `botdeck bot add`.");
                return Ok(());
            }
            println!(
                "  {:<38} {:<20} {:<10} {:<10} {:<10} {}",
                style("ID").bold(),
                style("NAME").bold(),
                style("PLATFORM").bold(),
                style("TYPE").bold(),
                style("STATUS").bold(),
                style("STATE").bold(),
            );
            for bot in &bots {
                print_bot_row(bot);
            }
        }
        BotCommands::Add {
            name,
            platform,
            bot_type,
            config,
            config_file,
        } => {
            let bot_config = read_config(config, config_file)?;
            let res = client
                .send(
                    Method::POST,
                    "/bots",
                    Some(json!({
                        "name": name,
                        "platform": platform,
                        "bot_type": bot_type,
                        "config": bot_config,
                    })),
                )
                .await?;
            terminal::print_success(&format!(
                "Bot '{}' created with id {}",
                name,
                res["bot"]["id"].as_str().unwrap_or("?")
            ));
        }
        BotCommands::Start { id } => {
            let res = client
                .send(Method::POST, &format!("/bots/{}/start", id), None)
                .await?;
            terminal::print_success(&format!(
                "Bot {} is {}",
                id,
                res["state"].as_str().unwrap_or("?")
            ));
        }
        BotCommands::Stop { id } => {
            client
                .send(Method::POST, &format!("/bots/{}/stop", id), None)
                .await?;
            terminal::print_success(&format!("Bot {} stopped", id));
        }
        BotCommands::Restart { id } => {
            let res = client
                .send(Method::POST, &format!("/bots/{}/restart", id), None)
                .await?;
            terminal::print_success(&format!(
                "Bot {} restarted ({})",
                id,
                res["state"].as_str().unwrap_or("?")
            ));
        }
        BotCommands::Delete { id } => {
            client
                .send(Method::DELETE, &format!("/bots/{}", id), None)
                .await?;
            terminal::print_success(&format!("Bot {} deleted", id));
        }
        BotCommands::Status { id } => {
            let res = client.send(Method::GET, &format!("/bots/{}", id), None).await?;
            let bot = &res["bot"];
            terminal::print_status("Name", bot["name"].as_str().unwrap_or("?"));
            terminal::print_status(
                "Platform",
                &format!(
                    "{} ({})",
                    bot["platform"].as_str().unwrap_or("?"),
                    bot["bot_type"].as_str().unwrap_or("?")
                ),
            );
            terminal::print_status(
                "Status",
                &terminal::status_badge(bot["status"].as_str().unwrap_or("?")),
            );
            terminal::print_status(
                "State",
                &terminal::state_badge(bot["state"].as_str().unwrap_or("?")),
            );
            if let Some(pid) = bot["pid"].as_u64() {
                terminal::print_status("PID", &pid.to_string());
            }
            terminal::print_status(
                "Last active",
                bot["last_active"].as_str().unwrap_or("never"),
            );
            if let Some(tail) = bot["stderr_tail"].as_array() {
                terminal::print_warn("Last stderr lines:");
                for line in tail.iter().filter_map(|l| l.as_str()) {
                    println!("    {}", style(line).dim());
                }
            }
        }
    }
    Ok(())
}
