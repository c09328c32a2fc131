mod adapters;
mod api;
mod cli;
mod config;
mod core;
mod host;
mod logging;
mod runner;

use crate::cli::terminal;

#[tokio::main]
async fn main() {
    match cli::run_main().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            terminal::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
