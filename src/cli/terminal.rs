use console::{Emoji, style};

use crate::core::bot::BotStatus;
use crate::core::state::BotState;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

pub fn print_launch(msg: &str) {
    println!("{} {}", ROCKET, style(msg).bold());
}

/// Colored persisted status, as shown in `bot list`.
pub fn status_badge(status: &str) -> String {
    match BotStatus::from_status(status) {
        Some(BotStatus::Online) => style(status).green().bold().to_string(),
        Some(BotStatus::Error) => style(status).red().bold().to_string(),
        Some(BotStatus::Offline) => style(status).dim().to_string(),
        None => status.to_string(),
    }
}

/// Colored in-memory supervisor state.
pub fn state_badge(state: &str) -> String {
    if state == BotState::Running.as_str() {
        style(state).green().to_string()
    } else if state == BotState::Errored.as_str() {
        style(state).red().to_string()
    } else if state == BotState::Stopped.as_str() {
        style(state).dim().to_string()
    } else {
        style(state).yellow().to_string()
    }
}
