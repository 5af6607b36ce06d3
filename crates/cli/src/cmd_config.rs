//! `wfgame config`: show where things live and what will be dialled.

use std::path::Path;

use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, Color, ContentArrangement, Table};
use console::style;

use crate::config::CliConfig;
use crate::paths;

pub fn run(config: &CliConfig, data_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("  {}", style("WFGame realtime configuration").bold());
    println!();
    println!("{}", render(config, data_dir));
    println!();
    Ok(())
}

fn render(config: &CliConfig, data_dir: &Path) -> Table {
    let realtime = &config.realtime;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Setting"), Cell::new("Value")]);

    table.add_row(vec![
        Cell::new("Data dir"),
        Cell::new(data_dir.display().to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Config file"),
        Cell::new(paths::config_path().display().to_string()),
    ]);
    table.add_row(vec![
        Cell::new("Log file"),
        Cell::new(paths::log_path().display().to_string()),
    ]);
    table.add_row(vec![Cell::new("Server"), Cell::new(&realtime.server_url)]);
    table.add_row(vec![Cell::new("Notification stream"), resolved(realtime.stream_url())]);
    table.add_row(vec![Cell::new("Socket.IO endpoint"), resolved(realtime.socket_endpoint())]);

    let token = match config.token.as_deref() {
        Some(token) if !token.is_empty() => Cell::new("set").fg(Color::Green),
        _ => Cell::new("not set").fg(Color::Yellow),
    };
    table.add_row(vec![Cell::new("Access token"), token]);

    table.add_row(vec![
        Cell::new("Notification reconnect"),
        Cell::new(format!("every {} ms, unlimited", realtime.notification_reconnect_ms)),
    ]);
    table.add_row(vec![
        Cell::new("Room reconnect"),
        Cell::new(format!(
            "every {} ms, {} attempts",
            realtime.socket.reconnect_delay_ms, realtime.socket.reconnect_attempts
        )),
    ]);
    table.add_row(vec![
        Cell::new("Room connect timeout"),
        Cell::new(format!("{} ms", realtime.socket.connect_timeout_ms)),
    ]);

    table
}

fn resolved<T: std::fmt::Display, E: std::fmt::Display>(value: Result<T, E>) -> Cell {
    match value {
        Ok(value) => Cell::new(value.to_string()),
        Err(err) => Cell::new(err.to_string()).fg(Color::Red),
    }
}
