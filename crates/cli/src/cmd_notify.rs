//! `wfgame notify`: tail the notification stream.

use std::sync::Arc;

use console::style;
use serde_json::{json, Value};
use wfgame_protocol::notification::{BROADCAST, MESSAGE, NOTIFICATION, OCR_TASK_UPDATE};
use wfgame_protocol::OcrTaskUpdate;
use wfgame_realtime::{ConnectionState, CredentialProvider, RealtimeHub, Subscription};

use crate::config::CliConfig;

const DEFAULT_EVENTS: [&str; 4] = [MESSAGE, BROADCAST, NOTIFICATION, OCR_TASK_UPDATE];

pub async fn run(
    config: &CliConfig,
    credentials: Arc<dyn CredentialProvider>,
    events: &[String],
    json: bool,
) -> anyhow::Result<()> {
    if config.token.is_none() {
        eprintln!(
            "  {} no access token configured (--token, WFGAME_TOKEN or config.toml); the stream will not connect",
            style("warning:").yellow().bold()
        );
    }

    let hub = RealtimeHub::new(config.realtime.clone(), credentials)?;
    let client = hub.notifications()?;

    let events: Vec<String> = if events.is_empty() {
        DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect()
    } else {
        events.to_vec()
    };

    let _subscriptions: Vec<Subscription> = events
        .iter()
        .map(|event| {
            if event == OCR_TASK_UPDATE && !json {
                client.on_typed(event, |update: OcrTaskUpdate| -> anyhow::Result<()> {
                    print_ocr_update(&update);
                    Ok(())
                })
            } else {
                let name = event.clone();
                client.on(event, move |payload: &Value| -> anyhow::Result<()> {
                    print_event(&name, payload, json);
                    Ok(())
                })
            }
        })
        .collect();

    if !json {
        println!(
            "  Watching {} on {}",
            style(events.join(", ")).cyan(),
            style(config.realtime.stream_url()?).dim()
        );
    }

    let mut state_rx = client.watch_state();
    client.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if !json {
                    print_state(state);
                }
            }
        }
    }

    hub.shutdown();
    Ok(())
}

fn print_event(event: &str, payload: &Value, json: bool) {
    if json {
        println!("{}", json!({ "event": event, "data": payload }));
    } else {
        println!("  {} {}", style(event).cyan().bold(), payload);
    }
}

fn print_ocr_update(update: &OcrTaskUpdate) {
    let progress = update
        .progress
        .map(|p| format!(" {:.0}%", p * 100.0))
        .unwrap_or_default();
    let message = update
        .message
        .as_deref()
        .map(|m| format!(" - {m}"))
        .unwrap_or_default();
    println!(
        "  {} task {} {}{}{}",
        style(OCR_TASK_UPDATE).cyan().bold(),
        style(&update.task_id).bold(),
        style(&update.status).green(),
        progress,
        message
    );
}

fn print_state(state: ConnectionState) {
    let label = match state {
        ConnectionState::Open => style("connected").green(),
        ConnectionState::Connecting => style("connecting").yellow(),
        ConnectionState::Closed => style("disconnected").red(),
    };
    println!("  [{label}]");
}
