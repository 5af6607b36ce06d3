//! `wfgame room <name>`: join a replay room and print what arrives.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use console::style;
use serde_json::{json, Value};
use wfgame_protocol::{ReplayFrame, StepUpdate, SysMsg};
use wfgame_realtime::{ConnectionState, RoomCallbacks, RoomHub};

use crate::config::CliConfig;

/// Time allowed for the leave and disconnect packets to go out on release.
const RELEASE_GRACE: Duration = Duration::from_millis(250);

pub async fn run(
    config: &CliConfig,
    room: &str,
    save_frames: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let endpoint = config.realtime.socket_endpoint()?;
    let hub = RoomHub::new(&config.realtime)?;

    let saver = match save_frames {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            Some(Arc::new(FrameSaver::new(dir)))
        }
        None => None,
    };

    let frames = Arc::new(AtomicU64::new(0));
    let callbacks = RoomCallbacks::new()
        .on_connect(move || {
            print_line(json, "connect", Value::Null, || {
                format!("  [{}]", style("connected").green())
            });
            Ok(())
        })
        .on_disconnect(move |reason| {
            print_line(json, "disconnect", json!(reason), || {
                format!(
                    "  [{}] {}",
                    style("disconnected").red(),
                    reason.unwrap_or("")
                )
            });
            Ok(())
        })
        .on_error(move |message| {
            print_line(json, "error", json!(message), || {
                format!("  {} {}", style("error:").red().bold(), message)
            });
            Ok(())
        })
        .on_sys_msg(move |msg: &SysMsg| {
            print_line(json, "sysMsg", msg.to_value(), || describe_sys_msg(msg));
            Ok(())
        })
        .on_step(move |step: &StepUpdate| {
            print_line(json, "replay_step", step.data.clone(), || {
                format!("  {} {}", style("step").magenta().bold(), step.data)
            });
            Ok(())
        })
        .on_replay({
            let frames = frames.clone();
            move |frame: &ReplayFrame| -> anyhow::Result<()> {
                let n = frames.fetch_add(1, Ordering::Relaxed) + 1;
                let saved = match &saver {
                    Some(saver) => Some(saver.save(n, frame)?),
                    None => None,
                };
                let detail = json!({
                    "frame": n,
                    "mime_type": frame.mime_type(),
                    "bytes": frame.data.len(),
                    "saved": saved.as_ref().map(|p| p.display().to_string()),
                });
                print_line(json, "replay", detail, || {
                    let target = saved
                        .as_ref()
                        .map(|p| format!(" -> {}", p.display()))
                        .unwrap_or_default();
                    format!(
                        "  {} #{n} {} bytes{target}",
                        style("frame").cyan().bold(),
                        frame.data.len()
                    )
                });
                Ok(())
            }
        });

    if !json {
        println!(
            "  Joining room {} at {}",
            style(room).bold(),
            style(&endpoint).dim()
        );
    }

    let socket = hub.connect_socket(room, callbacks);
    let mut state_rx = socket.connection().watch_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if state != ConnectionState::Closed {
                    continue;
                }
                socket.connection().flush().await?;
                let snapshot = socket.connection().snapshot();
                if snapshot.state == ConnectionState::Closed
                    && !snapshot.reconnect_scheduled
                    && !snapshot.auto_reconnect
                {
                    // Gave up reconnecting; the error callback already said why.
                    break;
                }
            }
        }
    }

    tracing::info!(
        component = "cli",
        event = "cli.room.releasing",
        room = %room,
        frames = frames.load(Ordering::Relaxed),
        "Releasing room"
    );
    drop(socket);
    hub.release_room_socket(room);
    tokio::time::sleep(RELEASE_GRACE).await;
    Ok(())
}

fn print_line(json: bool, event: &str, data: Value, human: impl FnOnce() -> String) {
    if json {
        println!("{}", json!({ "event": event, "data": data }));
    } else {
        println!("{}", human());
    }
}

fn describe_sys_msg(msg: &SysMsg) -> String {
    match msg {
        SysMsg::Server { msg, payload } => format!(
            "  {} {}",
            style("sysMsg").yellow().bold(),
            msg.clone().unwrap_or_else(|| payload.to_string())
        ),
        SysMsg::Task { event, data } => {
            format!("  {} {}", style(event).yellow().bold(), data)
        }
    }
}

/// Writes decoded replay frames as `frame-00001.png`, `frame-00002.png`, ...
struct FrameSaver {
    dir: PathBuf,
}

impl FrameSaver {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn save(&self, n: u64, frame: &ReplayFrame) -> anyhow::Result<PathBuf> {
        let bytes = frame
            .decode_image()
            .with_context(|| format!("Frame {n} is not base64"))?;
        let path = frame_path(&self.dir, n, frame_extension(frame.mime_type(), &bytes));
        std::fs::write(&path, &bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn frame_path(dir: &Path, n: u64, extension: &str) -> PathBuf {
    dir.join(format!("frame-{n:05}.{extension}"))
}

/// Extension from the declared MIME type, falling back to the image magic.
fn frame_extension(mime_type: Option<&str>, bytes: &[u8]) -> &'static str {
    match mime_type {
        Some("image/png") => return "png",
        Some("image/jpeg") | Some("image/jpg") => return "jpg",
        Some("image/webp") => return "webp",
        _ => {}
    }
    if bytes.starts_with(b"\x89PNG") {
        "png"
    } else if bytes.starts_with(&[0xFF, 0xD8]) {
        "jpg"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "webp"
    } else {
        "bin"
    }
}
