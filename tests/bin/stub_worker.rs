//! Scriptable worker process for end-to-end tests.
//!
//! Speaks the line protocol on stdin/stdout and logs to stderr. The first
//! argument is the worker category. Commands:
//!
//! - `ping`, `shutdown`, `echo`, `pid`
//! - `allocate`: replies `{"allocationId": "abc"}`
//! - `sleep {"ms": N}`: replies after N ms without blocking other commands
//! - `fail`: replies with `success: false`
//! - `crash`: exits with code 3 without replying
//! - `garbage`: writes a non-JSON line before replying
//! - `hang`: never replies
//!
//! `STUB_EXIT_IMMEDIATELY=<code>` makes the process exit before reading
//! anything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use foreman_ipc::{
    decode_command, encode_response, IncomingCommand, LineRead, LineReader, LineWriter,
    WireResponse, DEFAULT_MAX_LINE_LENGTH, PING_COMMAND, SHUTDOWN_COMMAND,
};
use foreman_logging::init_worker_tracing;
use serde_json::json;
use tokio::io::Stdout;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type SharedStdout = Arc<Mutex<LineWriter<Stdout>>>;

async fn reply(stdout: &SharedStdout, response: WireResponse) {
    match encode_response(&response) {
        Ok(line) => {
            if let Err(e) = stdout.lock().await.write_line(&line).await {
                error!("Failed to write response: {}", e);
            }
        }
        Err(e) => error!("Failed to encode response: {}", e),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Handle one command. Returns false when the worker should exit.
async fn handle(command: IncomingCommand, category: &str, stdout: &SharedStdout) -> bool {
    let started = Instant::now();
    let id = command.correlation_id.clone();
    debug!(command = %command.command, "Handling {}", id);

    match command.command.as_str() {
        PING_COMMAND => {
            let data = json!({ "pong": true, "category": category, "pid": std::process::id() });
            reply(stdout, WireResponse::ok(id, data, elapsed_ms(started))).await;
        }
        SHUTDOWN_COMMAND => {
            reply(stdout, WireResponse::ok(id, json!(null), elapsed_ms(started))).await;
            info!("Shutdown requested");
            return false;
        }
        "echo" => {
            reply(stdout, WireResponse::ok(id, command.data, elapsed_ms(started))).await;
        }
        "pid" => {
            let data = json!({ "pid": std::process::id() });
            reply(stdout, WireResponse::ok(id, data, elapsed_ms(started))).await;
        }
        "allocate" => {
            let data = json!({ "allocationId": "abc", "sizeBytes": command.data["sizeBytes"] });
            reply(stdout, WireResponse::ok(id, data, elapsed_ms(started))).await;
        }
        "sleep" => {
            let ms = command.data["ms"].as_u64().unwrap_or(0);
            let stdout = Arc::clone(stdout);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let data = json!({ "sleptMs": ms });
                reply(&stdout, WireResponse::ok(id, data, elapsed_ms(started))).await;
            });
        }
        "fail" => {
            let message = command.data["message"]
                .as_str()
                .unwrap_or("requested failure")
                .to_string();
            reply(stdout, WireResponse::error(id, message, elapsed_ms(started))).await;
        }
        "crash" => {
            error!("Crash requested, exiting without a response");
            std::process::exit(3);
        }
        "garbage" => {
            if let Err(e) = stdout.lock().await.write_line("this is not json").await {
                error!("Failed to write garbage: {}", e);
            }
            reply(stdout, WireResponse::ok(id, json!("after garbage"), elapsed_ms(started))).await;
        }
        "hang" => debug!("Never answering {}", id),
        other => {
            let message = format!("unknown command: {other}");
            reply(stdout, WireResponse::error(id, message, elapsed_ms(started))).await;
        }
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let category = std::env::args().nth(1).unwrap_or_else(|| "other".to_string());
    init_worker_tracing(std::env::var("STUB_LOG").ok().as_deref())?;

    if let Ok(code) = std::env::var("STUB_EXIT_IMMEDIATELY") {
        error!("Refusing to start ({} worker)", category);
        std::process::exit(code.parse().unwrap_or(1));
    }

    info!("Stub worker ready for category {}", category);
    let stdout: SharedStdout = Arc::new(Mutex::new(LineWriter::new(tokio::io::stdout())));
    let mut stdin = LineReader::new(tokio::io::stdin(), DEFAULT_MAX_LINE_LENGTH);

    loop {
        let line = match stdin.next_line().await {
            Ok(LineRead::Line(line)) => line,
            Ok(LineRead::Oversized { len }) => {
                warn!("Skipping {} byte command line", len);
                continue;
            }
            Ok(LineRead::Eof) => {
                info!("Stdin closed");
                break;
            }
            Err(e) if e.is_line_local() => {
                warn!("Skipping unreadable line: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match decode_command(&line, DEFAULT_MAX_LINE_LENGTH) {
            Ok(command) => {
                if !handle(command, &category, &stdout).await {
                    break;
                }
            }
            Err(e) => warn!("Ignoring malformed command: {}", e),
        }
    }

    // A blocked stdin read would hold up runtime shutdown
    std::process::exit(0)
}
