//! In-memory worker processes for unit tests

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foreman_ipc::{
    decode_command, encode_response, IncomingCommand, LineRead, LineReader, LineWriter,
    WireResponse, WorkerCategory, DEFAULT_MAX_LINE_LENGTH,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{DispatchError, DispatchResult};
use crate::launcher::WorkerLauncher;
use crate::process::{LaunchedWorker, ProcessControl, ProcessExit};

const PIPE_CAPACITY: usize = 64 * 1024;

/// What a fake worker does in reaction to one command
pub(crate) enum Action {
    Reply(WireResponse),
    ReplyAfter(Duration, WireResponse),
    /// Write a raw stdout line
    Raw(String),
    Stderr(String),
    Exit(i32),
}

pub(crate) type Behavior = Arc<dyn Fn(&IncomingCommand) -> Vec<Action> + Send + Sync>;

/// ping, shutdown, echo, sleep, fail, crash and hang
pub(crate) fn standard_behavior() -> Behavior {
    Arc::new(standard_actions)
}

pub(crate) fn standard_actions(cmd: &IncomingCommand) -> Vec<Action> {
    let id = cmd.correlation_id.as_str();
    match cmd.command.as_str() {
        "ping" => vec![Action::Reply(WireResponse::ok(id, json!({ "pong": true }), 0))],
        "shutdown" => vec![
            Action::Reply(WireResponse::ok(id, json!(null), 0)),
            Action::Exit(0),
        ],
        "echo" => vec![Action::Reply(WireResponse::ok(id, cmd.data.clone(), 1))],
        "sleep" => {
            let ms = cmd.data["ms"].as_u64().unwrap_or(0);
            vec![Action::ReplyAfter(
                Duration::from_millis(ms),
                WireResponse::ok(id, json!({ "sleptMs": ms }), ms),
            )]
        }
        "fail" => vec![Action::Reply(WireResponse::error(id, "requested failure", 0))],
        "crash" => vec![
            Action::Stderr("fatal: crash requested".to_string()),
            Action::Exit(3),
        ],
        "hang" => Vec::new(),
        other => vec![Action::Reply(WireResponse::error(
            id,
            format!("unknown command: {other}"),
            0,
        ))],
    }
}

/// Process control over the task that plays the worker
struct FakeControl {
    task: JoinHandle<i32>,
    signal: Option<i32>,
    exit: Option<ProcessExit>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = match (&mut self.task).await {
            Ok(code) => ProcessExit {
                code: Some(code),
                signal: None,
            },
            Err(e) if e.is_cancelled() => ProcessExit {
                code: None,
                signal: self.signal.or(Some(9)),
            },
            Err(e) => return Err(io::Error::other(e.to_string())),
        };
        self.exit = Some(exit);
        Ok(exit)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal.get_or_insert(15);
        self.task.abort();
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.signal.get_or_insert(9);
        self.task.abort();
        Ok(())
    }
}

struct Pipes {
    host: LaunchedWorkerPipes,
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

struct LaunchedWorkerPipes {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

fn pipes() -> Pipes {
    let (host_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
    let (worker_stdout, host_stdout) = tokio::io::duplex(PIPE_CAPACITY);
    let (worker_stderr, host_stderr) = tokio::io::duplex(PIPE_CAPACITY);
    Pipes {
        host: LaunchedWorkerPipes {
            stdin: host_stdin,
            stdout: host_stdout,
            stderr: host_stderr,
        },
        stdin: worker_stdin,
        stdout: worker_stdout,
        stderr: worker_stderr,
    }
}

fn launched(host: LaunchedWorkerPipes, task: JoinHandle<i32>) -> LaunchedWorker {
    LaunchedWorker {
        stdin: Box::new(host.stdin),
        stdout: Box::new(host.stdout),
        stderr: Some(Box::new(host.stderr)),
        control: Box::new(FakeControl {
            task,
            signal: None,
            exit: None,
        }),
    }
}

/// Start an in-memory worker driven by `behavior`
pub(crate) fn spawn_fake(behavior: Behavior) -> LaunchedWorker {
    let Pipes {
        host,
        stdin,
        stdout,
        stderr,
    } = pipes();
    let task = tokio::spawn(run_fake(stdin, stdout, stderr, behavior));
    launched(host, task)
}

/// Process control for a worker that ignores every signal and never exits
struct UnkillableControl {
    _task: JoinHandle<i32>,
}

#[async_trait]
impl ProcessControl for UnkillableControl {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        std::future::pending().await
    }

    fn terminate(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Start an in-memory worker whose process cannot be stopped
pub(crate) fn spawn_unkillable(behavior: Behavior) -> LaunchedWorker {
    let Pipes {
        host,
        stdin,
        stdout,
        stderr,
    } = pipes();
    let task = tokio::spawn(run_fake(stdin, stdout, stderr, behavior));
    LaunchedWorker {
        stdin: Box::new(host.stdin),
        stdout: Box::new(host.stdout),
        stderr: Some(Box::new(host.stderr)),
        control: Box::new(UnkillableControl { _task: task }),
    }
}

/// Start an in-memory worker that writes one stderr line and exits
pub(crate) fn spawn_exiting(code: i32, stderr_line: &'static str) -> LaunchedWorker {
    let Pipes {
        host,
        stdin,
        stdout,
        stderr,
    } = pipes();
    let task = tokio::spawn(async move {
        let mut stderr = LineWriter::new(stderr);
        let _ = stderr.write_line(stderr_line).await;
        // The pipes close together with the "process"
        drop((stdin, stdout));
        code
    });
    launched(host, task)
}

async fn run_fake(
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
    behavior: Behavior,
) -> i32 {
    let stdout = Arc::new(tokio::sync::Mutex::new(LineWriter::new(stdout)));
    let mut stderr = LineWriter::new(stderr);
    let mut reader = LineReader::new(stdin, DEFAULT_MAX_LINE_LENGTH);
    let mut delayed = JoinSet::new();

    loop {
        let line = match reader.next_line().await {
            Ok(LineRead::Line(line)) => line,
            Ok(LineRead::Eof) => return 0,
            Ok(LineRead::Oversized { .. }) | Err(_) => continue,
        };
        let Ok(command) = decode_command(&line, DEFAULT_MAX_LINE_LENGTH) else {
            continue;
        };

        for action in behavior(&command) {
            match action {
                Action::Reply(response) => write_response(&stdout, &response).await,
                Action::ReplyAfter(delay, response) => {
                    let stdout = Arc::clone(&stdout);
                    delayed.spawn(async move {
                        tokio::time::sleep(delay).await;
                        write_response(&stdout, &response).await;
                    });
                }
                Action::Raw(line) => {
                    let _ = stdout.lock().await.write_line(&line).await;
                }
                Action::Stderr(line) => {
                    let _ = stderr.write_line(&line).await;
                }
                Action::Exit(code) => return code,
            }
        }
    }
}

async fn write_response(
    stdout: &tokio::sync::Mutex<LineWriter<DuplexStream>>,
    response: &WireResponse,
) {
    if let Ok(line) = encode_response(response) {
        let _ = stdout.lock().await.write_line(&line).await;
    }
}

/// Launcher producing in-memory workers, with launch bookkeeping
pub(crate) struct FakeLauncher {
    behavior: Behavior,
    exit_on_start: Option<i32>,
    refuse: AtomicBool,
    launches: Mutex<HashMap<WorkerCategory, usize>>,
}

impl FakeLauncher {
    pub(crate) fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            exit_on_start: None,
            refuse: AtomicBool::new(false),
            launches: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn standard() -> Self {
        Self::new(standard_behavior())
    }

    /// Every launched process exits before its grace period ends
    pub(crate) fn exiting(code: i32) -> Self {
        Self {
            exit_on_start: Some(code),
            ..Self::standard()
        }
    }

    pub(crate) fn refuse_launches(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn launches(&self, category: &WorkerCategory) -> usize {
        self.launches.lock().get(category).copied().unwrap_or(0)
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, category: &WorkerCategory) -> DispatchResult<LaunchedWorker> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DispatchError::unavailable(category, "launch refused"));
        }
        *self.launches.lock().entry(category.clone()).or_insert(0) += 1;

        Ok(match self.exit_on_start {
            Some(code) => spawn_exiting(code, "worker failed to initialise"),
            None => spawn_fake(Arc::clone(&self.behavior)),
        })
    }
}
