//! Supervision of a single worker process
//!
//! A [`WorkerProcessHandle`] owns one process and four background tasks:
//! a writer that drains the outbound queue into stdin, a reader that routes
//! stdout lines to their pending slots, a stderr collector, and a
//! supervisor that waits for the process to exit and applies termination
//! requests. Commands are written by the writer task only, so lines from
//! concurrent callers never interleave.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use foreman_config::DispatchConfig;
use foreman_ipc::{
    decode_response, encode_command, Command, LineRead, LineReader, LineWriter, WorkerCategory,
    SHUTDOWN_COMMAND,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::pending::{Fulfilment, PendingResponse, PendingTable};
use crate::process::{LaunchedWorker, ProcessControl, ProcessExit, WorkerStdin, WorkerStdout};
use crate::stderr::{drain_stderr, StderrTail};

/// How long crash reporting waits for the stderr pipe to finish draining
const STDERR_SETTLE: Duration = Duration::from_millis(200);

/// Lifecycle of a worker process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// No process has been launched for the category yet
    Unstarted,
    /// Launched, inside its startup grace period
    Starting,
    /// Accepting commands
    Alive,
    /// Exited unexpectedly; outstanding commands are being failed
    Crashed,
    /// Shutdown requested; no new commands are accepted
    ShuttingDown,
    /// Process gone and all resources released
    Dead,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Unstarted => "unstarted",
            HandleState::Starting => "starting",
            HandleState::Alive => "alive",
            HandleState::Crashed => "crashed",
            HandleState::ShuttingDown => "shutting_down",
            HandleState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Per-process limits
#[derive(Debug, Clone)]
pub struct HandleSettings {
    pub max_line_length: usize,
    pub stderr_buffer_lines: usize,
}

impl HandleSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_line_length: config.max_line_length,
            stderr_buffer_lines: config.stderr_buffer_lines,
        }
    }
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Deadlines for the shutdown escalation: command, SIGTERM, kill
#[derive(Debug, Clone)]
pub struct ShutdownSettings {
    pub command_timeout: Duration,
    pub grace: Duration,
    pub kill_timeout: Duration,
}

impl ShutdownSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            command_timeout: config.shutdown_command_timeout,
            grace: config.shutdown_grace,
            kill_timeout: config.kill_timeout,
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// State shared between the handle and its background tasks
struct Shared {
    category: WorkerCategory,
    state: watch::Sender<HandleState>,
    exit: Mutex<Option<ProcessExit>>,
    pending: Arc<PendingTable>,
    stderr: StderrTail,
    stderr_open: watch::Sender<bool>,
    max_line_length: usize,
}

impl Shared {
    fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    /// Route one stdout line to the caller waiting for it
    fn route_line(&self, line: &str) {
        match decode_response(line, self.max_line_length) {
            Ok(response) => {
                let correlation_id = response.correlation_id.clone();
                match self.pending.fulfil(&correlation_id, Ok(response)) {
                    Fulfilment::Delivered => {
                        trace!(worker = %self.category, "Delivered response {}", correlation_id)
                    }
                    Fulfilment::Late => debug!(
                        worker = %self.category,
                        "Discarding late response {}", correlation_id
                    ),
                    Fulfilment::Unknown => warn!(
                        worker = %self.category,
                        "Response for unknown correlation id {}", correlation_id
                    ),
                }
            }
            Err(e) => match correlation_hint(line) {
                Some(correlation_id) => {
                    warn!(
                        worker = %self.category,
                        "Unreadable response for {}: {}", correlation_id, e
                    );
                    let failure = DispatchError::Protocol {
                        category: self.category.clone(),
                        message: e.to_string(),
                    };
                    self.pending.fulfil(&correlation_id, Err(failure));
                }
                None => warn!(worker = %self.category, "Ignoring unreadable line: {}", e),
            },
        }
    }

    fn exit_detail(&self) -> String {
        let exit = match *self.exit.lock() {
            Some(exit) => format!("process exited with {exit}"),
            None => "process exit status unavailable".to_string(),
        };
        match self.stderr.summary() {
            Some(tail) => format!("{exit}; stderr: {tail}"),
            None => exit,
        }
    }

    async fn settle_stderr(&self) {
        let mut open = self.stderr_open.subscribe();
        let _ = tokio::time::timeout(STDERR_SETTLE, open.wait_for(|open| !*open)).await;
    }

    /// Record the exit and fail everything still outstanding
    async fn finish(&self, exit: Option<ProcessExit>) {
        *self.exit.lock() = exit;

        let mut previous = HandleState::Dead;
        self.state.send_modify(|state| {
            previous = *state;
            if *state != HandleState::ShuttingDown {
                *state = HandleState::Crashed;
            }
        });

        self.settle_stderr().await;
        let detail = self.exit_detail();
        let failed = self
            .pending
            .close(|| DispatchError::crashed(&self.category, detail.clone()));

        if previous == HandleState::ShuttingDown {
            info!(worker = %self.category, "Worker stopped: {}", detail);
        } else {
            warn!(
                worker = %self.category,
                failed_commands = failed,
                "Worker exited unexpectedly: {}", detail
            );
        }

        self.state.send_replace(HandleState::Dead);
    }
}

/// Pull a correlation id out of a line that is JSON but not a valid response
fn correlation_hint(line: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    match value.get("correlationId")? {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        _ => None,
    }
}

/// One live worker process and its pipes
pub struct WorkerProcessHandle {
    shared: Arc<Shared>,
    instance_id: Uuid,
    id_prefix: String,
    sequence: AtomicU64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<String>,
    signals: mpsc::UnboundedSender<Signal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerProcessHandle {
    /// Take ownership of a launched process and start its background tasks.
    ///
    /// The handle begins in [`HandleState::Starting`]; call
    /// [`await_startup`](Self::await_startup) before sending commands.
    pub fn start(category: WorkerCategory, worker: LaunchedWorker, settings: &HandleSettings) -> Self {
        let LaunchedWorker {
            stdin,
            stdout,
            stderr,
            control,
        } = worker;

        let instance_id = Uuid::new_v4();
        let mut id_prefix = instance_id.simple().to_string();
        id_prefix.truncate(8);
        let pid = control.id();

        let (state, _) = watch::channel(HandleState::Starting);
        let (stderr_open, _) = watch::channel(stderr.is_some());
        let shared = Arc::new(Shared {
            category: category.clone(),
            state,
            exit: Mutex::new(None),
            pending: Arc::new(PendingTable::new(category.clone())),
            stderr: StderrTail::new(settings.stderr_buffer_lines),
            stderr_open,
            max_line_length: settings.max_line_length,
        });

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (signals, signals_rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(4);
        tasks.push(tokio::spawn(write_commands(
            LineWriter::new(stdin),
            outbound_rx,
            Arc::clone(&shared),
            signals.clone(),
        )));
        tasks.push(tokio::spawn(read_responses(
            LineReader::new(stdout, settings.max_line_length),
            Arc::clone(&shared),
            signals.clone(),
        )));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(collect_stderr(
                stderr,
                Arc::clone(&shared),
                settings.max_line_length,
            )));
        }
        tasks.push(tokio::spawn(supervise(control, signals_rx, Arc::clone(&shared))));

        debug!(worker = %category, pid = ?pid, instance = %instance_id, "Worker handle started");

        Self {
            shared,
            instance_id,
            id_prefix,
            sequence: AtomicU64::new(0),
            pid,
            started_at: Utc::now(),
            outbound,
            signals,
            tasks: Mutex::new(tasks),
        }
    }

    /// Wait out the startup grace period.
    ///
    /// A process that exits inside the grace period is reported as
    /// unavailable, with its exit status and captured stderr.
    pub async fn await_startup(&self, grace: Duration) -> DispatchResult<()> {
        let mut state = self.shared.state.subscribe();
        let exited = matches!(
            tokio::time::timeout(grace, state.wait_for(|s| *s == HandleState::Dead)).await,
            Ok(_)
        );

        if exited {
            return Err(DispatchError::unavailable(
                &self.shared.category,
                format!("exited during startup: {}", self.shared.exit_detail()),
            ));
        }

        if self.transition(&[HandleState::Starting], HandleState::Alive) {
            Ok(())
        } else {
            Err(DispatchError::unavailable(
                &self.shared.category,
                format!("worker is {} after startup", self.state()),
            ))
        }
    }

    pub fn category(&self) -> &WorkerCategory {
        &self.shared.category
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> HandleState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == HandleState::Alive
    }

    /// Exit status, once the process is gone
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.shared.exit.lock()
    }

    /// Number of commands awaiting a response
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Most recent stderr lines
    pub fn stderr_tail(&self) -> Vec<String> {
        self.shared.stderr.lines()
    }

    /// Fresh correlation id, unique across every handle in this host
    pub fn next_correlation_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.id_prefix, seq)
    }

    /// Queue a command and return the future for its response.
    ///
    /// The command is encoded before anything is registered, so a payload
    /// that cannot be written leaves no trace.
    pub fn send(&self, command: Command) -> DispatchResult<PendingResponse> {
        let state = self.state();
        if state != HandleState::Alive {
            return Err(DispatchError::unavailable(
                &self.shared.category,
                format!("worker is {state}"),
            ));
        }
        self.enqueue(command)
    }

    fn enqueue(&self, command: Command) -> DispatchResult<PendingResponse> {
        let line = encode_command(&command)
            .map_err(|e| DispatchError::from_ipc(&self.shared.category, e))?;
        let pending = self
            .shared
            .pending
            .register(command.correlation_id())
            .ok_or_else(|| {
                DispatchError::unavailable(&self.shared.category, "worker no longer accepts commands")
            })?;

        self.outbound.send(line).map_err(|_| {
            DispatchError::unavailable(&self.shared.category, "command writer has stopped")
        })?;
        trace!(
            worker = %self.shared.category,
            command = command.name(),
            "Queued command {}", command.correlation_id()
        );
        Ok(pending)
    }

    /// Stop the process: ask nicely, then SIGTERM, then kill.
    ///
    /// Safe to call more than once and on a handle that already crashed.
    pub async fn shutdown(&self, settings: &ShutdownSettings) {
        let requested = self.transition(
            &[HandleState::Starting, HandleState::Alive],
            HandleState::ShuttingDown,
        );

        if requested {
            debug!(worker = %self.shared.category, "Requesting worker shutdown");
            let command = Command::from_value(
                self.shared.category.clone(),
                SHUTDOWN_COMMAND,
                self.next_correlation_id(),
                serde_json::Value::Null,
            );
            match self.enqueue(command) {
                Ok(ack) => match tokio::time::timeout(settings.command_timeout, ack).await {
                    Ok(Ok(_)) => debug!(worker = %self.shared.category, "Shutdown acknowledged"),
                    Ok(Err(e)) => debug!(worker = %self.shared.category, "Shutdown not acknowledged: {}", e),
                    Err(_) => debug!(worker = %self.shared.category, "No shutdown acknowledgement"),
                },
                Err(e) => debug!(worker = %self.shared.category, "Could not send shutdown: {}", e),
            }
        }

        if !self.wait_until_dead(settings.grace).await {
            debug!(worker = %self.shared.category, "Worker still running, sending SIGTERM");
            let _ = self.signals.send(Signal::Terminate);

            if !self.wait_until_dead(settings.grace).await {
                warn!(worker = %self.shared.category, "Worker ignored SIGTERM, killing");
                let _ = self.signals.send(Signal::Kill);

                if !self.wait_until_dead(settings.kill_timeout).await {
                    error!(worker = %self.shared.category, "Worker did not exit after kill");
                    self.abandon();
                }
            }
        }

        self.abort_tasks();
    }

    /// Give up on a process that outlived its kill: stop the tasks, fail the
    /// remaining callers and mark the handle dead.
    fn abandon(&self) {
        self.abort_tasks();
        let failed = self.shared.pending.close(|| {
            DispatchError::crashed(&self.shared.category, "process did not exit after kill")
        });
        if failed > 0 {
            warn!(worker = %self.shared.category, failed_commands = failed, "Abandoned worker");
        }
        self.shared.state.send_replace(HandleState::Dead);
    }

    /// Wait until the process has exited, up to `limit`
    pub async fn wait_until_dead(&self, limit: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let dead = matches!(
            tokio::time::timeout(limit, state.wait_for(|s| *s == HandleState::Dead)).await,
            Ok(Ok(_))
        );
        dead
    }

    fn transition(&self, from: &[HandleState], to: HandleState) -> bool {
        self.shared.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for WorkerProcessHandle {
    fn drop(&mut self) {
        // Aborting the supervisor drops the process, which kills it
        self.abort_tasks();
    }
}

impl fmt::Debug for WorkerProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcessHandle")
            .field("category", &self.shared.category)
            .field("instance_id", &self.instance_id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

async fn write_commands(
    mut writer: LineWriter<WorkerStdin>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    signals: mpsc::UnboundedSender<Signal>,
) {
    while let Some(line) = outbound.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            if shared.state() == HandleState::Alive {
                error!(worker = %shared.category, "Write to worker failed: {}", e);
            } else {
                debug!(worker = %shared.category, "Write to stopping worker failed: {}", e);
            }
            let _ = signals.send(Signal::Kill);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_responses(
    mut reader: LineReader<WorkerStdout>,
    shared: Arc<Shared>,
    signals: mpsc::UnboundedSender<Signal>,
) {
    loop {
        match reader.next_line().await {
            Ok(LineRead::Line(line)) => {
                if !line.trim().is_empty() {
                    shared.route_line(&line);
                }
            }
            Ok(LineRead::Oversized { len }) => warn!(
                worker = %shared.category,
                "Discarded {} byte line over the {} byte limit", len, shared.max_line_length
            ),
            Ok(LineRead::Eof) => {
                debug!(worker = %shared.category, "Worker stdout closed");
                break;
            }
            Err(e) if e.is_line_local() => {
                warn!(worker = %shared.category, "Ignoring unreadable line: {}", e)
            }
            Err(e) => {
                error!(worker = %shared.category, "Reading worker stdout failed: {}", e);
                break;
            }
        }
    }

    // A worker without stdout can never answer again
    if shared.state() != HandleState::ShuttingDown {
        let _ = signals.send(Signal::Kill);
    }
}

async fn collect_stderr(stderr: WorkerStdout, shared: Arc<Shared>, max_line_length: usize) {
    drain_stderr(stderr, &shared.stderr, &shared.category, max_line_length).await;
    shared.stderr_open.send_replace(false);
}

enum Event {
    Exited(io::Result<ProcessExit>),
    Signal(Option<Signal>),
}

async fn supervise(
    mut control: Box<dyn ProcessControl>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    shared: Arc<Shared>,
) {
    let exit = loop {
        let event = tokio::select! {
            status = control.wait() => Event::Exited(status),
            signal = signals.recv() => Event::Signal(signal),
        };

        match event {
            Event::Exited(Ok(exit)) => break Some(exit),
            Event::Exited(Err(e)) => {
                error!(worker = %shared.category, "Waiting on worker process failed: {}", e);
                break None;
            }
            Event::Signal(Some(Signal::Terminate)) => {
                if let Err(e) = control.terminate() {
                    warn!(worker = %shared.category, "SIGTERM failed: {}", e);
                }
            }
            Event::Signal(Some(Signal::Kill)) => {
                if let Err(e) = control.kill() {
                    warn!(worker = %shared.category, "Kill failed: {}", e);
                }
            }
            Event::Signal(None) => {
                if let Err(e) = control.kill() {
                    warn!(worker = %shared.category, "Kill failed: {}", e);
                }
                break control.wait().await.ok();
            }
        }
    };

    shared.finish(exit).await;
}
