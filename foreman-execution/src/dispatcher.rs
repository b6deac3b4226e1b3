//! Request/response dispatch on top of the worker pool

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use foreman_ipc::{Command, WorkerCategory, PING_COMMAND};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::handle::WorkerProcessHandle;
use crate::pool::WorkerPool;

/// Message used when a worker fails a command without saying why
const UNSPECIFIED_FAILURE: &str = "worker reported failure";

/// A command addressed to a category, not yet bound to a process
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub category: WorkerCategory,
    pub command: String,
    pub payload: JsonValue,
}

impl CommandRequest {
    pub fn new<P>(category: WorkerCategory, command: impl Into<String>, payload: &P) -> DispatchResult<Self>
    where
        P: Serialize + ?Sized,
    {
        let payload =
            serde_json::to_value(payload).map_err(|e| DispatchError::Serialization(e.to_string()))?;
        Ok(Self::from_value(category, command, payload))
    }

    pub fn from_value(category: WorkerCategory, command: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            category,
            command: command.into(),
            payload,
        }
    }
}

/// Successful outcome of a dispatched command
#[derive(Debug, Clone)]
pub struct DispatchReply {
    pub correlation_id: String,
    /// `data` from the response, `null` when absent
    pub payload: JsonValue,
    /// Execution time reported by the worker itself
    pub worker_elapsed_ms: Option<u64>,
    /// Host-side time from enqueue to response
    pub round_trip: Duration,
    pub completed_at: DateTime<Utc>,
}

/// A typed command with a fixed name and a typed reply
pub trait WorkerRequest: Serialize {
    type Output: DeserializeOwned;

    const COMMAND: &'static str;

    fn category(&self) -> WorkerCategory;
}

/// Liveness check every worker must answer
#[derive(Debug, Clone, Serialize)]
pub struct Ping {
    #[serde(skip)]
    category: WorkerCategory,
}

impl Ping {
    pub fn new(category: WorkerCategory) -> Self {
        Self { category }
    }
}

impl WorkerRequest for Ping {
    type Output = JsonValue;

    const COMMAND: &'static str = PING_COMMAND;

    fn category(&self) -> WorkerCategory {
        self.category.clone()
    }
}

/// Sends commands to workers and waits for their responses.
///
/// There are no retries here. A crash is reported to the caller and the
/// process is restarted in the background for whoever comes next.
#[derive(Clone)]
pub struct RequestDispatcher {
    pool: Arc<WorkerPool>,
    default_timeout: Duration,
}

impl RequestDispatcher {
    pub fn new(pool: Arc<WorkerPool>, default_timeout: Duration) -> Self {
        Self {
            pool,
            default_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `command` on the category's worker and return the response data
    pub async fn execute(
        &self,
        category: WorkerCategory,
        command: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> DispatchResult<JsonValue> {
        let request = CommandRequest::from_value(category, command, payload);
        self.dispatch(request, timeout).await.map(|reply| reply.payload)
    }

    /// [`execute`](Self::execute) with the configured default timeout
    pub async fn execute_default(
        &self,
        category: WorkerCategory,
        command: &str,
        payload: JsonValue,
    ) -> DispatchResult<JsonValue> {
        self.execute(category, command, payload, self.default_timeout)
            .await
    }

    /// Serialize `payload`, dispatch, and deserialize the response data
    pub async fn execute_typed<P, R>(
        &self,
        category: WorkerCategory,
        command: &str,
        payload: &P,
        timeout: Duration,
    ) -> DispatchResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = CommandRequest::new(category, command, payload)?;
        let reply = self.dispatch(request, timeout).await?;
        serde_json::from_value(reply.payload)
            .map_err(|e| DispatchError::Serialization(format!("unexpected response data: {e}")))
    }

    /// Dispatch a [`WorkerRequest`]
    pub async fn request<R>(&self, request: &R, timeout: Duration) -> DispatchResult<R::Output>
    where
        R: WorkerRequest,
    {
        self.execute_typed(request.category(), R::COMMAND, request, timeout)
            .await
    }

    /// Dispatch and return the full reply
    pub async fn dispatch(&self, request: CommandRequest, timeout: Duration) -> DispatchResult<DispatchReply> {
        let CommandRequest {
            category,
            command,
            payload,
        } = request;

        let handle = self.pool.get(&category).await?;
        let correlation_id = handle.next_correlation_id();
        let message = Command::from_value(category.clone(), command.as_str(), correlation_id.as_str(), payload);

        let started = Instant::now();
        let pending = handle.send(message)?;
        debug!(worker = %category, command = %command, "Dispatched {}", correlation_id);

        let response = match tokio::time::timeout(timeout, pending).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if e.is_crash() {
                    self.schedule_recovery(category, handle);
                }
                return Err(e);
            }
            Err(_) => {
                warn!(
                    worker = %category,
                    command = %command,
                    "Command {} timed out after {:?}", correlation_id, timeout
                );
                return Err(DispatchError::Timeout {
                    category,
                    command,
                    timeout,
                });
            }
        };

        let round_trip = started.elapsed();
        if !response.success {
            return Err(DispatchError::WorkerReported {
                category,
                command,
                message: response
                    .error_message
                    .filter(|message| !message.is_empty())
                    .unwrap_or_else(|| UNSPECIFIED_FAILURE.to_string()),
            });
        }

        debug!(
            worker = %category,
            command = %command,
            round_trip_ms = round_trip.as_millis() as u64,
            worker_ms = ?response.server_elapsed_ms,
            "Completed {}", correlation_id
        );

        Ok(DispatchReply {
            correlation_id,
            payload: response.payload.unwrap_or(JsonValue::Null),
            worker_elapsed_ms: response.server_elapsed_ms,
            round_trip,
            completed_at: response.completed_at,
        })
    }

    /// Restart a crashed worker without making the failing caller wait
    fn schedule_recovery(&self, category: WorkerCategory, failed: Arc<WorkerProcessHandle>) {
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            match pool.recover(&category, &failed).await {
                Ok(true) => debug!(worker = %category, "Crashed worker replaced"),
                Ok(false) => {}
                Err(e) => warn!(worker = %category, "Could not replace crashed worker: {}", e),
            }
        });
    }
}
