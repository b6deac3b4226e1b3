//! Protocol types shared by the host and its worker processes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

use crate::error::IpcError;

/// Command name a worker must answer during the startup handshake
pub const PING_COMMAND: &str = "ping";

/// Command name asking a worker to exit cleanly
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// Default cap on a single protocol line, in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Kind of external process that handles a command.
///
/// Exactly one live process exists per category. Known categories have their
/// own variants; anything else named in configuration lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WorkerCategory {
    Device,
    Memory,
    Training,
    Postprocessing,
    Other(String),
}

impl WorkerCategory {
    /// Wire name of the category
    pub fn as_str(&self) -> &str {
        match self {
            WorkerCategory::Device => "device",
            WorkerCategory::Memory => "memory",
            WorkerCategory::Training => "training",
            WorkerCategory::Postprocessing => "postprocessing",
            WorkerCategory::Other(name) => name,
        }
    }
}

impl fmt::Display for WorkerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerCategory {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        match name.as_str() {
            "" => Err(IpcError::InvalidCategory(s.to_string())),
            "device" => Ok(WorkerCategory::Device),
            "memory" => Ok(WorkerCategory::Memory),
            "training" => Ok(WorkerCategory::Training),
            "postprocessing" => Ok(WorkerCategory::Postprocessing),
            _ if name.chars().any(char::is_whitespace) => {
                Err(IpcError::InvalidCategory(s.to_string()))
            }
            _ => Ok(WorkerCategory::Other(name)),
        }
    }
}

impl TryFrom<String> for WorkerCategory {
    type Error = IpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkerCategory> for String {
    fn from(category: WorkerCategory) -> Self {
        category.as_str().to_string()
    }
}

/// A command bound for one worker process. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    category: WorkerCategory,
    name: String,
    correlation_id: String,
    payload: JsonValue,
    issued_at: DateTime<Utc>,
}

impl Command {
    /// Build a command from any serializable payload.
    ///
    /// Fails with `IpcError::Serialization` when the payload cannot be
    /// represented as JSON, before anything reaches a process.
    pub fn new<P>(
        category: WorkerCategory,
        name: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, IpcError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| IpcError::Serialization(e.to_string()))?;
        Ok(Self::from_value(category, name, correlation_id, payload))
    }

    /// Build a command from an already-converted JSON payload
    pub fn from_value(
        category: WorkerCategory,
        name: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            category,
            name: name.into(),
            correlation_id: correlation_id.into(),
            payload,
            issued_at: Utc::now(),
        }
    }

    pub fn category(&self) -> &WorkerCategory {
        &self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Wire representation of this command
    pub fn to_wire(&self) -> WireCommand<'_> {
        WireCommand {
            worker_type: self.category.as_str(),
            command: &self.name,
            correlation_id: &self.correlation_id,
            data: &self.payload,
            timestamp: self.issued_at,
        }
    }
}

/// A decoded response from a worker process
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub correlation_id: String,
    pub success: bool,
    pub payload: Option<JsonValue>,
    pub error_message: Option<String>,
    /// Host clock at the moment the response line was decoded
    pub completed_at: DateTime<Utc>,
    /// Execution time as reported by the worker (`executionTimeMs`)
    pub server_elapsed_ms: Option<u64>,
}

/// Command line as written to a worker's stdin
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCommand<'a> {
    pub worker_type: &'a str,
    pub command: &'a str,
    pub correlation_id: &'a str,
    pub data: &'a JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// Command line as read by a worker. Owned counterpart of [`WireCommand`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCommand {
    pub worker_type: String,
    pub command: String,
    pub correlation_id: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Response line as exchanged on a worker's stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
}

impl WireResponse {
    /// Successful response carrying `data`
    pub fn ok(correlation_id: impl Into<String>, data: JsonValue, execution_time_ms: u64) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms: Some(execution_time_ms),
        }
    }

    /// Failed response carrying an error message
    pub fn error(
        correlation_id: impl Into<String>,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            success: false,
            data: None,
            error: Some(message.into()),
            execution_time_ms: Some(execution_time_ms),
        }
    }
}
