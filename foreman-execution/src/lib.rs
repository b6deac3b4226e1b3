//! Foreman Execution Engine
//!
//! Supervises one long-lived worker process per category and multiplexes
//! concurrent commands over each process's stdin/stdout, matching responses
//! to callers by correlation id.

pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod launcher;
pub mod lifecycle;
pub mod pending;
pub mod pool;
pub mod process;
pub mod stderr;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use dispatcher::{CommandRequest, DispatchReply, Ping, RequestDispatcher, WorkerRequest};
pub use error::{DispatchError, DispatchResult};
pub use handle::{HandleSettings, HandleState, ShutdownSettings, WorkerProcessHandle};
pub use launcher::{CommandLauncher, WorkerLauncher};
pub use lifecycle::{LifecycleController, LifecycleSettings};
pub use pending::{Fulfilment, PendingResponse, PendingTable};
pub use pool::{PoolSettings, WorkerHealth, WorkerPool};
pub use process::{ChildProcess, LaunchedWorker, ProcessControl, ProcessExit};
pub use stderr::StderrTail;

// Protocol types callers need alongside the dispatcher
pub use foreman_ipc::{WorkerCategory, PING_COMMAND, SHUTDOWN_COMMAND};
