//! Control over a running worker process

use std::fmt;
use std::io;
use std::process::ExitStatus;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Lifecycle operations on a spawned process.
///
/// `wait` must be cancel-safe: the supervisor polls it inside `select!`
/// alongside termination requests.
#[async_trait]
pub trait ProcessControl: Send {
    /// OS process id, if the process is still known to the OS
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Ask the process to stop (SIGTERM on unix)
    fn terminate(&mut self) -> io::Result<()>;

    /// Stop the process unconditionally
    fn kill(&mut self) -> io::Result<()>;
}

/// [`ProcessControl`] over a real child process
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl ProcessControl for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        self.child.wait().await.map(ProcessExit::from)
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            match self.child.id() {
                Some(pid) => signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(io::Error::from),
                // Already reaped
                None => Ok(()),
            }
        }

        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

pub type WorkerStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerStdout = Box<dyn AsyncRead + Send + Unpin>;

/// A freshly started worker: its three pipes plus process control
pub struct LaunchedWorker {
    pub stdin: WorkerStdin,
    pub stdout: WorkerStdout,
    pub stderr: Option<WorkerStdout>,
    pub control: Box<dyn ProcessControl>,
}

impl LaunchedWorker {
    /// Take the pipes of a child spawned with piped stdin and stdout
    pub fn from_child(mut child: Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as WorkerStdout);

        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            control: Box::new(ChildProcess::new(child)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        let exited = ProcessExit {
            code: Some(3),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exit code 3");
        assert!(!exited.success());

        let killed = ProcessExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");

        assert!(ProcessExit {
            code: Some(0),
            signal: None
        }
        .success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_process_terminate() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let mut worker = LaunchedWorker::from_child(child).unwrap();
        assert!(worker.pid().is_some());

        worker.control.terminate().unwrap();
        let exit = worker.control.wait().await.unwrap();
        assert_eq!(exit.signal, Some(15));
        assert_eq!(exit.code, None);
    }
}
