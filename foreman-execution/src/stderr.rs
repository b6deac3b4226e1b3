//! Bounded capture of a worker's stderr

use std::collections::VecDeque;

use foreman_ipc::{LineRead, LineReader, WorkerCategory};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// The most recent stderr lines of one worker process
pub struct StderrTail {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Captured lines joined for inclusion in an error message
    pub fn summary(&self) -> Option<String> {
        let lines = self.lines.lock();
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().map(String::as_str).collect::<Vec<_>>().join(" | "))
        }
    }
}

/// Copy stderr into `tail` until the stream closes. Never touches stdout.
pub(crate) async fn drain_stderr<R>(
    stderr: R,
    tail: &StderrTail,
    category: &WorkerCategory,
    max_line_length: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = LineReader::new(stderr, max_line_length);
    loop {
        match reader.next_line().await {
            Ok(LineRead::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                debug!(worker = %category, "stderr: {}", line);
                tail.push(line);
            }
            Ok(LineRead::Oversized { len }) => {
                tail.push(format!("<{len} bytes of stderr omitted>"));
            }
            Ok(LineRead::Eof) => break,
            Err(e) if e.is_line_local() => {
                tail.push("<unreadable stderr line>".to_string());
            }
            Err(e) => {
                warn!(worker = %category, "stderr read failed: {}", e);
                break;
            }
        }
    }
}
