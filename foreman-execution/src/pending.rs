//! Outstanding request slots, keyed by correlation id

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use foreman_ipc::{Response, WorkerCategory};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{DispatchError, DispatchResult};

/// Number of abandoned correlation ids remembered for late-response logging
const EXPIRED_HISTORY: usize = 256;

type Slot = oneshot::Sender<DispatchResult<Response>>;

/// What happened to a response handed to [`PendingTable::fulfil`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fulfilment {
    /// A waiting caller received it
    Delivered,
    /// Its caller already gave up (timeout or cancellation)
    Late,
    /// Nothing with that id was ever outstanding
    Unknown,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    expired: VecDeque<String>,
    closed: bool,
}

impl Inner {
    fn remember_expired(&mut self, id: String) {
        if self.expired.len() == EXPIRED_HISTORY {
            self.expired.pop_front();
        }
        self.expired.push_back(id);
    }
}

/// Table of in-flight commands for one worker handle.
///
/// Every slot is completed at most once: by its response, by cancellation,
/// or by [`PendingTable::close`] when the process goes away.
pub struct PendingTable {
    category: WorkerCategory,
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new(category: WorkerCategory) -> Self {
        Self {
            category,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Open a slot for `correlation_id`.
    ///
    /// Returns `None` once the table is closed or if the id is already
    /// outstanding.
    pub fn register(self: &Arc<Self>, correlation_id: &str) -> Option<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.closed || inner.slots.contains_key(correlation_id) {
                return None;
            }
            inner.slots.insert(correlation_id.to_string(), tx);
        }

        Some(PendingResponse {
            correlation_id: correlation_id.to_string(),
            category: self.category.clone(),
            rx,
            table: Arc::clone(self),
            finished: false,
        })
    }

    /// Complete the slot for `correlation_id` with `result`
    pub fn fulfil(&self, correlation_id: &str, result: DispatchResult<Response>) -> Fulfilment {
        let slot = {
            let mut inner = self.inner.lock();
            match inner.slots.remove(correlation_id) {
                Some(slot) => slot,
                None if inner.expired.iter().any(|id| id == correlation_id) => {
                    return Fulfilment::Late
                }
                None => return Fulfilment::Unknown,
            }
        };

        match slot.send(result) {
            Ok(()) => Fulfilment::Delivered,
            // Receiver dropped between removal and send
            Err(_) => Fulfilment::Late,
        }
    }

    /// Drop the slot for a caller that stopped waiting
    fn cancel(&self, correlation_id: &str) {
        let mut inner = self.inner.lock();
        if inner.slots.remove(correlation_id).is_some() {
            inner.remember_expired(correlation_id.to_string());
        }
    }

    /// Refuse new registrations and fail every outstanding slot.
    ///
    /// Returns the number of callers that were failed.
    pub fn close(&self, make_error: impl Fn() -> DispatchError) -> usize {
        let slots: Vec<Slot> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.slots.drain().map(|(_, slot)| slot).collect()
        };

        slots
            .into_iter()
            .map(|slot| slot.send(Err(make_error())))
            .filter(Result::is_ok)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Future resolving to the response for one registered command.
///
/// Dropping it before completion cancels the slot, so a response arriving
/// afterwards is recognised as late and discarded.
pub struct PendingResponse {
    correlation_id: String,
    category: WorkerCategory,
    rx: oneshot::Receiver<DispatchResult<Response>>,
    table: Arc<PendingTable>,
    finished: bool,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingResponse {
    type Output = DispatchResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(DispatchError::crashed(
                &self.category,
                "worker handle went away before responding",
            )),
        };
        self.finished = true;
        Poll::Ready(result)
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.table.cancel(&self.correlation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn response(id: &str) -> Response {
        Response {
            correlation_id: id.to_string(),
            success: true,
            payload: None,
            error_message: None,
            completed_at: Utc::now(),
            server_elapsed_ms: None,
        }
    }

    fn table() -> Arc<PendingTable> {
        Arc::new(PendingTable::new(WorkerCategory::Memory))
    }

    #[tokio::test]
    async fn test_fulfil_delivers_to_matching_slot() {
        let table = table();
        let first = table.register("a-1").unwrap();
        let second = table.register("a-2").unwrap();
        assert_eq!(table.len(), 2);

        assert_eq!(table.fulfil("a-2", Ok(response("a-2"))), Fulfilment::Delivered);
        assert_eq!(table.fulfil("a-1", Ok(response("a-1"))), Fulfilment::Delivered);

        assert_eq!(second.await.unwrap().correlation_id, "a-2");
        assert_eq!(first.await.unwrap().correlation_id, "a-1");
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let table = table();
        let _slot = table.register("a-1").unwrap();
        assert!(table.register("a-1").is_none());
    }

    #[test]
    fn test_unknown_and_late_responses() {
        let table = table();
        assert_eq!(table.fulfil("nope", Ok(response("nope"))), Fulfilment::Unknown);

        let slot = table.register("a-7").unwrap();
        drop(slot);
        assert!(table.is_empty());
        assert_eq!(table.fulfil("a-7", Ok(response("a-7"))), Fulfilment::Late);
    }

    #[tokio::test]
    async fn test_timeout_cancels_slot() {
        let table = table();
        let slot = table.register("a-1").unwrap();

        let outcome = tokio::time::timeout(std::time::Duration::from_millis(10), slot).await;
        assert!(outcome.is_err());
        assert!(table.is_empty());
        assert_eq!(table.fulfil("a-1", Ok(response("a-1"))), Fulfilment::Late);
    }

    #[tokio::test]
    async fn test_close_fails_everything_and_refuses_new_slots() {
        let table = table();
        let slots: Vec<_> = (1..=3)
            .map(|i| table.register(&format!("a-{i}")).unwrap())
            .collect();

        let failed = table.close(|| DispatchError::crashed(&WorkerCategory::Memory, "exit code 1"));
        assert_eq!(failed, 3);
        assert!(table.is_closed());
        assert!(table.register("a-4").is_none());

        for slot in slots {
            assert!(slot.await.unwrap_err().is_crash());
        }
    }

    #[tokio::test]
    async fn test_dropped_table_fails_waiter() {
        let table = table();
        let slot = table.register("a-1").unwrap();
        // Simulate the sender side vanishing without an answer
        table.inner.lock().slots.clear();

        assert!(slot.await.unwrap_err().is_crash());
    }
}
