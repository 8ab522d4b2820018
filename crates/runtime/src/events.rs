//! One-shot event waiters for remote objects.
//!
//! - [`EventWaiters`] - Per-object table of pending waiters, keyed by event name
//! - [`EventWaiter`] - Handle returned to the caller; resolves with the params
//!   of the next matching event
//!
//! A waiter only sees events dispatched after it was registered. When an
//! event fires, every waiter registered for that name at that moment is
//! resolved, in registration order, and removed; waiters registered later
//! wait for the next occurrence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::ConnectionLike;
use crate::error::{Error, Result};

/// Resolution slot shared by pending calls and event waiters.
pub(crate) type Slot = oneshot::Sender<Result<Value>>;

/// Pending waiters of one object, by event name.
#[derive(Default)]
pub struct EventWaiters {
    waiters: Mutex<HashMap<String, Vec<Slot>>>,
}

impl EventWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `event` and returns its receiving end.
    pub fn register(&self, event: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Resolves and removes every waiter currently registered for `event`.
    ///
    /// Returns the number of waiters resolved.
    pub fn fire(&self, event: &str, params: &Value) -> usize {
        let Some(batch) = self.waiters.lock().remove(event) else {
            return 0;
        };
        let count = batch.len();
        for tx in batch {
            // The caller may have stopped waiting.
            let _ = tx.send(Ok(params.clone()));
        }
        count
    }

    /// Fails and removes every pending waiter.
    pub fn fail_all(&self, error: impl Fn() -> Error) -> usize {
        let drained: Vec<Slot> = self
            .waiters
            .lock()
            .drain()
            .flat_map(|(_, batch)| batch)
            .collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    /// Number of waiters pending for `event`.
    pub fn pending(&self, event: &str) -> usize {
        self.waiters.lock().get(event).map_or(0, Vec::len)
    }
}

/// Pending wait for one event on one object.
///
/// Awaiting [`get`](Self::get) pumps the connection's dispatch loop until the
/// event arrives, the object is disposed, or the connection terminates.
///
/// # Example
///
/// ```ignore
/// let popup = page.wait_for_event("popup");
/// page.channel().call("evaluateExpression", params).await?;
/// let params = popup.get().await?;
/// ```
pub struct EventWaiter {
    event: String,
    rx: oneshot::Receiver<Result<Value>>,
    connection: Arc<dyn ConnectionLike>,
}

impl EventWaiter {
    pub(crate) fn new(
        event: &str,
        rx: oneshot::Receiver<Result<Value>>,
        connection: Arc<dyn ConnectionLike>,
    ) -> Self {
        Self {
            event: event.to_string(),
            rx,
            connection,
        }
    }

    /// A waiter that is already settled with `result`.
    pub(crate) fn settled(
        event: &str,
        result: Result<Value>,
        connection: Arc<dyn ConnectionLike>,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(event, rx, connection)
    }

    /// Name of the awaited event.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Waits for the event and returns its params.
    pub async fn get(self) -> Result<Value> {
        let Self {
            event,
            rx,
            connection,
        } = self;
        let result = connection.pump_until(rx).await;
        tracing::debug!(event = %event, ok = result.is_ok(), "event waiter settled");
        result
    }

    /// Like [`get`](Self::get), failing with [`Error::Timeout`] after `timeout`.
    pub async fn get_timeout(self, timeout: Duration) -> Result<Value> {
        let event = self.event.clone();
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "event '{}' not received within {}ms",
                    event,
                    timeout.as_millis()
                ))
            })?
    }
}

impl std::fmt::Debug for EventWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWaiter")
            .field("event", &self.event)
            .finish()
    }
}
