//! Single-slot request/response correlation.
//!
//! Both protocols are strictly one-request-at-a-time on the command path,
//! so a session holds at most one outstanding waiter. The slot pairs a
//! request id with a oneshot sender:
//!
//! ```text
//! send_command ──install(id)──▶ [ slot ] ◀──resolve(id, result)── I/O task
//!      │                           │
//!      └──wait(timeout)◀───oneshot─┘
//! ```
//!
//! Whichever comes first (response, server error, timeout, session close)
//! completes the waiter, exactly once. A response that arrives after the
//! waiter gave up finds the slot empty and is handed back to the caller so
//! it can go to the session's generic handler.

use crate::error::{ClientError, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

struct Slot<T> {
    request_id: u64,
    tx: oneshot::Sender<Result<T>>,
}

/// Holder for the one in-flight request of a session.
pub struct PendingRequest<T> {
    slot: Mutex<Option<Slot<T>>>,
}

impl<T> Default for PendingRequest<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side handed to the caller by [`PendingRequest::install`].
pub struct PendingWaiter<T> {
    request_id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingRequest<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Register a new waiter, replacing any previous occupant.
    ///
    /// A replaced waiter completes with `Internal("superseded")`.
    pub fn install(&self, request_id: u64) -> PendingWaiter<T> {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().replace(Slot { request_id, tx });
        if let Some(old) = previous {
            let _ = old.tx.send(Err(ClientError::Internal(format!(
                "request {} superseded by {}",
                old.request_id, request_id
            ))));
        }
        PendingWaiter { request_id, rx }
    }

    /// Complete the waiter for `request_id`.
    ///
    /// Returns `Err(result)` when there is no matching occupant so the
    /// caller can route the value elsewhere.
    pub fn resolve(&self, request_id: u64, result: Result<T>) -> std::result::Result<(), Result<T>> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(s) if s.request_id == request_id => {}
            _ => return Err(result),
        }
        let Some(s) = slot.take() else {
            return Err(result);
        };
        drop(slot);
        // Receiver dropped means the waiter timed out concurrently.
        s.tx.send(result)
    }

    /// Complete whatever is waiting, regardless of id.
    ///
    /// Used when the protocol carries no request id (MySQL) or when the
    /// session is torn down.
    pub fn resolve_current(&self, result: Result<T>) -> std::result::Result<(), Result<T>> {
        let taken = self.lock().take();
        match taken {
            Some(s) => s.tx.send(result),
            None => Err(result),
        }
    }

    /// Clear the slot if it still belongs to `request_id`.
    pub fn clear(&self, request_id: u64) {
        let mut slot = self.lock();
        if slot.as_ref().map(|s| s.request_id) == Some(request_id) {
            slot.take();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }

    /// Id of the current occupant.
    pub fn current_id(&self) -> Option<u64> {
        self.lock().as_ref().map(|s| s.request_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Slot<T>>> {
        // Never held across an await; a poisoned lock still has a valid Option.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> PendingWaiter<T> {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the response.
    ///
    /// On timeout the slot is cleared (if still ours) so a late response
    /// falls through to the generic handler.
    pub async fn wait(
        self,
        pending: &PendingRequest<T>,
        operation: &str,
        timeout: Duration,
    ) -> Result<T> {
        let request_id = self.request_id;
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Internal(format!(
                "No response for {}: session dropped the request",
                operation
            ))),
            Err(_) => {
                pending.clear(request_id);
                Err(ClientError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }
}
