// ABOUTME: Pending-response registry correlating outbound message ids with their replies.
// ABOUTME: Waiters deregister themselves on drop; resolution never blocks the receive loop.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use agentcomm_proto::Status;
use tokio::sync::mpsc;
use tonic::Code;

use crate::error::SessionError;

/// Status carried by a correlated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub code: Code,
    pub message: String,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Convert a wire status. A missing status is OK.
    pub fn from_proto(status: Option<Status>) -> Self {
        match status {
            Some(st) => Self {
                code: Code::from_i32(st.code),
                message: st.message,
            },
            None => Self::ok(),
        }
    }

    /// Map the status onto the send result taxonomy.
    pub fn into_result(self) -> Result<(), SessionError> {
        match self.code {
            Code::Ok => Ok(()),
            Code::ResourceExhausted => Err(SessionError::ResourceExhausted(self.message)),
            code => Err(SessionError::UnexpectedStatus {
                code,
                message: self.message,
            }),
        }
    }
}

/// Map of outstanding message ids to their notification slots.
#[derive(Debug, Default)]
pub struct PendingResponses {
    entries: Mutex<HashMap<String, mpsc::Sender<ResponseStatus>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<ResponseStatus>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `message_id`. Returns `None` if the id is already outstanding.
    pub fn register(&self, message_id: impl Into<String>) -> Option<ResponseWaiter<'_>> {
        let message_id = message_id.into();
        let (tx, rx) = mpsc::channel(1);
        {
            let mut entries = self.entries();
            if entries.contains_key(&message_id) {
                return None;
            }
            entries.insert(message_id.clone(), tx);
        }
        Some(ResponseWaiter {
            registry: self,
            message_id,
            rx,
        })
    }

    /// Deliver a status to the waiter for `message_id` without blocking.
    ///
    /// Returns true if a waiter accepted it. A waiter that already holds a
    /// status, or has gone away, is skipped.
    pub fn resolve(&self, message_id: &str, status: ResponseStatus) -> bool {
        let entries = self.entries();
        match entries.get(message_id) {
            Some(tx) => tx.try_send(status).is_ok(),
            None => false,
        }
    }

    /// Drop the entry for `message_id`.
    pub fn remove(&self, message_id: &str) {
        self.entries().remove(message_id);
    }

    /// Drop every entry. Waiters observe a closed slot.
    pub fn cancel_all(&self) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries().contains_key(message_id)
    }
}

/// Receiving side of one registry entry. Deregisters on drop.
#[derive(Debug)]
pub struct ResponseWaiter<'a> {
    registry: &'a PendingResponses,
    message_id: String,
    rx: mpsc::Receiver<ResponseStatus>,
}

impl ResponseWaiter<'_> {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the status. `None` means the entry was cancelled.
    pub async fn recv(&mut self) -> Option<ResponseStatus> {
        self.rx.recv().await
    }
}

impl Drop for ResponseWaiter<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.message_id);
    }
}
