//! Priority-aware queue of chunk requests shared by every session.
//!
//! Urgent requests are always handed out before normal ones; within a class
//! requests leave in arrival order. Duplicate requests are kept as separate
//! entries.

use crate::session::{SessionClosed, SessionId, SessionLink};
use bytes::Bytes;
use shared::Priority;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("request queue closed")]
pub struct QueueClosed;

/// One client request for an archive entry.
pub struct ChunkRequest {
    pub index: u8,
    pub entry: u16,
    pub priority: Priority,
    link: SessionLink,
    /// Backlog slot of the owning session, released once the response is written
    slot: OwnedSemaphorePermit,
}

impl ChunkRequest {
    pub fn new(
        link: SessionLink,
        index: u8,
        entry: u16,
        priority: Priority,
        slot: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            index,
            entry,
            priority,
            link,
            slot,
        }
    }

    pub fn session(&self) -> SessionId {
        self.link.session()
    }

    /// True once the owning session has closed.
    pub fn is_abandoned(&self) -> bool {
        self.link.is_closed()
    }

    /// Hands the framed response to the owning session's writer.
    pub async fn deliver(self, frames: Vec<Bytes>) -> Result<(), SessionClosed> {
        self.link.deliver(frames, self.slot).await
    }
}

impl fmt::Debug for ChunkRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRequest")
            .field("session", &self.session())
            .field("index", &self.index)
            .field("entry", &self.entry)
            .field("priority", &self.priority)
            .finish()
    }
}

struct Queued {
    request: ChunkRequest,
    _capacity: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Pending {
    urgent: VecDeque<Queued>,
    normal: VecDeque<Queued>,
    closed: bool,
}

impl Pending {
    fn next(&mut self) -> Option<Queued> {
        self.urgent.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len()
    }
}

pub struct RequestQueue {
    pending: Mutex<Pending>,
    available: Notify,
    capacity: Arc<Semaphore>,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            available: Notify::new(),
            capacity: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Adds a request, waiting while the queue is at capacity.
    pub async fn push(&self, request: ChunkRequest) -> Result<(), QueueClosed> {
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| QueueClosed)?;

        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(QueueClosed);
            }
            let queued = Queued {
                request,
                _capacity: permit,
            };
            match queued.request.priority {
                Priority::Urgent => pending.urgent.push_back(queued),
                Priority::Normal => pending.normal.push_back(queued),
            }
        }

        self.available.notify_one();
        Ok(())
    }

    /// Takes the next request, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and everything queued before
    /// the close has been taken.
    pub async fn pop(&self) -> Option<ChunkRequest> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut pending = self.pending.lock().await;
                if let Some(queued) = pending.next() {
                    return Some(queued.request);
                }
                if pending.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stops accepting requests and wakes idle workers.
    pub async fn close(&self) {
        self.pending.lock().await.closed = true;
        self.capacity.close();
        self.available.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.pending.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
