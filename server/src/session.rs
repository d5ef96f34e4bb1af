//! One client connection: the protocol state machine and its outbound path.
//!
//! A session runs the handshake and acknowledge steps directly on the socket.
//! Once serving, the write half moves to a writer task fed by a bounded
//! channel (the [`Outbox`]); workers reach that channel only through a weak
//! [`SessionLink`], so nothing they hold keeps a closed session alive.

use crate::config::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::protocol::{Acknowledger, Flow, Handshake, RequestReader};
use bytes::Bytes;
use log::{debug, error, trace};
use shared::Status;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

pub type SessionId = u32;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session closed")]
pub struct SessionClosed;

/// Protocol states, in the only order a session moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Synchronising,
    Acknowledging,
    Serving,
    Closed,
}

/// Messages for a session's writer task.
pub enum Outbound {
    /// The frames of one response. The slot is released after they are written.
    Response {
        frames: Vec<Bytes>,
        slot: OwnedSemaphorePermit,
    },
    /// Write the status byte and close.
    Reject(Status),
}

/// The session's side of its outbound path.
pub struct Outbox {
    session: SessionId,
    sender: mpsc::Sender<Outbound>,
    slots: Arc<Semaphore>,
}

impl Outbox {
    /// Creates an outbox allowing `backlog` outstanding requests.
    ///
    /// The channel has room for one more message than there are slots, so a
    /// rejection can always be queued behind a full backlog.
    pub fn channel(session: SessionId, backlog: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(backlog + 1);
        let outbox = Self {
            session,
            sender,
            slots: Arc::new(Semaphore::new(backlog)),
        };
        (outbox, receiver)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Waits for a free backlog slot. Returns `None` if the writer has gone away.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = self.sender.closed() => None,
        }
    }

    pub fn link(&self) -> SessionLink {
        SessionLink {
            session: self.session,
            sender: self.sender.downgrade(),
        }
    }

    pub async fn reject(&self, status: Status) -> Result<(), SessionClosed> {
        self.sender
            .send(Outbound::Reject(status))
            .await
            .map_err(|_| SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A worker's handle on a session's outbound path.
#[derive(Clone)]
pub struct SessionLink {
    session: SessionId,
    sender: mpsc::WeakSender<Outbound>,
}

impl SessionLink {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .upgrade()
            .map_or(true, |sender| sender.is_closed())
    }

    pub async fn deliver(
        &self,
        frames: Vec<Bytes>,
        slot: OwnedSemaphorePermit,
    ) -> Result<(), SessionClosed> {
        let sender = self.sender.upgrade().ok_or(SessionClosed)?;
        sender
            .send(Outbound::Response { frames, slot })
            .await
            .map_err(|_| SessionClosed)
    }
}

impl fmt::Debug for SessionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLink")
            .field("session", &self.session)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drains a session's outbound channel to the socket.
///
/// Each response is flushed as soon as all of its frames are written.
pub async fn write_responses<W>(
    session: SessionId,
    mut receiver: mpsc::Receiver<Outbound>,
    writer: W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(outbound) = receiver.recv().await {
        match outbound {
            Outbound::Response { frames, slot } => {
                for frame in &frames {
                    writer.write_all(frame).await?;
                }
                writer.flush().await?;
                drop(slot);
            }
            Outbound::Reject(status) => {
                trace!("Session {} rejected with status {:?}", session, status);
                writer.write_u8(status as u8).await?;
                writer.flush().await?;
                writer.shutdown().await?;
                break;
            }
        }
    }
    Ok(())
}

/// Drives one connection from handshake to close.
pub struct Session<P> {
    id: SessionId,
    protocol: Arc<P>,
    backlog: usize,
    handshake_timeout: Duration,
    state: SessionState,
}

impl<P> Session<P>
where
    P: Handshake + Acknowledger + RequestReader + 'static,
{
    pub fn new(id: SessionId, protocol: Arc<P>, backlog: usize) -> Self {
        Self {
            id,
            protocol,
            backlog,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: SessionState::Connecting,
        }
    }

    /// Limits how long each handshake step, and the flush of a rejection
    /// while serving, may take.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        if next > self.state {
            debug!("Session {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    /// Runs the session to completion.
    ///
    /// Requests still queued or being fetched when this returns are discarded
    /// by the workers that pick them up.
    pub async fn run<R, W>(&mut self, mut reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let result = self.serve(&mut reader, writer).await;
        self.advance(SessionState::Closed);
        result
    }

    async fn serve<R, W>(&mut self, reader: &mut R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.advance(SessionState::Synchronising);
        if !self
            .step("synchronise", self.protocol.synchronise(reader, &mut writer))
            .await?
        {
            return Ok(());
        }

        self.advance(SessionState::Acknowledging);
        if !self
            .step("acknowledge", self.protocol.acknowledge(reader, &mut writer))
            .await?
        {
            return Ok(());
        }

        self.advance(SessionState::Serving);
        self.serve_requests(reader, writer).await
    }

    /// Runs one handshake step. A step that times out closes the session silently.
    async fn step<F>(&self, name: &str, step: F) -> io::Result<bool>
    where
        F: Future<Output = io::Result<bool>>,
    {
        match timeout(self.handshake_timeout, step).await {
            Ok(result) => result,
            Err(_) => {
                debug!(
                    "Session {} timed out after {:?} waiting to {}",
                    self.id, self.handshake_timeout, name
                );
                Ok(false)
            }
        }
    }

    async fn serve_requests<R, W>(&self, reader: &mut R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.id;
        let (outbox, receiver) = Outbox::channel(id, self.backlog);

        // Dropping the set aborts the writer.
        let mut writer_task = JoinSet::new();
        writer_task.spawn(write_responses(id, receiver, writer));

        let flow = tokio::select! {
            flow = self.protocol.read_requests(reader, &outbox) => flow,
            finished = writer_task.join_next() => {
                log_writer_exit(id, finished);
                return Ok(());
            }
        };
        drop(outbox);

        if let Ok(Flow::Rejected(_)) = flow {
            match timeout(self.handshake_timeout, writer_task.join_next()).await {
                Ok(finished) => log_writer_exit(id, finished),
                Err(_) => {
                    debug!("Session {} could not flush its rejection in time", id);
                    writer_task.abort_all();
                }
            }
        } else {
            writer_task.abort_all();
        }
        flow.map(|_| ())
    }
}

fn log_writer_exit(
    session: SessionId,
    finished: Option<Result<io::Result<()>, tokio::task::JoinError>>,
) {
    match finished {
        Some(Ok(Ok(()))) | None => {}
        Some(Ok(Err(e))) => debug!("Session {} write failed: {}", session, e),
        Some(Err(e)) if e.is_cancelled() => {}
        Some(Err(e)) => error!("Session {} writer task failed: {}", session, e),
    }
}
