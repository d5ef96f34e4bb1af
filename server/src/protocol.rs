//! The three protocol steps a session runs through.
//!
//! Each step is its own trait so a session driver can be exercised with fake
//! steps, and each step can be tested against a scripted transport.

use crate::queue::{ChunkRequest, RequestQueue};
use crate::session::Outbox;
use crate::versions::VersionTable;
use async_trait::async_trait;
use log::{debug, trace, warn};
use shared::{
    Priority, Status, ACKNOWLEDGE, ACKNOWLEDGE_TOKEN, DISCONNECT, STATUS_LOGGED_IN,
    STATUS_LOGGED_OUT, STATUS_TOKEN, SYNCHRONISE,
};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// What the serving loop does after one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The client disconnected or sent something unknown.
    Close,
    /// A status byte was queued for the client and the session must end
    /// once it is written.
    Rejected(Status),
}

#[async_trait]
pub trait Handshake: Send + Sync {
    /// Reads the handshake and answers it. Returns whether the session may continue.
    async fn synchronise<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<bool>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Validates the acknowledge message. Writes nothing on success.
    async fn acknowledge<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<bool>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send;
}

#[async_trait]
pub trait RequestReader: Send + Sync {
    async fn read_request<R>(&self, reader: &mut R, outbox: &Outbox) -> io::Result<Flow>
    where
        R: AsyncRead + Unpin + Send;

    /// Reads requests until the session should close.
    async fn read_requests<R>(&self, reader: &mut R, outbox: &Outbox) -> io::Result<Flow>
    where
        R: AsyncRead + Unpin + Send,
    {
        loop {
            match self.read_request(reader, outbox).await? {
                Flow::Continue => continue,
                flow => return Ok(flow),
            }
        }
    }
}

/// Decides whether the tokens a client sends are the ones expected of it.
pub trait TokenValidator: Send + Sync {
    fn validate_acknowledge(&self, token: u32) -> bool;

    fn validate_status(&self, logged_in: bool, token: u32) -> bool;
}

/// Expects the constant tokens every stock client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTokens {
    pub acknowledge: u32,
    pub status: u32,
}

impl Default for FixedTokens {
    fn default() -> Self {
        Self {
            acknowledge: ACKNOWLEDGE_TOKEN,
            status: STATUS_TOKEN,
        }
    }
}

impl TokenValidator for FixedTokens {
    fn validate_acknowledge(&self, token: u32) -> bool {
        token == self.acknowledge
    }

    fn validate_status(&self, _logged_in: bool, token: u32) -> bool {
        token == self.status
    }
}

/// The file server's implementation of every protocol step.
pub struct FileServerProtocol<T = FixedTokens> {
    revision: u32,
    versions: VersionTable,
    queue: Arc<RequestQueue>,
    tokens: T,
}

impl FileServerProtocol {
    pub fn new(revision: u32, versions: VersionTable, queue: Arc<RequestQueue>) -> Self {
        Self::with_tokens(revision, versions, queue, FixedTokens::default())
    }
}

impl<T: TokenValidator> FileServerProtocol<T> {
    pub fn with_tokens(
        revision: u32,
        versions: VersionTable,
        queue: Arc<RequestQueue>,
        tokens: T,
    ) -> Self {
        Self {
            revision,
            versions,
            queue,
            tokens,
        }
    }
}

#[async_trait]
impl<T: TokenValidator> Handshake for FileServerProtocol<T> {
    async fn synchronise<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<bool>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let opcode = reader.read_u8().await?;
        if opcode != SYNCHRONISE {
            debug!("Rejecting handshake with opcode {}", opcode);
            write_status(writer, Status::RejectSession).await?;
            return Ok(false);
        }

        let revision = reader.read_u32().await?;
        if revision != self.revision {
            debug!(
                "Rejecting revision {}, expected {}",
                revision, self.revision
            );
            write_status(writer, Status::GameUpdated).await?;
            return Ok(false);
        }

        writer
            .write_all(&self.versions.encode_handshake(Status::Ok as u8))
            .await?;
        writer.flush().await?;
        Ok(true)
    }
}

#[async_trait]
impl<T: TokenValidator> Acknowledger for FileServerProtocol<T> {
    async fn acknowledge<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<bool>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let opcode = reader.read_u8().await?;
        if opcode != ACKNOWLEDGE {
            debug!("Expected acknowledge, got opcode {}", opcode);
            write_status(writer, Status::RejectSession).await?;
            return Ok(false);
        }

        let token = read_medium(reader).await?;
        if !self.tokens.validate_acknowledge(token) {
            debug!("Rejecting acknowledge token {}", token);
            write_status(writer, Status::BadSessionId).await?;
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl<T: TokenValidator> RequestReader for FileServerProtocol<T> {
    async fn read_request<R>(&self, reader: &mut R, outbox: &Outbox) -> io::Result<Flow>
    where
        R: AsyncRead + Unpin + Send,
    {
        let opcode = reader.read_u8().await?;

        if let Some(priority) = Priority::from_opcode(opcode) {
            let index = reader.read_u8().await?;
            let entry = reader.read_u16().await?;
            trace!(
                "Session {} requested {}/{} ({:?})",
                outbox.session(),
                index,
                entry,
                priority
            );

            let Some(slot) = outbox.reserve().await else {
                return Ok(Flow::Close);
            };
            let request = ChunkRequest::new(outbox.link(), index, entry, priority, slot);
            if self.queue.push(request).await.is_err() {
                return Ok(Flow::Close);
            }
            return Ok(Flow::Continue);
        }

        match opcode {
            STATUS_LOGGED_IN | STATUS_LOGGED_OUT => {
                let logged_in = opcode == STATUS_LOGGED_IN;
                let token = read_medium(reader).await?;
                if self.tokens.validate_status(logged_in, token) {
                    debug!(
                        "Session {} is now logged {}",
                        outbox.session(),
                        if logged_in { "in" } else { "out" }
                    );
                    Ok(Flow::Continue)
                } else {
                    debug!(
                        "Session {} sent status token {}",
                        outbox.session(),
                        token
                    );
                    // A failed send means the writer is gone and the session is closing anyway.
                    let _ = outbox.reject(Status::BadSessionId).await;
                    Ok(Flow::Rejected(Status::BadSessionId))
                }
            }
            DISCONNECT => Ok(Flow::Close),
            other => {
                warn!("Session {} sent unknown opcode {}", outbox.session(), other);
                Ok(Flow::Close)
            }
        }
    }
}

pub async fn read_medium<R>(reader: &mut R) -> io::Result<u32>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 3];
    reader.read_exact(&mut bytes).await?;
    Ok(shared::medium_from_bytes(bytes))
}

async fn write_status<W>(writer: &mut W, status: Status) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(status as u8).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn protocol(revision: u32, keys: Vec<u32>) -> FileServerProtocol {
        FileServerProtocol::new(
            revision,
            VersionTable::new(keys),
            Arc::new(RequestQueue::new(16)),
        )
    }

    fn handshake_reply(keys: &[u32]) -> Vec<u8> {
        let mut reply = vec![0u8];
        for key in keys {
            reply.extend_from_slice(&key.to_be_bytes());
        }
        reply
    }

    #[tokio::test]
    async fn test_synchronise_writes_version_table() {
        let keys = vec![0xffff, 0xfff, 0xff, 0xf];
        let protocol = protocol(1337, keys.clone());

        let mut reader = Builder::new()
            .read(&[SYNCHRONISE])
            .read(&1337u32.to_be_bytes())
            .build();
        let mut writer = Builder::new().write(&handshake_reply(&keys)).build();

        assert!(protocol.synchronise(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_synchronise_wrong_revision() {
        let protocol = protocol(1337, vec![0xffff, 0xfff, 0xff, 0xf]);

        let mut reader = Builder::new()
            .read(&[SYNCHRONISE])
            .read(&10u32.to_be_bytes())
            .build();
        let mut writer = Builder::new().write(&[6]).build();

        assert!(!protocol.synchronise(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_synchronise_rejects_without_reading_revision() {
        let protocol = protocol(1337, vec![1]);

        // Any further read would hit end of stream and fail the call.
        let mut reader = Builder::new().read(&[123]).build();
        let mut writer = Builder::new().write(&[11]).build();

        assert!(!protocol.synchronise(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_synchronise_empty_table() {
        let protocol = protocol(1, Vec::new());

        let mut reader = Builder::new()
            .read(&[SYNCHRONISE, 0, 0, 0, 1])
            .build();
        let mut writer = Builder::new().write(&[0]).build();

        assert!(protocol.synchronise(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_synchronise_eof() {
        let protocol = protocol(1337, vec![1]);

        let mut reader = Builder::new().read(&[SYNCHRONISE, 0, 0]).build();
        let mut writer = Builder::new().build();

        let err = protocol
            .synchronise(&mut reader, &mut writer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_acknowledge_valid_token_writes_nothing() {
        let protocol = protocol(1, vec![]);

        let mut reader = Builder::new().read(&[ACKNOWLEDGE, 0, 0, 3]).build();
        let mut writer = Builder::new().build();

        assert!(protocol.acknowledge(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_acknowledge_wrong_token() {
        let protocol = protocol(1, vec![]);

        let mut reader = Builder::new().read(&[ACKNOWLEDGE, 0, 0, 4]).build();
        let mut writer = Builder::new().write(&[10]).build();

        assert!(!protocol.acknowledge(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_acknowledge_wrong_opcode_skips_token() {
        let protocol = protocol(1, vec![]);

        let mut reader = Builder::new().read(&[SYNCHRONISE]).build();
        let mut writer = Builder::new().write(&[11]).build();

        assert!(!protocol.acknowledge(&mut reader, &mut writer).await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_token_validator() {
        let tokens = FixedTokens {
            acknowledge: 0x123456,
            status: 7,
        };
        let protocol = FileServerProtocol::with_tokens(
            1,
            VersionTable::new(vec![]),
            Arc::new(RequestQueue::new(4)),
            tokens,
        );

        let mut reader = Builder::new()
            .read(&[ACKNOWLEDGE, 0x12, 0x34, 0x56])
            .build();
        let mut writer = Builder::new().build();
        assert!(protocol.acknowledge(&mut reader, &mut writer).await.unwrap());

        let (outbox, _receiver) = Outbox::channel(1, 4);
        let mut reader = Builder::new().read(&[STATUS_LOGGED_IN, 0, 0, 7]).build();
        let flow = protocol.read_request(&mut reader, &outbox).await.unwrap();
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn test_status_updates_with_expected_token() {
        let protocol = protocol(1, vec![]);
        let (outbox, mut receiver) = Outbox::channel(1, 4);

        for opcode in [STATUS_LOGGED_IN, STATUS_LOGGED_OUT] {
            let mut reader = Builder::new().read(&[opcode, 0, 0, 0]).build();
            let flow = protocol.read_request(&mut reader, &outbox).await.unwrap();
            assert_eq!(flow, Flow::Continue);
        }
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_update_with_unexpected_token() {
        let protocol = protocol(1, vec![]);
        let (outbox, mut receiver) = Outbox::channel(1, 4);

        for opcode in [STATUS_LOGGED_IN, STATUS_LOGGED_OUT] {
            let mut reader = Builder::new().read(&[opcode, 0, 0, 1]).build();
            let flow = protocol.read_request(&mut reader, &outbox).await.unwrap();
            assert_eq!(flow, Flow::Rejected(Status::BadSessionId));

            match receiver.recv().await {
                Some(Outbound::Reject(status)) => assert_eq!(status, Status::BadSessionId),
                _ => panic!("expected a rejection"),
            }
        }
    }

    #[tokio::test]
    async fn test_chunk_requests_are_queued() {
        let protocol = protocol(1, vec![]);
        let (outbox, _receiver) = Outbox::channel(3, 4);

        let mut reader = Builder::new()
            .read(&[0, 2, 0x01, 0x00])
            .read(&[1, 255, 0, 255])
            .build();
        assert_eq!(
            protocol.read_request(&mut reader, &outbox).await.unwrap(),
            Flow::Continue
        );
        assert_eq!(
            protocol.read_request(&mut reader, &outbox).await.unwrap(),
            Flow::Continue
        );

        let queue = &protocol.queue;
        assert_eq!(queue.len().await, 2);

        let first = queue.pop().await.unwrap();
        assert_eq!(first.session(), 3);
        assert_eq!((first.index, first.entry), (255, 255));
        assert_eq!(first.priority, Priority::Urgent);

        let second = queue.pop().await.unwrap();
        assert_eq!((second.index, second.entry), (2, 256));
        assert_eq!(second.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_full_backlog_stops_reading() {
        let protocol = protocol(1, vec![]);
        let (outbox, _receiver) = Outbox::channel(1, 2);
        let (mut client, mut server) = tokio::io::duplex(64);

        for entry in 0..5u8 {
            client.write_all(&[1, 2, 0, entry]).await.unwrap();
        }

        // Nothing drains the outbox, so only two requests get a slot.
        let read = tokio::time::timeout(
            Duration::from_millis(200),
            protocol.read_requests(&mut server, &outbox),
        )
        .await;
        assert!(read.is_err());
        assert_eq!(protocol.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_read_requests_until_disconnect() {
        let protocol = protocol(1, vec![]);
        let (outbox, _receiver) = Outbox::channel(1, 8);

        let mut reader = Builder::new()
            .read(&[0, 1, 0, 1])
            .read(&[STATUS_LOGGED_IN, 0, 0, 0])
            .read(&[1, 1, 0, 2])
            .read(&[DISCONNECT])
            .build();

        let flow = protocol.read_requests(&mut reader, &outbox).await.unwrap();
        assert_eq!(flow, Flow::Close);
        assert_eq!(protocol.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_opcode_closes() {
        let protocol = protocol(1, vec![]);
        let (outbox, _receiver) = Outbox::channel(1, 8);

        let mut reader = Builder::new().read(&[42]).build();
        let flow = protocol.read_requests(&mut reader, &outbox).await.unwrap();
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn test_read_requests_eof_is_error() {
        let protocol = protocol(1, vec![]);
        let (outbox, _receiver) = Outbox::channel(1, 8);

        let mut reader = Builder::new().read(&[0, 1]).build();
        let err = protocol
            .read_requests(&mut reader, &outbox)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_request_after_queue_close() {
        let protocol = protocol(1, vec![]);
        protocol.queue.close().await;
        let (outbox, _receiver) = Outbox::channel(1, 8);

        let mut reader = Builder::new().read(&[1, 1, 0, 1]).build();
        let flow = protocol.read_request(&mut reader, &outbox).await.unwrap();
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn test_read_medium() {
        let mut reader = Builder::new().read(&[0x01, 0x02, 0x03]).build();
        assert_eq!(read_medium(&mut reader).await.unwrap(), 0x010203);
    }
}
