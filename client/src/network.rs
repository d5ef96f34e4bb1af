use bytes::BytesMut;
use log::{debug, info, trace};
use shared::{
    acknowledge_bytes, synchronise_bytes, CodecError, Priority, Request, Response,
    ResponseDecoder, Status, ACKNOWLEDGE_TOKEN, STATUS_TOKEN,
};
use std::collections::VecDeque;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("server rejected the session: {0:?}")]
    Rejected(Status),
    #[error("server sent unknown status {0}")]
    UnknownStatus(u8),
    #[error("malformed response: {0}")]
    Codec(#[from] CodecError),
    #[error("connection closed by server")]
    Closed,
}

/// A cache client speaking the file server protocol over any byte stream.
pub struct Client<S = TcpStream> {
    stream: S,
    buffer: BytesMut,
    decoder: ResponseDecoder,
    /// Responses read while waiting for a different one
    pending: VecDeque<Response>,
    version_table: Vec<u32>,
}

impl Client<TcpStream> {
    /// Connects and completes the handshake.
    ///
    /// `index_count` is the number of version keys the server is expected to
    /// send; the protocol does not carry it.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        revision: u32,
        index_count: usize,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {}", stream.peer_addr()?);
        Self::handshake(stream, revision, index_count).await
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs synchronise and acknowledge over an established stream.
    pub async fn handshake(
        mut stream: S,
        revision: u32,
        index_count: usize,
    ) -> Result<Self, ClientError> {
        stream.write_all(&synchronise_bytes(revision)).await?;
        stream.flush().await?;

        let status = stream.read_u8().await?;
        match Status::from_u8(status) {
            Some(Status::Ok) => {}
            Some(rejected) => return Err(ClientError::Rejected(rejected)),
            None => return Err(ClientError::UnknownStatus(status)),
        }

        let mut version_table = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            version_table.push(stream.read_u32().await?);
        }
        debug!("Received {} version keys", version_table.len());

        stream.write_all(&acknowledge_bytes(ACKNOWLEDGE_TOKEN)).await?;
        stream.flush().await?;

        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            decoder: ResponseDecoder::new(),
            pending: VecDeque::new(),
            version_table,
        })
    }

    pub fn version_table(&self) -> &[u32] {
        &self.version_table
    }

    /// Queues a request with the server without waiting for the answer.
    pub async fn request(
        &mut self,
        index: u8,
        entry: u16,
        priority: Priority,
    ) -> Result<(), ClientError> {
        trace!("Requesting {}/{} ({:?})", index, entry, priority);
        self.send(Request::Entry {
            index,
            entry,
            priority,
        })
        .await
    }

    /// Requests an entry urgently and waits for its response.
    ///
    /// Responses to other requests that arrive first are kept for
    /// [`Client::next_response`].
    pub async fn fetch(&mut self, index: u8, entry: u16) -> Result<Response, ClientError> {
        self.request(index, entry, Priority::Urgent).await?;
        if let Some(position) = self
            .pending
            .iter()
            .position(|response| response.index == index && response.entry == entry)
        {
            if let Some(response) = self.pending.remove(position) {
                return Ok(response);
            }
        }

        loop {
            let response = self.read_response().await?;
            if response.index == index && response.entry == entry {
                return Ok(response);
            }
            self.pending.push_back(response);
        }
    }

    /// Returns the next response in arrival order.
    pub async fn next_response(&mut self) -> Result<Response, ClientError> {
        match self.pending.pop_front() {
            Some(response) => Ok(response),
            None => self.read_response().await,
        }
    }

    pub async fn set_logged_in(&mut self, logged_in: bool) -> Result<(), ClientError> {
        let request = if logged_in {
            Request::LoggedIn {
                token: STATUS_TOKEN,
            }
        } else {
            Request::LoggedOut {
                token: STATUS_TOKEN,
            }
        };
        self.send(request).await
    }

    /// Sends a raw request, including ones the server will refuse.
    pub async fn send(&mut self, request: Request) -> Result<(), ClientError> {
        self.stream.write_all(&request.to_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(Request::Disconnect).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response, ClientError> {
        loop {
            if let Some(response) = self.decoder.decode(&mut self.buffer)? {
                trace!(
                    "Received {}/{}: {} bytes",
                    response.index,
                    response.entry,
                    response.container.len()
                );
                return Ok(response);
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                // A lone byte before the close is a status the server rejected us with.
                if self.buffer.len() == 1 {
                    let status = self.buffer[0];
                    return Err(Status::from_u8(status)
                        .map(ClientError::Rejected)
                        .unwrap_or(ClientError::UnknownStatus(status)));
                }
                return Err(ClientError::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{encode_missing, encode_response, Container, ACKNOWLEDGE, SYNCHRONISE};
    use tokio_test::io::Builder;

    fn handshake_reply(keys: &[u32]) -> Vec<u8> {
        let mut reply = vec![0u8];
        for key in keys {
            reply.extend_from_slice(&key.to_be_bytes());
        }
        reply
    }

    fn wire(frames: &[bytes::Bytes]) -> Vec<u8> {
        frames.iter().flat_map(|frame| frame.iter().copied()).collect()
    }

    #[tokio::test]
    async fn test_handshake_reads_version_table() {
        let stream = Builder::new()
            .write(&[SYNCHRONISE, 0, 0, 0x05, 0x39])
            .read(&handshake_reply(&[0xffff, 0xfff, 0xff, 0xf]))
            .write(&[ACKNOWLEDGE, 0, 0, 3])
            .build();

        let client = Client::handshake(stream, 1337, 4).await.unwrap();
        assert_eq!(client.version_table(), &[0xffff, 0xfff, 0xff, 0xf]);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let stream = Builder::new()
            .write(&[SYNCHRONISE, 0, 0, 0, 10])
            .read(&[6])
            .build();

        let err = Client::handshake(stream, 10, 4).await.err().unwrap();
        assert!(matches!(err, ClientError::Rejected(Status::GameUpdated)));
    }

    #[tokio::test]
    async fn test_fetch_keeps_other_responses() {
        let data = vec![7u8; 1200];
        let mut stored = vec![0u8];
        stored.extend_from_slice(&(data.len() as u32).to_be_bytes());
        stored.extend_from_slice(&data);
        let container = Container::parse(&stored).unwrap();

        let other = wire(&encode_missing(1, 1, Priority::Normal));
        let wanted = wire(&encode_response(2, 5, &container, Priority::Urgent));

        let stream = Builder::new()
            .write(&[SYNCHRONISE, 0, 0, 0, 1])
            .read(&[0])
            .write(&[ACKNOWLEDGE, 0, 0, 3])
            .write(&[0, 1, 0, 1])
            .write(&[1, 2, 0, 5])
            .read(&other)
            .read(&wanted[..600])
            .read(&wanted[600..])
            .build();

        let mut client = Client::handshake(stream, 1, 0).await.unwrap();
        client.request(1, 1, Priority::Normal).await.unwrap();

        let response = client.fetch(2, 5).await.unwrap();
        assert_eq!(response.data(), &data[..]);

        let earlier = client.next_response().await.unwrap();
        assert_eq!((earlier.index, earlier.entry), (1, 1));
        assert!(earlier.is_missing());
    }

    #[tokio::test]
    async fn test_rejection_while_serving() {
        let stream = Builder::new()
            .write(&[SYNCHRONISE, 0, 0, 0, 1])
            .read(&[0])
            .write(&[ACKNOWLEDGE, 0, 0, 3])
            .write(&[2, 0, 0, 9])
            .read(&[10])
            .build();

        let mut client = Client::handshake(stream, 1, 0).await.unwrap();
        client
            .send(Request::LoggedIn { token: 9 })
            .await
            .unwrap();

        let err = client.next_response().await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(Status::BadSessionId)));
    }

    #[tokio::test]
    async fn test_status_and_disconnect() {
        let stream = Builder::new()
            .write(&[SYNCHRONISE, 0, 0, 0, 1])
            .read(&[0])
            .write(&[ACKNOWLEDGE, 0, 0, 3])
            .write(&[2, 0, 0, 0])
            .write(&[3, 0, 0, 0])
            .write(&[7])
            .build();

        let mut client = Client::handshake(stream, 1, 0).await.unwrap();
        client.set_logged_in(true).await.unwrap();
        client.set_logged_in(false).await.unwrap();
        client.disconnect().await.unwrap();
    }
}
