//! TCP accept loop coordinating sessions and the worker pool

use crate::archive::DirectoryArchive;
use crate::config::Config;
use crate::error::ServerError;
use crate::files::FileStore;
use crate::producer::ChunkProducer;
use crate::protocol::FileServerProtocol;
use crate::queue::RequestQueue;
use crate::session::Session;
use crate::session_manager::SessionManager;
use crate::versions::VersionTable;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinSet;

/// The file server: one listener, one shared request queue, one worker pool
pub struct Server {
    listener: TcpListener,
    config: Arc<Config>,
    files: Arc<FileStore>,
    queue: Arc<RequestQueue>,
    protocol: Arc<FileServerProtocol>,
    sessions: Arc<RwLock<SessionManager>>,
}

impl Server {
    /// Binds the listener for an already opened archive.
    pub async fn bind(
        config: Config,
        files: FileStore,
        versions: VersionTable,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.address()).await?;
        info!("File server listening on {}", listener.local_addr()?);

        let queue = Arc::new(RequestQueue::new(config.queue_capacity));
        let protocol = Arc::new(FileServerProtocol::new(
            config.revision,
            versions,
            Arc::clone(&queue),
        ));

        Ok(Server {
            listener,
            sessions: Arc::new(RwLock::new(SessionManager::new(config.max_sessions))),
            config: Arc::new(config),
            files: Arc::new(files),
            queue,
            protocol,
        })
    }

    /// Opens the configured archive and binds the listener.
    pub async fn open(config: Config) -> Result<Self, ServerError> {
        let archive = DirectoryArchive::open(&config.cache_path)?;
        let (files, indices) = FileStore::open(Arc::new(archive))?;
        let versions = VersionTable::resolve(&config.prefetch_keys, &indices);
        info!(
            "Serving revision {} with {} version keys",
            config.revision,
            versions.len()
        );
        Self::bind(config, files, versions).await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> Arc<RwLock<SessionManager>> {
        Arc::clone(&self.sessions)
    }

    /// Serves connections until `shutdown` completes.
    ///
    /// On shutdown the listener stops accepting, live sessions are aborted,
    /// and the workers finish whatever is already queued before this returns.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let producer = ChunkProducer::new(Arc::clone(&self.queue), Arc::clone(&self.files));
        let mut workers = producer.spawn(self.config.threads);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down file server");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(&mut sessions, stream, addr).await,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        sessions.shutdown().await;
        self.queue.close().await;
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
        info!("File server stopped");
        Ok(())
    }

    async fn spawn_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        let Some(id) = self.sessions.write().await.add_session(addr) else {
            warn!("Refusing {}: session limit reached", addr);
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let protocol = Arc::clone(&self.protocol);
        let registry = Arc::clone(&self.sessions);
        let backlog = self.config.session_backlog;
        let handshake_timeout = self.config.handshake_timeout;

        sessions.spawn(async move {
            let (reader, writer) = stream.into_split();
            let mut session =
                Session::new(id, protocol, backlog).with_handshake_timeout(handshake_timeout);
            if let Err(e) = session.run(reader, writer).await {
                debug!("Session {} ended with error: {}", id, e);
            }
            registry.write().await.remove_session(&id);
        });
    }
}
