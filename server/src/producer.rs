//! Worker pool turning queued requests into framed responses.

use crate::files::FileStore;
use crate::queue::{ChunkRequest, RequestQueue};
use bytes::Bytes;
use log::{debug, error, trace, warn};
use shared::{encode_missing, encode_response, Container};
use std::sync::Arc;
use tokio::task::{self, JoinSet};

/// How a worker disposed of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fulfilment {
    Delivered,
    /// The entry could not be served and the empty container was sent instead.
    Missing,
    /// The session had closed; nothing was sent.
    Discarded,
}

#[derive(Clone)]
pub struct ChunkProducer {
    queue: Arc<RequestQueue>,
    files: Arc<FileStore>,
}

impl ChunkProducer {
    pub fn new(queue: Arc<RequestQueue>, files: Arc<FileStore>) -> Self {
        Self { queue, files }
    }

    /// Starts `workers` tasks that run until the queue is closed and drained.
    pub fn spawn(&self, workers: usize) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let producer = self.clone();
            set.spawn(async move { producer.run(worker).await });
        }
        debug!("Started {} workers", workers);
        set
    }

    async fn run(self, worker: usize) {
        while let Some(request) = self.queue.pop().await {
            let outcome = self.fulfil(request).await;
            trace!("Worker {} finished request: {:?}", worker, outcome);
        }
        debug!("Worker {} stopped", worker);
    }

    pub async fn fulfil(&self, request: ChunkRequest) -> Fulfilment {
        if request.is_abandoned() {
            trace!("Discarding {:?}", request);
            return Fulfilment::Discarded;
        }

        let (frames, outcome) = self.frames_for(&request).await;
        match request.deliver(frames).await {
            Ok(()) => outcome,
            Err(_) => Fulfilment::Discarded,
        }
    }

    async fn frames_for(&self, request: &ChunkRequest) -> (Vec<Bytes>, Fulfilment) {
        let (index, entry, priority) = (request.index, request.entry, request.priority);
        let files = Arc::clone(&self.files);
        let fetched = task::spawn_blocking(move || files.fetch(index, entry)).await;

        let missing = || (encode_missing(index, entry, priority), Fulfilment::Missing);
        match fetched {
            Ok(Ok(Some(data))) => match Container::parse(&data) {
                Ok(container) => (
                    encode_response(index, entry, &container, priority),
                    Fulfilment::Delivered,
                ),
                Err(e) => {
                    warn!("Malformed container {}/{}: {}", index, entry, e);
                    missing()
                }
            },
            Ok(Ok(None)) => {
                trace!("No entry {}/{}", index, entry);
                missing()
            }
            Ok(Err(e)) => {
                warn!("Failed to read {}/{}: {}", index, entry, e);
                missing()
            }
            Err(e) => {
                error!("Fetch task for {}/{} failed: {}", index, entry, e);
                missing()
            }
        }
    }
}
