//! # File Server Library
//!
//! This library implements the server side of the cache update protocol. Game
//! clients connect over TCP, prove they run the current revision, and then
//! stream requests for archive entries which the server answers in priority
//! order from a single shared archive.
//!
//! ## Core Responsibilities
//!
//! ### Handshake
//! Each connection starts with a synchronise message carrying the client
//! revision. A matching revision is answered with the version table, one
//! checksum per archive index, so the client can tell which of its cached
//! indices are stale. The client then acknowledges with its session token.
//!
//! ### Request Scheduling
//! Once serving, a session only parses requests and queues them. Urgent
//! requests (what the client needs to draw the next frame) jump ahead of
//! prefetch traffic, but requests of the same class are answered in order.
//!
//! ### Chunked Delivery
//! Workers read containers from storage off the async runtime, frame them
//! into 512 byte blocks and hand them to the owning session's writer. Entries
//! that cannot be served are answered with an empty container so the client
//! never waits on a request forever.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! Every accepted socket gets one task for reading and one for writing. The
//! two halves are connected by a bounded channel whose slots are reserved
//! before a request is queued, so a client that stops reading stalls only
//! its own requests.
//!
//! ### Shared Worker Pool
//! A fixed number of workers serve every session through one
//! [`queue::RequestQueue`]. Requests carry a weak handle to their session;
//! work for a session that has since closed is dropped without error.
//!
//! ## Module Organization
//!
//! ### Protocol (`protocol`, `session`)
//! The handshake, acknowledge and request-reading steps, each behind its own
//! trait, and the session driver that runs them in order and owns the
//! outbound writer.
//!
//! ### Scheduling (`queue`, `producer`)
//! The priority queue and the worker pool draining it.
//!
//! ### Storage (`provider`, `archive`, `files`, `versions`)
//! The [`provider::DataProvider`] boundary with in-memory and on-disk
//! implementations, the reference table and the handshake version table.
//!
//! ### Server (`network`, `session_manager`, `config`)
//! Configuration loading, the session registry and the accept loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::Config;
//! use server::network::Server;
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Path::new("file-server.properties"))?;
//!
//!     // Opens the archive at cachePath and binds host:port
//!     let server = Server::open(config).await?;
//!
//!     // Serves until Ctrl+C, then drains queued requests
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod files;
pub mod network;
pub mod producer;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod session;
pub mod session_manager;
pub mod versions;

pub use error::ServerError;
