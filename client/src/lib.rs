//! # Cache Client Library
//!
//! A headless client for the file server protocol. It performs the same
//! handshake a game client does, pipelines entry requests and reassembles the
//! block-framed responses into whole containers.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - Synchronise and acknowledge handshake
//! - Urgent and prefetch requests, status updates and disconnect
//! - Incremental response decoding over the TCP stream
//!
//! Wire types (opcodes, status codes, the container codec) live in the
//! `shared` crate.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Revision 1337 with a four entry version table
//!     let mut client = Client::connect("127.0.0.1:43594", 1337, 4).await?;
//!
//!     // The reference table listing every index's crc and version
//!     let response = client.fetch(255, 255).await?;
//!     println!("{} bytes", response.container.len());
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{Client, ClientError};
