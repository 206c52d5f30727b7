//! RPC server.
//!
//! This crate provides:
//! - [`Server`]: a service registry and the per-connection serving loop
//! - The HTTP CONNECT bridge and a plain-text debug page
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpc_server::Server;
//!
//! # async fn run() -> corelib::Result<()> {
//! let server = Arc::new(Server::new());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9999").await?;
//! server.accept(listener).await
//! # }
//! ```

pub mod http;
pub mod server;

pub use corelib::http::{CONNECTED, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use server::Server;
