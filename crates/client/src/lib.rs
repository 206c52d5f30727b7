//! RPC client.
//!
//! This crate provides:
//! - [`Client`]: many concurrent calls multiplexed over one connection
//! - [`CompletionQueue`]: where asynchronous calls are delivered when done
//! - Dialing over TCP, unix sockets and HTTP CONNECT ([`dial`], [`dial_http`], [`xdial`])
//!
//! # Example
//!
//! ```no_run
//! use rpc_client::{xdial, CancellationToken};
//!
//! # async fn run() -> corelib::Result<()> {
//! let client = xdial("tcp@127.0.0.1:9999", None).await?;
//! let product: i64 = client
//!     .call(&CancellationToken::new(), "Arith.Multiply", &(6, 7))
//!     .await?;
//! assert_eq!(product, 42);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod dial;

pub use client::{Call, Client, CompletionQueue, Completions, DEFAULT_QUEUE_CAPACITY};
#[cfg(unix)]
pub use dial::dial_unix;
pub use dial::{dial, dial_http, resolve_options, xdial};
pub use tokio_util::sync::CancellationToken;
