//! Core library shared by the RPC client and server.
//!
//! This crate provides the pieces both ends of a connection agree on:
//! - Connection options and their one-time textual exchange
//! - The per-call frame header
//! - Pluggable `(Header, Body)` codecs (binary and JSON)
//! - Service method tables and the `"Service.Method"` registry
//! - The shared error type

pub mod codec;
pub mod error;
pub mod header;
pub mod http;
pub mod options;
pub mod service;

pub use codec::{new_codec, BoxReader, BoxWriter, CodecType, FrameReader, FrameWriter};
pub use error::{Error, Result};
pub use header::Header;
pub use options::{Options, MAGIC_NUMBER};
pub use service::{MethodType, Receiver, Registry, Service, ServiceBuilder};
