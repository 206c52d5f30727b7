//! Command line front-end for muxrpc.
//!
//! Provides commands for:
//! - Hosting the demo `Arith` service over TCP or HTTP CONNECT
//! - Issuing a single call
//! - Benchmarking many concurrent calls on one connection

pub mod arith;
pub mod commands;
pub mod config;

pub use arith::{Arith, Args};
pub use commands::{Command, CommandResult};
pub use config::CliConfig;
