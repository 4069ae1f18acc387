//! Yari: in-memory key-value store server
//!
//! Clients speak a small length-prefixed protocol over TCP and issue GET and
//! SET against one process-wide table.
//!
//! # Architecture
//!
//! - Hybrid spin/futex shared-exclusive lock under every shared structure
//! - Sharded, chained hash table with slot and entry locks
//! - Fixed worker pool sharing one elected poller
//! - Per-connection event rings so each connection is served by one
//!   worker at a time

/// Blocking client library
pub mod client;

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Fixed-capacity I/O buffer
pub mod io;

/// Event engine and connection management
pub mod network;

/// Token codec and command handling
pub mod protocol;

/// Core server implementation
pub mod server;

/// Key-value table
pub mod store;

/// Locking primitives
pub mod sync;

/// Trace subscriber setup
pub mod trace;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
