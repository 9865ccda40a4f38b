//! kiri: a local code-search daemon over a SQLite index store.
//!
//! Clients reach one long-lived daemon per index file through a local IPC
//! channel. The daemon keeps the full-text index consistent with the content
//! store and falls back to a substring scan when the index cannot be trusted.

pub mod cmd;
pub mod config;
pub mod degrade;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod lease;
pub mod rpc;
pub mod search;
pub mod security;
pub mod store;
pub mod usock;
pub mod watch;

pub use error::{Error, Result};
