use std::{io, path::PathBuf};

use thiserror::Error;

use crate::usock::SocketError;

/// Main error type for kiri.
///
/// Covers the daemon supervision path (spawn, readiness, locks), the index
/// store (SQLite, migrations), the JSON-RPC surface and configuration.
#[derive(Debug, Error)]
pub enum Error {
   /// I/O error occurred during file or channel operations.
   #[error("io error: {0}")]
   Io(#[from] io::Error),

   /// SQLite reported an error.
   #[error("sqlite error: {0}")]
   Sqlite(#[from] rusqlite::Error),

   /// The additive schema migration failed; the store cannot be trusted.
   #[error("schema migration failed: {0}")]
   Migration(String),

   /// Configuration-related error occurred.
   #[error("config error: {0}")]
   Config(#[from] ConfigError),

   /// JSON serialization or deserialization error occurred.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// TOML deserialization error occurred.
   #[error("toml error: {0}")]
   Toml(#[from] toml::de::Error),

   /// Inter-process communication error occurred.
   #[error("ipc error: {0}")]
   Ipc(#[from] IpcError),

   /// Socket communication error occurred.
   #[error("socket error: {0}")]
   Socket(#[from] SocketError),

   /// Server error occurred during a specific operation.
   #[error("server error during {op}: {reason}")]
   Server { op: &'static str, reason: String },

   /// Unexpected response received from the daemon during an operation.
   #[error("unexpected response from daemon during {0}")]
   UnexpectedResponse(&'static str),

   /// The daemon answered with a JSON-RPC error object.
   #[error("daemon error {code}: {message}")]
   Rpc { code: i64, message: String },

   /// Failed to spawn the daemon process.
   #[error("failed to spawn daemon: {0}")]
   DaemonSpawn(#[source] io::Error),

   /// The daemon never accepted a connection before the deadline.
   #[error(
      "daemon did not become ready within {waited_secs} seconds (timeout); check log: {log}",
      log = log.display()
   )]
   DaemonStartTimeout { waited_secs: u64, log: PathBuf },

   /// The spawned daemon exited before it became ready.
   #[error("daemon exited before becoming ready ({status}); check log: {log}", log = log.display())]
   DaemonExited { status: String, log: PathBuf },

   /// Another client held the startup marker for longer than allowed.
   #[error("timeout waiting for startup lock {path}", path = path.display())]
   StartupLockTimeout { path: PathBuf },

   /// The degrade controller refused to serve.
   #[error("refusing to serve: {0}")]
   ServingRefused(String),

   /// The pinned security config does not match the lock file.
   #[error("security config rejected: {0}")]
   Security(String),

   /// Unknown JSON-RPC method was requested.
   #[error("unknown method: {0}")]
   UnknownMethod(String),

   /// Unknown tool was requested through `tools/call`.
   #[error("unknown tool: {0}")]
   UnknownTool(String),

   /// Request parameters did not match the method's contract.
   #[error("invalid params: {0}")]
   InvalidParams(String),
}

impl Error {
   pub fn exit_code(&self) -> i32 {
      match self {
         Self::DaemonStartTimeout { .. } | Self::StartupLockTimeout { .. } => 11,
         Self::ServingRefused(_) | Self::Security(_) | Self::Migration(_) => 13,
         other => {
            if other.to_string().to_lowercase().contains("timeout") {
               11
            } else {
               1
            }
         },
      }
   }

   /// JSON-RPC error code used when this error is reported to a client.
   pub const fn rpc_code(&self) -> i64 {
      match self {
         Self::UnknownMethod(_) => -32601,
         Self::InvalidParams(_) | Self::UnknownTool(_) => -32602,
         Self::Json(_) => -32700,
         _ => -32603,
      }
   }
}

/// Errors that can occur during inter-process communication (IPC).
///
/// These errors are related to line framing, JSON decoding and I/O on the
/// channel between a client and the daemon.
#[derive(Debug, Error)]
pub enum IpcError {
   /// The message size exceeds the maximum allowed size.
   #[error("message too large: {0} bytes")]
   MessageTooLarge(usize),

   /// Failed to serialize a message for IPC transmission.
   #[error("failed to serialize: {0}")]
   Serialize(#[source] serde_json::Error),

   /// Failed to deserialize a message received via IPC.
   #[error("failed to deserialize: {0}")]
   Deserialize(#[source] serde_json::Error),

   /// Failed to read data from the IPC channel.
   #[error("failed to read: {0}")]
   Read(#[source] io::Error),

   /// Failed to write data to the IPC channel.
   #[error("failed to write: {0}")]
   Write(#[source] io::Error),

   /// The peer closed the channel.
   #[error("connection closed")]
   Closed,
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
   /// Config file could not be parsed.
   #[error("invalid config: {0}")]
   Invalid(String),
}

impl From<notify::Error> for Error {
   fn from(e: notify::Error) -> Self {
      Self::Io(io::Error::other(e))
   }
}

/// Standard result type using [`enum@Error`] as the default error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
