//! Local IPC channel addressing and transports.
//!
//! Unix platforms serve on a domain socket next to the database file; Windows
//! has no usable filesystem socket semantics and serves on a named pipe whose
//! name is hashed from the canonical database path. Both address forms can be
//! computed on any platform; only the transport is platform specific.

use std::{
   fmt, io,
   path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

/// Errors that can occur during socket operations
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
   #[error("server already running")]
   AlreadyRunning,

   #[error("failed to connect: {0}")]
   Connect(#[source] io::Error),

   #[error("failed to bind: {0}")]
   Bind(#[source] io::Error),

   #[error("accept failed: {0}")]
   Accept(#[source] io::Error),

   #[error("failed to remove stale socket: {0}")]
   RemoveStale(#[source] io::Error),

   #[error("address {0} is not served on this platform")]
   Unsupported(String),
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
mod pipe;
#[cfg(windows)]
pub use pipe::*;

pub const SOCKET_SUFFIX: &str = ".sock";
pub const PIPE_PREFIX: &str = r"\\.\pipe\";
pub const PIPE_NAME_PREFIX: &str = "kiri-";
const PIPE_HASH_LEN: usize = 16;

/// Where a daemon for a given database listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IpcAddress {
   /// Filesystem socket at `<db>.sock`.
   Socket(PathBuf),
   /// Named pipe `\\.\pipe\kiri-<hex16>`.
   NamedPipe(String),
}

impl IpcAddress {
   /// Picks the form used by this platform's transport.
   pub fn resolve(canonical: &Path) -> Self {
      if cfg!(windows) {
         Self::pipe_for(canonical)
      } else {
         Self::socket_for(canonical)
      }
   }

   pub fn socket_for(canonical: &Path) -> Self {
      let mut raw = canonical.as_os_str().to_owned();
      raw.push(SOCKET_SUFFIX);
      Self::Socket(PathBuf::from(raw))
   }

   pub fn pipe_for(canonical: &Path) -> Self {
      let digest = hex::encode(Sha256::digest(canonical.to_string_lossy().as_bytes()));
      Self::NamedPipe(format!("{PIPE_PREFIX}{PIPE_NAME_PREFIX}{}", &digest[..PIPE_HASH_LEN]))
   }

   /// Parses an address passed on the command line.
   pub fn parse(raw: &str) -> Self {
      if raw.starts_with(PIPE_PREFIX) {
         Self::NamedPipe(raw.to_string())
      } else {
         Self::Socket(PathBuf::from(raw))
      }
   }

   /// Recovers the database path from the socket form. The hashed pipe form
   /// is one-way.
   pub fn database_path(&self) -> Option<PathBuf> {
      match self {
         Self::Socket(path) => {
            let raw = path.to_str()?;
            raw.strip_suffix(SOCKET_SUFFIX).map(PathBuf::from)
         },
         Self::NamedPipe(_) => None,
      }
   }

   /// Filesystem entry that must be removed when the lease is stale.
   pub fn socket_file(&self) -> Option<&Path> {
      match self {
         Self::Socket(path) => Some(path),
         Self::NamedPipe(_) => None,
      }
   }

   pub fn debug_info(&self, canonical: &Path) -> String {
      match self {
         Self::Socket(path) => format!("socket {}", path.display()),
         Self::NamedPipe(name) => format!("pipe {name} (database {})", canonical.display()),
      }
   }
}

impl fmt::Display for IpcAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Socket(path) => write!(f, "{}", path.display()),
         Self::NamedPipe(name) => f.write_str(name),
      }
   }
}

/// Removes a stale socket file, treating "already gone" as success.
pub fn remove_socket_file(address: &IpcAddress) -> io::Result<()> {
   let Some(path) = address.socket_file() else {
      return Ok(());
   };
   match std::fs::remove_file(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
   }
}
