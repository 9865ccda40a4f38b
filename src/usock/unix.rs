//! Unix domain socket transport

use std::{
   fs, io,
   path::PathBuf,
   pin::Pin,
   task::{self, Poll},
};

use tokio::{
   io::ReadBuf,
   net::{UnixListener as TokioUnixListener, UnixStream as TokioUnixStream},
};

use super::{IpcAddress, SocketError};
use crate::Result;

fn socket_path(address: &IpcAddress) -> Result<&PathBuf> {
   match address {
      IpcAddress::Socket(path) => Ok(path),
      IpcAddress::NamedPipe(name) => Err(SocketError::Unsupported(name.clone()).into()),
   }
}

/// Narrows the process umask to owner-only until dropped.
struct OwnerOnlyUmask(libc::mode_t);

impl OwnerOnlyUmask {
   fn set() -> Self {
      // SAFETY: umask only swaps the process file-creation mask.
      Self(unsafe { libc::umask(0o177) })
   }
}

impl Drop for OwnerOnlyUmask {
   fn drop(&mut self) {
      // SAFETY: restores the mask saved in `set`.
      unsafe { libc::umask(self.0) };
   }
}

/// Unix domain socket listener
pub struct Listener {
   inner: TokioUnixListener,
   path:  PathBuf,
}

impl Listener {
   /// Binds the socket, refusing if another daemon is answering on it.
   ///
   /// The answer check is not atomic with the bind: two daemons started by
   /// hand at the same instant can each unlink the other's socket. Clients
   /// only spawn daemons while holding the startup lock, and they trust a
   /// socket only together with a live PID file.
   pub async fn bind(address: &IpcAddress) -> Result<Self> {
      let path = socket_path(address)?.clone();

      if path.exists() {
         // A live listener must keep its socket file; only a file nobody
         // answers on may be unlinked.
         if Stream::connect(address).await.is_ok() {
            return Err(SocketError::AlreadyRunning.into());
         }
         match fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(SocketError::RemoveStale(e).into()),
         }
      }

      let inner = {
         // The socket file is created with the umask applied, so it is never
         // visible with wider permissions.
         let _umask = OwnerOnlyUmask::set();
         TokioUnixListener::bind(&path).map_err(SocketError::Bind)?
      };
      {
         use std::os::unix::fs::PermissionsExt;
         fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .map_err(SocketError::Bind)?;
      }
      Ok(Self { inner, path })
   }

   /// Accepts an incoming connection
   pub async fn accept(&mut self) -> Result<Stream> {
      let (stream, _) = self.inner.accept().await.map_err(SocketError::Accept)?;
      Ok(Stream { inner: stream })
   }

   /// Returns the socket path as a string
   pub fn local_addr(&self) -> String {
      self.path.display().to_string()
   }
}

impl Drop for Listener {
   fn drop(&mut self) {
      let _ = fs::remove_file(&self.path);
   }
}

/// Unix domain socket stream implementing async I/O
#[repr(transparent)]
pub struct Stream {
   inner: TokioUnixStream,
}

impl Stream {
   /// Connects to a Unix domain socket
   pub async fn connect(address: &IpcAddress) -> Result<Self> {
      let path = socket_path(address)?;
      let inner = TokioUnixStream::connect(path)
         .await
         .map_err(SocketError::Connect)?;
      Ok(Self { inner })
   }
}

impl tokio::io::AsyncRead for Stream {
   fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_read(cx, buf)
   }
}

impl tokio::io::AsyncWrite for Stream {
   fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      Pin::new(&mut self.inner).poll_write(cx, buf)
   }

   fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_flush(cx)
   }

   fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_shutdown(cx)
   }
}
