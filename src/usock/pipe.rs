//! Named pipe transport for Windows

use std::{
   io,
   pin::Pin,
   task::{self, Poll},
   time::Duration,
};

use tokio::{
   io::{AsyncRead, AsyncWrite, ReadBuf},
   net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions},
   time,
};

use super::{IpcAddress, SocketError};
use crate::Result;

const ERROR_PIPE_BUSY: i32 = 231;
const BUSY_RETRIES: usize = 20;

fn pipe_name(address: &IpcAddress) -> Result<&str> {
   match address {
      IpcAddress::NamedPipe(name) => Ok(name),
      IpcAddress::Socket(path) => Err(SocketError::Unsupported(path.display().to_string()).into()),
   }
}

/// Named pipe listener. Each accepted client consumes the pending instance and
/// a fresh one is created for the next client.
pub struct Listener {
   name: String,
   next: NamedPipeServer,
}

impl Listener {
   /// Creates the first pipe instance; fails if another daemon owns the name.
   pub async fn bind(address: &IpcAddress) -> Result<Self> {
      let name = pipe_name(address)?.to_string();
      let next = match ServerOptions::new().first_pipe_instance(true).create(&name) {
         Ok(server) => server,
         Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            return Err(SocketError::AlreadyRunning.into());
         },
         Err(e) => return Err(SocketError::Bind(e).into()),
      };
      Ok(Self { name, next })
   }

   /// Accepts an incoming connection
   pub async fn accept(&mut self) -> Result<Stream> {
      self.next.connect().await.map_err(SocketError::Accept)?;
      let fresh = ServerOptions::new()
         .create(&self.name)
         .map_err(SocketError::Accept)?;
      let connected = std::mem::replace(&mut self.next, fresh);
      Ok(Stream::Server(connected))
   }

   pub fn local_addr(&self) -> String {
      self.name.clone()
   }
}

/// Either end of a named pipe connection.
pub enum Stream {
   Server(NamedPipeServer),
   Client(NamedPipeClient),
}

impl Stream {
   pub async fn connect(address: &IpcAddress) -> Result<Self> {
      let name = pipe_name(address)?;
      let mut attempts = 0;
      loop {
         match ClientOptions::new().open(name) {
            Ok(client) => return Ok(Self::Client(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) && attempts < BUSY_RETRIES => {
               attempts += 1;
               time::sleep(Duration::from_millis(25)).await;
            },
            Err(e) => return Err(SocketError::Connect(e).into()),
         }
      }
   }
}

impl AsyncRead for Stream {
   fn poll_read(
      self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      match self.get_mut() {
         Self::Server(s) => Pin::new(s).poll_read(cx, buf),
         Self::Client(c) => Pin::new(c).poll_read(cx, buf),
      }
   }
}

impl AsyncWrite for Stream {
   fn poll_write(
      self: Pin<&mut Self>,
      cx: &mut task::Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      match self.get_mut() {
         Self::Server(s) => Pin::new(s).poll_write(cx, buf),
         Self::Client(c) => Pin::new(c).poll_write(cx, buf),
      }
   }

   fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      match self.get_mut() {
         Self::Server(s) => Pin::new(s).poll_flush(cx),
         Self::Client(c) => Pin::new(c).poll_flush(cx),
      }
   }

   fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
      match self.get_mut() {
         Self::Server(s) => Pin::new(s).poll_shutdown(cx),
         Self::Client(c) => Pin::new(c).poll_shutdown(cx),
      }
   }
}
