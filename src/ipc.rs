//! JSON-RPC 2.0 envelopes and newline-delimited framing for the daemon
//! channel.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{
   AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
   ReadHalf, WriteHalf,
};

use crate::{
   Result,
   error::{Error, IpcError},
   usock,
};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

fn default_version() -> Cow<'static, str> {
   Cow::Borrowed(JSONRPC_VERSION)
}

/// Incoming JSON-RPC 2.0 request. A missing `id` makes it a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
   #[serde(default = "default_version")]
   pub jsonrpc: Cow<'static, str>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub id:      Option<Value>,
   pub method:  String,
   #[serde(default, skip_serializing_if = "Value::is_null")]
   pub params:  Value,
}

impl JsonRpcRequest {
   pub fn new(id: u64, method: &str, params: Value) -> Self {
      Self { jsonrpc: default_version(), id: Some(Value::from(id)), method: method.to_string(), params }
   }

   /// A `null` id deserializes to `None`, so it also marks a notification.
   pub const fn is_notification(&self) -> bool {
      self.id.is_none()
   }
}

/// Outgoing JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
   pub jsonrpc:  Cow<'static, str>,
   pub id:       Value,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub result:   Option<Value>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub error:    Option<JsonRpcError>,
   /// Degraded-mode warnings for results that are not JSON objects.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub warnings: Option<Vec<String>>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
   pub code:    i64,
   pub message: String,
}

impl JsonRpcResponse {
   pub const fn success(id: Value, result: Value) -> Self {
      Self {
         jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
         id,
         result: Some(result),
         error: None,
         warnings: None,
      }
   }

   pub const fn error(id: Value, code: i64, message: String) -> Self {
      Self {
         jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
         id,
         result: None,
         error: Some(JsonRpcError { code, message }),
         warnings: None,
      }
   }

   /// Converts the envelope into the result value or an [`Error::Rpc`].
   pub fn into_result(self) -> Result<Value> {
      match (self.error, self.result) {
         (Some(err), _) => Err(Error::Rpc { code: err.code, message: err.message }),
         (None, Some(result)) => Ok(result),
         (None, None) => Ok(Value::Null),
      }
   }
}

/// Reads one newline-terminated message. Returns `Ok(None)` on a clean EOF.
///
/// A line whose payload (terminator excluded) exceeds `max_bytes` fails with [`IpcError::MessageTooLarge`];
/// the stream is out of sync afterwards and must be dropped.
pub async fn read_line<R>(reader: &mut R, max_bytes: usize) -> Result<Option<String>>
where
   R: AsyncBufRead + Unpin,
{
   let mut line = String::new();
   // Room for the payload plus a CRLF terminator.
   let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(2);
   let read = (&mut *reader)
      .take(limit)
      .read_line(&mut line)
      .await
      .map_err(IpcError::Read)?;
   if read == 0 {
      return Ok(None);
   }

   if line.ends_with('\n') {
      line.pop();
      if line.ends_with('\r') {
         line.pop();
      }
   }
   if line.len() > max_bytes {
      return Err(IpcError::MessageTooLarge(line.len()).into());
   }
   Ok(Some(line))
}

/// Serializes `msg` as one line and flushes it.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
   W: AsyncWrite + Unpin,
   T: Serialize,
{
   let mut buf = serde_json::to_vec(msg).map_err(IpcError::Serialize)?;
   buf.push(b'\n');
   writer.write_all(&buf).await.map_err(IpcError::Write)?;
   writer.flush().await.map_err(IpcError::Write)?;
   Ok(())
}

/// Writes an already-encoded line verbatim.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
   W: AsyncWrite + Unpin,
{
   writer
      .write_all(line.as_bytes())
      .await
      .map_err(IpcError::Write)?;
   writer.write_all(b"\n").await.map_err(IpcError::Write)?;
   writer.flush().await.map_err(IpcError::Write)?;
   Ok(())
}

/// Client side of one daemon connection.
pub struct Client<S = usock::Stream> {
   reader:    BufReader<ReadHalf<S>>,
   writer:    WriteHalf<S>,
   next_id:   u64,
   max_bytes: usize,
}

impl Client<usock::Stream> {
   pub async fn connect(address: &usock::IpcAddress, max_bytes: usize) -> Result<Self> {
      let stream = usock::Stream::connect(address).await?;
      Ok(Self::new(stream, max_bytes))
   }
}

impl<S> Client<S>
where
   S: AsyncRead + AsyncWrite,
{
   pub fn new(stream: S, max_bytes: usize) -> Self {
      let (read, writer) = tokio::io::split(stream);
      Self { reader: BufReader::new(read), writer, next_id: 1, max_bytes }
   }

   /// Sends a request and waits for its response envelope.
   pub async fn request(&mut self, method: &str, params: Value) -> Result<JsonRpcResponse> {
      let id = self.next_id;
      self.next_id += 1;
      write_message(&mut self.writer, &JsonRpcRequest::new(id, method, params)).await?;

      let line = read_line(&mut self.reader, self.max_bytes)
         .await?
         .ok_or(IpcError::Closed)?;
      let response: JsonRpcResponse =
         serde_json::from_str(&line).map_err(IpcError::Deserialize)?;
      if response.id != Value::from(id) {
         return Err(Error::UnexpectedResponse("request id mismatch"));
      }
      Ok(response)
   }

   /// Sends a request and unwraps its result.
   pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
      self.request(method, params).await?.into_result()
   }

   /// Forwards a raw line. With `id` set, waits for the response line and
   /// checks that it answers that id; without one, returns immediately.
   pub async fn forward(&mut self, line: &str, id: Option<&Value>) -> Result<Option<String>> {
      write_line(&mut self.writer, line).await?;
      let Some(id) = id else {
         return Ok(None);
      };
      let reply = read_line(&mut self.reader, self.max_bytes)
         .await?
         .ok_or(IpcError::Closed)?;
      let envelope: Value = serde_json::from_str(&reply).map_err(IpcError::Deserialize)?;
      if envelope.get("id") != Some(id) {
         return Err(Error::UnexpectedResponse("request id mismatch"));
      }
      Ok(Some(reply))
   }
}
