//! Model Context Protocol (MCP) stdio transport.
//!
//! Reads newline-delimited JSON-RPC from stdin and relays each message to the
//! daemon for the current database, starting the daemon when needed. MCP
//! clients talk to `kiri mcp` exactly as they would to the daemon itself.

use std::io::Write;

use serde_json::Value;
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   time,
};

use crate::{
   Result,
   cmd::daemon::{self, DaemonLauncher, StartOptions},
   config::Config,
   error::Error,
   ipc::{self, JsonRpcResponse},
};

/// Relays raw JSON-RPC lines to the daemon, reconnecting once per message
/// when the connection breaks.
pub struct Proxy {
   opts:     StartOptions,
   launcher: DaemonLauncher,
   cfg:      Config,
   conn:     Option<ipc::Client>,
}

impl Proxy {
   pub fn new(opts: StartOptions, launcher: DaemonLauncher, cfg: Config) -> Self {
      Self { opts, launcher, cfg, conn: None }
   }

   async fn ensure_conn(&mut self) -> Result<&mut ipc::Client> {
      if self.conn.is_none() {
         let (identity, outcome) = daemon::ensure_daemon(&self.opts, &self.launcher, &self.cfg).await?;
         tracing::debug!(?outcome, "proxy attached to {}", identity.describe());
         let client = daemon::connect(&identity, &self.cfg).await?;
         self.conn = Some(client);
      }
      self
         .conn
         .as_mut()
         .ok_or(Error::UnexpectedResponse("connect"))
   }

   async fn try_forward(&mut self, line: &str, id: Option<&Value>) -> Result<Option<String>> {
      let timeout = self.cfg.rpc_timeout();
      let client = self.ensure_conn().await?;
      match time::timeout(timeout, client.forward(line, id)).await {
         Ok(result) => result,
         Err(_) => Err(Error::Server {
            op:     "forward",
            reason: format!("daemon did not answer within {}ms", timeout.as_millis()),
         }),
      }
   }

   /// Handles one stdin line and returns the line to write back, if any.
   pub async fn handle_line(&mut self, line: &str) -> Option<String> {
      let message: Value = match serde_json::from_str(line) {
         Ok(message) => message,
         Err(e) => {
            return encode(&JsonRpcResponse::error(
               Value::Null,
               ipc::PARSE_ERROR,
               format!("Parse error: {e}"),
            ));
         },
      };
      // Only well-formed messages reach the daemon, so every forwarded line
      // is either answered under its own id or not answered at all.
      let Some(object) = message.as_object() else {
         return encode(&JsonRpcResponse::error(
            Value::Null,
            ipc::INVALID_REQUEST,
            "Invalid request: expected a JSON object".to_string(),
         ));
      };
      let id = object.get("id").cloned().unwrap_or(Value::Null);
      if !object.get("method").is_some_and(Value::is_string) {
         return encode(&JsonRpcResponse::error(
            id,
            ipc::INVALID_REQUEST,
            "Invalid request: missing method".to_string(),
         ));
      }
      let expects_reply = !id.is_null();
      let reply_id = expects_reply.then_some(&id);

      let mut last_err = None;
      for attempt in 0..2 {
         match self.try_forward(line, reply_id).await {
            Ok(reply) => return reply,
            Err(e) => {
               tracing::debug!(attempt, "forward failed: {e}");
               // A late reply on the old connection would desync framing.
               self.conn = None;
               last_err = Some(e);
            },
         }
      }

      let err = last_err.map_or_else(|| "daemon unavailable".to_string(), |e| e.to_string());
      if !expects_reply {
         tracing::warn!("dropping notification: {err}");
         return None;
      }
      encode(&JsonRpcResponse::error(id, ipc::INTERNAL_ERROR, format!("kiri daemon unavailable: {err}")))
   }
}

fn encode(response: &JsonRpcResponse) -> Option<String> {
   match serde_json::to_string(response) {
      Ok(line) => Some(line),
      Err(e) => {
         tracing::error!("failed to encode response: {e}");
         None
      },
   }
}

/// Writes one response line to stdout.
fn write_response(line: &str) -> Result<()> {
   let stdout = std::io::stdout();
   let mut stdout = stdout.lock();
   stdout.write_all(line.as_bytes())?;
   stdout.write_all(b"\n")?;
   stdout.flush()?;
   Ok(())
}

/// Executes `kiri mcp`.
pub async fn execute(opts: StartOptions, cfg: Config) -> Result<()> {
   let launcher = DaemonLauncher::current_exe()?;
   let mut proxy = Proxy::new(opts, launcher, cfg);

   // Start the daemon up front so the first request does not pay for it.
   if let Err(e) = proxy.ensure_conn().await {
      tracing::warn!("daemon not available yet: {e}");
   }

   let stdin = BufReader::new(tokio::io::stdin());
   let mut lines = stdin.lines();
   while let Some(line) = lines.next_line().await? {
      if line.trim().is_empty() {
         continue;
      }
      if let Some(reply) = proxy.handle_line(&line).await {
         write_response(&reply)?;
      }
   }
   Ok(())
}

#[cfg(test)]
mod tests {
   use std::path::PathBuf;

   use super::*;

   fn unreachable_proxy(dir: &std::path::Path) -> Proxy {
      let opts = StartOptions {
         repo_root: dir.to_path_buf(),
         db_path: dir.join("index.db"),
         ..StartOptions::default()
      };
      let cfg = Config { ready_timeout_ms: 200, ready_poll_interval_ms: 20, ..Config::default() };
      Proxy::new(opts, DaemonLauncher::new(PathBuf::from("/bin/false")), cfg)
   }

   #[tokio::test]
   async fn parse_errors_are_answered_locally() {
      let dir = tempfile::tempdir().unwrap();
      let mut proxy = unreachable_proxy(dir.path());
      let reply = proxy.handle_line("{not json").await.unwrap();
      let reply: Value = serde_json::from_str(&reply).unwrap();
      assert_eq!(reply["error"]["code"], ipc::PARSE_ERROR);
      assert!(reply["id"].is_null());
   }

   #[tokio::test]
   async fn malformed_messages_are_answered_locally() {
      let dir = tempfile::tempdir().unwrap();
      let mut proxy = unreachable_proxy(dir.path());

      for line in ["42", "[]", r#"{"jsonrpc":"2.0"}"#] {
         let reply = proxy.handle_line(line).await.unwrap();
         let reply: Value = serde_json::from_str(&reply).unwrap();
         assert_eq!(reply["error"]["code"], ipc::INVALID_REQUEST, "{line}");
         assert!(reply["id"].is_null(), "{line}");
      }

      let reply = proxy.handle_line(r#"{"jsonrpc":"2.0","id":3}"#).await.unwrap();
      let reply: Value = serde_json::from_str(&reply).unwrap();
      assert_eq!(reply["id"], 3);
      assert_eq!(reply["error"]["code"], ipc::INVALID_REQUEST);
      assert!(proxy.conn.is_none());
   }

   #[cfg(unix)]
   #[tokio::test]
   async fn unavailable_daemon_yields_internal_error_for_requests_only() {
      let dir = tempfile::tempdir().unwrap();
      let mut proxy = unreachable_proxy(dir.path());

      let reply = proxy
         .handle_line(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#)
         .await
         .unwrap();
      let reply: Value = serde_json::from_str(&reply).unwrap();
      assert_eq!(reply["id"], 7);
      assert_eq!(reply["error"]["code"], ipc::INTERNAL_ERROR);

      let none = proxy
         .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
         .await;
      assert!(none.is_none());
   }
}
