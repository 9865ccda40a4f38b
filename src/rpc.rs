//! JSON-RPC method dispatch for the daemon.
//!
//! Every request runs against the shared [`ServerState`]. While the daemon is
//! degraded each successful result carries the degradation warning: object
//! results get a `warnings` member, other results get it on the envelope.

use std::{
   path::PathBuf,
   sync::atomic::{AtomicU64, Ordering},
   time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
   Result,
   config::Config,
   degrade::DegradeState,
   error::Error,
   identity::DatabaseIdentity,
   ipc::{self, JsonRpcRequest, JsonRpcResponse},
   search::{self, Backend, ContextBundleParams, FilesSearchParams, SearchContext},
   security::Redactor,
   store::{IndexStore, RepoId},
};

pub const SERVER_NAME: &str = "kiri";

/// State shared by every connection of one daemon.
pub struct ServerState {
   pub store:     Mutex<IndexStore>,
   pub repo_id:   RepoId,
   pub repo_root: PathBuf,
   pub identity:  DatabaseIdentity,
   pub degrade:   DegradeState,
   pub redactor:  Redactor,
   pub config:    Config,
   pub shutdown:  CancellationToken,
   launch_time:   Instant,
   last_activity: AtomicU64,
   requests:      AtomicU64,
}

impl ServerState {
   pub fn new(
      store: IndexStore,
      repo_id: RepoId,
      repo_root: PathBuf,
      identity: DatabaseIdentity,
      degrade: DegradeState,
      redactor: Redactor,
      config: Config,
   ) -> Self {
      Self {
         store: Mutex::new(store),
         repo_id,
         repo_root,
         identity,
         degrade,
         redactor,
         config,
         shutdown: CancellationToken::new(),
         launch_time: Instant::now(),
         last_activity: AtomicU64::new(0),
         requests: AtomicU64::new(0),
      }
   }

   fn clock(&self) -> u64 {
      u64::try_from(self.launch_time.elapsed().as_millis()).unwrap_or(u64::MAX)
   }

   pub fn touch(&self) {
      self
         .last_activity
         .fetch_max(self.clock(), Ordering::Relaxed);
   }

   pub fn idle_duration(&self) -> Duration {
      let idle = self
         .clock()
         .saturating_sub(self.last_activity.load(Ordering::Relaxed));
      Duration::from_millis(idle)
   }

   pub fn uptime(&self) -> Duration {
      self.launch_time.elapsed()
   }

   /// Runs a retrieval tool on the backend the current mode allows. A
   /// full-text failure demotes the daemon and retries on the scan backend
   /// when degradation is allowed.
   fn with_backend<T>(&self, run: impl Fn(&SearchContext<'_>, Backend) -> Result<T>) -> Result<T> {
      let store = self.store.lock();
      let ctx = SearchContext {
         store:    &store,
         repo_id:  self.repo_id,
         config:   &self.config,
         redactor: &self.redactor,
      };

      if self.degrade.current().uses_fts() {
         match run(&ctx, Backend::FullText) {
            Ok(value) => return Ok(value),
            Err(Error::Sqlite(e)) => {
               if !self.degrade.demote(&format!("full-text query failed: {e}")) {
                  return Err(Error::Sqlite(e));
               }
            },
            Err(other) => return Err(other),
         }
      }
      run(&ctx, Backend::Scan)
   }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
   let params = if params.is_null() { json!({}) } else { params };
   serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

fn tool_definitions() -> Value {
   json!({
      "tools": [
         {
            "name": "context_bundle",
            "description": "Rank repository files relevant to a goal, boosted by the file being edited and its neighborhood.",
            "inputSchema": {
               "type": "object",
               "properties": {
                  "goal": { "type": "string", "description": "What you are trying to do" },
                  "limit": { "type": "integer", "description": "Maximum number of items" },
                  "profile": { "type": "string", "description": "Scoring profile name" },
                  "artifacts": {
                     "type": "object",
                     "properties": {
                        "editing_path": { "type": "string", "description": "Repository-relative path being edited" }
                     }
                  }
               },
               "required": ["goal"]
            }
         },
         {
            "name": "files_search",
            "description": "Keyword search over indexed file contents.",
            "inputSchema": {
               "type": "object",
               "properties": {
                  "query": { "type": "string" },
                  "limit": { "type": "integer" },
                  "lang": { "type": "string" },
                  "ext": { "type": "string" },
                  "path_prefix": { "type": "string" }
               },
               "required": ["query"]
            }
         }
      ]
   })
}

fn status(state: &ServerState) -> Result<Value> {
   let store = state.store.lock();
   Ok(json!({
      "pid": std::process::id(),
      "version": env!("CARGO_PKG_VERSION"),
      "db_path": state.identity.db_path().display().to_string(),
      "address": state.identity.address().to_string(),
      "repo_root": state.repo_root.display().to_string(),
      "repo_id": state.repo_id,
      "serving": state.degrade.current(),
      "stale": state.degrade.stale_reason().is_some(),
      "allow_degrade": state.degrade.allow_degrade(),
      "fts_generation": store.fts_generation()?,
      "repo_dirty": store.repo_is_dirty(state.repo_id)?,
      "uptime_secs": state.uptime().as_secs(),
      "requests": state.requests.load(Ordering::Relaxed),
   }))
}

fn files_search(state: &ServerState, params: Value) -> Result<Value> {
   let params: FilesSearchParams = parse_params(params)?;
   let hits = state.with_backend(|ctx, backend| search::files_search(ctx, &params, backend))?;
   Ok(serde_json::to_value(hits)?)
}

fn context_bundle(state: &ServerState, params: Value) -> Result<Value> {
   let params: ContextBundleParams = parse_params(params)?;
   let bundle = state.with_backend(|ctx, backend| search::context_bundle(ctx, &params, backend))?;
   Ok(serde_json::to_value(bundle)?)
}

fn call_tool(state: &ServerState, params: Value) -> Result<Value> {
   let name = params
      .get("name")
      .and_then(Value::as_str)
      .ok_or_else(|| Error::InvalidParams("tools/call requires a tool name".to_string()))?;
   let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

   let result = match name {
      "context_bundle" => context_bundle(state, args)?,
      "files_search" => files_search(state, args)?,
      other => return Err(Error::UnknownTool(other.to_string())),
   };
   Ok(json!({
      "content": [{
         "type": "text",
         "text": serde_json::to_string_pretty(&result)?
      }]
   }))
}

fn call_method(state: &ServerState, method: &str, params: Value) -> Result<Value> {
   match method {
      "ping" => Ok(json!({ "ok": true })),
      "initialize" => Ok(json!({
         "protocolVersion": ipc::MCP_PROTOCOL_VERSION,
         "capabilities": { "tools": {} },
         "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
      })),
      "notifications/initialized" | "initialized" => Ok(Value::Null),
      "tools/list" => Ok(tool_definitions()),
      "tools/call" => call_tool(state, params),
      "context.bundle" => context_bundle(state, params),
      "files.search" => files_search(state, params),
      "status" => status(state),
      "shutdown" => {
         tracing::info!("shutdown requested over rpc");
         state.shutdown.cancel();
         Ok(json!({ "ok": true }))
      },
      other => Err(Error::UnknownMethod(other.to_string())),
   }
}

fn attach_warning(degrade: &DegradeState, response: &mut JsonRpcResponse) {
   let Some(warning) = degrade.warning() else {
      return;
   };
   match response.result.as_mut() {
      Some(Value::Object(map)) => {
         map.insert("warnings".to_string(), json!([warning]));
      },
      Some(_) => response.warnings = Some(vec![warning]),
      None => {},
   }
}

/// Handles one parsed request. Notifications produce no response.
pub fn dispatch(state: &ServerState, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
   state.requests.fetch_add(1, Ordering::Relaxed);
   let notification = request.is_notification();
   let JsonRpcRequest { id, method, params, .. } = request;
   let outcome = call_method(state, &method, params);

   if notification {
      if let Err(e) = outcome {
         tracing::debug!(%method, "notification failed: {e}");
      }
      return None;
   }

   let id = id.unwrap_or(Value::Null);
   let mut response = match outcome {
      Ok(result) => JsonRpcResponse::success(id, result),
      Err(e) => {
         tracing::debug!(%method, "request failed: {e}");
         JsonRpcResponse::error(id, e.rpc_code(), e.to_string())
      },
   };
   attach_warning(&state.degrade, &mut response);
   Some(response)
}

/// Handles one raw line from the wire.
pub fn handle_line(state: &ServerState, line: &str) -> Option<JsonRpcResponse> {
   let value: Value = match serde_json::from_str(line) {
      Ok(value) => value,
      Err(e) => {
         return Some(JsonRpcResponse::error(
            Value::Null,
            ipc::PARSE_ERROR,
            format!("parse error: {e}"),
         ));
      },
   };
   if !value.is_object() {
      return Some(JsonRpcResponse::error(
         Value::Null,
         ipc::INVALID_REQUEST,
         "invalid request: expected a JSON object".to_string(),
      ));
   }

   let id = value.get("id").cloned().unwrap_or(Value::Null);
   match serde_json::from_value::<JsonRpcRequest>(value) {
      Ok(request) => dispatch(state, request),
      // Without an id the sender reads no reply, so answering would leave a
      // stray line on the connection.
      Err(e) if id.is_null() => {
         tracing::debug!("dropping malformed notification: {e}");
         None
      },
      Err(e) => {
         Some(JsonRpcResponse::error(id, ipc::INVALID_REQUEST, format!("invalid request: {e}")))
      },
   }
}
