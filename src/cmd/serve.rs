//! The daemon process.
//!
//! Opens and migrates the store, brings the full-text index up to date,
//! decides a serving mode, then binds the channel and serves JSON-RPC until
//! shutdown, a signal, or the idle timeout.

use std::{
   path::{Path, PathBuf},
   sync::Arc,
   time::Duration,
};

use serde_json::Value;
use tokio::{io::BufReader, signal, time};
use tokio_util::task::TaskTracker;

use crate::{
   Result, config,
   degrade::{self, DegradeState, ServingMode},
   error::{Error, IpcError},
   identity::DatabaseIdentity,
   ipc::{self, JsonRpcResponse},
   lease::PidFile,
   rpc::{self, ServerState},
   security::{self, Redactor},
   store::{IndexStore, RepoId},
   usock::{self, IpcAddress, SocketError},
   watch,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Arguments of `kiri daemon`.
#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
   pub repo:            PathBuf,
   pub db:              PathBuf,
   pub socket_path:     Option<String>,
   pub watch:           bool,
   pub allow_degrade:   bool,
   pub security_config: Option<PathBuf>,
   pub security_lock:   Option<PathBuf>,
   /// Idle timeout in minutes. 0 disables it.
   pub daemon_timeout:  Option<u64>,
}

/// Store-side startup: migrate, reconcile the full-text index, pick a mode.
/// Refusal is an error.
pub fn prepare_store(
   db_path: &Path,
   repo_root: &Path,
   fts_enabled: bool,
   allow_degrade: bool,
) -> Result<(IndexStore, RepoId, ServingMode)> {
   let mut store = IndexStore::open_and_migrate(db_path, fts_enabled)?;
   let repo_id = store.resolve_repo_id(repo_root)?;

   let report = store.rebuild_if_needed(repo_id, false)?;
   tracing::info!(
      repo_id,
      was_dirty = report.was_dirty,
      index_existed = report.index_existed,
      outcome = ?report.outcome,
      "full-text index reconciled"
   );

   match degrade::evaluate(&store, allow_degrade) {
      ServingMode::Refuse { reason } => Err(Error::ServingRefused(reason)),
      mode => Ok((store, repo_id, mode)),
   }
}

fn idle_timeout(args: &DaemonArgs, cfg: &config::Config) -> Option<Duration> {
   let secs = args
      .daemon_timeout
      .map_or(cfg.idle_timeout_secs, |minutes| minutes.saturating_mul(60));
   (secs > 0).then(|| Duration::from_secs(secs))
}

async fn shutdown_signal() {
   #[cfg(unix)]
   {
      use tokio::signal::unix::{SignalKind, signal as unix_signal};
      match unix_signal(SignalKind::terminate()) {
         Ok(mut term) => {
            tokio::select! {
               _ = signal::ctrl_c() => {},
               _ = term.recv() => {},
            }
         },
         Err(e) => {
            tracing::warn!("failed to install SIGTERM handler: {e}");
            let _ = signal::ctrl_c().await;
         },
      }
   }
   #[cfg(not(unix))]
   {
      let _ = signal::ctrl_c().await;
   }
}

/// Executes `kiri daemon`.
pub async fn execute(args: DaemonArgs) -> Result<()> {
   let repo_root = args.repo.canonicalize().unwrap_or_else(|_| args.repo.clone());
   let cfg = config::init_for_root(&repo_root).clone();

   let mut identity = DatabaseIdentity::prepare(&args.db)?;
   if let Some(raw) = &args.socket_path {
      identity = identity.with_address(IpcAddress::parse(raw));
   }
   tracing::info!(pid = std::process::id(), "starting daemon for {}", identity.describe());

   let lock_path = args
      .security_lock
      .clone()
      .unwrap_or_else(|| security::default_lock_path(identity.db_path()));
   let security = security::load_and_verify(args.security_config.as_deref(), &lock_path)?;
   let redactor = Redactor::new(&security);
   tracing::info!(tokens = redactor.token_count(), "security config verified");

   let (store, repo_id, mode) =
      prepare_store(identity.db_path(), &repo_root, cfg.fts_enabled, args.allow_degrade)?;

   let mut listener = match usock::Listener::bind(identity.address()).await {
      Ok(listener) => listener,
      Err(Error::Socket(SocketError::AlreadyRunning)) => {
         tracing::warn!("another daemon already serves {}; exiting", identity.describe());
         return Ok(());
      },
      Err(e) => return Err(e),
   };
   let pid_file = PidFile::write(&identity)?;
   tracing::info!(pid = pid_file.pid(), "listening on {}", listener.local_addr());

   let timeout = idle_timeout(&args, &cfg);
   let watch_debounce = Duration::from_millis(cfg.watch_debounce_ms);
   let state = Arc::new(ServerState::new(
      store,
      repo_id,
      repo_root.clone(),
      identity.clone(),
      DegradeState::new(mode, args.allow_degrade),
      redactor,
      cfg,
   ));

   let _watcher = if args.watch {
      let watch_state = Arc::clone(&state);
      let db_dir = identity.db_path().parent().map(Path::to_path_buf);
      Some(watch::watch_repo(&repo_root, db_dir, watch_debounce, move |paths| {
         watch_state.touch();
         let store = watch_state.store.lock();
         if let Err(e) = store.mark_dirty(watch_state.repo_id) {
            tracing::error!("failed to mark repository dirty: {e}");
            return;
         }
         tracing::info!(changed = paths.len(), "repository changed; full-text index marked dirty");
         watch_state.degrade.reevaluate(&store);
      })?)
   } else {
      None
   };

   if let Some(timeout) = timeout {
      let idle_state = Arc::clone(&state);
      let check = Duration::from_secs(idle_state.config.idle_check_interval_secs.max(1)).min(timeout);
      tokio::spawn(async move {
         loop {
            tokio::select! {
               () = time::sleep(check) => {},
               () = idle_state.shutdown.cancelled() => break,
            }
            if idle_state.idle_duration() > timeout {
               tracing::info!("idle timeout reached, shutting down");
               idle_state.shutdown.cancel();
               break;
            }
         }
      });
   }

   let tracker = TaskTracker::new();
   let stop_signal = shutdown_signal();
   tokio::pin!(stop_signal);
   loop {
      tokio::select! {
         accepted = listener.accept() => match accepted {
            Ok(stream) => {
               tracker.spawn(handle_client(Arc::clone(&state), stream));
            },
            Err(e) => tracing::error!("accept error: {e}"),
         },
         () = state.shutdown.cancelled() => break,
         () = &mut stop_signal => {
            tracing::info!("signal received, shutting down");
            state.shutdown.cancel();
            break;
         },
      }
   }

   drop(listener);
   tracker.close();
   if time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
      tracing::warn!("connections still open after shutdown; dropping them");
   }
   drop(pid_file);
   tracing::info!("daemon stopped");
   Ok(())
}

async fn handle_client(state: Arc<ServerState>, stream: usock::Stream) {
   state.touch();
   let (read, mut write) = tokio::io::split(stream);
   let mut reader = BufReader::new(read);
   let max_bytes = state.config.effective_max_request_bytes();

   loop {
      let line = tokio::select! {
         line = ipc::read_line(&mut reader, max_bytes) => line,
         () = state.shutdown.cancelled() => break,
      };
      let line = match line {
         Ok(Some(line)) => line,
         Ok(None) => break,
         Err(Error::Ipc(IpcError::MessageTooLarge(len))) => {
            let response = JsonRpcResponse::error(
               Value::Null,
               ipc::INVALID_REQUEST,
               format!("request of {len} bytes exceeds the {max_bytes} byte limit"),
            );
            let _ = ipc::write_message(&mut write, &response).await;
            break;
         },
         Err(e) => {
            tracing::debug!("client read error: {e}");
            break;
         },
      };
      if line.trim().is_empty() {
         continue;
      }
      state.touch();

      let worker = Arc::clone(&state);
      let response = match tokio::task::spawn_blocking(move || rpc::handle_line(&worker, &line)).await
      {
         Ok(response) => response,
         Err(e) => Some(JsonRpcResponse::error(
            Value::Null,
            ipc::INTERNAL_ERROR,
            format!("request handler failed: {e}"),
         )),
      };

      if let Some(response) = response {
         if let Err(e) = ipc::write_message(&mut write, &response).await {
            tracing::debug!("client write error: {e}");
            break;
         }
      }
   }
}
