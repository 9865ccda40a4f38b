//! Stop daemon command.
//!
//! Asks the daemon for a database to shut down over JSON-RPC and waits for
//! its lease to disappear. An unresponsive daemon is terminated when its
//! command line identifies it, and its artifacts are reaped.

use std::{
   path::PathBuf,
   time::{Duration, Instant},
};

use console::style;
use serde_json::Value;
use tokio::time;

use crate::{
   Result,
   cmd::daemon,
   config::{self, Config},
   identity::DatabaseIdentity,
   lease::{self, LeaseState},
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What `stop` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
   /// The daemon acknowledged shutdown and released its lease.
   Stopped,
   /// No daemon and no artifacts.
   NotRunning,
   /// Artifacts of a dead or unresponsive daemon were removed.
   Reaped,
}

fn looks_like_kiri_daemon(pid: u32) -> bool {
   let Ok(bytes) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
      return false;
   };
   let cmdline = String::from_utf8_lossy(&bytes);
   cmdline.contains("kiri") && cmdline.contains("daemon")
}

fn force_kill_if_possible(identity: &DatabaseIdentity) -> bool {
   let Ok(Some(Ok(pid))) = lease::read_pid(identity) else {
      return false;
   };
   if pid == std::process::id() || !looks_like_kiri_daemon(pid) {
      return false;
   }

   #[cfg(unix)]
   {
      std::process::Command::new("kill")
         .arg("-TERM")
         .arg(pid.to_string())
         .status()
         .is_ok_and(|s| s.success())
   }

   #[cfg(not(unix))]
   {
      false
   }
}

fn reap(identity: &DatabaseIdentity) -> Result<StopOutcome> {
   let killed = force_kill_if_possible(identity);
   tracing::debug!(killed, "reaping daemon artifacts for {}", identity.describe());
   lease::cleanup_stale(identity)?;
   Ok(StopOutcome::Reaped)
}

/// Waits until the PID file is gone and the channel refuses connections.
async fn wait_for_exit(identity: &DatabaseIdentity, cfg: &Config) -> bool {
   let start = Instant::now();
   while start.elapsed() < cfg.rpc_timeout() {
      let pid_gone = !identity.pid_path().exists();
      if pid_gone && !lease::probe_channel(identity.address(), cfg.probe_timeout()).await {
         return true;
      }
      time::sleep(EXIT_POLL_INTERVAL).await;
   }
   false
}

/// Stops the daemon serving `identity`.
pub async fn stop_daemon(identity: &DatabaseIdentity, cfg: &Config) -> Result<StopOutcome> {
   match lease::validate_lease(identity, cfg.probe_timeout()).await {
      LeaseState::Absent => {
         if !lease::probe_channel(identity.address(), cfg.probe_timeout()).await {
            lease::cleanup_stale(identity)?;
            return Ok(StopOutcome::NotRunning);
         }
      },
      LeaseState::Stale { pid, reason } => {
         tracing::debug!(?pid, ?reason, "stale lease");
         return reap(identity);
      },
      LeaseState::Live { .. } => {},
   }

   let acknowledged = match daemon::connect(identity, cfg).await {
      Ok(mut client) => match daemon::call(&mut client, "shutdown", Value::Null, cfg).await {
         Ok(_) => true,
         Err(e) => {
            tracing::debug!("shutdown request failed: {e}");
            false
         },
      },
      Err(e) => {
         tracing::debug!("failed to connect to daemon: {e}");
         false
      },
   };

   if acknowledged && wait_for_exit(identity, cfg).await {
      return Ok(StopOutcome::Stopped);
   }
   reap(identity)
}

/// Executes `kiri stop`.
pub async fn execute(repo: Option<PathBuf>, db: Option<PathBuf>) -> Result<()> {
   let cfg = config::get();
   let (_, db_path) = daemon::resolve_target(repo.as_deref(), db.as_deref(), cfg)?;
   let identity = DatabaseIdentity::resolve(&db_path);

   match stop_daemon(&identity, cfg).await? {
      StopOutcome::Stopped => println!("{}", style("Daemon stopped").green()),
      StopOutcome::NotRunning => {
         println!("{}", style("No daemon running for this database").yellow());
      },
      StopOutcome::Reaped => println!("{}", style("Daemon unresponsive; removed lease").yellow()),
   }
   Ok(())
}
