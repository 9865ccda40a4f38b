#![cfg(unix)]

mod support;

use std::{fs, time::Duration};

use kiri::{
   Error,
   cmd::{
      daemon::{self, DaemonLauncher, EnsureOutcome, StartOptions},
      stop::{self, StopOutcome},
   },
   identity::DatabaseIdentity,
   lease,
};
use serde_json::Value;
use support::fast_config;

fn options(dir: &tempfile::TempDir) -> StartOptions {
   StartOptions {
      repo_root: dir.path().to_path_buf(),
      db_path: dir.path().join("index.db"),
      allow_degrade: true,
      ..StartOptions::default()
   }
}

fn kiri() -> DaemonLauncher {
   DaemonLauncher::new(env!("CARGO_BIN_EXE_kiri"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawns_once_then_reuses() {
   let dir = tempfile::tempdir().unwrap();
   let cfg = fast_config();
   let opts = options(&dir);

   let (identity, first) = daemon::ensure_daemon(&opts, &kiri(), &cfg).await.unwrap();
   let EnsureOutcome::Spawned { pid } = first else {
      panic!("expected a spawn, got {first:?}");
   };

   let (_, second) = daemon::ensure_daemon(&opts, &kiri(), &cfg).await.unwrap();
   assert_eq!(second, EnsureOutcome::Reused { pid: Some(pid) });
   assert_eq!(lease::read_pid(&identity).unwrap(), Some(Ok(pid)));

   let mut client = daemon::connect(&identity, &cfg).await.unwrap();
   let pong = daemon::call(&mut client, "ping", Value::Null, &cfg).await.unwrap();
   assert_eq!(pong["ok"], true);
   let status = daemon::call(&mut client, "status", Value::Null, &cfg).await.unwrap();
   assert_eq!(status["pid"], pid);
   drop(client);

   assert_eq!(stop::stop_daemon(&identity, &cfg).await.unwrap(), StopOutcome::Stopped);
   assert!(!identity.pid_path().exists());
   assert!(!lease::probe_channel(identity.address(), cfg.probe_timeout()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_artifacts_are_replaced_by_a_fresh_daemon() {
   let dir = tempfile::tempdir().unwrap();
   let cfg = fast_config();
   let opts = options(&dir);
   let identity = DatabaseIdentity::prepare(&opts.db_path).unwrap();

   let mut ghost = std::process::Command::new("true").spawn().unwrap();
   let ghost_pid = ghost.id();
   ghost.wait().unwrap();
   fs::write(identity.pid_path(), ghost_pid.to_string()).unwrap();
   fs::write(identity.address().socket_file().unwrap(), b"").unwrap();

   let (identity, outcome) = daemon::ensure_daemon(&opts, &kiri(), &cfg).await.unwrap();
   let EnsureOutcome::Spawned { pid } = outcome else {
      panic!("expected a spawn, got {outcome:?}");
   };
   assert_ne!(pid, ghost_pid);
   assert_eq!(stop::stop_daemon(&identity, &cfg).await.unwrap(), StopOutcome::Stopped);
}

#[tokio::test]
async fn hung_daemon_times_out_with_log_path() {
   let dir = tempfile::tempdir().unwrap();
   let cfg = kiri::config::Config { ready_timeout_ms: 600, ..fast_config() };
   let opts = options(&dir);
   let launcher = DaemonLauncher::new("sh").with_leading_args(["-c", "sleep 5", "sh"]);

   let started = std::time::Instant::now();
   let err = daemon::ensure_daemon(&opts, &launcher, &cfg).await.unwrap_err();
   assert!(started.elapsed() < Duration::from_secs(5));
   assert!(matches!(err, Error::DaemonStartTimeout { .. }), "{err}");
   assert_eq!(err.exit_code(), 11);
   assert!(err.to_string().contains("index.db.daemon.log"), "{err}");

   // The startup marker is released even though the child is still running.
   let identity = DatabaseIdentity::resolve(&opts.db_path);
   assert!(!identity.starting_path().exists());
}

#[tokio::test]
async fn daemon_that_exits_early_is_reported() {
   let dir = tempfile::tempdir().unwrap();
   let cfg = fast_config();
   let opts = options(&dir);
   let launcher =
      DaemonLauncher::new("sh").with_leading_args(["-c", "echo boom >&2; exit 3", "sh"]);

   let err = daemon::ensure_daemon(&opts, &launcher, &cfg).await.unwrap_err();
   assert!(matches!(err, Error::DaemonExited { .. }), "{err}");

   let identity = DatabaseIdentity::resolve(&opts.db_path);
   let log = fs::read_to_string(identity.log_path()).unwrap();
   assert!(log.contains("boom"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strict_daemon_refuses_without_full_text() {
   let dir = tempfile::tempdir().unwrap();
   // Disable full-text via the repository config the daemon reads.
   fs::write(dir.path().join(".kiri.toml"), "fts_enabled = false\n").unwrap();
   let cfg = fast_config();
   let opts = StartOptions { allow_degrade: false, ..options(&dir) };

   let err = daemon::ensure_daemon(&opts, &kiri(), &cfg).await.unwrap_err();
   assert!(matches!(err, Error::DaemonExited { .. }), "{err}");
   assert!(err.to_string().contains("13"), "{err}");
}
