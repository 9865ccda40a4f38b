//! Daemon supervision from the client side.
//!
//! Ensures exactly one daemon serves a database: validate the lease, reap it
//! when stale, take the startup lock, re-validate, then spawn a detached
//! daemon and poll its channel until it accepts connections.

use std::{
   ffi::OsString,
   fs::OpenOptions,
   path::{Path, PathBuf},
   process::{Child, Command, Stdio},
   time::Instant,
};

use serde_json::Value;
use tokio::time;

use crate::{
   Result,
   config::Config,
   error::Error,
   identity::DatabaseIdentity,
   ipc,
   lease::{self, Liveness, StartupLock},
};

/// How the daemon for a database should be started.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
   pub repo_root:       PathBuf,
   pub db_path:         PathBuf,
   pub watch:           bool,
   pub allow_degrade:   bool,
   pub security_config: Option<PathBuf>,
   pub security_lock:   Option<PathBuf>,
   /// Idle timeout in minutes; `None` uses the daemon's configuration.
   pub idle_timeout:    Option<u64>,
}

/// Result of [`ensure_daemon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
   /// A live daemon already served the database. The pid is unknown when the
   /// daemon answered before writing its PID file.
   Reused { pid: Option<u32> },
   Spawned { pid: u32 },
}

/// Program and leading arguments used to launch `daemon`.
#[derive(Debug, Clone)]
pub struct DaemonLauncher {
   program:      PathBuf,
   leading_args: Vec<OsString>,
}

impl DaemonLauncher {
   /// Relaunches the running executable.
   pub fn current_exe() -> Result<Self> {
      Ok(Self::new(std::env::current_exe()?))
   }

   pub fn new(program: impl Into<PathBuf>) -> Self {
      Self { program: program.into(), leading_args: Vec::new() }
   }

   /// Arguments placed before the `daemon` subcommand.
   pub fn with_leading_args<I, S>(mut self, args: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<OsString>,
   {
      self.leading_args = args.into_iter().map(Into::into).collect();
      self
   }

   fn command(&self, identity: &DatabaseIdentity, opts: &StartOptions) -> Command {
      let mut cmd = Command::new(&self.program);
      cmd.args(&self.leading_args)
         .arg("daemon")
         .arg("--repo")
         .arg(&opts.repo_root)
         .arg("--db")
         .arg(identity.db_path())
         .arg("--socket-path")
         .arg(identity.address().to_string());
      if opts.watch {
         cmd.arg("--watch");
      }
      if opts.allow_degrade {
         cmd.arg("--allow-degrade");
      }
      if let Some(path) = &opts.security_config {
         cmd.arg("--security-config").arg(path);
      }
      if let Some(path) = &opts.security_lock {
         cmd.arg("--security-lock").arg(path);
      }
      if let Some(minutes) = opts.idle_timeout {
         cmd.arg("--daemon-timeout").arg(minutes.to_string());
      }
      cmd
   }

   /// Spawns the daemon detached from this process. Its stdout and stderr are
   /// appended to the identity's log file.
   pub fn spawn(&self, identity: &DatabaseIdentity, opts: &StartOptions) -> Result<Child> {
      let log_path = identity.log_path();
      let log = OpenOptions::new()
         .create(true)
         .append(true)
         .open(&log_path)
         .map_err(Error::DaemonSpawn)?;
      let log_err = log.try_clone().map_err(Error::DaemonSpawn)?;

      let mut cmd = self.command(identity, opts);
      cmd.stdin(Stdio::null())
         .stdout(Stdio::from(log))
         .stderr(Stdio::from(log_err));
      detach(&mut cmd);

      let child = cmd.spawn().map_err(Error::DaemonSpawn)?;
      tracing::info!(pid = child.id(), "spawned daemon; log: {}", log_path.display());
      Ok(child)
   }
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
   use std::os::unix::process::CommandExt;
   cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut Command) {
   use std::os::windows::process::CommandExt;
   const DETACHED_PROCESS: u32 = 0x0000_0008;
   const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
   cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_cmd: &mut Command) {}

/// Collects the child's exit status off the caller's path so it never turns
/// into a zombie.
fn reap_in_background(mut child: Child) {
   let spawned = std::thread::Builder::new()
      .name("kiri-reaper".to_string())
      .spawn(move || match child.wait() {
         Ok(status) => tracing::debug!("daemon exited: {status}"),
         Err(e) => tracing::debug!("failed to reap daemon: {e}"),
      });
   if let Err(e) = spawned {
      tracing::debug!("failed to start reaper thread: {e}");
   }
}

/// Polls the channel until the daemon answers. Fails early when the child
/// exits with an error, and at the deadline otherwise. Never kills the child.
async fn await_ready(identity: &DatabaseIdentity, child: &mut Child, cfg: &Config) -> Result<()> {
   let start = Instant::now();
   let deadline = cfg.ready_timeout();
   loop {
      if lease::probe_channel(identity.address(), cfg.probe_timeout()).await {
         return Ok(());
      }

      match child.try_wait() {
         Ok(Some(status)) if !status.success() => {
            return Err(Error::DaemonExited {
               status: status.to_string(),
               log:    identity.log_path(),
            });
         },
         Ok(_) => {},
         Err(e) => tracing::debug!("failed to poll daemon status: {e}"),
      }

      if start.elapsed() >= deadline {
         return Err(Error::DaemonStartTimeout {
            waited_secs: deadline.as_secs(),
            log:         identity.log_path(),
         });
      }
      time::sleep(cfg.ready_poll_interval()).await;
   }
}

async fn live_daemon(identity: &DatabaseIdentity, cfg: &Config) -> Option<EnsureOutcome> {
   match lease::probe_liveness(identity, cfg.probe_timeout()).await {
      Liveness::Running { pid } => Some(EnsureOutcome::Reused { pid: Some(pid) }),
      Liveness::NotRunning => None,
   }
}

/// Makes sure a daemon serves `opts.db_path`, starting one if needed.
pub async fn ensure_daemon(
   opts: &StartOptions,
   launcher: &DaemonLauncher,
   cfg: &Config,
) -> Result<(DatabaseIdentity, EnsureOutcome)> {
   let identity = DatabaseIdentity::prepare(&opts.db_path)?;

   if let Some(outcome) = live_daemon(&identity, cfg).await {
      tracing::debug!(?outcome, "reusing daemon at {}", identity.describe());
      return Ok((identity, outcome));
   }

   let _lock = StartupLock::acquire(&identity, cfg.startup_lock_timeout()).await?;

   // Another client may have finished starting the daemon while we waited.
   if let Some(outcome) = live_daemon(&identity, cfg).await {
      tracing::debug!(?outcome, "daemon started by another client");
      return Ok((identity, outcome));
   }
   if lease::probe_channel(identity.address(), cfg.probe_timeout()).await {
      return Ok((identity, EnsureOutcome::Reused { pid: None }));
   }

   let mut child = launcher.spawn(&identity, opts)?;
   let pid = child.id();
   let ready = await_ready(&identity, &mut child, cfg).await;
   reap_in_background(child);
   ready?;

   Ok((identity, EnsureOutcome::Spawned { pid }))
}

/// Opens a client connection to the daemon for `identity`.
pub async fn connect(identity: &DatabaseIdentity, cfg: &Config) -> Result<ipc::Client> {
   match time::timeout(
      cfg.probe_timeout(),
      ipc::Client::connect(identity.address(), cfg.effective_max_request_bytes()),
   )
   .await
   {
      Ok(result) => result,
      Err(_) => Err(Error::Server {
         op:     "connect",
         reason: format!("timed out connecting to {}", identity.describe()),
      }),
   }
}

/// One request with the configured RPC timeout.
pub async fn call(client: &mut ipc::Client, method: &str, params: Value, cfg: &Config) -> Result<Value> {
   match time::timeout(cfg.rpc_timeout(), client.call(method, params)).await {
      Ok(result) => result,
      Err(_) => Err(Error::Server {
         op:     "rpc",
         reason: format!("{method} timed out after {}ms", cfg.rpc_timeout().as_millis()),
      }),
   }
}

/// Resolves the repository root and database path a client command targets.
pub fn resolve_target(repo: Option<&Path>, db: Option<&Path>, cfg: &Config) -> Result<(PathBuf, PathBuf)> {
   let repo = match repo {
      Some(path) => path.to_path_buf(),
      None => std::env::current_dir()?,
   };
   let repo = repo.canonicalize().unwrap_or(repo);
   let db = db.map_or_else(|| cfg.db_path_for(&repo), Path::to_path_buf);
   Ok((repo, db))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn command_carries_every_option() {
      let identity = DatabaseIdentity::from_canonical(PathBuf::from("/data/index.db"));
      let opts = StartOptions {
         repo_root: PathBuf::from("/repo"),
         db_path: PathBuf::from("/data/index.db"),
         watch: true,
         allow_degrade: true,
         security_config: Some(PathBuf::from("/etc/kiri/security.toml")),
         security_lock: None,
         idle_timeout: Some(15),
      };
      let cmd = DaemonLauncher::new("kiri").command(&identity, &opts);
      let args: Vec<String> = cmd
         .get_args()
         .map(|a| a.to_string_lossy().into_owned())
         .collect();
      assert_eq!(&args[..3], ["daemon", "--repo", "/repo"]);
      for flag in ["--watch", "--allow-degrade", "--security-config", "--daemon-timeout"] {
         assert!(args.iter().any(|a| a == flag), "missing {flag}");
      }
      assert!(!args.iter().any(|a| a == "--security-lock"));
   }

   #[test]
   fn explicit_db_overrides_config_default() {
      let cfg = Config::default();
      let (_, db) =
         resolve_target(Some(Path::new("/nonexistent/repo")), Some(Path::new("/x/i.db")), &cfg)
            .unwrap();
      assert_eq!(db, PathBuf::from("/x/i.db"));
   }
}
