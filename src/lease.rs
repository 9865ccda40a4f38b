//! Daemon lease management (PID file + channel + startup marker).
//!
//! A lease is advisory: the PID file and socket only claim that a daemon owns
//! a database. Clients re-validate the claim with a process-existence probe
//! and a bounded connect before trusting it, and reap the artifacts when the
//! claim turns out to be stale.

use std::{
   fs::{self, File, OpenOptions},
   io::{self, Write},
   path::{Path, PathBuf},
   time::{Duration, Instant},
};

use fs4::FileExt;
use tokio::time;

use crate::{Result, error::Error, identity::DatabaseIdentity, usock};

/// Result of validating a daemon lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
   /// The recorded process exists and answers on the channel.
   Live { pid: u32 },
   /// Artifacts exist but nobody is serving behind them.
   Stale { pid: Option<u32>, reason: StaleReason },
   /// No PID file.
   Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
   UnreadablePid,
   ProcessGone,
   ChannelUnresponsive,
}

/// What a client needs to know after probing: reuse or start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
   Running { pid: u32 },
   NotRunning,
}

/// Reads the PID file. `Ok(None)` when the file is absent.
pub fn read_pid(identity: &DatabaseIdentity) -> io::Result<Option<Result<u32, String>>> {
   match fs::read_to_string(identity.pid_path()) {
      Ok(raw) => {
         let trimmed = raw.trim();
         Ok(Some(trimmed.parse::<u32>().map_err(|_| trimmed.to_string())))
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e),
   }
}

/// Non-destructive existence probe. EPERM means the process exists but
/// belongs to someone else, which still counts as alive.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
   let Ok(pid) = libc::pid_t::try_from(pid) else {
      return false;
   };
   if pid <= 0 {
      return false;
   }
   // SAFETY: signal 0 performs permission and existence checks only.
   let rc = unsafe { libc::kill(pid, 0) };
   rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable probe the channel connect decides liveness.
#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
   true
}

/// Attempts a bounded connect-and-close on the daemon channel.
pub async fn probe_channel(address: &usock::IpcAddress, timeout: Duration) -> bool {
   matches!(time::timeout(timeout, usock::Stream::connect(address)).await, Ok(Ok(_)))
}

/// Validates the lease for `identity` without modifying anything.
pub async fn validate_lease(identity: &DatabaseIdentity, probe_timeout: Duration) -> LeaseState {
   let pid = match read_pid(identity) {
      Ok(None) => return LeaseState::Absent,
      Ok(Some(Ok(pid))) => pid,
      Ok(Some(Err(raw))) => {
         tracing::debug!("unparseable pid file content {raw:?}");
         return LeaseState::Stale { pid: None, reason: StaleReason::UnreadablePid };
      },
      Err(e) => {
         tracing::debug!("failed to read pid file: {e}");
         return LeaseState::Stale { pid: None, reason: StaleReason::UnreadablePid };
      },
   };

   if !pid_is_alive(pid) {
      return LeaseState::Stale { pid: Some(pid), reason: StaleReason::ProcessGone };
   }

   if probe_channel(identity.address(), probe_timeout).await {
      LeaseState::Live { pid }
   } else {
      LeaseState::Stale { pid: Some(pid), reason: StaleReason::ChannelUnresponsive }
   }
}

/// Validates the lease and reaps it when stale.
pub async fn probe_liveness(identity: &DatabaseIdentity, probe_timeout: Duration) -> Liveness {
   match validate_lease(identity, probe_timeout).await {
      LeaseState::Live { pid } => Liveness::Running { pid },
      LeaseState::Absent => Liveness::NotRunning,
      LeaseState::Stale { pid, reason } => {
         tracing::warn!(
            ?pid,
            ?reason,
            "stale daemon lease for {}; cleaning up",
            identity.db_path().display()
         );
         if let Err(e) = cleanup_stale(identity) {
            tracing::warn!("failed to clean stale daemon artifacts: {e}");
         }
         Liveness::NotRunning
      },
   }
}

/// Removes the PID file, socket file and startup marker. Files that are
/// already gone count as removed. A startup marker locked by another client is
/// left in place.
pub fn cleanup_stale(identity: &DatabaseIdentity) -> io::Result<()> {
   remove_if_present(&identity.pid_path())?;
   usock::remove_socket_file(identity.address())?;

   let marker = identity.starting_path();
   match OpenOptions::new().read(true).write(true).open(&marker) {
      Ok(file) => {
         if file.try_lock_exclusive().is_ok() {
            let removed = remove_if_present(&marker);
            let _ = FileExt::unlock(&file);
            removed?;
         } else {
            tracing::debug!("startup marker {} is held; leaving it", marker.display());
         }
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => {},
      Err(e) => return Err(e),
   }
   Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
   match fs::remove_file(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
   }
}

/// PID file owned by the running daemon. Removed on drop if it still names
/// this process.
pub struct PidFile {
   path: PathBuf,
   pid:  u32,
}

impl PidFile {
   pub fn write(identity: &DatabaseIdentity) -> Result<Self> {
      let path = identity.pid_path();
      let pid = std::process::id();
      let tmp = path.with_extension("pid.tmp");
      fs::write(&tmp, pid.to_string())?;
      fs::rename(&tmp, &path)?;
      Ok(Self { path, pid })
   }

   pub const fn pid(&self) -> u32 {
      self.pid
   }
}

impl Drop for PidFile {
   fn drop(&mut self) {
      let ours = fs::read_to_string(&self.path)
         .ok()
         .and_then(|raw| raw.trim().parse::<u32>().ok())
         == Some(self.pid);
      if ours {
         let _ = fs::remove_file(&self.path);
      }
   }
}

/// Exclusive advisory lock on the startup marker. Only the holder may spawn a
/// daemon for the identity.
pub struct StartupLock {
   file: File,
   path: PathBuf,
}

impl StartupLock {
   /// Polls for the lock until `timeout` elapses.
   pub async fn acquire(identity: &DatabaseIdentity, timeout: Duration) -> Result<Self> {
      let path = identity.starting_path();
      let start = Instant::now();
      loop {
         if let Some(lock) = Self::try_acquire(&path)? {
            return Ok(lock);
         }
         if start.elapsed() >= timeout {
            return Err(Error::StartupLockTimeout { path });
         }
         time::sleep(Duration::from_millis(50)).await;
      }
   }

   /// One non-blocking attempt. `Ok(None)` when another client holds it.
   pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
      let file = OpenOptions::new()
         .create(true)
         .truncate(false)
         .read(true)
         .write(true)
         .open(path)?;
      if file.try_lock_exclusive().is_err() {
         return Ok(None);
      }
      // The previous holder unlinks the marker on release; a lock taken on the
      // unlinked inode does not exclude anyone.
      if !same_file(&file, path) {
         let _ = FileExt::unlock(&file);
         return Ok(None);
      }

      let mut lock = Self { file, path: path.to_path_buf() };
      lock.record_owner();
      Ok(Some(lock))
   }

   fn record_owner(&mut self) {
      let _ = self.file.set_len(0);
      let _ = writeln!(self.file, "pid={}", std::process::id());
      let _ = self.file.flush();
   }

   pub fn path(&self) -> &Path {
      &self.path
   }
}

impl Drop for StartupLock {
   fn drop(&mut self) {
      let _ = fs::remove_file(&self.path);
      let _ = FileExt::unlock(&self.file);
   }
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
   use std::os::unix::fs::MetadataExt;

   match (file.metadata(), fs::metadata(path)) {
      (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
      _ => false,
   }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
   path.exists()
}
