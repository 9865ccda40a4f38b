//! Canonical identity of an index store file and the artifacts derived from
//! it.
//!
//! Every daemon artifact (channel, PID file, startup marker, log) is keyed off
//! the canonical database path, so two spellings of the same file must agree
//! on it. Only the parent directory is resolved: the store file itself may not
//! exist yet on first run.

use std::{
   ffi::OsString,
   fs,
   path::{Path, PathBuf},
};

use crate::{Result, usock::IpcAddress};

pub const PID_SUFFIX: &str = ".daemon.pid";
pub const STARTING_SUFFIX: &str = ".daemon.starting";
pub const LOG_SUFFIX: &str = ".daemon.log";

/// Normalizes a database path so symlinked or relative spellings of the same
/// file collapse to one identity.
///
/// The parent directory is canonicalized when it exists; otherwise the
/// absolute path is returned unchanged. The result is idempotent.
pub fn normalize_db_path(path: &Path) -> PathBuf {
   let absolute = absolutize(path);

   let (Some(parent), Some(name)) = (absolute.parent(), absolute.file_name()) else {
      return absolute;
   };

   match fs::canonicalize(parent) {
      Ok(real_parent) => real_parent.join(name),
      Err(_) => absolute,
   }
}

/// Creates the parent directory of a database path.
pub fn ensure_db_parent_dir(path: &Path) -> Result<()> {
   if let Some(parent) = absolutize(path).parent() {
      fs::create_dir_all(parent)?;
   }
   Ok(())
}

fn absolutize(path: &Path) -> PathBuf {
   let joined = if path.is_absolute() {
      path.to_path_buf()
   } else {
      std::env::current_dir()
         .unwrap_or_else(|_| PathBuf::from("."))
         .join(path)
   };
   lexical_clean(&joined)
}

/// Drops `.` components and folds `..` without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
   use std::path::Component;

   let mut out = PathBuf::new();
   for component in path.components() {
      match component {
         Component::CurDir => {},
         Component::ParentDir => {
            if !out.pop() {
               out.push(component);
            }
         },
         other => out.push(other),
      }
   }
   out
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
   let mut raw: OsString = path.as_os_str().to_owned();
   raw.push(suffix);
   PathBuf::from(raw)
}

/// Canonical database path plus every artifact derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseIdentity {
   db_path: PathBuf,
   address: IpcAddress,
}

impl DatabaseIdentity {
   /// Creates the parent directory, then normalizes. Use this before deriving
   /// locks or channels from the identity.
   pub fn prepare(path: &Path) -> Result<Self> {
      ensure_db_parent_dir(path)?;
      Ok(Self::from_canonical(normalize_db_path(path)))
   }

   /// Normalizes without creating anything. Suitable for read-only commands.
   pub fn resolve(path: &Path) -> Self {
      Self::from_canonical(normalize_db_path(path))
   }

   pub fn from_canonical(db_path: PathBuf) -> Self {
      let address = IpcAddress::resolve(&db_path);
      Self { db_path, address }
   }

   /// Same identity, serving on an explicit address instead of the derived
   /// one.
   pub fn with_address(mut self, address: IpcAddress) -> Self {
      self.address = address;
      self
   }

   pub fn db_path(&self) -> &Path {
      &self.db_path
   }

   pub const fn address(&self) -> &IpcAddress {
      &self.address
   }

   pub fn pid_path(&self) -> PathBuf {
      with_suffix(&self.db_path, PID_SUFFIX)
   }

   pub fn starting_path(&self) -> PathBuf {
      with_suffix(&self.db_path, STARTING_SUFFIX)
   }

   pub fn log_path(&self) -> PathBuf {
      with_suffix(&self.db_path, LOG_SUFFIX)
   }

   /// Human-readable summary that keeps the database path next to the channel
   /// name, which cannot be reversed on named-pipe platforms.
   pub fn describe(&self) -> String {
      self.address.debug_info(&self.db_path)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn missing_parent_returns_absolute_path() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nope").join("deeper").join("index.db");
      assert_eq!(normalize_db_path(&path), path);
   }

   #[test]
   fn dot_components_are_folded() {
      let dir = tempfile::tempdir().unwrap();
      let real = fs::canonicalize(dir.path()).unwrap();
      let spelled = dir.path().join(".").join("sub").join("..").join("index.db");
      assert_eq!(normalize_db_path(&spelled), real.join("index.db"));
   }

   #[test]
   fn artifact_paths_append_suffixes() {
      let id = DatabaseIdentity::from_canonical(PathBuf::from("/data/index.db"));
      assert_eq!(id.pid_path(), PathBuf::from("/data/index.db.daemon.pid"));
      assert_eq!(id.starting_path(), PathBuf::from("/data/index.db.daemon.starting"));
      assert_eq!(id.log_path(), PathBuf::from("/data/index.db.daemon.log"));
   }

   #[test]
   fn prepare_creates_parent_and_canonicalizes() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("a").join("b").join("index.db");
      let id = DatabaseIdentity::prepare(&path).unwrap();
      assert!(path.parent().unwrap().is_dir());
      assert_eq!(id.db_path(), fs::canonicalize(path.parent().unwrap()).unwrap().join("index.db"));
   }
}
