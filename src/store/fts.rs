//! Full-text secondary index over `blob.content` and its freshness model.
//!
//! Two signals decide whether the index can be trusted: the per-repository
//! `fts_dirty` flag (set by any writer, cleared only here) and the physical
//! presence and integrity of the FTS5 structures. Rebuilds happen inside a
//! `BEGIN IMMEDIATE` transaction, so concurrent builders serialize on
//! SQLite's write lock and a builder that finds a verified index after waiting
//! reports it instead of rebuilding.

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use super::{IndexStore, RepoId, now_rfc3339};
use crate::{Result, error::Error};

pub const FTS_TABLE: &str = "blob_fts";
pub const FTS_SHADOW_TABLES: [&str; 4] =
   ["blob_fts_data", "blob_fts_idx", "blob_fts_config", "blob_fts_docsize"];

const REBUILD_SQL: &str = "
DROP TABLE IF EXISTS blob_fts;
CREATE VIRTUAL TABLE blob_fts USING fts5(content, content = 'blob', tokenize = 'unicode61');
INSERT INTO blob_fts(blob_fts) VALUES ('rebuild');
";

/// Read-only capability probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtsAvailability {
   Available,
   Unavailable { reason: String },
}

impl FtsAvailability {
   pub const fn is_available(&self) -> bool {
      matches!(self, Self::Available)
   }
}

/// Outcome of a build attempt. Never an error: anything that prevents a
/// usable index is `Unavailable` and the caller degrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtsBuildOutcome {
   Ready { rebuilt: bool },
   Unavailable { reason: String },
}

impl FtsBuildOutcome {
   pub const fn is_ready(&self) -> bool {
      matches!(self, Self::Ready { .. })
   }

   pub const fn rebuilt(&self) -> bool {
      matches!(self, Self::Ready { rebuilt: true })
   }
}

/// What `rebuild_if_needed` saw and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
   pub was_dirty:     bool,
   pub index_existed: bool,
   pub outcome:       FtsBuildOutcome,
}

fn capability(conn: &Connection, enabled: bool) -> std::result::Result<(), String> {
   if !enabled {
      return Err("full-text index disabled by configuration".to_string());
   }
   let compiled: rusqlite::Result<bool> =
      conn.query_row("SELECT sqlite_compileoption_used('ENABLE_FTS5')", [], |row| row.get(0));
   match compiled {
      Ok(true) => Ok(()),
      Ok(false) => Err("sqlite was built without FTS5".to_string()),
      Err(e) => Err(format!("failed to probe FTS5 support: {e}")),
   }
}

fn structures_exist(conn: &Connection) -> rusqlite::Result<bool> {
   let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM sqlite_master WHERE name = ?1")?;
   for name in std::iter::once(FTS_TABLE).chain(FTS_SHADOW_TABLES) {
      let count: i64 = stmt.query_row(params![name], |row| row.get(0))?;
      if count == 0 {
         return Ok(false);
      }
   }
   Ok(true)
}

/// Structures present and a trial query against them succeeds.
fn integrity_holds(conn: &Connection) -> bool {
   match structures_exist(conn) {
      Ok(true) => {},
      Ok(false) => return false,
      Err(e) => {
         tracing::debug!("fts structure probe failed: {e}");
         return false;
      },
   }
   let trial: rusqlite::Result<i64> = conn.query_row(
      "SELECT COUNT(*) FROM blob_fts WHERE blob_fts MATCH 'test'",
      [],
      |row| row.get(0),
   );
   match trial {
      Ok(_) => true,
      Err(e) => {
         tracing::warn!("full-text index failed its integrity check: {e}");
         false
      },
   }
}

fn bump_generation(tx: &Transaction<'_>) -> rusqlite::Result<()> {
   tx.execute(
      "INSERT INTO fts_index_meta (name, generation, built_at) VALUES (?1, 1, ?2)
       ON CONFLICT(name) DO UPDATE SET generation = generation + 1, built_at = excluded.built_at",
      params![FTS_TABLE, now_rfc3339()],
   )?;
   Ok(())
}

impl IndexStore {
   /// Builds the full-text index if it is missing or fails its integrity
   /// check, or unconditionally when `force_rebuild` is set.
   pub fn try_build_full_text_index(&mut self, force_rebuild: bool) -> FtsBuildOutcome {
      if let Err(reason) = capability(self.conn(), self.fts_enabled) {
         return FtsBuildOutcome::Unavailable { reason };
      }
      if !force_rebuild && integrity_holds(self.conn()) {
         return FtsBuildOutcome::Ready { rebuilt: false };
      }

      match self.build_locked(force_rebuild, |_| Ok(())) {
         Ok(rebuilt) => FtsBuildOutcome::Ready { rebuilt },
         Err(e) => {
            tracing::warn!("full-text index build failed: {e}");
            FtsBuildOutcome::Unavailable { reason: e.to_string() }
         },
      }
   }

   /// Takes the write lock, re-checks, rebuilds and runs `on_success` in the
   /// same transaction. Returns whether a rebuild happened.
   fn build_locked<F>(&mut self, force_rebuild: bool, on_success: F) -> Result<bool>
   where
      F: FnOnce(&Transaction<'_>) -> rusqlite::Result<()>,
   {
      let tx = self
         .conn_mut()
         .transaction_with_behavior(TransactionBehavior::Immediate)?;

      if !force_rebuild && integrity_holds(&tx) {
         tracing::debug!("full-text index already built by another writer");
         on_success(&tx)?;
         tx.commit()?;
         return Ok(false);
      }

      tx.execute_batch(REBUILD_SQL)?;
      if !integrity_holds(&tx) {
         return Err(Error::Server {
            op:     "fts rebuild",
            reason: "rebuilt full-text index failed verification".to_string(),
         });
      }
      bump_generation(&tx)?;
      on_success(&tx)?;
      tx.commit()?;
      tracing::info!("rebuilt full-text index");
      Ok(true)
   }

   /// Orchestration entry point for an indexing pass.
   ///
   /// Rebuilds when forced, when the repository is dirty (a missing row or a
   /// missing freshness timestamp counts as dirty), or when the index is
   /// missing. A successful rebuild clears the flag in the same transaction;
   /// a failed one leaves it set so the next pass retries.
   pub fn rebuild_if_needed(&mut self, repo_id: RepoId, force_fts: bool) -> Result<RebuildReport> {
      self.ensure_repo_meta_columns()?;
      let was_dirty = self.repo_is_dirty(repo_id)?;
      let index_existed = structures_exist(self.conn())?;

      if !force_fts && !was_dirty && index_existed {
         return Ok(RebuildReport {
            was_dirty,
            index_existed,
            outcome: FtsBuildOutcome::Ready { rebuilt: false },
         });
      }

      if let Err(reason) = capability(self.conn(), self.fts_enabled) {
         tracing::warn!(repo_id, "full-text index unavailable: {reason}");
         return Ok(RebuildReport {
            was_dirty,
            index_existed,
            outcome: FtsBuildOutcome::Unavailable { reason },
         });
      }

      let stamp = now_rfc3339();
      let built = self.build_locked(true, |tx| {
         tx.execute(
            "UPDATE repo SET fts_dirty = 0, fts_last_indexed_at = ?1 WHERE id = ?2",
            params![stamp, repo_id],
         )?;
         Ok(())
      });

      let outcome = match built {
         Ok(rebuilt) => FtsBuildOutcome::Ready { rebuilt },
         Err(e) => {
            tracing::warn!(repo_id, "full-text rebuild failed; repo stays dirty: {e}");
            FtsBuildOutcome::Unavailable { reason: e.to_string() }
         },
      };
      Ok(RebuildReport { was_dirty, index_existed, outcome })
   }

   /// Read-only probe: capability present and structures exist. Builds and
   /// repairs nothing.
   pub fn check_availability(&self) -> FtsAvailability {
      if let Err(reason) = capability(self.conn(), self.fts_enabled) {
         return FtsAvailability::Unavailable { reason };
      }
      match structures_exist(self.conn()) {
         Ok(true) => FtsAvailability::Available,
         Ok(false) => {
            FtsAvailability::Unavailable { reason: "full-text index has not been built".to_string() }
         },
         Err(e) => FtsAvailability::Unavailable { reason: format!("failed to inspect index: {e}") },
      }
   }

   /// Flags a repository's content as newer than the full-text index.
   pub fn mark_dirty(&self, repo_id: RepoId) -> Result<()> {
      self.ensure_repo_meta_columns()?;
      let updated = self
         .conn()
         .execute("UPDATE repo SET fts_dirty = 1 WHERE id = ?1", params![repo_id])?;
      if updated == 0 {
         tracing::debug!(repo_id, "mark_dirty on unknown repo");
      }
      Ok(())
   }

   /// Missing rows and never-stamped rows are dirty.
   pub fn repo_is_dirty(&self, repo_id: RepoId) -> Result<bool> {
      let row: Option<(bool, Option<String>)> = self
         .conn()
         .query_row(
            "SELECT fts_dirty, fts_last_indexed_at FROM repo WHERE id = ?1",
            params![repo_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
         )
         .optional()?;
      Ok(row.is_none_or(|(dirty, stamp)| dirty || stamp.is_none()))
   }

   /// The index is shared by every repository in the store, so one stale
   /// repository makes it stale for all of them.
   pub fn any_repo_stale(&self) -> Result<bool> {
      Ok(self.conn().query_row(
         "SELECT EXISTS (SELECT 1 FROM repo WHERE fts_dirty != 0 OR fts_last_indexed_at IS NULL)",
         [],
         |row| row.get(0),
      )?)
   }

   /// Number of rebuilds recorded for the shared index; 0 if never built.
   pub fn fts_generation(&self) -> Result<i64> {
      Ok(self
         .conn()
         .query_row(
            "SELECT generation FROM fts_index_meta WHERE name = ?1",
            params![FTS_TABLE],
            |row| row.get(0),
         )
         .optional()?
         .unwrap_or(0))
   }

   /// Count of schema objects belonging to the full-text index.
   pub fn fts_structure_count(&self) -> Result<i64> {
      Ok(self.conn().query_row(
         "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1 OR name LIKE ?1 || '\\_%' ESCAPE '\\'",
         params![FTS_TABLE],
         |row| row.get(0),
      )?)
   }
}

#[cfg(test)]
mod tests {
   use std::path::Path;

   use super::*;

   fn seeded() -> (IndexStore, RepoId) {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_base_schema().unwrap();
      store.ensure_repo_meta_columns().unwrap();
      let repo = store.resolve_repo_id(Path::new("/repo")).unwrap();
      store
         .put_file(repo, "src/lib.rs", "pub fn parse_config() {}\n")
         .unwrap();
      (store, repo)
   }

   #[test]
   fn availability_reports_missing_index() {
      let (store, _) = seeded();
      assert!(!store.check_availability().is_available());
   }

   #[test]
   fn disabled_capability_is_unavailable_not_error() {
      let (store, _) = seeded();
      let mut store = store.with_fts_enabled(false);
      assert!(matches!(
         store.try_build_full_text_index(false),
         FtsBuildOutcome::Unavailable { .. }
      ));
   }

   #[test]
   fn forced_build_bumps_generation() {
      let (mut store, _) = seeded();
      assert!(store.try_build_full_text_index(false).rebuilt());
      assert!(store.try_build_full_text_index(true).rebuilt());
      assert_eq!(store.fts_generation().unwrap(), 2);
   }

   #[test]
   fn new_repo_rows_are_dirty() {
      let (store, repo) = seeded();
      assert!(store.repo_is_dirty(repo).unwrap());
      assert!(store.repo_is_dirty(9999).unwrap());
      assert!(store.any_repo_stale().unwrap());
   }

   #[test]
   fn mark_dirty_on_read_only_store_propagates() {
      let (store, repo) = seeded();
      store.conn().execute_batch("PRAGMA query_only = ON;").unwrap();
      assert!(store.mark_dirty(repo).is_err());
   }
}
