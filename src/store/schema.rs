use rusqlite::params;

use super::IndexStore;
use crate::{Result, error::Error};

const BASE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS repo (
   id INTEGER PRIMARY KEY AUTOINCREMENT,
   root TEXT NOT NULL UNIQUE,
   default_branch TEXT,
   indexed_at TEXT
);

CREATE TABLE IF NOT EXISTS blob (
   hash TEXT PRIMARY KEY,
   size_bytes INTEGER NOT NULL,
   line_count INTEGER,
   content TEXT
);

CREATE TABLE IF NOT EXISTS tree (
   repo_id INTEGER NOT NULL,
   commit_hash TEXT NOT NULL,
   path TEXT NOT NULL,
   blob_hash TEXT NOT NULL,
   ext TEXT,
   lang TEXT,
   is_binary INTEGER NOT NULL DEFAULT 0,
   mtime TEXT,
   PRIMARY KEY (repo_id, commit_hash, path)
);

CREATE TABLE IF NOT EXISTS file (
   repo_id INTEGER NOT NULL,
   path TEXT NOT NULL,
   blob_hash TEXT NOT NULL,
   ext TEXT,
   lang TEXT,
   is_binary INTEGER NOT NULL DEFAULT 0,
   mtime TEXT,
   PRIMARY KEY (repo_id, path)
);
CREATE INDEX IF NOT EXISTS idx_file_lang ON file(repo_id, lang);
CREATE INDEX IF NOT EXISTS idx_file_blob ON file(blob_hash);

CREATE TABLE IF NOT EXISTS symbol (
   repo_id INTEGER NOT NULL,
   path TEXT NOT NULL,
   symbol_id INTEGER NOT NULL,
   name TEXT NOT NULL,
   kind TEXT NOT NULL,
   range_start_line INTEGER NOT NULL,
   range_end_line INTEGER NOT NULL,
   signature TEXT,
   doc TEXT,
   PRIMARY KEY (repo_id, path, symbol_id)
);
CREATE INDEX IF NOT EXISTS idx_symbol_name ON symbol(repo_id, name);

CREATE TABLE IF NOT EXISTS snippet (
   repo_id INTEGER NOT NULL,
   path TEXT NOT NULL,
   snippet_id INTEGER NOT NULL,
   start_line INTEGER NOT NULL,
   end_line INTEGER NOT NULL,
   symbol_id INTEGER,
   PRIMARY KEY (repo_id, path, snippet_id)
);

CREATE TABLE IF NOT EXISTS dependency (
   repo_id INTEGER NOT NULL,
   src_path TEXT NOT NULL,
   dst_kind TEXT NOT NULL,
   dst TEXT NOT NULL,
   rel TEXT NOT NULL,
   PRIMARY KEY (repo_id, src_path, dst_kind, dst, rel)
);
CREATE INDEX IF NOT EXISTS idx_dep_src ON dependency(repo_id, src_path);
CREATE INDEX IF NOT EXISTS idx_dep_dst ON dependency(repo_id, dst);

CREATE TABLE IF NOT EXISTS file_embedding (
   repo_id INTEGER NOT NULL,
   path TEXT NOT NULL,
   dims INTEGER NOT NULL,
   vector_json TEXT NOT NULL,
   updated_at TEXT NOT NULL,
   PRIMARY KEY (repo_id, path)
);

CREATE TABLE IF NOT EXISTS fts_index_meta (
   name TEXT PRIMARY KEY,
   generation INTEGER NOT NULL DEFAULT 0,
   built_at TEXT
);
";

impl IndexStore {
   /// Creates every structural table and lookup index. Safe on every startup.
   pub fn ensure_base_schema(&self) -> Result<()> {
      self.conn().execute_batch(BASE_SCHEMA)?;
      Ok(())
   }

   /// Adds the freshness columns to `repo` when they are missing.
   ///
   /// No-op when `repo` does not exist yet. Rows that predate the columns are
   /// left dirty: a repository is never assumed clean because it has no
   /// history.
   pub fn ensure_repo_meta_columns(&self) -> Result<()> {
      self.migrate_repo_meta_columns().map_err(|e| match e {
         Error::Sqlite(inner) => Error::Migration(inner.to_string()),
         other => other,
      })
   }

   fn migrate_repo_meta_columns(&self) -> Result<()> {
      if !self.table_exists("repo")? {
         return Ok(());
      }

      let mut added = false;
      if !self.has_column("repo", "fts_last_indexed_at")? {
         self
            .conn()
            .execute("ALTER TABLE repo ADD COLUMN fts_last_indexed_at TEXT", [])?;
         added = true;
      }
      if !self.has_column("repo", "fts_dirty")? {
         self.conn().execute(
            "ALTER TABLE repo ADD COLUMN fts_dirty INTEGER NOT NULL DEFAULT 1",
            [],
         )?;
         added = true;
      }

      if added {
         let marked = self.conn().execute(
            "UPDATE repo SET fts_dirty = 1 WHERE fts_last_indexed_at IS NULL",
            params![],
         )?;
         tracing::info!(marked, "added freshness columns to repo registry");
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use std::path::Path;

   use super::*;

   #[test]
   fn base_schema_is_idempotent() {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_base_schema().unwrap();
      store.ensure_base_schema().unwrap();
      for table in
         ["repo", "blob", "tree", "file", "symbol", "snippet", "dependency", "file_embedding"]
      {
         assert!(store.table_exists(table).unwrap(), "{table} missing");
      }
   }

   #[test]
   fn dependency_edges_are_stored_once() {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_base_schema().unwrap();
      store.ensure_repo_meta_columns().unwrap();
      let repo = store.resolve_repo_id(Path::new("/repo")).unwrap();
      store.put_dependency(repo, "src/main.rs", "src/config.rs").unwrap();
      store.put_dependency(repo, "src/main.rs", "src/config.rs").unwrap();
      store.put_dependency(repo, "src/main.rs", "src/util.rs").unwrap();

      let edges: i64 = store
         .conn()
         .query_row("SELECT COUNT(*) FROM dependency WHERE repo_id = ?1", [repo], |r| r.get(0))
         .unwrap();
      assert_eq!(edges, 2);
   }

   #[test]
   fn meta_columns_noop_without_registry() {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_repo_meta_columns().unwrap();
      assert!(!store.table_exists("repo").unwrap());
   }

   #[test]
   fn legacy_rows_are_marked_dirty() {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_base_schema().unwrap();
      store
         .conn()
         .execute("INSERT INTO repo (root) VALUES ('/legacy')", [])
         .unwrap();

      store.ensure_repo_meta_columns().unwrap();
      store.ensure_repo_meta_columns().unwrap();

      let (dirty, stamp): (bool, Option<String>) = store
         .conn()
         .query_row("SELECT fts_dirty, fts_last_indexed_at FROM repo", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
         })
         .unwrap();
      assert!(dirty);
      assert!(stamp.is_none());
   }

   #[test]
   fn migration_failure_is_reported_as_migration() {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_base_schema().unwrap();
      store.conn().execute_batch("PRAGMA query_only = ON;").unwrap();

      let err = store.ensure_repo_meta_columns().unwrap_err();
      assert!(matches!(err, Error::Migration(_)), "got {err}");
   }
}
