//! Index store: a SQLite database holding the content store, structural
//! tables and the FTS5 secondary index.

mod fts;
mod schema;

use std::{
   path::{Path, PathBuf},
   time::Duration,
};

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

pub use self::fts::{FTS_SHADOW_TABLES, FTS_TABLE, FtsAvailability, FtsBuildOutcome, RebuildReport};
use crate::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type RepoId = i64;

/// Handle to one index store file.
pub struct IndexStore {
   conn:        Connection,
   path:        Option<PathBuf>,
   fts_enabled: bool,
}

impl IndexStore {
   /// Opens (or creates) the store at `path`.
   pub fn open(path: &Path) -> Result<Self> {
      let conn = Connection::open(path)?;
      conn.busy_timeout(BUSY_TIMEOUT)?;
      // WAL lets readers proceed while an indexing pass writes.
      let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
      conn.execute_batch("PRAGMA foreign_keys = ON;")?;
      Ok(Self { conn, path: Some(path.to_path_buf()), fts_enabled: true })
   }

   pub fn open_in_memory() -> Result<Self> {
      let conn = Connection::open_in_memory()?;
      Ok(Self { conn, path: None, fts_enabled: true })
   }

   /// Disables the full-text capability regardless of what SQLite supports.
   pub fn with_fts_enabled(mut self, enabled: bool) -> Self {
      self.fts_enabled = enabled;
      self
   }

   pub fn path(&self) -> Option<&Path> {
      self.path.as_deref()
   }

   pub const fn conn(&self) -> &Connection {
      &self.conn
   }

   pub fn conn_mut(&mut self) -> &mut Connection {
      &mut self.conn
   }

   /// Opens the store, creates the base schema and runs the freshness
   /// migration. Migration failures are fatal.
   pub fn open_and_migrate(path: &Path, fts_enabled: bool) -> Result<Self> {
      let mut store = Self::open(path)?.with_fts_enabled(fts_enabled);
      store.ensure_base_schema()?;
      store.ensure_repo_meta_columns()?;
      Ok(store)
   }

   /// Finds the registry row for `root`, creating it if needed. New rows start
   /// dirty and without a freshness timestamp.
   pub fn resolve_repo_id(&self, root: &Path) -> Result<RepoId> {
      let root = root.to_string_lossy();
      let existing: Option<RepoId> = self
         .conn
         .query_row("SELECT id FROM repo WHERE root = ?1", params![root], |row| row.get(0))
         .optional()?;
      if let Some(id) = existing {
         return Ok(id);
      }

      self.conn.execute(
         "INSERT INTO repo (root, indexed_at) VALUES (?1, ?2)",
         params![root, now_rfc3339()],
      )?;
      Ok(self.conn.last_insert_rowid())
   }

   pub fn repo_root(&self, repo_id: RepoId) -> Result<Option<String>> {
      Ok(self
         .conn
         .query_row("SELECT root FROM repo WHERE id = ?1", params![repo_id], |row| row.get(0))
         .optional()?)
   }

   pub fn table_exists(&self, name: &str) -> Result<bool> {
      let count: i64 = self.conn.query_row(
         "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
         params![name],
         |row| row.get(0),
      )?;
      Ok(count > 0)
   }

   /// Writes one text file and its blob into the content store, the way the
   /// crawler does. The full-text index is not touched; callers mark the repo
   /// dirty.
   pub fn put_file(&self, repo_id: RepoId, path: &str, content: &str) -> Result<()> {
      let hash = hex::encode(Sha256::digest(content.as_bytes()));
      let ext = path
         .rsplit_once('.')
         .filter(|(_, ext)| !ext.contains('/'))
         .map(|(_, ext)| format!(".{ext}"));
      let lang = ext.as_deref().map(lang_for_ext);
      self.conn.execute(
         "INSERT OR IGNORE INTO blob (hash, size_bytes, line_count, content) VALUES (?1, ?2, ?3, \
          ?4)",
         params![hash, content.len() as i64, content.lines().count() as i64, content],
      )?;
      self.conn.execute(
         "INSERT OR REPLACE INTO file (repo_id, path, blob_hash, ext, lang, is_binary, mtime) \
          VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
         params![repo_id, path, hash, ext, lang, now_rfc3339()],
      )?;
      Ok(())
   }

   /// Records an import edge between two repository paths.
   pub fn put_dependency(&self, repo_id: RepoId, src_path: &str, dst_path: &str) -> Result<()> {
      self.conn.execute(
         "INSERT OR IGNORE INTO dependency (repo_id, src_path, dst_kind, dst, rel) VALUES (?1, ?2, \
          'path', ?3, 'import')",
         params![repo_id, src_path, dst_path],
      )?;
      Ok(())
   }

   pub fn has_column(&self, table: &str, column: &str) -> Result<bool> {
      let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
      let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
      for name in names {
         if name? == column {
            return Ok(true);
         }
      }
      Ok(false)
   }
}

pub fn now_rfc3339() -> String {
   Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Best-effort language tag from a file extension.
pub fn lang_for_ext(ext: &str) -> &'static str {
   match ext {
      ".rs" => "rust",
      ".ts" | ".tsx" => "typescript",
      ".js" | ".jsx" => "javascript",
      ".py" => "python",
      ".go" => "go",
      ".md" => "markdown",
      _ => "text",
   }
}
