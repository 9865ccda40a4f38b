//! Index maintenance command.
//!
//! Migrates the database and brings the full-text index up to date for one
//! repository. Content itself is written by whatever populates the store;
//! this command only reconciles the derived index.

use std::path::{Path, PathBuf};

use console::style;
use serde_json::json;

use crate::{
   Result,
   cmd::daemon,
   config,
   identity::DatabaseIdentity,
   store::{FtsBuildOutcome, IndexStore, RebuildReport},
};

/// Options of `kiri index`.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
   pub force_fts:  bool,
   pub mark_dirty: bool,
   pub json:       bool,
}

/// Runs the reconciliation against an open store.
pub fn reindex(store: &mut IndexStore, repo_root: &Path, opts: &IndexOptions) -> Result<RebuildReport> {
   let repo_id = store.resolve_repo_id(repo_root)?;
   if opts.mark_dirty {
      store.mark_dirty(repo_id)?;
   }
   store.rebuild_if_needed(repo_id, opts.force_fts)
}

/// Executes `kiri index`.
pub fn execute(repo: Option<PathBuf>, db: Option<PathBuf>, opts: IndexOptions) -> Result<()> {
   let cfg = config::get();
   let (repo_root, db_path) = daemon::resolve_target(repo.as_deref(), db.as_deref(), cfg)?;
   let identity = DatabaseIdentity::prepare(&db_path)?;

   let mut store = IndexStore::open_and_migrate(identity.db_path(), cfg.fts_enabled)?;
   let report = reindex(&mut store, &repo_root, &opts)?;
   let generation = store.fts_generation()?;
   tracing::info!(?report, generation, "index reconciled");

   if opts.json {
      let outcome = match &report.outcome {
         FtsBuildOutcome::Ready { rebuilt } => json!({ "status": "ready", "rebuilt": rebuilt }),
         FtsBuildOutcome::Unavailable { reason } => {
            json!({ "status": "unavailable", "reason": reason })
         },
      };
      let out = json!({
         "db_path": identity.db_path(),
         "was_dirty": report.was_dirty,
         "index_existed": report.index_existed,
         "fts": outcome,
         "fts_generation": generation,
      });
      println!("{}", serde_json::to_string_pretty(&out)?);
      return Ok(());
   }

   match &report.outcome {
      FtsBuildOutcome::Ready { rebuilt: true } => println!(
         "{} {}",
         style("Full-text index rebuilt").green(),
         style(format!("(generation {generation})")).dim()
      ),
      FtsBuildOutcome::Ready { rebuilt: false } => println!(
         "{} {}",
         style("Full-text index up to date").green(),
         style(format!("(generation {generation})")).dim()
      ),
      FtsBuildOutcome::Unavailable { reason } => {
         println!("{} {}", style("Full-text index unavailable:").yellow(), reason);
      },
   }
   Ok(())
}
