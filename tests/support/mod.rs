#![allow(dead_code)]

use std::path::{Path, PathBuf};

use kiri::{config::Config, store::IndexStore};

/// Config with timeouts short enough for tests to fail fast.
pub fn fast_config() -> Config {
   Config {
      probe_timeout_ms: 500,
      ready_poll_interval_ms: 50,
      ready_timeout_ms: 10_000,
      startup_lock_timeout_ms: 20_000,
      rpc_timeout_ms: 5_000,
      ..Config::default()
   }
}

/// Seeds a small repository into the store at `db` and builds its index.
pub fn seeded_db(root: &Path, db: &Path) -> PathBuf {
   let mut store = IndexStore::open_and_migrate(db, true).expect("open store");
   let repo = store.resolve_repo_id(root).expect("repo id");
   store
      .put_file(repo, "src/config.rs", "pub struct Config;\n\npub fn load_config() -> Config {\n   Config\n}\n")
      .expect("put");
   store
      .put_file(repo, "src/main.rs", "mod config;\n\nfn main() {\n   config::load_config();\n}\n")
      .expect("put");
   store
      .put_file(repo, "docs/guide.md", "# Guide\n\nEdit the config file to tune the daemon.\n")
      .expect("put");
   store
      .put_dependency(repo, "src/main.rs", "src/config.rs")
      .expect("dep");
   store.mark_dirty(repo).expect("dirty");
   let report = store.rebuild_if_needed(repo, false).expect("rebuild");
   assert!(report.outcome.is_ready(), "fts build failed: {:?}", report.outcome);
   db.to_path_buf()
}
