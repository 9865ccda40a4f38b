use std::{path::Path, sync::Barrier, thread};

use kiri::store::{FtsBuildOutcome, IndexStore};

fn seeded(db: &Path) -> (IndexStore, i64) {
   let store = IndexStore::open_and_migrate(db, true).unwrap();
   let repo = store.resolve_repo_id(Path::new("/repo")).unwrap();
   store
      .put_file(repo, "src/lib.rs", "pub fn parse_config() -> Config { Config }\n")
      .unwrap();
   store
      .put_file(repo, "README.md", "Run the parser against your config.\n")
      .unwrap();
   (store, repo)
}

fn match_count(store: &IndexStore, term: &str) -> i64 {
   store
      .conn()
      .query_row("SELECT COUNT(*) FROM blob_fts WHERE blob_fts MATCH ?1", [term], |row| row.get(0))
      .unwrap()
}

#[test]
fn second_build_is_a_no_op() {
   let dir = tempfile::tempdir().unwrap();
   let (mut store, _) = seeded(&dir.path().join("index.db"));

   assert_eq!(store.try_build_full_text_index(false), FtsBuildOutcome::Ready { rebuilt: true });
   let structures = store.fts_structure_count().unwrap();
   assert!(structures > 1);

   assert_eq!(store.try_build_full_text_index(false), FtsBuildOutcome::Ready { rebuilt: false });
   assert_eq!(store.fts_structure_count().unwrap(), structures);
   assert_eq!(store.fts_generation().unwrap(), 1);
}

#[test]
fn dropped_index_is_rebuilt() {
   let dir = tempfile::tempdir().unwrap();
   let (mut store, _) = seeded(&dir.path().join("index.db"));
   assert!(store.try_build_full_text_index(false).rebuilt());

   store.conn().execute_batch("DROP TABLE blob_fts;").unwrap();
   assert!(!store.check_availability().is_available());
   assert_eq!(store.fts_structure_count().unwrap(), 0);

   assert!(store.try_build_full_text_index(false).rebuilt());
   assert!(store.check_availability().is_available());
   assert_eq!(match_count(&store, "parser"), 1);
   assert_eq!(store.fts_generation().unwrap(), 2);
}

#[test]
fn dirty_flag_clears_only_after_successful_rebuild() {
   let dir = tempfile::tempdir().unwrap();
   let (mut store, repo) = seeded(&dir.path().join("index.db"));
   assert!(store.repo_is_dirty(repo).unwrap(), "never-indexed repo counts as dirty");

   let report = store.rebuild_if_needed(repo, false).unwrap();
   assert!(report.was_dirty);
   assert!(!report.index_existed);
   assert!(report.outcome.rebuilt());
   assert!(!store.repo_is_dirty(repo).unwrap());
   assert!(!store.any_repo_stale().unwrap());

   let noop = store.rebuild_if_needed(repo, false).unwrap();
   assert!(!noop.was_dirty);
   assert!(!noop.outcome.rebuilt());
   assert_eq!(store.fts_generation().unwrap(), 1);

   store.put_file(repo, "src/new.rs", "fn freshly_added() {}\n").unwrap();
   store.mark_dirty(repo).unwrap();
   assert!(store.repo_is_dirty(repo).unwrap());
   assert_eq!(match_count(&store, "freshly_added"), 0);

   let report = store.rebuild_if_needed(repo, false).unwrap();
   assert!(report.was_dirty && report.index_existed && report.outcome.rebuilt());
   assert!(!store.repo_is_dirty(repo).unwrap());
   assert_eq!(match_count(&store, "freshly_added"), 1);
}

#[test]
fn failed_rebuild_leaves_repo_dirty() {
   let dir = tempfile::tempdir().unwrap();
   let db = dir.path().join("index.db");
   let (store, repo) = seeded(&db);
   let mut store = store.with_fts_enabled(false);

   let report = store.rebuild_if_needed(repo, true).unwrap();
   assert!(matches!(report.outcome, FtsBuildOutcome::Unavailable { .. }));
   assert!(store.repo_is_dirty(repo).unwrap());
   assert_eq!(store.fts_generation().unwrap(), 0);
}

#[test]
fn concurrent_builders_build_once() {
   let dir = tempfile::tempdir().unwrap();
   let db = dir.path().join("index.db");
   drop(seeded(&db));

   let barrier = Barrier::new(4);
   let outcomes: Vec<FtsBuildOutcome> = thread::scope(|scope| {
      let handles: Vec<_> = (0..4)
         .map(|_| {
            scope.spawn(|| {
               let mut store = IndexStore::open_and_migrate(&db, true).unwrap();
               barrier.wait();
               store.try_build_full_text_index(false)
            })
         })
         .collect();
      handles.into_iter().map(|h| h.join().unwrap()).collect()
   });

   assert!(outcomes.iter().all(FtsBuildOutcome::is_ready), "{outcomes:?}");
   assert_eq!(outcomes.iter().filter(|o| o.rebuilt()).count(), 1, "{outcomes:?}");

   let store = IndexStore::open_and_migrate(&db, true).unwrap();
   assert_eq!(store.fts_generation().unwrap(), 1);
   assert_eq!(match_count(&store, "parser"), 1);
}

#[test]
fn migration_is_additive_and_repeatable() {
   let dir = tempfile::tempdir().unwrap();
   let db = dir.path().join("index.db");
   let (store, repo) = seeded(&db);
   drop(store);

   let store = IndexStore::open_and_migrate(&db, true).unwrap();
   assert!(store.has_column("repo", "fts_dirty").unwrap());
   assert!(store.has_column("repo", "fts_last_indexed_at").unwrap());
   assert_eq!(store.repo_root(repo).unwrap().as_deref(), Some("/repo"));
}
