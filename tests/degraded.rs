mod support;

use std::{path::Path, sync::Arc};

use kiri::{
   config::Config,
   degrade::{self, DegradeState, ServingMode},
   identity::DatabaseIdentity,
   rpc::{self, ServerState},
   security::Redactor,
   store::IndexStore,
};
use serde_json::Value;

fn server(db: &Path, root: &Path, allow_degrade: bool) -> Arc<ServerState> {
   let store = IndexStore::open_and_migrate(db, true).unwrap();
   let repo_id = store.resolve_repo_id(root).unwrap();
   let mode = degrade::evaluate(&store, allow_degrade);
   Arc::new(ServerState::new(
      store,
      repo_id,
      root.to_path_buf(),
      DatabaseIdentity::resolve(db),
      DegradeState::new(mode, allow_degrade),
      Redactor::default(),
      Config::default(),
   ))
}

fn call(state: &ServerState, line: &str) -> Value {
   serde_json::to_value(rpc::handle_line(state, line).expect("response")).unwrap()
}

#[test]
fn never_indexed_store_is_stale() {
   let dir = tempfile::tempdir().unwrap();
   let store = IndexStore::open_and_migrate(&dir.path().join("index.db"), true).unwrap();
   store.resolve_repo_id(dir.path()).unwrap();

   let probe = degrade::probe(&store);
   assert!(probe.stale);
   assert!(!probe.fts.is_available());
   assert!(matches!(degrade::evaluate(&store, false), ServingMode::Refuse { .. }));
   assert!(matches!(degrade::evaluate(&store, true), ServingMode::Degraded { .. }));
}

#[test]
fn fresh_store_serves_full_without_warnings() {
   let dir = tempfile::tempdir().unwrap();
   let db = support::seeded_db(dir.path(), &dir.path().join("index.db"));
   let state = server(&db, dir.path(), false);
   assert_eq!(state.degrade.current(), ServingMode::Full);

   let hits = call(&state, r#"{"id":1,"method":"files.search","params":{"query":"load_config"}}"#);
   assert!(hits.get("warnings").is_none());
   let paths: Vec<&str> = hits["result"]
      .as_array()
      .unwrap()
      .iter()
      .filter_map(|h| h["path"].as_str())
      .collect();
   assert!(paths.contains(&"src/config.rs"), "{paths:?}");
}

#[test]
fn dirty_repo_degrades_every_response_when_allowed() {
   let dir = tempfile::tempdir().unwrap();
   let db = support::seeded_db(dir.path(), &dir.path().join("index.db"));
   {
      let store = IndexStore::open_and_migrate(&db, true).unwrap();
      let repo = store.resolve_repo_id(dir.path()).unwrap();
      store.mark_dirty(repo).unwrap();
   }

   let state = server(&db, dir.path(), true);
   assert!(matches!(state.degrade.current(), ServingMode::Degraded { .. }));

   let search = call(&state, r#"{"id":1,"method":"files.search","params":{"query":"config"}}"#);
   assert!(search["warnings"][0].as_str().unwrap().contains("degraded"));
   assert!(!search["result"].as_array().unwrap().is_empty());

   let bundle = call(
      &state,
      r#"{"id":2,"method":"context.bundle","params":{"goal":"tune the config loader"}}"#,
   );
   assert!(bundle["result"]["warnings"][0].as_str().unwrap().contains("degraded"));
   assert!(!bundle["result"]["context"].as_array().unwrap().is_empty());
}

#[test]
fn reindex_restores_full_mode_on_reevaluation() {
   let dir = tempfile::tempdir().unwrap();
   let db = support::seeded_db(dir.path(), &dir.path().join("index.db"));
   let state = server(&db, dir.path(), true);
   assert_eq!(state.degrade.current(), ServingMode::Full);

   {
      let store = state.store.lock();
      store.mark_dirty(state.repo_id).unwrap();
      assert!(matches!(state.degrade.reevaluate(&store), ServingMode::Degraded { .. }));
   }
   {
      let mut store = state.store.lock();
      store.rebuild_if_needed(state.repo_id, false).unwrap();
      assert_eq!(state.degrade.reevaluate(&store), ServingMode::Full);
   }
   let ping = call(&state, r#"{"id":1,"method":"ping"}"#);
   assert!(ping["result"].get("warnings").is_none());
}

#[test]
fn strict_daemon_keeps_serving_when_index_goes_stale() {
   let dir = tempfile::tempdir().unwrap();
   let db = support::seeded_db(dir.path(), &dir.path().join("index.db"));
   let state = server(&db, dir.path(), false);

   {
      let store = state.store.lock();
      store.mark_dirty(state.repo_id).unwrap();
      assert_eq!(state.degrade.reevaluate(&store), ServingMode::Full);
   }
   assert_eq!(state.degrade.current(), ServingMode::Full);
   assert!(state.degrade.stale_reason().is_some());

   let search = call(&state, r#"{"id":1,"method":"files.search","params":{"query":"config"}}"#);
   assert!(search["warnings"][0].as_str().unwrap().contains("stale index"));
   let status = call(&state, r#"{"id":2,"method":"status"}"#);
   assert_eq!(status["result"]["stale"], true);
   assert_eq!(status["result"]["serving"]["mode"], "full");

   {
      let mut store = state.store.lock();
      store.rebuild_if_needed(state.repo_id, false).unwrap();
      assert_eq!(state.degrade.reevaluate(&store), ServingMode::Full);
   }
   assert!(state.degrade.stale_reason().is_none());
   let search = call(&state, r#"{"id":3,"method":"files.search","params":{"query":"config"}}"#);
   assert!(search.get("warnings").is_none());
}

#[test]
fn status_reports_serving_mode() {
   let dir = tempfile::tempdir().unwrap();
   let db = support::seeded_db(dir.path(), &dir.path().join("index.db"));
   let state = server(&db, dir.path(), false);
   let status = call(&state, r#"{"id":9,"method":"status"}"#);
   assert_eq!(status["result"]["serving"]["mode"], "full");
   assert_eq!(status["result"]["repo_dirty"], false);
   assert_eq!(status["result"]["stale"], false);
   assert_eq!(status["result"]["fts_generation"], 1);
   let expected = DatabaseIdentity::resolve(&db).db_path().display().to_string();
   assert_eq!(status["result"]["db_path"], expected);
}
