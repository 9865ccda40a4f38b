//! Retrieval tools served by the daemon: keyword file search and context
//! bundles ranked by the weighted scorer.
//!
//! Both tools run against one of two backends. The full-text backend queries
//! the FTS5 index and orders by bm25; the scan backend is a case-insensitive
//! `LIKE` pass over the content store, used while the index is degraded.

pub mod profile;
pub mod scoring;

use std::{
   collections::{BTreeMap, BTreeSet},
   path::Path,
   sync::LazyLock,
};

use regex::Regex;
use rusqlite::{OptionalExtension, params, params_from_iter, types::Value};
use serde::{Deserialize, Serialize};

use self::scoring::{ContextSignals, directory_proximity, rank_order, score};
use crate::{
   Result,
   config::Config,
   error::Error,
   security::Redactor,
   store::{IndexStore, RepoId},
};

const MAX_KEYWORDS: usize = 12;
const MAX_SEARCH_LIMIT: usize = 200;
const BUNDLE_CANDIDATE_FACTOR: usize = 4;
const SIBLING_LIMIT: usize = 32;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9_]{2,}").unwrap());

/// Which query path serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
   FullText,
   Scan,
}

/// Everything a tool needs to answer one request.
pub struct SearchContext<'a> {
   pub store:    &'a IndexStore,
   pub repo_id:  RepoId,
   pub config:   &'a Config,
   pub redactor: &'a Redactor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilesSearchParams {
   pub query:       String,
   #[serde(default)]
   pub limit:       Option<usize>,
   #[serde(default)]
   pub lang:        Option<String>,
   #[serde(default)]
   pub ext:         Option<String>,
   #[serde(default)]
   pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileHit {
   pub path:    String,
   pub lang:    Option<String>,
   pub ext:     Option<String>,
   pub line:    usize,
   pub preview: String,
   pub score:   f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleArtifacts {
   #[serde(default)]
   pub editing_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextBundleParams {
   pub goal:      String,
   #[serde(default)]
   pub limit:     Option<usize>,
   #[serde(default)]
   pub profile:   Option<String>,
   #[serde(default)]
   pub artifacts: Option<BundleArtifacts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
   pub path:    String,
   pub range:   [usize; 2],
   pub why:     Vec<String>,
   pub score:   f64,
   pub preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
   pub context: Vec<ContextItem>,
}

/// Lowercased, deduplicated search terms in first-seen order.
pub fn extract_keywords(text: &str) -> Vec<String> {
   let mut seen = BTreeSet::new();
   WORD
      .find_iter(text)
      .map(|m| m.as_str().to_lowercase())
      .filter(|w| seen.insert(w.clone()))
      .take(MAX_KEYWORDS)
      .collect()
}

fn fts_query(keywords: &[String]) -> String {
   keywords
      .iter()
      .map(|k| format!("\"{}\"", k.replace('"', "\"\"")))
      .collect::<Vec<_>>()
      .join(" OR ")
}

fn like_pattern(raw: &str) -> String {
   let mut out = String::with_capacity(raw.len() + 2);
   for c in raw.chars() {
      if matches!(c, '%' | '_' | '\\') {
         out.push('\\');
      }
      out.push(c);
   }
   out
}

fn normalize_ext(ext: &str) -> String {
   if ext.starts_with('.') { ext.to_string() } else { format!(".{ext}") }
}

/// 1-based line of the first keyword occurrence, or 1.
fn first_match_line(content: &str, keywords: &[String]) -> usize {
   content
      .lines()
      .position(|line| {
         let line = line.to_lowercase();
         keywords.iter().any(|k| line.contains(k.as_str()))
      })
      .map_or(1, |idx| idx + 1)
}

/// Up to `lines` lines starting at `start`, with the inclusive range actually
/// covered.
fn line_window(content: &str, start: usize, lines: usize) -> (String, [usize; 2]) {
   let total = content.lines().count().max(1);
   let start = start.clamp(1, total);
   let end = start.saturating_add(lines.max(1) - 1).min(total);
   let text = content
      .lines()
      .skip(start - 1)
      .take(end + 1 - start)
      .collect::<Vec<_>>()
      .join("\n");
   (text, [start, end])
}

#[derive(Debug, Clone)]
struct RawHit {
   path:    String,
   lang:    Option<String>,
   ext:     Option<String>,
   content: String,
   score:   f64,
}

struct Filters {
   lang:        Option<String>,
   ext:         Option<String>,
   path_prefix: Option<String>,
}

impl Filters {
   fn none() -> Self {
      Self { lang: None, ext: None, path_prefix: None }
   }

   fn values(&self) -> [Value; 3] {
      let opt = |v: &Option<String>| v.clone().map_or(Value::Null, Value::Text);
      [
         opt(&self.lang),
         self
            .ext
            .as_deref()
            .map_or(Value::Null, |e| Value::Text(normalize_ext(e))),
         self
            .path_prefix
            .as_deref()
            .map_or(Value::Null, |p| Value::Text(format!("{}%", like_pattern(p)))),
      ]
   }
}

const FILTER_SQL: &str = "(?2 IS NULL OR f.lang = ?2) AND (?3 IS NULL OR f.ext = ?3) AND (?4 IS \
                          NULL OR f.path LIKE ?4 ESCAPE '\\')";

fn text_hits(
   ctx: &SearchContext<'_>,
   keywords: &[String],
   filters: &Filters,
   limit: usize,
   backend: Backend,
) -> Result<Vec<RawHit>> {
   if keywords.is_empty() {
      return Ok(Vec::new());
   }
   let [lang, ext, prefix] = filters.values();

   let mut hits = match backend {
      Backend::FullText => {
         let sql = format!(
            "SELECT f.path, f.lang, f.ext, b.content, bm25(blob_fts) AS rank
             FROM blob_fts
             JOIN blob b ON b.rowid = blob_fts.rowid
             JOIN file f ON f.blob_hash = b.hash
             WHERE blob_fts MATCH ?5 AND f.repo_id = ?1 AND {FILTER_SQL}
             ORDER BY rank, f.path
             LIMIT ?6"
         );
         let mut stmt = ctx.store.conn().prepare(&sql)?;
         let rows = stmt.query_map(
            params![ctx.repo_id, lang, ext, prefix, fts_query(keywords), limit as i64],
            |row| {
               let rank: f64 = row.get(4)?;
               Ok(RawHit {
                  path:    row.get(0)?,
                  lang:    row.get(1)?,
                  ext:     row.get(2)?,
                  content: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                  score:   -rank,
               })
            },
         )?;
         rows.collect::<rusqlite::Result<Vec<_>>>()?
      },
      Backend::Scan => {
         let clauses = (0..keywords.len())
            .map(|i| format!("b.content LIKE ?{} ESCAPE '\\'", i + 5))
            .collect::<Vec<_>>()
            .join(" OR ");
         let sql = format!(
            "SELECT f.path, f.lang, f.ext, b.content
             FROM file f JOIN blob b ON b.hash = f.blob_hash
             WHERE f.repo_id = ?1 AND f.is_binary = 0 AND {FILTER_SQL} AND ({clauses})"
         );
         let mut values = vec![Value::Integer(ctx.repo_id), lang, ext, prefix];
         values.extend(
            keywords
               .iter()
               .map(|k| Value::Text(format!("%{}%", like_pattern(k)))),
         );

         let mut stmt = ctx.store.conn().prepare(&sql)?;
         let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(RawHit {
               path:    row.get(0)?,
               lang:    row.get(1)?,
               ext:     row.get(2)?,
               content: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
               score:   0.0,
            })
         })?;
         let mut hits = rows.collect::<rusqlite::Result<Vec<_>>>()?;
         for hit in &mut hits {
            let lower = hit.content.to_lowercase();
            let matched = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
            hit.score = matched as f64 / keywords.len() as f64;
         }
         hits
      },
   };

   hits.sort_by(|a, b| rank_order(a.score, &a.path, b.score, &b.path));
   hits.truncate(limit);
   Ok(hits)
}

/// `files.search`: files whose content matches any keyword of the query.
pub fn files_search(
   ctx: &SearchContext<'_>,
   params: &FilesSearchParams,
   backend: Backend,
) -> Result<Vec<FileHit>> {
   let keywords = extract_keywords(&params.query);
   if keywords.is_empty() {
      return Err(Error::InvalidParams("query must contain at least one word".to_string()));
   }
   let limit = params
      .limit
      .unwrap_or(ctx.config.search_default_limit)
      .clamp(1, MAX_SEARCH_LIMIT);
   let filters = Filters {
      lang:        params.lang.clone(),
      ext:         params.ext.clone(),
      path_prefix: params.path_prefix.clone(),
   };

   let hits = text_hits(ctx, &keywords, &filters, limit, backend)?;
   Ok(hits
      .into_iter()
      .map(|hit| {
         let line = first_match_line(&hit.content, &keywords);
         let lines = ctx.config.effective_preview_lines();
         let (preview, _) = line_window(&hit.content, line, lines);
         FileHit {
            path: hit.path,
            lang: hit.lang,
            ext: hit.ext,
            line,
            preview: ctx.redactor.redact(&preview),
            score: hit.score,
         }
      })
      .collect())
}

#[derive(Debug, Default)]
struct Candidate {
   content: String,
   line:    usize,
   signals: ContextSignals,
   why:     Vec<String>,
}

fn load_content(ctx: &SearchContext<'_>, path: &str) -> Result<Option<String>> {
   Ok(ctx
      .store
      .conn()
      .query_row(
         "SELECT b.content FROM file f JOIN blob b ON b.hash = f.blob_hash
          WHERE f.repo_id = ?1 AND f.path = ?2",
         params![ctx.repo_id, path],
         |row| row.get::<_, Option<String>>(0),
      )
      .optional()?
      .map(Option::unwrap_or_default))
}

/// Import edges touching `path` in either direction, with the reason tag.
fn dependency_neighbors(ctx: &SearchContext<'_>, path: &str) -> Result<Vec<(String, String)>> {
   let mut stmt = ctx.store.conn().prepare(
      "SELECT dst, 'dep:imported-by-editing' FROM dependency
        WHERE repo_id = ?1 AND src_path = ?2 AND dst_kind = 'path'
       UNION
       SELECT src_path, 'dep:imports-editing' FROM dependency
        WHERE repo_id = ?1 AND dst = ?2 AND dst_kind = 'path'",
   )?;
   let rows = stmt.query_map(params![ctx.repo_id, path], |row| Ok((row.get(0)?, row.get(1)?)))?;
   Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn siblings(ctx: &SearchContext<'_>, path: &str) -> Result<Vec<String>> {
   let parent = Path::new(path)
      .parent()
      .map(|p| p.to_string_lossy().into_owned())
      .unwrap_or_default();
   let prefix = if parent.is_empty() { String::new() } else { format!("{parent}/") };
   let mut stmt = ctx.store.conn().prepare(
      "SELECT path FROM file WHERE repo_id = ?1 AND path LIKE ?2 ESCAPE '\\' AND path != ?3
       ORDER BY path",
   )?;
   let rows = stmt.query_map(
      params![ctx.repo_id, format!("{}%", like_pattern(&prefix)), path],
      |row| row.get::<_, String>(0),
   )?;
   let mut out = Vec::new();
   for row in rows {
      let candidate = row?;
      if candidate.get(prefix.len()..).is_some_and(|rest| !rest.contains('/')) {
         out.push(candidate);
         if out.len() >= SIBLING_LIMIT {
            break;
         }
      }
   }
   Ok(out)
}

/// `context.bundle`: ranks files relevant to a goal, boosted by the file the
/// caller is editing and its dependency and directory neighborhood.
pub fn context_bundle(
   ctx: &SearchContext<'_>,
   params: &ContextBundleParams,
   backend: Backend,
) -> Result<ContextBundle> {
   if params.goal.trim().is_empty() {
      return Err(Error::InvalidParams("goal must not be empty".to_string()));
   }
   let limit = ctx.config.effective_bundle_limit(params.limit);
   let weights = profile::load_scoring_profile(params.profile.as_deref(), ctx.config);
   let editing = params
      .artifacts
      .as_ref()
      .and_then(|a| a.editing_path.as_deref())
      .map(|p| p.trim_start_matches("./").to_string());

   let keywords = extract_keywords(&params.goal);
   let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();

   let hits = text_hits(
      ctx,
      &keywords,
      &Filters::none(),
      limit.saturating_mul(BUNDLE_CANDIDATE_FACTOR),
      backend,
   )?;
   let best = hits.iter().map(|h| h.score).fold(0.0_f64, f64::max);
   for hit in hits {
      let strength = if best > 0.0 { hit.score / best } else { 1.0 };
      let line = first_match_line(&hit.content, &keywords);
      let entry = candidates.entry(hit.path).or_default();
      entry.line = line;
      entry.content = hit.content;
      entry.signals.text_match = strength;
      entry.why.push(format!("text:{}", keywords.join(",")));
   }

   if let Some(editing) = editing.as_deref() {
      if let Some(content) = load_content(ctx, editing)? {
         let entry = candidates.entry(editing.to_string()).or_default();
         if entry.content.is_empty() {
            entry.content = content;
            entry.line = 1;
         }
         entry.signals.editing_path = 1.0;
         entry.why.push("editing".to_string());
      }

      for (other, rel) in dependency_neighbors(ctx, editing)? {
         if !candidates.contains_key(&other) {
            let Some(content) = load_content(ctx, &other)? else {
               continue;
            };
            candidates.insert(other.clone(), Candidate { content, line: 1, ..Candidate::default() });
         }
         if let Some(entry) = candidates.get_mut(&other) {
            entry.signals.dependency = 1.0;
            entry.why.push(rel);
         }
      }

      for sibling in siblings(ctx, editing)? {
         if candidates.contains_key(&sibling) {
            continue;
         }
         if let Some(content) = load_content(ctx, &sibling)? {
            candidates.insert(sibling, Candidate { content, line: 1, ..Candidate::default() });
         }
      }

      for (path, entry) in &mut candidates {
         if path == editing {
            continue;
         }
         let near = directory_proximity(path, editing);
         entry.signals.proximity = near;
         if near >= 1.0 {
            entry.why.push("near:editing".to_string());
         }
      }
   }

   let mut items: Vec<ContextItem> = candidates
      .into_iter()
      .filter(|(_, c)| !c.why.is_empty())
      .map(|(path, c)| {
         let lines = ctx.config.effective_preview_lines();
         let (preview, range) = line_window(&c.content, c.line, lines);
         ContextItem {
            score: score(&c.signals, &weights),
            range,
            why: c.why,
            preview: ctx.redactor.redact(&preview),
            path,
         }
      })
      .collect();
   items.sort_by(|a, b| rank_order(a.score, &a.path, b.score, &b.path));
   items.truncate(limit);

   Ok(ContextBundle { context: items })
}

#[cfg(test)]
mod tests {
   use super::*;

   fn seeded() -> (IndexStore, RepoId) {
      let store = IndexStore::open_in_memory().unwrap();
      store.ensure_base_schema().unwrap();
      store.ensure_repo_meta_columns().unwrap();
      let repo = store.resolve_repo_id(Path::new("/repo")).unwrap();
      store
         .put_file(repo, "src/config.rs", "use serde;\n\npub fn load_config() {}\n")
         .unwrap();
      store
         .put_file(repo, "src/main.rs", "mod config;\nfn main() { config::load_config(); }\n")
         .unwrap();
      store
         .put_file(repo, "src/util.rs", "pub fn helper() {}\n")
         .unwrap();
      store
         .put_file(repo, "docs/guide.md", "Configure with LOAD_CONFIG\n")
         .unwrap();
      store
         .put_dependency(repo, "src/main.rs", "src/config.rs")
         .unwrap();
      (store, repo)
   }

   fn ctx<'a>(
      store: &'a IndexStore,
      repo_id: RepoId,
      config: &'a Config,
      redactor: &'a Redactor,
   ) -> SearchContext<'a> {
      SearchContext { store, repo_id, config, redactor }
   }

   #[test]
   fn keywords_are_lowercased_and_unique() {
      assert_eq!(extract_keywords("Load load CONFIG a"), vec!["load", "config"]);
   }

   #[test]
   fn line_window_stays_within_content() {
      let content = "one\ntwo\nthree\nfour";
      assert_eq!(line_window(content, 2, 2), ("two\nthree".to_string(), [2, 3]));
      assert_eq!(line_window(content, 3, usize::MAX), ("three\nfour".to_string(), [3, 4]));
      assert_eq!(line_window(content, usize::MAX, usize::MAX).1, [4, 4]);
   }

   #[test]
   fn scan_backend_is_case_insensitive() {
      let (store, repo) = seeded();
      let cfg = Config::default();
      let redactor = Redactor::default();
      let params = FilesSearchParams { query: "load_config".into(), ..Default::default() };
      let hits = files_search(&ctx(&store, repo, &cfg, &redactor), &params, Backend::Scan).unwrap();
      let paths: Vec<_> = hits.iter().map(|h| h.path.as_str()).collect();
      assert_eq!(paths, vec!["docs/guide.md", "src/config.rs", "src/main.rs"]);
      assert_eq!(hits[1].line, 3);
   }

   #[test]
   fn filters_narrow_results() {
      let (store, repo) = seeded();
      let cfg = Config::default();
      let redactor = Redactor::default();
      let params = FilesSearchParams {
         query: "load_config".into(),
         ext: Some("rs".into()),
         path_prefix: Some("src/m".into()),
         ..Default::default()
      };
      let hits = files_search(&ctx(&store, repo, &cfg, &redactor), &params, Backend::Scan).unwrap();
      assert_eq!(hits.len(), 1);
      assert_eq!(hits[0].path, "src/main.rs");
   }

   #[test]
   fn full_text_backend_matches_after_build() {
      let (mut store, repo) = seeded();
      assert!(store.try_build_full_text_index(false).is_ready());
      let cfg = Config::default();
      let redactor = Redactor::default();
      let params = FilesSearchParams { query: "helper".into(), ..Default::default() };
      let hits =
         files_search(&ctx(&store, repo, &cfg, &redactor), &params, Backend::FullText).unwrap();
      assert_eq!(hits.len(), 1);
      assert_eq!(hits[0].path, "src/util.rs");
   }

   #[test]
   fn empty_query_is_invalid() {
      let (store, repo) = seeded();
      let cfg = Config::default();
      let redactor = Redactor::default();
      let params = FilesSearchParams { query: "  ".into(), ..Default::default() };
      let err = files_search(&ctx(&store, repo, &cfg, &redactor), &params, Backend::Scan).unwrap_err();
      assert!(matches!(err, Error::InvalidParams(_)));
   }

   #[test]
   fn bundle_ranks_editing_file_first() {
      let (store, repo) = seeded();
      let cfg = Config::default();
      let redactor = Redactor::default();
      let params = ContextBundleParams {
         goal: "load config".into(),
         artifacts: Some(BundleArtifacts { editing_path: Some("src/main.rs".into()) }),
         ..Default::default()
      };
      let bundle =
         context_bundle(&ctx(&store, repo, &cfg, &redactor), &params, Backend::Scan).unwrap();
      assert_eq!(bundle.context[0].path, "src/main.rs");
      assert!(bundle.context[0].why.contains(&"editing".to_string()));

      let config = bundle
         .context
         .iter()
         .find(|c| c.path == "src/config.rs")
         .expect("dependency candidate");
      assert!(config.why.iter().any(|w| w.starts_with("dep:")));
      assert!(config.why.contains(&"near:editing".to_string()));
   }

   #[test]
   fn bundle_is_deterministic() {
      let (store, repo) = seeded();
      let cfg = Config::default();
      let redactor = Redactor::default();
      let params = ContextBundleParams { goal: "config".into(), ..Default::default() };
      let c = ctx(&store, repo, &cfg, &redactor);
      let a = context_bundle(&c, &params, Backend::Scan).unwrap();
      let b = context_bundle(&c, &params, Backend::Scan).unwrap();
      let paths = |b: &ContextBundle| b.context.iter().map(|c| c.path.clone()).collect::<Vec<_>>();
      assert_eq!(paths(&a), paths(&b));
   }
}
