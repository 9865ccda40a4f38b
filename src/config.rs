//! Configuration for daemon timeouts, retrieval limits and scoring profiles.

use std::{
   collections::BTreeMap,
   path::{Path, PathBuf},
   sync::OnceLock,
   time::Duration,
};

use directories::BaseDirs;
use figment::{
   Figment,
   providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
   error::{ConfigError, Result},
   search::profile::ScoringWeights,
};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub const MAX_BUNDLE_LIMIT_CAP: usize = 50;
pub const MAX_REQUEST_BYTES_CAP: usize = 16 * 1_048_576;
pub const MAX_PREVIEW_LINES: usize = 200;

/// Application configuration loaded from config files and environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
   pub probe_timeout_ms:         u64,
   pub ready_poll_interval_ms:   u64,
   pub ready_timeout_ms:         u64,
   pub startup_lock_timeout_ms:  u64,
   pub idle_timeout_secs:        u64,
   pub idle_check_interval_secs: u64,
   pub rpc_timeout_ms:           u64,

   pub max_request_bytes: usize,
   pub fts_enabled:       bool,
   pub watch_debounce_ms: u64,
   pub default_db_path:   PathBuf,

   pub search_default_limit: usize,
   pub bundle_default_limit: usize,
   pub bundle_max_limit:     usize,
   pub preview_lines:        usize,

   pub scoring_profile:  Option<String>,
   pub scoring_profiles: BTreeMap<String, ScoringWeights>,
}

impl Default for Config {
   fn default() -> Self {
      Self {
         probe_timeout_ms:         2000,
         ready_poll_interval_ms:   500,
         ready_timeout_ms:         10_000,
         startup_lock_timeout_ms:  15_000,
         idle_timeout_secs:        0,
         idle_check_interval_secs: 60,
         rpc_timeout_ms:           5000,
         max_request_bytes:        1_048_576,
         fts_enabled:              true,
         watch_debounce_ms:        500,
         default_db_path:          PathBuf::from(".kiri/index.sqlite"),
         search_default_limit:     20,
         bundle_default_limit:     7,
         bundle_max_limit:         20,
         preview_lines:            3,
         scoring_profile:          None,
         scoring_profiles:         BTreeMap::new(),
      }
   }
}

impl Config {
   pub fn load() -> Self {
      Self::load_with_repo_path(None)
   }

   pub fn load_with_repo(root: &Path) -> Self {
      Self::load_with_repo_path(Some(root))
   }

   fn load_with_repo_path(repo_root: Option<&Path>) -> Self {
      Self::figment(repo_root)
         .extract()
         .inspect_err(|e| tracing::warn!("failed to parse config: {e}"))
         .unwrap_or_default()
   }

   /// Builds the layered provider: defaults, then `~/.kiri/config.toml`, then
   /// the repository's `.kiri.toml`, then `KIRI_*` environment variables.
   pub fn figment(repo_root: Option<&Path>) -> Figment {
      let mut figment = Figment::from(Serialized::defaults(Self::default()));

      let global = config_file_path();
      if global.exists() {
         figment = figment.merge(Toml::file(global));
      }

      if let Some(root) = repo_root {
         let repo_path = repo_config_path(root);
         if repo_path.exists() {
            figment = figment.merge(Toml::file(repo_path));
         }
      }

      figment.merge(Env::prefixed("KIRI_").lowercase(true))
   }

   pub fn probe_timeout(&self) -> Duration {
      Duration::from_millis(self.probe_timeout_ms.max(1))
   }

   pub fn ready_poll_interval(&self) -> Duration {
      Duration::from_millis(self.ready_poll_interval_ms.max(10))
   }

   pub fn ready_timeout(&self) -> Duration {
      Duration::from_millis(self.ready_timeout_ms)
   }

   pub fn startup_lock_timeout(&self) -> Duration {
      Duration::from_millis(self.startup_lock_timeout_ms)
   }

   pub fn rpc_timeout(&self) -> Duration {
      Duration::from_millis(self.rpc_timeout_ms.max(1))
   }

   pub fn effective_max_request_bytes(&self) -> usize {
      self.max_request_bytes.clamp(1024, MAX_REQUEST_BYTES_CAP)
   }

   pub fn effective_preview_lines(&self) -> usize {
      self.preview_lines.clamp(1, MAX_PREVIEW_LINES)
   }

   pub fn effective_bundle_limit(&self, requested: Option<usize>) -> usize {
      let max = self.bundle_max_limit.clamp(1, MAX_BUNDLE_LIMIT_CAP);
      requested.unwrap_or(self.bundle_default_limit).clamp(1, max)
   }

   /// Resolves the database path for a repository root, honoring absolute
   /// overrides of `default_db_path`.
   pub fn db_path_for(&self, root: &Path) -> PathBuf {
      if self.default_db_path.is_absolute() {
         self.default_db_path.clone()
      } else {
         root.join(&self.default_db_path)
      }
   }
}

/// Returns the global configuration instance
pub fn get() -> &'static Config {
   CONFIG.get_or_init(Config::load)
}

/// Initializes config using a repo-root `.kiri.toml` if present.
pub fn init_for_root(root: &Path) -> &'static Config {
   let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
   CONFIG.get_or_init(|| Config::load_with_repo(&root))
}

/// Strict variant of [`Config::load_with_repo`] used by `kiri status --check-config`.
pub fn validate(root: Option<&Path>) -> Result<Config> {
   let cfg: Config = Config::figment(root)
      .extract()
      .map_err(|e| ConfigError::Invalid(e.to_string()))?;
   if !(1..=MAX_PREVIEW_LINES).contains(&cfg.preview_lines) {
      return Err(ConfigError::Invalid(format!(
         "preview_lines must be between 1 and {MAX_PREVIEW_LINES}, got {}",
         cfg.preview_lines
      ))
      .into());
   }
   Ok(cfg)
}

/// Returns the base directory for kiri configuration
pub fn base_dir() -> &'static PathBuf {
   static ONCE: OnceLock<PathBuf> = OnceLock::new();
   ONCE.get_or_init(|| resolve_base_dir(".kiri"))
}

pub fn config_file_path() -> PathBuf {
   base_dir().join("config.toml")
}

pub fn repo_config_path(root: &Path) -> PathBuf {
   root.join(".kiri.toml")
}

fn resolve_base_dir(dir_name: &str) -> PathBuf {
   BaseDirs::new()
      .map(|d| d.home_dir().join(dir_name))
      .or_else(|| {
         std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(dir_name))
      })
      .unwrap_or_else(|| {
         std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(dir_name)
      })
}
