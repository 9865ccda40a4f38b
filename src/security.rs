//! Security config pinning and preview redaction.
//!
//! The optional security config lists tokens that must never leave the daemon
//! in a preview. Its sha256 is pinned in a lock file on first use so a later
//! start with an edited config is refused instead of silently trusted.

use std::{
   fs, io,
   path::{Path, PathBuf},
};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{Result, error::Error};

pub const DEFAULT_LOCK_NAME: &str = "security.lock";
pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
   pub sensitive_tokens: Vec<String>,
}

/// Lock file used when none is given: next to the database.
pub fn default_lock_path(db_path: &Path) -> PathBuf {
   db_path
      .parent()
      .map_or_else(|| PathBuf::from(DEFAULT_LOCK_NAME), |dir| dir.join(DEFAULT_LOCK_NAME))
}

pub fn config_digest(raw: &[u8]) -> String {
   hex::encode(Sha256::digest(raw))
}

/// Loads the config at `config_path` and checks it against `lock_path`.
///
/// Without a config the daemon runs with no sensitive tokens. A missing lock
/// is created from the current digest; a lock that disagrees is an error.
pub fn load_and_verify(config_path: Option<&Path>, lock_path: &Path) -> Result<SecurityConfig> {
   let Some(config_path) = config_path else {
      return Ok(SecurityConfig::default());
   };

   let raw = fs::read(config_path).map_err(|e| {
      Error::Security(format!("cannot read security config {}: {e}", config_path.display()))
   })?;
   let digest = config_digest(&raw);

   match fs::read_to_string(lock_path) {
      Ok(pinned) => {
         if pinned.trim() != digest {
            return Err(Error::Security(format!(
               "{} does not match the digest pinned in {}",
               config_path.display(),
               lock_path.display()
            )));
         }
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
         if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
         }
         fs::write(lock_path, format!("{digest}\n"))?;
         tracing::info!("pinned security config digest in {}", lock_path.display());
      },
      Err(e) => return Err(e.into()),
   }

   let text = String::from_utf8(raw)
      .map_err(|e| Error::Security(format!("security config is not utf-8: {e}")))?;
   Ok(toml::from_str(&text)?)
}

/// Replaces sensitive tokens in text handed back to clients.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
   tokens: Vec<String>,
}

impl Redactor {
   pub fn new(config: &SecurityConfig) -> Self {
      let mut tokens: Vec<String> = config
         .sensitive_tokens
         .iter()
         .filter(|t| !t.is_empty())
         .cloned()
         .collect();
      // Longest first so a token containing another is replaced whole.
      tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
      tokens.dedup();
      Self { tokens }
   }

   pub fn redact(&self, text: &str) -> String {
      let mut out = text.to_string();
      for token in &self.tokens {
         if out.contains(token.as_str()) {
            out = out.replace(token.as_str(), REDACTED);
         }
      }
      out
   }

   pub fn token_count(&self) -> usize {
      self.tokens.len()
   }
}
