//! Named weight profiles for context ranking.

use serde::{Deserialize, Serialize};

use crate::config::Config;

pub const DEFAULT_PROFILE: &str = "default";

/// Per-signal weights. A candidate's score is the weighted sum of its signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
   pub text_match:   f64,
   pub editing_path: f64,
   pub dependency:   f64,
   pub proximity:    f64,
}

impl ScoringWeights {
   pub const DEFAULT: Self =
      Self { text_match: 1.0, editing_path: 2.0, dependency: 0.5, proximity: 0.25 };
}

impl Default for ScoringWeights {
   fn default() -> Self {
      Self::DEFAULT
   }
}

fn builtin(name: &str) -> Option<ScoringWeights> {
   let (text_match, editing_path, dependency, proximity) = match name {
      DEFAULT_PROFILE => return Some(ScoringWeights::DEFAULT),
      // Keyword hits dominate; structure only breaks ties.
      "lexical" => (2.0, 1.0, 0.25, 0.1),
      // Favors the neighborhood of the file being edited.
      "structural" => (0.75, 2.5, 1.0, 0.5),
      _ => return None,
   };
   Some(ScoringWeights { text_match, editing_path, dependency, proximity })
}

/// Resolves a profile by name: configured profiles first, then built-ins.
/// Unknown and absent names fall back to `default`.
pub fn load_scoring_profile(name: Option<&str>, cfg: &Config) -> ScoringWeights {
   let Some(name) = name.or(cfg.scoring_profile.as_deref()) else {
      return ScoringWeights::DEFAULT;
   };

   if let Some(weights) = cfg.scoring_profiles.get(name) {
      return *weights;
   }
   builtin(name).unwrap_or_else(|| {
      tracing::debug!("unknown scoring profile {name:?}; using default");
      ScoringWeights::DEFAULT
   })
}
