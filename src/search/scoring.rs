//! Weighted ranking of context-bundle candidates.

use std::{cmp::Ordering, path::Path};

use super::profile::ScoringWeights;

/// Per-candidate signal strengths, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContextSignals {
   pub text_match:   f64,
   pub editing_path: f64,
   pub dependency:   f64,
   pub proximity:    f64,
}

impl ContextSignals {
   /// Clamps every signal into `[0, 1]`; NaN becomes 0.
   pub fn clamped(self) -> Self {
      let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
      Self {
         text_match:   clamp(self.text_match),
         editing_path: clamp(self.editing_path),
         dependency:   clamp(self.dependency),
         proximity:    clamp(self.proximity),
      }
   }
}

pub fn score(signals: &ContextSignals, weights: &ScoringWeights) -> f64 {
   let s = signals.clamped();
   weights.text_match * s.text_match
      + weights.editing_path * s.editing_path
      + weights.dependency * s.dependency
      + weights.proximity * s.proximity
}

/// Descending by score, then ascending by path.
pub fn rank_order(a_score: f64, a_path: &str, b_score: f64, b_path: &str) -> Ordering {
   b_score
      .partial_cmp(&a_score)
      .unwrap_or(Ordering::Equal)
      .then_with(|| a_path.cmp(b_path))
}

/// Directory proximity between a candidate and the focus file: 1 for the same
/// directory, halving with each directory step apart.
pub fn directory_proximity(candidate: &str, focus: &str) -> f64 {
   let dir = |p: &str| -> Vec<String> {
      Path::new(p)
         .parent()
         .map(|d| {
            d.components()
               .map(|c| c.as_os_str().to_string_lossy().into_owned())
               .collect()
         })
         .unwrap_or_default()
   };
   let (a, b) = (dir(candidate), dir(focus));
   let shared = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
   let steps = (a.len() - shared) + (b.len() - shared);
   0.5f64.powi(i32::try_from(steps).unwrap_or(i32::MAX))
}
