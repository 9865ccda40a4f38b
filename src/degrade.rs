//! Serving-mode decision: full-text, degraded substring scan, or refusal.

use parking_lot::RwLock;
use serde::Serialize;

use crate::store::{FtsAvailability, IndexStore};

/// Inputs gathered from the store at startup (or after a watch event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessProbe {
   pub fts:   FtsAvailability,
   /// Some repository in the registry is dirty or was never indexed.
   pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServingMode {
   Full,
   Degraded { reason: String },
   Refuse { reason: String },
}

impl ServingMode {
   pub const fn uses_fts(&self) -> bool {
      matches!(self, Self::Full)
   }

   /// Warning attached to every response in this mode.
   pub fn warning(&self) -> Option<String> {
      match self {
         Self::Degraded { reason } => {
            Some(format!("degraded mode: full-text index unusable ({reason}); using substring scan"))
         },
         _ => None,
      }
   }
}

/// Healthy and fresh serves in full; anything else degrades when the operator
/// allows it and refuses otherwise.
pub fn decide(probe: &FreshnessProbe, allow_degrade: bool) -> ServingMode {
   let reason = match (&probe.fts, probe.stale) {
      (FtsAvailability::Available, false) => return ServingMode::Full,
      (FtsAvailability::Unavailable { reason }, _) => reason.clone(),
      (FtsAvailability::Available, true) => {
         "full-text index is stale for at least one repository".to_string()
      },
   };

   if allow_degrade {
      ServingMode::Degraded { reason }
   } else {
      ServingMode::Refuse { reason }
   }
}

/// Reads the probe inputs. A failure to read staleness counts as stale.
pub fn probe(store: &IndexStore) -> FreshnessProbe {
   let fts = store.check_availability();
   let stale = store.any_repo_stale().unwrap_or_else(|e| {
      tracing::warn!("unable to read freshness flags, assuming stale: {e}");
      true
   });
   FreshnessProbe { fts, stale }
}

pub fn evaluate(store: &IndexStore, allow_degrade: bool) -> ServingMode {
   let mode = decide(&probe(store), allow_degrade);
   match &mode {
      ServingMode::Full => tracing::info!("serving with full-text index"),
      ServingMode::Degraded { reason } => tracing::warn!("serving degraded: {reason}"),
      ServingMode::Refuse { reason } => tracing::error!("refusing to serve: {reason}"),
   }
   mode
}

/// Current mode of a running daemon. Query failures demote it; a later
/// re-evaluation may restore full mode.
pub struct DegradeState {
   mode:          RwLock<ServingMode>,
   /// Why the index is behind while a strict daemon keeps serving it.
   stale:         RwLock<Option<String>>,
   allow_degrade: bool,
}

impl DegradeState {
   pub fn new(mode: ServingMode, allow_degrade: bool) -> Self {
      Self { mode: RwLock::new(mode), stale: RwLock::new(None), allow_degrade }
   }

   pub fn current(&self) -> ServingMode {
      self.mode.read().clone()
   }

   pub fn stale_reason(&self) -> Option<String> {
      self.stale.read().clone()
   }

   /// Warning for the next response: the degraded-mode warning, or a
   /// staleness notice when a strict daemon serves an index that fell behind.
   pub fn warning(&self) -> Option<String> {
      self.current().warning().or_else(|| {
         self
            .stale_reason()
            .map(|reason| format!("stale index: {reason}; results may be out of date"))
      })
   }

   pub const fn allow_degrade(&self) -> bool {
      self.allow_degrade
   }

   /// Switches to degraded after a runtime full-text failure. Returns false
   /// when degradation is not allowed and the caller must surface the error.
   pub fn demote(&self, reason: &str) -> bool {
      if !self.allow_degrade {
         return false;
      }
      let mut mode = self.mode.write();
      if mode.uses_fts() {
         tracing::warn!("demoting to degraded mode: {reason}");
         *mode = ServingMode::Degraded { reason: reason.to_string() };
      }
      true
   }

   /// Re-probes the store. A running daemon never switches to refusal; it
   /// keeps its previous mode and records the refusal reason as staleness.
   pub fn reevaluate(&self, store: &IndexStore) -> ServingMode {
      let next = decide(&probe(store), self.allow_degrade);
      if let ServingMode::Refuse { reason } = &next {
         let mut stale = self.stale.write();
         if stale.is_none() {
            tracing::warn!("index fell behind; serving it with a warning: {reason}");
         }
         *stale = Some(reason.clone());
         return self.current();
      }
      *self.stale.write() = None;
      let mut mode = self.mode.write();
      if *mode != next {
         tracing::info!(?next, "serving mode changed");
         *mode = next.clone();
      }
      next
   }
}
