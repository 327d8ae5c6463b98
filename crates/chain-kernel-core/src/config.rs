use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ChainError;

/// Tunables for learning and generation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of reduced terms in every tuple prefix.
    pub order: usize,
    /// Generation stops once the text reaches this many characters.
    pub max_chars: usize,
    /// Upper bound on walker steps, including backoff retries.
    pub max_iterations: usize,
    /// Back off to a shorter context when fewer candidates than this are seen.
    pub min_candidates: usize,
    /// Return accumulated text instead of an error when a store read fails mid-walk.
    pub best_effort: bool,
    /// Per-call deadline applied to every store operation.
    pub scan_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// # Errors
    /// Returns [`ChainError::Validation`] when a bound is zero.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.order == 0 {
            return Err(ChainError::Validation("order MUST be >= 1".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(ChainError::Validation("max_iterations MUST be >= 1".to_string()));
        }
        if self.min_candidates == 0 {
            return Err(ChainError::Validation("min_candidates MUST be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order: 3,
            max_chars: 500,
            max_iterations: 1024,
            min_candidates: 3,
            best_effort: false,
            scan_timeout_ms: None,
        }
    }
}
