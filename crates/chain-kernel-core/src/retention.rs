use regex_lite::Regex;

use crate::store::{ChainStore, ScanControl};
use crate::{CancelToken, ChainError, DeleteReason, MessageId};

/// Compiled text pattern for bulk forgetting.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Regex,
}

impl PatternMatcher {
    /// # Errors
    /// Returns [`ChainError::InvalidPattern`] when the pattern is empty or fails to
    /// compile.
    pub fn new(pattern: &str) -> Result<Self, ChainError> {
        if pattern.is_empty() {
            return Err(ChainError::InvalidPattern("pattern MUST be non-empty".to_string()));
        }
        let regex = Regex::new(pattern).map_err(|err| ChainError::InvalidPattern(err.to_string()))?;
        Ok(Self { regex })
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

/// Forget every live message in `tag` whose history text matches `pattern`.
///
/// Matches are collected from the history scan first and then forgotten one by
/// one, so the scan never observes its own writes.
///
/// # Errors
/// Returns an error when the scan or any forget fails, or on cancellation.
pub fn forget_pattern<S: ChainStore + ?Sized>(
    store: &mut S,
    cancel: &CancelToken,
    tag: &str,
    pattern: &PatternMatcher,
) -> Result<usize, ChainError> {
    let mut matched: Vec<MessageId> = Vec::new();
    store.scan_history(cancel, tag, &mut |record| {
        if pattern.is_match(&record.text) {
            matched.push(record.id.clone());
        }
        ScanControl::Continue
    })?;

    for id in &matched {
        cancel.check()?;
        store.forget_message(cancel, tag, id, DeleteReason::Pattern)?;
    }
    tracing::info!(tag, pattern = pattern.as_str(), forgotten = matched.len(), "forgot by pattern");
    Ok(matched.len())
}

/// Forget every message that contributed to one generated message.
///
/// # Errors
/// Returns an error when any forget fails, or on cancellation.
pub fn forget_trace<S: ChainStore + ?Sized>(
    store: &mut S,
    cancel: &CancelToken,
    tag: &str,
    trace: &[MessageId],
) -> Result<(), ChainError> {
    for id in trace {
        cancel.check()?;
        store.forget_message(cancel, tag, id, DeleteReason::Message)?;
    }
    tracing::info!(tag, forgotten = trace.len(), "forgot generated message trace");
    Ok(())
}
