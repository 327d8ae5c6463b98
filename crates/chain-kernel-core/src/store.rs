use time::OffsetDateTime;

use crate::retention::{self, PatternMatcher};
use crate::tuple::Tuples;
use crate::{CancelToken, ChainError, DeleteReason, MessageId, MessageMeta, MessageRecord, UserHash};

/// One continuation observed by a scan.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Candidate<'a> {
    /// Full-entropy token, or empty for the end-of-message marker.
    pub suffix: &'a str,
    pub id: &'a MessageId,
}

/// Returned by scan visitors to keep reading or abandon the scan.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Persistence contract shared by the ordered key-value and relational backends.
///
/// Every operation is scoped by tag and honours the cancel token. Scans are
/// restartable and finite: each call reads the current committed state from the
/// beginning, skips soft-deleted records, and releases its cursor on return,
/// whether it finished, was stopped by the visitor, or was cancelled.
pub trait ChainStore {
    /// Prefix length of every persisted tuple.
    fn order(&self) -> usize;

    /// Persist the message record and all of its tuples atomically.
    ///
    /// # Errors
    /// [`ChainError::DuplicateMessage`] when `(tag, id)` already exists,
    /// [`ChainError::AlreadyForgotten`] when it was forgotten, and
    /// [`ChainError::EncodingInvariantViolation`] when the tuples are malformed.
    fn learn(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        meta: &MessageMeta,
        text: &str,
        tuples: &Tuples,
    ) -> Result<(), ChainError>;

    /// Visit live tuples whose leading prefix terms equal `prefix`.
    ///
    /// `prefix` holds between 1 and `order` reduced terms, most recent first; a
    /// shorter prefix matches on its terms only.
    ///
    /// # Errors
    /// Returns an error when the prefix length is out of range, the backend fails,
    /// or the token is cancelled mid-scan.
    fn scan_candidates(
        &self,
        cancel: &CancelToken,
        tag: &str,
        prefix: &[String],
        visit: &mut dyn FnMut(Candidate<'_>) -> ScanControl,
    ) -> Result<(), ChainError>;

    /// Visit live message-start tuples.
    ///
    /// # Errors
    /// Same as [`ChainStore::scan_candidates`].
    fn scan_start(
        &self,
        cancel: &CancelToken,
        tag: &str,
        visit: &mut dyn FnMut(Candidate<'_>) -> ScanControl,
    ) -> Result<(), ChainError> {
        let start = vec![String::new(); self.order()];
        self.scan_candidates(cancel, tag, &start, visit)
    }

    /// Soft-delete one message and its tuples. Forgetting a forgotten or unknown
    /// message succeeds; an unknown id is recorded so it can never be learned.
    ///
    /// # Errors
    /// Returns an error when the backend fails or the token is cancelled.
    fn forget_message(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        id: &MessageId,
        reason: DeleteReason,
    ) -> Result<(), ChainError>;

    /// Soft-delete every live message `user` sent at or after `since`, in any tag.
    /// Returns the number of messages newly forgotten.
    ///
    /// # Errors
    /// Returns an error when the backend fails or the token is cancelled.
    fn forget_user_since(
        &mut self,
        cancel: &CancelToken,
        user: &UserHash,
        since: OffsetDateTime,
    ) -> Result<usize, ChainError>;

    /// Soft-delete every live message in `tag` with `since <= time < before`.
    /// Returns the number of messages newly forgotten.
    ///
    /// # Errors
    /// Returns an error when the backend fails or the token is cancelled.
    fn forget_during(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        since: OffsetDateTime,
        before: OffsetDateTime,
    ) -> Result<usize, ChainError>;

    /// Visit the live message history of `tag`.
    ///
    /// # Errors
    /// Returns an error when the backend fails or the token is cancelled.
    fn scan_history(
        &self,
        cancel: &CancelToken,
        tag: &str,
        visit: &mut dyn FnMut(&MessageRecord) -> ScanControl,
    ) -> Result<(), ChainError>;

    /// Audit lookup of one message record, forgotten or not.
    ///
    /// # Errors
    /// Returns an error when the backend fails.
    fn message(&self, tag: &str, id: &MessageId) -> Result<Option<MessageRecord>, ChainError>;

    /// Physically remove chain entries of forgotten messages in `tag`, returning
    /// how many were removed. Backends that delete eagerly have nothing to do.
    ///
    /// # Errors
    /// Returns an error when the backend fails or the token is cancelled.
    fn compact(&mut self, cancel: &CancelToken, _tag: &str) -> Result<usize, ChainError> {
        cancel.check()?;
        Ok(0)
    }

    /// Forget every live message in `tag` whose text matches `pattern`.
    /// Returns the number of messages forgotten.
    ///
    /// # Errors
    /// Returns an error when the backend fails or the token is cancelled.
    fn forget_pattern(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        pattern: &PatternMatcher,
    ) -> Result<usize, ChainError> {
        retention::forget_pattern(self, cancel, tag, pattern)
    }
}
