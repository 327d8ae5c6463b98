use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod builder;
mod cancel;
mod config;
mod pool;
mod retention;
mod skip;
mod speak;
mod status;
mod store;
#[cfg(test)]
mod testing;
mod tokenize;
mod tuple;

pub use builder::MessageBuilder;
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use pool::{Pool, Pooled, Recycle};
pub use retention::{forget_pattern, forget_trace, PatternMatcher};
pub use skip::Skip;
pub use speak::{speak, Speech};
pub use status::{ForeignKeyViolation, IntegrityReport, SchemaStatus};
pub use store::{Candidate, ChainStore, ScanControl};
pub use tokenize::{is_article, reduce, tokenize, tokenize_into};
pub use tuple::{build_tuples, validate_tuples, Tuple, Tuples};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ChainError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("message {0} was already learned")]
    DuplicateMessage(MessageId),
    #[error("message {0} was forgotten and cannot be learned again")]
    AlreadyForgotten(MessageId),
    #[error("encoding invariant violated: {0}")]
    EncodingInvariantViolation(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

impl ChainError {
    /// Wrap a backend failure with the operation that was attempted.
    #[must_use]
    pub fn store(context: &str, err: impl Display) -> Self {
        Self::StoreUnavailable(format!("{context}: {err}"))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Duplicate and already-forgotten rejections; callers treat these as success.
    #[must_use]
    pub fn is_idempotency_guard(&self) -> bool {
        matches!(self, Self::DuplicateMessage(_) | Self::AlreadyForgotten(_))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::DuplicateMessage(_) => "duplicate_message",
            Self::AlreadyForgotten(_) => "already_forgotten",
            Self::EncodingInvariantViolation(_) => "encoding_invariant_violation",
            Self::Cancelled => "cancelled",
            Self::Validation(_) => "validation",
            Self::InvalidPattern(_) => "invalid_pattern",
        }
    }
}

/// Opaque identifier of one learned message, unique within a tag.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// # Errors
    /// Returns [`ChainError::Validation`] when the identifier is empty.
    pub fn new(value: impl Into<String>) -> Result<Self, ChainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ChainError::Validation("message id MUST be non-empty".to_string()));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashed sender identity. Raw platform user ids never reach a store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserHash(String);

impl UserHash {
    /// Wrap an identity that the caller has already hashed.
    #[must_use]
    pub fn from_hashed(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive the opaque identity of `user` speaking in `room`, keyed by `secret`.
    #[must_use]
    pub fn derive(secret: &[u8], user: &str, room: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [secret, user.as_bytes(), room.as_bytes()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    Message,
    User,
    Time,
    Pattern,
}

impl DeleteReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::User => "user",
            Self::Time => "time",
            Self::Pattern => "pattern",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "message" => Some(Self::Message),
            "user" => Some(Self::User),
            "time" => Some(Self::Time),
            "pattern" => Some(Self::Pattern),
            _ => None,
        }
    }
}

/// Metadata supplied by the caller for one Learn call.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageMeta {
    pub id: MessageId,
    pub sender: UserHash,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

/// The persisted unit of retraction: one row or record per Learn call.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub tag: String,
    pub sender: UserHash,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub text: String,
    pub deleted: Option<DeleteReason>,
}

/// Convert a timestamp to the Unix milliseconds both backends persist.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

/// # Errors
/// Returns [`ChainError::EncodingInvariantViolation`] when the value is outside the
/// range `time` can represent.
pub fn from_unix_millis(value: i64) -> Result<OffsetDateTime, ChainError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000_000).map_err(|err| {
        ChainError::EncodingInvariantViolation(format!("invalid stored timestamp {value}: {err}"))
    })
}
