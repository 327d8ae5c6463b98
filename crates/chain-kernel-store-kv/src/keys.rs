//! Byte layout of the ordered keyspace.
//!
//! ```text
//! chain:      H(tag) ∥ (term ∥ FE)×order ∥ FF ∥ id ∥ FE ∥ seq   -> suffix
//! message:    H(tag) ∥ FF ∥ FF ∥ id                             -> JSON record
//! time index: H(tag) ∥ FF ∥ FE ∥ ts ∥ id                        -> ""
//! tombstone:  H(tag) ∥ FF ∥ FD ∥ id                             -> reason
//! user index: FF ∥ 'u' ∥ H(user) ∥ ts ∥ H(tag) ∥ id             -> tag
//! order:      FF ∥ 'o'                                          -> u64
//! ```
//!
//! Hashes never start with `FF` and UTF-8 never contains `FE` or `FF`, so terms
//! and ids are raw-concatenated without escaping.

use chain_kernel_core::{ChainError, MessageId};
use sha2::{Digest, Sha256};

const SEP: u8 = 0xFE;
const END: u8 = 0xFF;
const MESSAGE: u8 = 0xFF;
const TIME: u8 = 0xFE;
const TOMBSTONE: u8 = 0xFD;
const USER: u8 = b'u';
const HASH_LEN: usize = 8;
const SEQ_LEN: usize = 4;
const TS_LEN: usize = 8;

pub(crate) const ORDER_KEY: [u8; 2] = [END, b'o'];

pub(crate) type Hash = [u8; HASH_LEN];

pub(crate) fn hash(value: &str) -> Hash {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = [0_u8; HASH_LEN];
    out.copy_from_slice(&digest[..HASH_LEN]);
    out[0] &= 0x7F;
    out
}

fn chain_prefix(tag: &Hash, terms: &[String]) -> Vec<u8> {
    let len = terms.iter().map(|term| term.len() + 1).sum::<usize>();
    let mut key = Vec::with_capacity(HASH_LEN + len + 2 + SEQ_LEN + 26);
    key.extend_from_slice(tag);
    for term in terms {
        key.extend_from_slice(term.as_bytes());
        key.push(SEP);
    }
    key
}

pub(crate) fn chain_key(tag: &Hash, prefix: &[String], id: &MessageId, seq: u32) -> Vec<u8> {
    let mut key = chain_prefix(tag, prefix);
    key.push(END);
    key.extend_from_slice(id.as_str().as_bytes());
    key.push(SEP);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Half-open range of every chain key whose leading terms equal `terms`.
/// `terms` must be non-empty.
pub(crate) fn chain_range(tag: &Hash, terms: &[String]) -> (Vec<u8>, Vec<u8>) {
    let lower = chain_prefix(tag, terms);
    let mut upper = lower.clone();
    if let Some(last) = upper.last_mut() {
        *last = END;
    }
    (lower, upper)
}

/// Every chain key of one tag, whatever its prefix.
pub(crate) fn tag_chain_range(tag: &Hash) -> (Vec<u8>, Vec<u8>) {
    let lower = tag.to_vec();
    let mut upper = lower.clone();
    upper.push(END);
    (lower, upper)
}

/// Message id bytes embedded in a chain key.
pub(crate) fn chain_key_id(key: &[u8]) -> Result<&[u8], ChainError> {
    let malformed = || ChainError::EncodingInvariantViolation("malformed chain key".to_string());
    let id_end = key
        .len()
        .checked_sub(SEQ_LEN + 1)
        .filter(|&end| end > HASH_LEN && key[end] == SEP)
        .ok_or_else(malformed)?;
    let terminator =
        key[HASH_LEN..id_end].iter().rposition(|&byte| byte == END).ok_or_else(malformed)?;
    Ok(&key[HASH_LEN + terminator + 1..id_end])
}

fn record_key(tag: &Hash, kind: u8, rest: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(HASH_LEN + 2 + rest.len());
    key.extend_from_slice(tag);
    key.push(END);
    key.push(kind);
    key.extend_from_slice(rest);
    key
}

pub(crate) fn message_key(tag: &Hash, id_bytes: &[u8]) -> Vec<u8> {
    record_key(tag, MESSAGE, id_bytes)
}

pub(crate) fn message_range(tag: &Hash) -> (Vec<u8>, Vec<u8>) {
    (record_key(tag, MESSAGE, &[]), record_key(tag, MESSAGE, &[END]))
}

pub(crate) fn tombstone_key(tag: &Hash, id_bytes: &[u8]) -> Vec<u8> {
    record_key(tag, TOMBSTONE, id_bytes)
}

pub(crate) fn tombstone_range(tag: &Hash) -> (Vec<u8>, Vec<u8>) {
    (record_key(tag, TOMBSTONE, &[]), record_key(tag, TOMBSTONE + 1, &[]))
}

pub(crate) fn tombstone_key_id(key: &[u8]) -> Result<&[u8], ChainError> {
    key.get(HASH_LEN + 2..).ok_or_else(|| {
        ChainError::EncodingInvariantViolation("malformed tombstone key".to_string())
    })
}

/// Every key that belongs to some tag, chain entries and records alike.
pub(crate) fn all_tags_range() -> (Vec<u8>, Vec<u8>) {
    (Vec::new(), vec![0x80])
}

/// Tag hash of a chain key, or `None` for record and global keys.
pub(crate) fn chain_key_tag(key: &[u8]) -> Option<Hash> {
    if key.len() <= HASH_LEN || key[0] & 0x80 != 0 || key[HASH_LEN] == END {
        return None;
    }
    let mut tag = [0_u8; HASH_LEN];
    tag.copy_from_slice(&key[..HASH_LEN]);
    Some(tag)
}

/// Order-preserving encoding of signed Unix milliseconds.
fn timestamp(millis: i64) -> [u8; TS_LEN] {
    (u64::from_be_bytes(millis.to_be_bytes()) ^ (1 << 63)).to_be_bytes()
}

pub(crate) fn time_key(tag: &Hash, millis: i64, id: &MessageId) -> Vec<u8> {
    let mut key = record_key(tag, TIME, &timestamp(millis));
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

pub(crate) fn time_range(tag: &Hash, since: i64, before: i64) -> (Vec<u8>, Vec<u8>) {
    (record_key(tag, TIME, &timestamp(since)), record_key(tag, TIME, &timestamp(before)))
}

pub(crate) fn time_key_id(key: &[u8]) -> Result<&[u8], ChainError> {
    key.get(HASH_LEN + 2 + TS_LEN..).ok_or_else(|| {
        ChainError::EncodingInvariantViolation("malformed time index key".to_string())
    })
}

fn user_prefix(user: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + HASH_LEN * 2 + TS_LEN + 26);
    key.push(END);
    key.push(USER);
    key.extend_from_slice(user);
    key
}

pub(crate) fn user_key(user: &Hash, millis: i64, tag: &Hash, id: &MessageId) -> Vec<u8> {
    let mut key = user_prefix(user);
    key.extend_from_slice(&timestamp(millis));
    key.extend_from_slice(tag);
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

pub(crate) fn user_range(user: &Hash, since: i64) -> (Vec<u8>, Vec<u8>) {
    let mut lower = user_prefix(user);
    lower.extend_from_slice(&timestamp(since));
    let mut upper = user_prefix(user);
    upper.extend_from_slice(&[END; TS_LEN + 1]);
    (lower, upper)
}

pub(crate) fn user_key_id(key: &[u8]) -> Result<&[u8], ChainError> {
    key.get(2 + HASH_LEN + TS_LEN + HASH_LEN..).ok_or_else(|| {
        ChainError::EncodingInvariantViolation("malformed user index key".to_string())
    })
}

pub(crate) fn parse_id(bytes: &[u8]) -> Result<MessageId, ChainError> {
    let raw = std::str::from_utf8(bytes).map_err(|err| {
        ChainError::EncodingInvariantViolation(format!("message id is not UTF-8: {err}"))
    })?;
    MessageId::new(raw)
}
