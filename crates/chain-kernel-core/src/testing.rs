//! In-memory store used by this crate's own unit tests.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::store::{Candidate, ChainStore, ScanControl};
use crate::tuple::{build_tuples, validate_tuples, Tuples};
use crate::{
    tokenize, CancelToken, ChainError, DeleteReason, MessageId, MessageMeta, MessageRecord,
    UserHash,
};

struct Row {
    tag: String,
    id: MessageId,
    prefix: Vec<String>,
    suffix: String,
}

pub(crate) struct MemoryStore {
    order: usize,
    rows: Vec<Row>,
    messages: BTreeMap<(String, MessageId), MessageRecord>,
    pub(crate) fail_scans_after: Option<usize>,
    scans: std::cell::Cell<usize>,
}

impl MemoryStore {
    pub(crate) fn new(order: usize) -> Self {
        Self {
            order,
            rows: Vec::new(),
            messages: BTreeMap::new(),
            fail_scans_after: None,
            scans: std::cell::Cell::new(0),
        }
    }

    fn is_live(&self, tag: &str, id: &MessageId) -> bool {
        self.messages
            .get(&(tag.to_string(), id.clone()))
            .is_some_and(|record| record.deleted.is_none())
    }

    fn mark(&mut self, tag: &str, id: &MessageId, reason: DeleteReason) -> bool {
        let key = (tag.to_string(), id.clone());
        let record = self.messages.entry(key).or_insert_with(|| MessageRecord {
            id: id.clone(),
            tag: tag.to_string(),
            sender: UserHash::from_hashed(""),
            time: OffsetDateTime::UNIX_EPOCH,
            text: String::new(),
            deleted: None,
        });
        if record.deleted.is_some() {
            return false;
        }
        record.deleted = Some(reason);
        true
    }
}

pub(crate) fn learn_text(
    store: &mut MemoryStore,
    tag: &str,
    id: &str,
    text: &str,
) -> Result<(), ChainError> {
    let meta = MessageMeta {
        id: MessageId::new(id)?,
        sender: UserHash::from_hashed("user"),
        time: OffsetDateTime::UNIX_EPOCH,
    };
    let tuples = build_tuples(store.order(), &tokenize(text));
    store.learn(&CancelToken::new(), tag, &meta, text, &tuples)
}

impl ChainStore for MemoryStore {
    fn order(&self) -> usize {
        self.order
    }

    fn learn(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        meta: &MessageMeta,
        text: &str,
        tuples: &Tuples,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        validate_tuples(self.order, tuples)?;
        if let Some(existing) = self.messages.get(&(tag.to_string(), meta.id.clone())) {
            if existing.deleted.is_some() {
                return Err(ChainError::AlreadyForgotten(meta.id.clone()));
            }
            return Err(ChainError::DuplicateMessage(meta.id.clone()));
        }
        self.messages.insert(
            (tag.to_string(), meta.id.clone()),
            MessageRecord {
                id: meta.id.clone(),
                tag: tag.to_string(),
                sender: meta.sender.clone(),
                time: meta.time,
                text: text.to_string(),
                deleted: None,
            },
        );
        for tuple in tuples.iter() {
            self.rows.push(Row {
                tag: tag.to_string(),
                id: meta.id.clone(),
                prefix: tuple.prefix.to_vec(),
                suffix: tuple.suffix.to_string(),
            });
        }
        Ok(())
    }

    fn scan_candidates(
        &self,
        cancel: &CancelToken,
        tag: &str,
        prefix: &[String],
        visit: &mut dyn FnMut(Candidate<'_>) -> ScanControl,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        let scans = self.scans.get() + 1;
        self.scans.set(scans);
        if self.fail_scans_after.is_some_and(|limit| scans > limit) {
            return Err(ChainError::StoreUnavailable("injected failure".to_string()));
        }
        for row in &self.rows {
            if row.tag != tag || !row.prefix.starts_with(prefix) || !self.is_live(tag, &row.id) {
                continue;
            }
            if visit(Candidate { suffix: &row.suffix, id: &row.id }) == ScanControl::Stop {
                break;
            }
        }
        Ok(())
    }

    fn forget_message(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        id: &MessageId,
        reason: DeleteReason,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        self.mark(tag, id, reason);
        Ok(())
    }

    fn forget_user_since(
        &mut self,
        cancel: &CancelToken,
        user: &UserHash,
        since: OffsetDateTime,
    ) -> Result<usize, ChainError> {
        cancel.check()?;
        let targets: Vec<(String, MessageId)> = self
            .messages
            .values()
            .filter(|r| r.deleted.is_none() && &r.sender == user && r.time >= since)
            .map(|r| (r.tag.clone(), r.id.clone()))
            .collect();
        Ok(targets.iter().filter(|(tag, id)| self.mark(tag, id, DeleteReason::User)).count())
    }

    fn forget_during(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        since: OffsetDateTime,
        before: OffsetDateTime,
    ) -> Result<usize, ChainError> {
        cancel.check()?;
        let targets: Vec<MessageId> = self
            .messages
            .values()
            .filter(|r| r.deleted.is_none() && r.tag == tag && r.time >= since && r.time < before)
            .map(|r| r.id.clone())
            .collect();
        Ok(targets.iter().filter(|id| self.mark(tag, id, DeleteReason::Time)).count())
    }

    fn scan_history(
        &self,
        cancel: &CancelToken,
        tag: &str,
        visit: &mut dyn FnMut(&MessageRecord) -> ScanControl,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        for record in self.messages.values() {
            if record.tag == tag
                && record.deleted.is_none()
                && visit(record) == ScanControl::Stop
            {
                break;
            }
        }
        Ok(())
    }

    fn message(&self, tag: &str, id: &MessageId) -> Result<Option<MessageRecord>, ChainError> {
        Ok(self.messages.get(&(tag.to_string(), id.clone())).cloned())
    }
}
