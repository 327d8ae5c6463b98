use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chain_kernel_core::{
    unix_millis, validate_tuples, CancelToken, Candidate, ChainError, ChainStore, DeleteReason,
    IntegrityReport, MessageId, MessageMeta, MessageRecord, ScanControl, SchemaStatus, Tuples,
    UserHash,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

mod keys;

use keys::Hash;

pub const BACKEND_NAME: &str = "kv";

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv (
  key BLOB PRIMARY KEY,
  value BLOB NOT NULL
) WITHOUT ROWID;
";

const SCAN_SQL: &str = "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key";

type Range = (Vec<u8>, Vec<u8>);

/// Chain store over one ordered keyspace of byte-string keys.
///
/// Forgetting writes a tombstone instead of touching chain entries; every chain
/// read consults the tombstone of the candidate's message, and [`KvStore::compact`]
/// removes the dead entries later.
pub struct KvStore {
    conn: Connection,
    order: usize,
}

impl KvStore {
    /// Open a key-value chain store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when `order` is zero, the database cannot be opened, or
    /// pragmas cannot be applied.
    pub fn open(path: &Path, order: usize) -> Result<Self> {
        if order == 0 {
            let err = ChainError::Validation("chain order MUST be at least 1".to_string());
            return Err(err.into());
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open kv database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, order })
    }

    /// Report current and target schema versions plus the persisted chain order.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let order = if table_exists(&self.conn, "kv")? { stored_order(&self.conn)? } else { None };
        Ok(SchemaStatus::new(BACKEND_NAME, current_version, LATEST_SCHEMA_VERSION, order))
    }

    /// Create the keyspace and record the chain order on first use.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the keyspace was created
    /// with a different chain order.
    pub fn migrate(&mut self) -> Result<()> {
        let status = self.schema_status()?;
        if status.current_version == LATEST_SCHEMA_VERSION {
            if let Some(stored) = status.order {
                return self.check_order(stored);
            }
        }

        let order = u64::try_from(self.order).context("chain order out of range")?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start migration transaction")?;
        tx.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&tx)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        if version < 1 {
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
        }
        let recorded = tx
            .execute(
                "INSERT OR IGNORE INTO kv(key, value) VALUES (?1, ?2)",
                params![keys::ORDER_KEY.as_slice(), order.to_be_bytes().as_slice()],
            )
            .context("failed to record chain order")?;
        let stored = stored_order(&tx)?;
        tx.commit().context("failed to commit migration")?;
        if recorded == 1 {
            tracing::info!(order = self.order, "initialized kv chain store");
        }

        let stored = stored.ok_or_else(|| anyhow!("chain order missing after migration"))?;
        self.check_order(stored)
    }

    fn check_order(&self, stored: usize) -> Result<()> {
        if stored == self.order {
            return Ok(());
        }
        Err(ChainError::Validation(format!(
            "store was created with order {stored}, refusing to open it with order {}",
            self.order
        ))
        .into())
    }

    /// Create a consistent copy of the keyspace at `out_file`.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create kv backup at {}", out_file.display()))
    }

    /// Run quick-check, look for chain entries without a message record, and
    /// report schema status.
    ///
    /// # Errors
    /// Returns an error when any integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut known: HashMap<(Hash, Vec<u8>), bool> = HashMap::new();
        let mut orphaned_entries = 0_usize;
        let cancel = CancelToken::new();
        scan(&self.conn, &keys::all_tags_range(), &cancel, &mut |key, _| {
            let Some(tag) = keys::chain_key_tag(key) else {
                return Ok(ScanControl::Continue);
            };
            let id = keys::chain_key_id(key)?;
            let present = match known.get(&(tag, id.to_vec())) {
                Some(&present) => present,
                None => {
                    let present = get(&self.conn, &keys::message_key(&tag, id))?.is_some()
                        || get(&self.conn, &keys::tombstone_key(&tag, id))?.is_some();
                    known.insert((tag, id.to_vec()), present);
                    present
                }
            };
            if !present {
                orphaned_entries += 1;
            }
            Ok(ScanControl::Continue)
        })
        .context("failed to scan chain entries")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations: Vec::new(),
            orphaned_entries,
            schema_status: self.schema_status()?,
        })
    }

    fn tombstone(&self, tag: &Hash, id_bytes: &[u8]) -> Result<Option<DeleteReason>, ChainError> {
        get(&self.conn, &keys::tombstone_key(tag, id_bytes))?
            .map(|value| parse_reason(&value))
            .transpose()
    }

    fn forget_all(
        &mut self,
        cancel: &CancelToken,
        targets: &[(String, MessageId)],
        reason: DeleteReason,
        sender: Option<&UserHash>,
    ) -> Result<usize, ChainError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("failed to begin forget transaction"))?;
        let mut forgotten = 0_usize;
        for (tag, id) in targets {
            cancel.check()?;
            let tag_hash = keys::hash(tag);
            if let Some(user) = sender {
                // The user index is keyed by a truncated hash; confirm against the record.
                match load_record(&tx, &tag_hash, id.as_str().as_bytes())? {
                    Some(record) if &record.sender == user => {}
                    _ => continue,
                }
            }
            let key = keys::tombstone_key(&tag_hash, id.as_str().as_bytes());
            if insert_if_absent(&tx, &key, reason)? {
                forgotten += 1;
            }
        }
        tx.commit().map_err(db("failed to commit forget transaction"))?;
        Ok(forgotten)
    }
}

impl ChainStore for KvStore {
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
        let tag_hash = keys::hash(tag);
        let id_bytes = meta.id.as_str().as_bytes();
        let record = MessageRecord {
            id: meta.id.clone(),
            tag: tag.to_string(),
            sender: meta.sender.clone(),
            time: meta.time,
            text: text.to_string(),
            deleted: None,
        };
        let encoded = serde_json::to_vec(&record)
            .map_err(|err| ChainError::store("failed to encode message record", err))?;
        let millis = unix_millis(meta.time);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("failed to begin learn transaction"))?;
        if get(&tx, &keys::tombstone_key(&tag_hash, id_bytes))?.is_some() {
            return Err(ChainError::AlreadyForgotten(meta.id.clone()));
        }
        let message_key = keys::message_key(&tag_hash, id_bytes);
        if get(&tx, &message_key)?.is_some() {
            return Err(ChainError::DuplicateMessage(meta.id.clone()));
        }
        put(&tx, &message_key, &encoded)?;
        put(&tx, &keys::time_key(&tag_hash, millis, &meta.id), &[])?;
        let user_hash = keys::hash(meta.sender.as_str());
        put(&tx, &keys::user_key(&user_hash, millis, &tag_hash, &meta.id), tag.as_bytes())?;

        for (seq, tuple) in tuples.iter().enumerate() {
            cancel.check()?;
            let seq = u32::try_from(seq).map_err(|_| {
                ChainError::EncodingInvariantViolation("message has too many tuples".to_string())
            })?;
            let key = keys::chain_key(&tag_hash, tuple.prefix, &meta.id, seq);
            put(&tx, &key, tuple.suffix.as_bytes())?;
        }
        tx.commit().map_err(db("failed to commit learn transaction"))?;
        tracing::debug!(tag, message_id = %meta.id, tuples = tuples.len(), "learned message");
        Ok(())
    }

    fn scan_candidates(
        &self,
        cancel: &CancelToken,
        tag: &str,
        prefix: &[String],
        visit: &mut dyn FnMut(Candidate<'_>) -> ScanControl,
    ) -> Result<(), ChainError> {
        if prefix.is_empty() || prefix.len() > self.order {
            return Err(ChainError::Validation(format!(
                "prefix length {} outside 1..={}",
                prefix.len(),
                self.order
            )));
        }
        cancel.check()?;
        let tag_hash = keys::hash(tag);
        let mut forgotten: HashMap<Vec<u8>, bool> = HashMap::new();
        scan(&self.conn, &keys::chain_range(&tag_hash, prefix), cancel, &mut |key, value| {
            let id_bytes = keys::chain_key_id(key)?;
            let dead = match forgotten.get(id_bytes) {
                Some(&dead) => dead,
                None => {
                    let tombstone = keys::tombstone_key(&tag_hash, id_bytes);
                    let dead = get(&self.conn, &tombstone)?.is_some();
                    forgotten.insert(id_bytes.to_vec(), dead);
                    dead
                }
            };
            if dead {
                return Ok(ScanControl::Continue);
            }
            let suffix = std::str::from_utf8(value).map_err(|err| {
                ChainError::EncodingInvariantViolation(format!("suffix is not UTF-8: {err}"))
            })?;
            let id = keys::parse_id(id_bytes)?;
            Ok(visit(Candidate { suffix, id: &id }))
        })
    }

    fn forget_message(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        id: &MessageId,
        reason: DeleteReason,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        let key = keys::tombstone_key(&keys::hash(tag), id.as_str().as_bytes());
        if insert_if_absent(&self.conn, &key, reason)? {
            tracing::info!(tag, message_id = %id, reason = reason.as_str(), "forgot message");
        }
        Ok(())
    }

    fn forget_user_since(
        &mut self,
        cancel: &CancelToken,
        user: &UserHash,
        since: OffsetDateTime,
    ) -> Result<usize, ChainError> {
        cancel.check()?;
        let range = keys::user_range(&keys::hash(user.as_str()), unix_millis(since));
        let mut targets: Vec<(String, MessageId)> = Vec::new();
        scan(&self.conn, &range, cancel, &mut |key, value| {
            let id = keys::parse_id(keys::user_key_id(key)?)?;
            let tag = String::from_utf8(value.to_vec()).map_err(|err| {
                ChainError::EncodingInvariantViolation(format!("indexed tag is not UTF-8: {err}"))
            })?;
            targets.push((tag, id));
            Ok(ScanControl::Continue)
        })?;

        let forgotten = self.forget_all(cancel, &targets, DeleteReason::User, Some(user))?;
        tracing::info!(forgotten, "forgot messages by user");
        Ok(forgotten)
    }

    fn forget_during(
        &mut self,
        cancel: &CancelToken,
        tag: &str,
        since: OffsetDateTime,
        before: OffsetDateTime,
    ) -> Result<usize, ChainError> {
        cancel.check()?;
        if since >= before {
            return Ok(0);
        }
        let range = keys::time_range(&keys::hash(tag), unix_millis(since), unix_millis(before));
        let mut targets: Vec<(String, MessageId)> = Vec::new();
        scan(&self.conn, &range, cancel, &mut |key, _| {
            targets.push((tag.to_string(), keys::parse_id(keys::time_key_id(key)?)?));
            Ok(ScanControl::Continue)
        })?;

        let forgotten = self.forget_all(cancel, &targets, DeleteReason::Time, None)?;
        tracing::info!(tag, forgotten, "forgot messages by time window");
        Ok(forgotten)
    }

    fn scan_history(
        &self,
        cancel: &CancelToken,
        tag: &str,
        visit: &mut dyn FnMut(&MessageRecord) -> ScanControl,
    ) -> Result<(), ChainError> {
        cancel.check()?;
        let tag_hash = keys::hash(tag);
        scan(&self.conn, &keys::message_range(&tag_hash), cancel, &mut |_, value| {
            let record = decode_record(value)?;
            if self.tombstone(&tag_hash, record.id.as_str().as_bytes())?.is_some() {
                return Ok(ScanControl::Continue);
            }
            Ok(visit(&record))
        })
    }

    /// Message records and tombstones stay for audit.
    fn compact(&mut self, cancel: &CancelToken, tag: &str) -> Result<usize, ChainError> {
        let tag_hash = keys::hash(tag);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("failed to begin compaction"))?;

        let mut forgotten: HashSet<Vec<u8>> = HashSet::new();
        scan(&tx, &keys::tombstone_range(&tag_hash), cancel, &mut |key, _| {
            forgotten.insert(keys::tombstone_key_id(key)?.to_vec());
            Ok(ScanControl::Continue)
        })?;
        if forgotten.is_empty() {
            return Ok(0);
        }

        let mut doomed: Vec<Vec<u8>> = Vec::new();
        scan(&tx, &keys::tag_chain_range(&tag_hash), cancel, &mut |key, _| {
            if forgotten.contains(keys::chain_key_id(key)?) {
                doomed.push(key.to_vec());
            }
            Ok(ScanControl::Continue)
        })?;

        for key in &doomed {
            cancel.check()?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(db("failed to delete chain entry"))?;
        }
        tx.commit().map_err(db("failed to commit compaction"))?;
        tracing::info!(tag, removed = doomed.len(), "compacted forgotten chain entries");
        Ok(doomed.len())
    }

    fn message(&self, tag: &str, id: &MessageId) -> Result<Option<MessageRecord>, ChainError> {
        let tag_hash = keys::hash(tag);
        let id_bytes = id.as_str().as_bytes();
        let deleted = self.tombstone(&tag_hash, id_bytes)?;
        match load_record(&self.conn, &tag_hash, id_bytes)? {
            Some(record) => Ok(Some(MessageRecord { deleted, ..record })),
            None => Ok(deleted.map(|reason| MessageRecord {
                id: id.clone(),
                tag: tag.to_string(),
                sender: UserHash::from_hashed(""),
                time: OffsetDateTime::UNIX_EPOCH,
                text: String::new(),
                deleted: Some(reason),
            })),
        }
    }
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> ChainError {
    move |err| ChainError::store(context, err)
}

/// Visit every key in the half-open `range` in key order.
fn scan(
    conn: &Connection,
    range: &Range,
    cancel: &CancelToken,
    visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<ScanControl, ChainError>,
) -> Result<(), ChainError> {
    let mut stmt = conn.prepare_cached(SCAN_SQL).map_err(db("failed to prepare range scan"))?;
    let mut rows = stmt
        .query(params![range.0.as_slice(), range.1.as_slice()])
        .map_err(db("failed to run range scan"))?;
    while let Some(row) = rows.next().map_err(db("failed to read range scan"))? {
        cancel.check()?;
        let key = row
            .get_ref(0)
            .map_err(db("failed to read key"))?
            .as_blob()
            .map_err(|err| ChainError::store("failed to decode key", err))?;
        let value = row
            .get_ref(1)
            .map_err(db("failed to read value"))?
            .as_blob()
            .map_err(|err| ChainError::store("failed to decode value", err))?;
        if visit(key, value)? == ScanControl::Stop {
            break;
        }
    }
    Ok(())
}

fn get(conn: &Connection, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
    let mut stmt = conn
        .prepare_cached("SELECT value FROM kv WHERE key = ?1")
        .map_err(db("failed to prepare key lookup"))?;
    stmt.query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
        .optional()
        .map_err(db("failed to look up key"))
}

fn put(conn: &Connection, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
    let mut stmt = conn
        .prepare_cached("INSERT INTO kv(key, value) VALUES (?1, ?2)")
        .map_err(db("failed to prepare key write"))?;
    stmt.execute(params![key, value]).map_err(db("failed to write key"))?;
    Ok(())
}

/// Write a tombstone unless one exists, so the first reason wins.
fn insert_if_absent(
    conn: &Connection,
    key: &[u8],
    reason: DeleteReason,
) -> Result<bool, ChainError> {
    let mut stmt = conn
        .prepare_cached("INSERT OR IGNORE INTO kv(key, value) VALUES (?1, ?2)")
        .map_err(db("failed to prepare tombstone write"))?;
    let changed = stmt
        .execute(params![key, reason.as_str().as_bytes()])
        .map_err(db("failed to write tombstone"))?;
    Ok(changed == 1)
}

fn load_record(
    conn: &Connection,
    tag: &Hash,
    id_bytes: &[u8],
) -> Result<Option<MessageRecord>, ChainError> {
    get(conn, &keys::message_key(tag, id_bytes))?.map(|value| decode_record(&value)).transpose()
}

fn decode_record(value: &[u8]) -> Result<MessageRecord, ChainError> {
    serde_json::from_slice(value)
        .map_err(|err| ChainError::store("failed to decode message record", err))
}

fn parse_reason(value: &[u8]) -> Result<DeleteReason, ChainError> {
    std::str::from_utf8(value).ok().and_then(DeleteReason::parse).ok_or_else(|| {
        ChainError::EncodingInvariantViolation("unknown tombstone reason".to_string())
    })
}

fn stored_order(conn: &Connection) -> Result<Option<usize>> {
    let value: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![keys::ORDER_KEY.as_slice()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read chain order")?;
    let Some(value) = value else {
        return Ok(None);
    };
    let bytes = <[u8; 8]>::try_from(value.as_slice())
        .map_err(|_| anyhow!("chain order record has {} bytes, expected 8", value.len()))?;
    let order = usize::try_from(u64::from_be_bytes(bytes)).context("chain order out of range")?;
    Ok(Some(order))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
