use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chain_kernel_core::{
    from_unix_millis, unix_millis, validate_tuples, CancelToken, Candidate, ChainError,
    ChainStore, DeleteReason, ForeignKeyViolation, IntegrityReport, MessageId, MessageMeta,
    MessageRecord, ScanControl, SchemaStatus, Tuples, UserHash,
};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;

pub const BACKEND_NAME: &str = "relational";

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS chain_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  tag TEXT NOT NULL,
  id TEXT NOT NULL,
  sender TEXT NOT NULL,
  time INTEGER NOT NULL,
  text TEXT NOT NULL,
  deleted TEXT CHECK (deleted IS NULL OR deleted IN ('message','user','time','pattern')),
  PRIMARY KEY (tag, id)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_messages_sender_time ON messages(sender, time);
CREATE INDEX IF NOT EXISTS idx_messages_tag_time ON messages(tag, time);
";

const MESSAGE_COLUMNS: &str = "tag, id, sender, time, text, deleted";

type RawRecord = (String, String, String, i64, String, Option<String>);

/// Chain store with one row per tuple and one column per prefix position.
///
/// The empty term is stored as NULL so prefix lookups are plain `IS` equality
/// against the `(tag, p1 … pN)` index.
pub struct SqliteStore {
    conn: Connection,
    order: usize,
    insert_sql: String,
    scan_sql: Vec<String>,
}

impl SqliteStore {
    /// Open a relational chain store and configure required runtime pragmas.
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
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        let columns = prefix_columns(order);
        let placeholders = (4..=order + 4).map(|n| format!("?{n}")).collect::<Vec<_>>().join(", ");
        let insert_sql = format!(
            "INSERT INTO knowledge(tag, id, seq, {}, suffix) VALUES (?1, ?2, ?3, {placeholders})",
            columns.join(", ")
        );
        let scan_sql = (1..=order)
            .map(|depth| {
                let matches = columns[..depth]
                    .iter()
                    .enumerate()
                    .map(|(index, column)| format!(" AND k.{column} IS ?{}", index + 2))
                    .collect::<String>();
                format!(
                    "SELECT k.suffix, k.id FROM knowledge k \
                     JOIN messages m ON m.tag = k.tag AND m.id = k.id \
                     WHERE k.tag = ?1{matches} \
                     AND likely(m.deleted IS NULL) AND k.deleted IS NULL"
                )
            })
            .collect();

        Ok(Self { conn, order, insert_sql, scan_sql })
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
        let order =
            if table_exists(&self.conn, "chain_meta")? { stored_order(&self.conn)? } else { None };
        Ok(SchemaStatus::new(BACKEND_NAME, current_version, LATEST_SCHEMA_VERSION, order))
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database was created
    /// with a different chain order.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = 1;
        }

        if version < 2 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration 002")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration 002")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration 002")?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        match stored_order(&self.conn)? {
            Some(stored) if stored == self.order => Ok(()),
            Some(stored) => Err(ChainError::Validation(format!(
                "store was created with order {stored}, refusing to open it with order {}",
                self.order
            ))
            .into()),
            None => Err(anyhow!("database schema is invalid: chain order is not recorded")),
        }
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let columns = prefix_columns(self.order);
        let knowledge_sql = format!(
            "CREATE TABLE IF NOT EXISTS knowledge (
               tag TEXT NOT NULL,
               id TEXT NOT NULL,
               seq INTEGER NOT NULL,
               {},
               suffix TEXT NOT NULL,
               deleted TEXT,
               PRIMARY KEY (tag, id, seq),
               FOREIGN KEY (tag, id) REFERENCES messages(tag, id)
             );
             CREATE INDEX IF NOT EXISTS idx_knowledge_prefix ON knowledge(tag, {});",
            columns.iter().map(|column| format!("{column} TEXT")).collect::<Vec<_>>().join(", "),
            columns.join(", ")
        );

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start migration 001")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
        tx.execute_batch(&knowledge_sql).context("failed to create knowledge table")?;
        tx.execute(
            "INSERT OR IGNORE INTO chain_meta(key, value) VALUES ('order', ?1)",
            params![self.order.to_string()],
        )
        .context("failed to record chain order")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration 001")?;
        tracing::info!(order = self.order, "initialized relational chain store");
        Ok(())
    }

    /// Create a `SQLite` backup file at the requested path.
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
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let orphaned_entries: i64 = if table_exists(&self.conn, "knowledge")? {
            self.conn
                .query_row(
                    "SELECT COUNT(*) FROM knowledge k
                     LEFT JOIN messages m ON m.tag = k.tag AND m.id = k.id
                     WHERE m.id IS NULL",
                    [],
                    |row| row.get(0),
                )
                .context("failed to count orphaned knowledge rows")?
        } else {
            0
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            orphaned_entries: usize::try_from(orphaned_entries).unwrap_or(usize::MAX),
            schema_status,
        })
    }

    /// Soft-delete the live messages selected by `filter` and their tuples.
    fn forget_where(
        &mut self,
        cancel: &CancelToken,
        filter: &str,
        args: &[&dyn ToSql],
        reason: DeleteReason,
    ) -> Result<usize, ChainError> {
        cancel.check()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("failed to begin forget transaction"))?;
        let reason_text = reason.as_str();
        let reason_param = format!("?{}", args.len() + 1);
        let mut values: Vec<&dyn ToSql> = args.to_vec();
        values.push(&reason_text);

        tx.execute(
            &format!(
                "UPDATE knowledge SET deleted = {reason_param}
                 WHERE deleted IS NULL AND (tag, id) IN (
                   SELECT tag, id FROM messages WHERE {filter} AND deleted IS NULL
                 )"
            ),
            values.as_slice(),
        )
        .map_err(db("failed to forget tuples"))?;
        cancel.check()?;
        let forgotten = tx
            .execute(
                &format!(
                    "UPDATE messages SET deleted = {reason_param}
                     WHERE {filter} AND deleted IS NULL"
                ),
                values.as_slice(),
            )
            .map_err(db("failed to forget messages"))?;
        tx.commit().map_err(db("failed to commit forget transaction"))?;
        Ok(forgotten)
    }
}

impl ChainStore for SqliteStore {
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
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("failed to begin learn transaction"))?;

        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT deleted FROM messages WHERE tag = ?1 AND id = ?2",
                params![tag, meta.id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db("failed to look up message"))?;
        match existing {
            Some(Some(_)) => return Err(ChainError::AlreadyForgotten(meta.id.clone())),
            Some(None) => return Err(ChainError::DuplicateMessage(meta.id.clone())),
            None => {}
        }

        tx.execute(
            "INSERT INTO messages(tag, id, sender, time, text) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tag, meta.id.as_str(), meta.sender.as_str(), unix_millis(meta.time), text],
        )
        .map_err(db("failed to insert message"))?;
        insert_knowledge(&tx, &self.insert_sql, cancel, tag, &meta.id, tuples)?;
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
        let Some(sql) = prefix.len().checked_sub(1).and_then(|depth| self.scan_sql.get(depth))
        else {
            return Err(ChainError::Validation(format!(
                "prefix length {} outside 1..={}",
                prefix.len(),
                self.order
            )));
        };
        cancel.check()?;

        let terms: Vec<Option<&str>> = prefix.iter().map(|term| term_value(term)).collect();
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(prefix.len() + 1);
        values.push(&tag);
        for term in &terms {
            values.push(term);
        }

        let mut stmt = self.conn.prepare_cached(sql).map_err(db("failed to prepare scan"))?;
        let mut rows = stmt.query(values.as_slice()).map_err(db("failed to run scan"))?;
        while let Some(row) = rows.next().map_err(db("failed to read scan"))? {
            cancel.check()?;
            let suffix = row
                .get_ref(0)
                .map_err(db("failed to read suffix"))?
                .as_str()
                .map_err(|err| ChainError::store("failed to decode suffix", err))?;
            let id = MessageId::new(row.get::<_, String>(1).map_err(db("failed to read id"))?)?;
            if visit(Candidate { suffix, id: &id }) == ScanControl::Stop {
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
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("failed to begin forget transaction"))?;
        let previous: Option<Option<String>> = tx
            .query_row(
                "SELECT deleted FROM messages WHERE tag = ?1 AND id = ?2",
                params![tag, id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db("failed to look up message"))?;

        // Unknown ids get a tombstone row so they can never be learned later.
        tx.execute(
            "INSERT INTO messages(tag, id, sender, time, text, deleted)
             VALUES (?1, ?2, '', 0, '', ?3)
             ON CONFLICT(tag, id) DO UPDATE
             SET deleted = COALESCE(messages.deleted, excluded.deleted)",
            params![tag, id.as_str(), reason.as_str()],
        )
        .map_err(db("failed to forget message"))?;
        tx.execute(
            "UPDATE knowledge SET deleted = ?3 WHERE tag = ?1 AND id = ?2 AND deleted IS NULL",
            params![tag, id.as_str(), reason.as_str()],
        )
        .map_err(db("failed to forget tuples"))?;
        tx.commit().map_err(db("failed to commit forget transaction"))?;

        if !matches!(previous, Some(Some(_))) {
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
        let sender = user.as_str();
        let since = unix_millis(since);
        let forgotten = self.forget_where(
            cancel,
            "sender = ?1 AND time >= ?2",
            params![sender, since],
            DeleteReason::User,
        )?;
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
        let (since, before) = (unix_millis(since), unix_millis(before));
        let forgotten = self.forget_where(
            cancel,
            "tag = ?1 AND time >= ?2 AND time < ?3",
            params![tag, since, before],
            DeleteReason::Time,
        )?;
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
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE tag = ?1 AND deleted IS NULL ORDER BY time, id"
            ))
            .map_err(db("failed to prepare history scan"))?;
        let mut rows = stmt.query(params![tag]).map_err(db("failed to run history scan"))?;
        while let Some(row) = rows.next().map_err(db("failed to read history scan"))? {
            cancel.check()?;
            let record = record_from_raw(raw_record(row).map_err(db("failed to read message"))?)?;
            if visit(&record) == ScanControl::Stop {
                break;
            }
        }
        Ok(())
    }

    fn message(&self, tag: &str, id: &MessageId) -> Result<Option<MessageRecord>, ChainError> {
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE tag = ?1 AND id = ?2"),
                params![tag, id.as_str()],
                raw_record,
            )
            .optional()
            .map_err(db("failed to look up message"))?
            .map(record_from_raw)
            .transpose()
    }
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> ChainError {
    move |err| ChainError::store(context, err)
}

fn insert_knowledge(
    tx: &rusqlite::Transaction<'_>,
    insert_sql: &str,
    cancel: &CancelToken,
    tag: &str,
    id: &MessageId,
    tuples: &Tuples,
) -> Result<(), ChainError> {
    let mut stmt = tx.prepare_cached(insert_sql).map_err(db("failed to prepare tuple insert"))?;
    let id = id.as_str();
    for (seq, tuple) in tuples.iter().enumerate() {
        cancel.check()?;
        let seq = i64::try_from(seq).map_err(|_| {
            ChainError::EncodingInvariantViolation("message has too many tuples".to_string())
        })?;
        let terms: Vec<Option<&str>> = tuple.prefix.iter().map(|term| term_value(term)).collect();
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(terms.len() + 4);
        values.push(&tag);
        values.push(&id);
        values.push(&seq);
        for term in &terms {
            values.push(term);
        }
        values.push(&tuple.suffix);
        stmt.execute(values.as_slice()).map_err(db("failed to insert tuple"))?;
    }
    Ok(())
}

fn prefix_columns(order: usize) -> Vec<String> {
    (1..=order).map(|position| format!("p{position}")).collect()
}

/// NULL stands for the empty term.
fn term_value(term: &str) -> Option<&str> {
    (!term.is_empty()).then_some(term)
}

fn raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn record_from_raw(raw: RawRecord) -> Result<MessageRecord, ChainError> {
    let (tag, id, sender, time, text, deleted) = raw;
    let deleted = deleted
        .map(|reason| {
            DeleteReason::parse(&reason).ok_or_else(|| {
                ChainError::EncodingInvariantViolation(format!("unknown delete reason {reason}"))
            })
        })
        .transpose()?;
    Ok(MessageRecord {
        id: MessageId::new(id)?,
        tag,
        sender: UserHash::from_hashed(sender),
        time: from_unix_millis(time)?,
        text,
        deleted,
    })
}

fn stored_order(conn: &Connection) -> Result<Option<usize>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM chain_meta WHERE key = 'order'", [], |row| row.get(0))
        .optional()
        .context("failed to read chain order")?;
    value
        .map(|raw| {
            raw.parse::<usize>().with_context(|| format!("invalid stored chain order {raw}"))
        })
        .transpose()
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
