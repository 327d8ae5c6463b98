use std::path::{Path, PathBuf};

use anyhow::Result;
use chain_kernel_core::{
    forget_trace, speak, tokenize_into, CancelToken, ChainError, ChainStore, DeleteReason,
    EngineConfig, IntegrityReport, MessageBuilder, MessageId, MessageMeta, MessageRecord,
    PatternMatcher, Pool, SchemaStatus, Speech, Tuples, UserHash,
};
use chain_kernel_store_kv::KvStore;
use chain_kernel_store_sqlite::SqliteStore;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Which chain store layout backs a database file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Ordered key-value keyspace.
    #[default]
    Kv,
    /// Messages and knowledge tables.
    Relational,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kv => chain_kernel_store_kv::BACKEND_NAME,
            Self::Relational => chain_kernel_store_sqlite::BACKEND_NAME,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub backend: String,
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Schema maintenance shared by both backends on top of the chain contract.
trait ManagedStore: ChainStore + Send {
    fn schema_status(&self) -> Result<SchemaStatus>;
    fn migrate(&mut self) -> Result<()>;
    fn integrity_check(&self) -> Result<IntegrityReport>;
    fn backup_database(&self, out_file: &Path) -> Result<()>;
}

impl ManagedStore for KvStore {
    fn schema_status(&self) -> Result<SchemaStatus> {
        KvStore::schema_status(self)
    }

    fn migrate(&mut self) -> Result<()> {
        KvStore::migrate(self)
    }

    fn integrity_check(&self) -> Result<IntegrityReport> {
        KvStore::integrity_check(self)
    }

    fn backup_database(&self, out_file: &Path) -> Result<()> {
        KvStore::backup_database(self, out_file)
    }
}

impl ManagedStore for SqliteStore {
    fn schema_status(&self) -> Result<SchemaStatus> {
        SqliteStore::schema_status(self)
    }

    fn migrate(&mut self) -> Result<()> {
        SqliteStore::migrate(self)
    }

    fn integrity_check(&self) -> Result<IntegrityReport> {
        SqliteStore::integrity_check(self)
    }

    fn backup_database(&self, out_file: &Path) -> Result<()> {
        SqliteStore::backup_database(self, out_file)
    }
}

/// Programmatic entry point linked into the chat-transport process.
///
/// Every call opens its own connection, so concurrent calls from several threads
/// share nothing but the buffer pools and the shutdown token.
#[derive(Debug)]
pub struct ChainKernelApi {
    db_path: PathBuf,
    backend: BackendKind,
    config: EngineConfig,
    shutdown: CancelToken,
    builders: Pool<MessageBuilder>,
    tokens: Pool<Vec<String>>,
    tuples: Pool<Tuples>,
}

impl ChainKernelApi {
    /// # Errors
    /// Returns [`ChainError::Validation`] when `config` is out of range.
    pub fn new(
        db_path: PathBuf,
        backend: BackendKind,
        config: EngineConfig,
    ) -> Result<Self, ChainError> {
        config.validate()?;
        Ok(Self {
            db_path,
            backend,
            config,
            shutdown: CancelToken::new(),
            builders: Pool::default(),
            tokens: Pool::default(),
            tuples: Pool::default(),
        })
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token whose cancellation aborts every in-flight and future call.
    #[must_use]
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    fn cancel_token(&self) -> CancelToken {
        match self.config.scan_timeout() {
            Some(timeout) => self.shutdown.with_timeout(timeout),
            None => self.shutdown.clone(),
        }
    }

    fn open_unmigrated(&self) -> Result<Box<dyn ManagedStore>> {
        let store: Box<dyn ManagedStore> = match self.backend {
            BackendKind::Kv => Box::new(KvStore::open(&self.db_path, self.config.order)?),
            BackendKind::Relational => {
                Box::new(SqliteStore::open(&self.db_path, self.config.order)?)
            }
        };
        Ok(store)
    }

    fn open_store(&self) -> Result<Box<dyn ManagedStore>, ChainError> {
        let mut store = self.open_unmigrated().map_err(chain_error)?;
        store.migrate().map_err(chain_error)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_unmigrated()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_unmigrated()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                backend: before.backend,
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            backend: before.backend,
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_unmigrated()?.integrity_check()
    }

    /// Copy the database to `out_file` after bringing its schema up to date.
    ///
    /// # Errors
    /// Returns an error when migration or the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        let mut store = self.open_unmigrated()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// Tokenize `text`, build its tuples and persist them with the message record.
    ///
    /// # Errors
    /// Returns [`ChainError::DuplicateMessage`] or [`ChainError::AlreadyForgotten`]
    /// when the id was seen before in `tag`, and store or cancellation errors
    /// otherwise. A failed call leaves no tuples behind.
    pub fn learn(&self, tag: &str, meta: &MessageMeta, text: &str) -> Result<(), ChainError> {
        let cancel = self.cancel_token();
        let mut store = self.open_store()?;
        let mut tokens = self.tokens.get();
        tokenize_into(&mut tokens, text);
        let mut tuples = self.tuples.get();
        tuples.fill(self.config.order, &tokens);
        store.learn(&cancel, tag, meta, text, &tuples)
    }

    /// Generate one message for `tag`, continuing from `prompt` when it is non-empty.
    ///
    /// # Errors
    /// Returns store failures (unless `best_effort` is configured) and cancellation.
    pub fn speak(&self, tag: &str, prompt: &str) -> Result<Speech, ChainError> {
        self.speak_with_rng(tag, prompt, &mut rand::thread_rng())
    }

    /// [`Self::speak`] drawing randomness from `rng`.
    ///
    /// # Errors
    /// See [`Self::speak`].
    pub fn speak_with_rng<R: RngCore + ?Sized>(
        &self,
        tag: &str,
        prompt: &str,
        rng: &mut R,
    ) -> Result<Speech, ChainError> {
        let cancel = self.cancel_token();
        let store = self.open_store()?;
        let mut prompt_tokens = self.tokens.get();
        tokenize_into(&mut prompt_tokens, prompt);
        let mut builder = self.builders.get();
        let speech =
            speak(&*store, &cancel, &self.config, tag, &prompt_tokens, rng, &mut builder)?;
        tracing::debug!(
            tag,
            trace = speech.trace.len(),
            truncated = speech.truncated,
            "generated message"
        );
        Ok(speech)
    }

    /// Forget one message. Forgetting an unknown id bars it from being learned later.
    ///
    /// # Errors
    /// Returns store or cancellation errors.
    pub fn forget(&self, tag: &str, id: &MessageId) -> Result<(), ChainError> {
        let cancel = self.cancel_token();
        self.open_store()?.forget_message(&cancel, tag, id, DeleteReason::Message)
    }

    /// Forget every message `user` sent at or after `since`, in every tag.
    ///
    /// # Errors
    /// Returns store or cancellation errors.
    pub fn forget_user_since(
        &self,
        user: &UserHash,
        since: OffsetDateTime,
    ) -> Result<usize, ChainError> {
        let cancel = self.cancel_token();
        self.open_store()?.forget_user_since(&cancel, user, since)
    }

    /// Forget every message in `tag` with `since <= time < before`.
    ///
    /// # Errors
    /// Returns store or cancellation errors.
    pub fn forget_during(
        &self,
        tag: &str,
        since: OffsetDateTime,
        before: OffsetDateTime,
    ) -> Result<usize, ChainError> {
        let cancel = self.cancel_token();
        self.open_store()?.forget_during(&cancel, tag, since, before)
    }

    /// Forget every live message in `tag` whose text matches the regular
    /// expression `pattern`.
    ///
    /// # Errors
    /// Returns [`ChainError::InvalidPattern`] for an empty or malformed pattern, and
    /// store or cancellation errors otherwise.
    pub fn forget_pattern(&self, tag: &str, pattern: &str) -> Result<usize, ChainError> {
        let pattern = PatternMatcher::new(pattern)?;
        let cancel = self.cancel_token();
        self.open_store()?.forget_pattern(&cancel, tag, &pattern)
    }

    /// Forget every message that contributed to a generated [`Speech`].
    ///
    /// # Errors
    /// Returns store or cancellation errors.
    pub fn forget_trace(&self, tag: &str, trace: &[MessageId]) -> Result<(), ChainError> {
        let cancel = self.cancel_token();
        let mut store = self.open_store()?;
        forget_trace(&mut *store, &cancel, tag, trace)
    }

    /// Audit lookup of one message, including the reason it was forgotten.
    ///
    /// # Errors
    /// Returns store errors.
    pub fn message(&self, tag: &str, id: &MessageId) -> Result<Option<MessageRecord>, ChainError> {
        self.open_store()?.message(tag, id)
    }

    /// Physically remove chain entries of forgotten messages in `tag`.
    ///
    /// # Errors
    /// Returns store or cancellation errors.
    pub fn compact(&self, tag: &str) -> Result<usize, ChainError> {
        let cancel = self.cancel_token();
        self.open_store()?.compact(&cancel, tag)
    }
}

/// Recover a typed chain error from an operational failure.
fn chain_error(err: anyhow::Error) -> ChainError {
    match err.downcast::<ChainError>() {
        Ok(err) => err,
        Err(err) => ChainError::StoreUnavailable(format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::{anyhow, Context};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use time::Duration;

    use super::*;

    const BACKENDS: [BackendKind; 2] = [BackendKind::Kv, BackendKind::Relational];

    fn unique_temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chainkernel-api-{label}-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn api(backend: BackendKind, label: &str) -> Result<(ChainKernelApi, PathBuf)> {
        let db_path = unique_temp_db_path(label);
        let config = EngineConfig { order: 2, ..EngineConfig::default() };
        Ok((ChainKernelApi::new(db_path.clone(), backend, config)?, db_path))
    }

    fn meta(id: &str, sender: &str, minute: i64) -> Result<MessageMeta> {
        Ok(MessageMeta {
            id: MessageId::new(id)?,
            sender: UserHash::from_hashed(sender),
            time: OffsetDateTime::UNIX_EPOCH + Duration::minutes(minute),
        })
    }

    fn speak_seeded(api: &ChainKernelApi, tag: &str, seed: u64) -> Result<Speech> {
        Ok(api.speak_with_rng(tag, "", &mut StdRng::seed_from_u64(seed))?)
    }

    #[test]
    fn kessoku_scenario_reproduces_the_only_message() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "kessoku")?;
            api.learn("kessoku", &meta("1", "bocchi", 0)?, "bocchi ryou")?;
            let speech = api.speak("kessoku", "")?;
            assert_eq!(speech.text, "bocchi ryou", "backend {}", backend.as_str());
            assert_eq!(speech.trace, vec![MessageId::new("1")?]);
            assert!(!speech.truncated);
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn concurrent_first_learns_on_a_new_database_all_succeed() -> Result<()> {
        for backend in BACKENDS {
            let db_path = unique_temp_db_path("first-learns");
            let handles: Vec<_> = (0..8)
                .map(|writer| {
                    let db_path = db_path.clone();
                    std::thread::spawn(move || -> Result<()> {
                        let config = EngineConfig { order: 2, ..EngineConfig::default() };
                        let api = ChainKernelApi::new(db_path, backend, config)?;
                        api.learn("t", &meta(&writer.to_string(), "u", 0)?, "hello world")?;
                        Ok(())
                    })
                })
                .collect();
            for handle in handles {
                let Ok(thread_result) = handle.join() else {
                    return Err(anyhow!("learn thread panicked"));
                };
                thread_result?;
            }

            let config = EngineConfig { order: 2, ..EngineConfig::default() };
            let api = ChainKernelApi::new(db_path.clone(), backend, config)?;
            let speech = speak_seeded(&api, "t", 3)?;
            assert_eq!(speech.text, "hello world", "backend {}", backend.as_str());
            assert_eq!(speech.trace.len(), 1);
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn tags_are_isolated() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "tags")?;
            api.learn("kessoku", &meta("1", "bocchi", 0)?, "bocchi ryou")?;
            let speech = api.speak("sick-hack", "")?;
            assert_eq!(speech.text, "");
            assert!(speech.trace.is_empty());
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn forgotten_message_never_appears_in_a_trace() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "roundtrip")?;
            let secret = meta("1", "bocchi", 0)?;
            api.learn("t", &secret, "secret plans tonight")?;
            api.learn("t", &meta("2", "nijika", 1)?, "public plans tomorrow")?;
            api.forget("t", &secret.id)?;
            for seed in 0..30 {
                let speech = speak_seeded(&api, "t", seed)?;
                assert!(!speech.trace.contains(&secret.id));
                assert!(!speech.text.contains("secret"));
            }
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn identical_text_survives_forgetting_one_contributor() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "identical")?;
            api.learn("t", &meta("1", "a", 0)?, "kita ikuyo")?;
            api.learn("t", &meta("2", "b", 1)?, "kita ikuyo")?;
            api.forget("t", &MessageId::new("1")?)?;
            let speech = api.speak("t", "")?;
            assert_eq!(speech.text, "kita ikuyo");
            assert_eq!(speech.trace, vec![MessageId::new("2")?]);
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn forget_twice_keeps_the_first_outcome() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "idempotent")?;
            let m = meta("1", "bocchi", 0)?;
            api.learn("t", &m, "bocchi ryou")?;
            api.forget("t", &m.id)?;
            let first = api.message("t", &m.id)?;
            api.forget("t", &m.id)?;
            assert_eq!(api.message("t", &m.id)?, first);
            assert_eq!(first.and_then(|record| record.deleted), Some(DeleteReason::Message));

            let err = api.learn("t", &m, "bocchi ryou").err();
            assert_eq!(err, Some(ChainError::AlreadyForgotten(m.id.clone())));
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn duplicate_learn_is_an_idempotency_guard() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "duplicate")?;
            let m = meta("1", "bocchi", 0)?;
            api.learn("t", &m, "bocchi ryou")?;
            let err = api
                .learn("t", &m, "bocchi ryou")
                .err()
                .ok_or_else(|| anyhow!("duplicate learn accepted"))?;
            assert!(err.is_idempotency_guard());
            assert!(!err.is_retryable());
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn bulk_forgetting_counts_messages() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "bulk")?;
            api.learn("a", &meta("1", "bocchi", 0)?, "early words")?;
            api.learn("a", &meta("2", "bocchi", 10)?, "secret words")?;
            api.learn("b", &meta("3", "bocchi", 20)?, "other room")?;
            api.learn("a", &meta("4", "kita", 30)?, "secret too")?;

            let at = |minute| OffsetDateTime::UNIX_EPOCH + Duration::minutes(minute);
            let user = UserHash::from_hashed("bocchi");
            assert_eq!(api.forget_user_since(&user, at(10))?, 2);
            assert_eq!(api.forget_pattern("a", "secret")?, 1);
            assert_eq!(api.forget_during("a", at(0), at(1))?, 1);
            assert_eq!(api.speak("a", "")?.text, "");

            let reason = api.message("a", &MessageId::new("4")?)?.and_then(|r| r.deleted);
            assert_eq!(reason, Some(DeleteReason::Pattern));
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn invalid_pattern_is_rejected_before_touching_the_store() -> Result<()> {
        let (api, db_path) = api(BackendKind::Kv, "pattern")?;
        let err = api.forget_pattern("t", "(unclosed").err();
        assert!(matches!(err, Some(ChainError::InvalidPattern(_))));
        assert!(!db_path.exists());
        Ok(())
    }

    #[test]
    fn speech_trace_can_be_forgotten() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "trace")?;
            api.learn("t", &meta("1", "a", 0)?, "hitori goto")?;
            let speech = api.speak("t", "")?;
            api.forget_trace("t", &speech.trace)?;
            assert_eq!(api.speak("t", "")?.text, "");
            let compacted = api.compact("t")?;
            match backend {
                BackendKind::Kv => assert_eq!(compacted, 3),
                BackendKind::Relational => assert_eq!(compacted, 0),
            }
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn migrate_dry_run_then_apply() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "migrate")?;
            let plan = api.migrate(true)?;
            assert!(plan.dry_run);
            assert_eq!(plan.current_version, 0);
            assert!(!plan.would_apply_versions.is_empty());
            assert_eq!(plan.backend, backend.as_str());

            let applied = api.migrate(false)?;
            assert_eq!(applied.up_to_date, Some(true));
            assert_eq!(applied.after_version, Some(applied.target_version));
            assert_eq!(api.schema_status()?.order, Some(2));
            assert!(api.integrity_check()?.is_clean());
            drop(api);
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn reopening_with_another_order_is_a_validation_error() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "order")?;
            api.learn("t", &meta("1", "a", 0)?, "bocchi ryou")?;
            let config = EngineConfig { order: 3, ..EngineConfig::default() };
            let other = ChainKernelApi::new(db_path.clone(), backend, config)?;
            assert!(matches!(other.speak("t", ""), Err(ChainError::Validation(_))));
            drop((api, other));
            cleanup(&db_path)?;
        }
        Ok(())
    }

    #[test]
    fn expired_scan_timeout_cancels_calls() -> Result<()> {
        let db_path = unique_temp_db_path("timeout");
        let config = EngineConfig { order: 2, scan_timeout_ms: Some(0), ..EngineConfig::default() };
        let api = ChainKernelApi::new(db_path.clone(), BackendKind::Relational, config)?;
        assert_eq!(api.learn("t", &meta("1", "a", 0)?, "too late"), Err(ChainError::Cancelled));
        drop(api);
        cleanup(&db_path)
    }

    #[test]
    fn shutdown_token_cancels_every_call() -> Result<()> {
        let (api, db_path) = api(BackendKind::Kv, "shutdown")?;
        api.learn("t", &meta("1", "a", 0)?, "bocchi ryou")?;
        api.shutdown_token().cancel();
        assert_eq!(api.speak("t", ""), Err(ChainError::Cancelled));
        drop(api);
        cleanup(&db_path)
    }

    #[test]
    fn backup_restores_into_a_new_api() -> Result<()> {
        for backend in BACKENDS {
            let (api, db_path) = api(backend, "backup")?;
            api.learn("kessoku", &meta("1", "a", 0)?, "bocchi ryou")?;
            let backup_path = unique_temp_db_path("backup-copy");
            api.backup(&backup_path)?;

            let restored =
                ChainKernelApi::new(backup_path.clone(), backend, api.config().clone())?;
            assert_eq!(restored.speak("kessoku", "")?.text, "bocchi ryou");
            drop((api, restored));
            cleanup(&db_path)?;
            cleanup(&backup_path)?;
        }
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig { min_candidates: 0, ..EngineConfig::default() };
        let result = ChainKernelApi::new(PathBuf::from("unused"), BackendKind::Kv, config);
        assert!(matches!(result, Err(ChainError::Validation(_))));
    }

    #[test]
    fn backend_kind_serializes_as_snake_case() -> Result<()> {
        assert_eq!(serde_json::to_string(&BackendKind::Relational)?, "\"relational\"");
        let parsed: BackendKind = serde_json::from_str("\"kv\"")?;
        assert_eq!(parsed, BackendKind::Kv);
        Ok(())
    }
}
