use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use chain_kernel_api::{BackendKind, ChainKernelApi};
use chain_kernel_core::{ChainError, EngineConfig, MessageId, MessageMeta, UserHash};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "CK_LOG";
const USER_SECRET_ENV: &str = "CK_USER_SECRET";

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Chain Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./chain_kernel.sqlite3")]
    db: PathBuf,

    #[arg(long, value_enum, default_value_t = BackendArg::Kv)]
    backend: BackendArg,

    /// Engine configuration as JSON; missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the chain order from the configuration file.
    #[arg(long)]
    order: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Learn(LearnArgs),
    Speak(SpeakArgs),
    Forget {
        #[command(subcommand)]
        command: ForgetCommand,
    },
    Message(MessageArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct LearnArgs {
    #[arg(long)]
    tag: String,
    /// Platform message id; a ULID is generated when omitted.
    #[arg(long)]
    id: Option<String>,
    #[command(flatten)]
    sender: SenderArgs,
    /// RFC3339 UTC send time; defaults to now.
    #[arg(long)]
    time: Option<String>,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Args)]
struct SenderArgs {
    /// Already-hashed sender identity.
    #[arg(long, conflicts_with_all = ["user", "room"])]
    sender: Option<String>,
    /// Raw platform user id, hashed together with `--room` and `CK_USER_SECRET`.
    #[arg(long, requires = "room")]
    user: Option<String>,
    #[arg(long, requires = "user")]
    room: Option<String>,
}

#[derive(Debug, Args)]
struct SpeakArgs {
    #[arg(long)]
    tag: String,
    #[arg(long, default_value = "")]
    prompt: String,
    /// Seed for reproducible output.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum ForgetCommand {
    Message(MessageArgs),
    User(ForgetUserArgs),
    During(ForgetDuringArgs),
    Pattern(ForgetPatternArgs),
}

#[derive(Debug, Args)]
struct MessageArgs {
    #[arg(long)]
    tag: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ForgetUserArgs {
    #[command(flatten)]
    sender: SenderArgs,
    #[arg(long)]
    since: String,
}

#[derive(Debug, Args)]
struct ForgetDuringArgs {
    #[arg(long)]
    tag: String,
    #[arg(long)]
    since: String,
    #[arg(long)]
    before: String,
}

#[derive(Debug, Args)]
struct ForgetPatternArgs {
    #[arg(long)]
    tag: String,
    #[arg(long)]
    pattern: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Compact(DbCompactArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbCompactArgs {
    #[arg(long)]
    tag: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Kv,
    Relational,
}

impl BackendArg {
    fn into_backend_kind(self) -> BackendKind {
        match self {
            Self::Kv => BackendKind::Kv,
            Self::Relational => BackendKind::Relational,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
    tracing_subscriber::registry().with(filter).with(layer).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = serde_json::json!({
                "error": {
                    "kind": error_kind(&err),
                    "message": format!("{err:#}"),
                }
            });
            if emit_json(envelope).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn error_kind(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<ChainError>().map_or("internal", ChainError::kind)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref(), cli.order)?;
    tracing::debug!(db = %cli.db.display(), order = config.order, "opening chain store");
    let api = ChainKernelApi::new(cli.db, cli.backend.into_backend_kind(), config)?;
    match cli.command {
        Command::Learn(args) => run_learn(&api, args),
        Command::Speak(args) => run_speak(&api, &args),
        Command::Forget { command } => run_forget(&api, command),
        Command::Message(args) => run_message(&api, &args),
        Command::Db { command } => run_db(&api, command),
    }
}

fn load_config(path: Option<&PathBuf>, order: Option<usize>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&body)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(order) = order {
        config.order = order;
    }
    Ok(config)
}

fn run_learn(api: &ChainKernelApi, args: LearnArgs) -> Result<()> {
    let id = match args.id {
        Some(raw) => MessageId::new(raw)?,
        None => MessageId::generate(),
    };
    let meta = MessageMeta {
        id,
        sender: resolve_sender(&args.sender)?,
        time: parse_optional_rfc3339(args.time.as_deref())?,
    };
    api.learn(&args.tag, &meta, &args.text)?;
    emit_json(serde_json::json!({
        "backend": api.backend().as_str(),
        "tag": args.tag,
        "message_id": meta.id,
        "learned": true
    }))
}

fn run_speak(api: &ChainKernelApi, args: &SpeakArgs) -> Result<()> {
    let speech = match args.seed {
        Some(seed) => {
            api.speak_with_rng(&args.tag, &args.prompt, &mut StdRng::seed_from_u64(seed))?
        }
        None => api.speak(&args.tag, &args.prompt)?,
    };
    emit_json(serde_json::json!({
        "tag": args.tag,
        "text": speech.text,
        "trace": speech.trace,
        "truncated": speech.truncated
    }))
}

fn run_forget(api: &ChainKernelApi, command: ForgetCommand) -> Result<()> {
    match command {
        ForgetCommand::Message(args) => {
            let id = MessageId::new(args.id)?;
            api.forget(&args.tag, &id)?;
            emit_json(serde_json::json!({
                "tag": args.tag,
                "message_id": id,
                "forgotten": true
            }))
        }
        ForgetCommand::User(args) => {
            let user = resolve_sender(&args.sender)?;
            let since = parse_rfc3339(&args.since)?;
            let forgotten = api.forget_user_since(&user, since)?;
            emit_json(serde_json::json!({
                "sender": user,
                "since": args.since,
                "forgotten": forgotten
            }))
        }
        ForgetCommand::During(args) => {
            let since = parse_rfc3339(&args.since)?;
            let before = parse_rfc3339(&args.before)?;
            if before < since {
                return Err(anyhow!("--before MUST NOT precede --since"));
            }
            let forgotten = api.forget_during(&args.tag, since, before)?;
            emit_json(serde_json::json!({
                "tag": args.tag,
                "since": args.since,
                "before": args.before,
                "forgotten": forgotten
            }))
        }
        ForgetCommand::Pattern(args) => {
            let forgotten = api.forget_pattern(&args.tag, &args.pattern)?;
            emit_json(serde_json::json!({
                "tag": args.tag,
                "pattern": args.pattern,
                "forgotten": forgotten
            }))
        }
    }
}

fn run_message(api: &ChainKernelApi, args: &MessageArgs) -> Result<()> {
    let id = MessageId::new(args.id.as_str())?;
    let record = api.message(&args.tag, &id)?;
    emit_json(serde_json::json!({
        "found": record.is_some(),
        "record": serde_json::to_value(&record).context("failed to serialize message record")?
    }))
}

fn run_db(api: &ChainKernelApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "backend": status.backend,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "order": status.order
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let mut value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            if let Value::Object(object) = &mut value {
                object.insert("clean".to_string(), Value::Bool(report.is_clean()));
            }
            emit_json(value)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Compact(args) => {
            let removed = api.compact(&args.tag)?;
            emit_json(serde_json::json!({
                "backend": api.backend().as_str(),
                "tag": args.tag,
                "removed": removed
            }))
        }
    }
}

fn resolve_sender(args: &SenderArgs) -> Result<UserHash> {
    match (&args.sender, &args.user, &args.room) {
        (Some(hashed), _, _) => Ok(UserHash::from_hashed(hashed.as_str())),
        (None, Some(user), Some(room)) => {
            let secret = std::env::var(USER_SECRET_ENV).unwrap_or_default();
            Ok(UserHash::derive(secret.as_bytes(), user, room))
        }
        _ => Err(anyhow!("either --sender or --user with --room is required")),
    }
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
