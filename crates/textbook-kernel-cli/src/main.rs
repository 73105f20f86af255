use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use textbook_kernel_api::{
    LinkRequest, MaintenanceApi, MaintenanceConfig, RepairOptions, DEFAULT_QR_BASE_URL,
};
use textbook_kernel_core::{ApiResponse, ExplanationTransition, KernelError, PromptVersionOrder};
use textbook_kernel_store_sqlite::{
    ErrorKind, PromptDraft, StoreConfig, StoreError, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_DB_PATH,
};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tk")]
#[command(about = "Textbook Kernel maintenance CLI")]
struct Cli {
    /// Store location: a path, `sqlite://<path>`, or `sqlite::memory:`.
    #[arg(long, env = "TEXTBOOK_KERNEL_DB", default_value = DEFAULT_DB_PATH)]
    db: String,

    /// Base URL for generated `qrCodeUrl` values.
    #[arg(long, env = "TEXTBOOK_KERNEL_QR_BASE_URL", default_value = DEFAULT_QR_BASE_URL)]
    qr_base_url: String,

    #[arg(long, env = "TEXTBOOK_KERNEL_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Docs {
        #[command(subcommand)]
        command: DocsCommand,
    },
    Mappings {
        #[command(subcommand)]
        command: MappingsCommand,
    },
    PassageSets {
        #[command(subcommand)]
        command: PassageSetsCommand,
    },
    Textbook {
        #[command(subcommand)]
        command: TextbookCommand,
    },
    Prompts {
        #[command(subcommand)]
        command: PromptsCommand,
    },
    Questions {
        #[command(subcommand)]
        command: QuestionsCommand,
    },
    Tombstones {
        #[command(subcommand)]
        command: TombstonesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DryRunArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DryRunArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DocsCommand {
    /// Load an NDJSON file (`mongoexport` output) into a collection.
    Import(DocsImportArgs),
}

#[derive(Debug, Args)]
struct DocsImportArgs {
    #[arg(long)]
    collection: String,
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Subcommand)]
enum MappingsCommand {
    List,
    PurgeWithoutQr(DryRunArgs),
    Report,
    Link(LinkArgs),
    Unlink(PairArgs),
}

#[derive(Debug, Args)]
struct PairArgs {
    #[arg(long)]
    textbook_id: String,
    #[arg(long)]
    passage_set_id: String,
}

#[derive(Debug, Args)]
struct LinkArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    order: Option<u32>,
    #[arg(long)]
    qr_code: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PassageSetsCommand {
    DetectLegacy,
    StripLegacy(StripLegacyArgs),
}

#[derive(Debug, Args)]
struct StripLegacyArgs {
    #[arg(long, default_value_t = false)]
    create_missing_mappings: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum TextbookCommand {
    PassageSets(TextbookPassageSetsArgs),
}

#[derive(Debug, Args)]
struct TextbookPassageSetsArgs {
    #[arg(long)]
    textbook_id: String,
}

#[derive(Debug, Subcommand)]
enum PromptsCommand {
    Save(PromptSaveArgs),
    Versions(PromptVersionsArgs),
    Restore(PromptRestoreArgs),
    SetActive(PromptSetActiveArgs),
}

#[derive(Debug, Args)]
struct PromptSaveArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, conflicts_with = "content_file", required_unless_present = "content_file")]
    content: Option<String>,
    #[arg(long)]
    content_file: Option<PathBuf>,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
struct PromptVersionsArgs {
    #[arg(long)]
    key: String,
    #[arg(long, value_enum, default_value_t = OrderArg::Version)]
    order: OrderArg,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct PromptRestoreArgs {
    #[arg(long)]
    key: String,
    #[arg(long)]
    version: u32,
}

#[derive(Debug, Args)]
struct PromptSetActiveArgs {
    #[arg(long)]
    key: String,
    #[arg(long, action = clap::ArgAction::Set)]
    active: bool,
}

#[derive(Debug, Subcommand)]
enum QuestionsCommand {
    Explanation(ExplanationArgs),
}

#[derive(Debug, Args)]
struct ExplanationArgs {
    #[arg(long)]
    question_id: String,
    #[arg(long, value_enum)]
    status: StatusArg,
    /// Explanation text for `completed`, error text for `failed`.
    #[arg(long)]
    text: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TombstonesCommand {
    List(TombstonesListArgs),
    Restore(TombstoneRestoreArgs),
}

#[derive(Debug, Args)]
struct TombstonesListArgs {
    #[arg(long)]
    collection: Option<String>,
}

#[derive(Debug, Args)]
struct TombstoneRestoreArgs {
    #[arg(long)]
    tombstone_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Version,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    contract_version: &'static str,
    #[serde(flatten)]
    response: ApiResponse<T>,
}

fn emit_json<T: Serialize>(response: ApiResponse<T>) -> Result<()> {
    let envelope = Envelope { contract_version: CLI_CONTRACT_VERSION, response };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn emit_ok<T: Serialize>(data: T, message: Option<String>) -> Result<()> {
    let response = ApiResponse::ok(data);
    match message {
        Some(message) => emit_json(response.with_message(message)),
        None => emit_json(response),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { ExitCode::from(1) } else { ExitCode::SUCCESS };
        }
    };
    init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let kind = error_kind(&err);
            let marker = kind.map_or("ERROR", ErrorKind::marker);
            tracing::error!(marker, error = %format!("{err:#}"), "command failed");
            if let Err(emit_err) = emit_json(ApiResponse::failure(format!("{marker}: {err:#}"))) {
                tracing::error!(error = %emit_err, "failed to write error envelope");
            }
            ExitCode::from(exit_code(kind))
        }
    }
}

fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    if let Some(store_err) = err.chain().find_map(|cause| cause.downcast_ref::<StoreError>()) {
        return Some(store_err.kind());
    }
    err.chain().find_map(|cause| cause.downcast_ref::<KernelError>()).map(|kernel_err| {
        match kernel_err {
            KernelError::Query(_) => ErrorKind::Query,
            _ => ErrorKind::Validation,
        }
    })
}

fn exit_code(kind: Option<ErrorKind>) -> u8 {
    match kind {
        Some(ErrorKind::Connection) => 2,
        Some(ErrorKind::Query) => 3,
        Some(ErrorKind::Write) => 4,
        Some(ErrorKind::Validation) => 5,
        None => 1,
    }
}

fn build_api(cli: &Cli) -> Result<MaintenanceApi> {
    let store = StoreConfig::from_connection_string(&cli.db)?
        .with_busy_timeout_ms(cli.busy_timeout_ms);
    Ok(MaintenanceApi::new(MaintenanceConfig { store, qr_base_url: cli.qr_base_url.clone() }))
}

fn run(cli: Cli) -> Result<()> {
    let api = build_api(&cli)?;
    tracing::debug!(db = %api.config().store.describe(), "resolved store");
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Docs { command } => run_docs(command, &api),
        Command::Mappings { command } => run_mappings(command, &api),
        Command::PassageSets { command } => run_passage_sets(command, &api),
        Command::Textbook { command } => run_textbook(command, &api),
        Command::Prompts { command } => run_prompts(command, &api),
        Command::Questions { command } => run_questions(command, &api),
        Command::Tombstones { command } => run_tombstones(command, &api),
    }
}

fn run_db(command: DbCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_ok(
                serde_json::json!({
                    "current_version": status.current_version,
                    "target_version": status.target_version,
                    "pending_versions": status.pending_versions,
                    "up_to_date": status.pending_versions.is_empty(),
                    "inferred_from_legacy": status.inferred_from_legacy
                }),
                None,
            )
        }
        DbCommand::Migrate(args) => emit_ok(api.migrate(args.dry_run)?, None),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let clean = report.quick_check_ok
                && report.foreign_key_violations.is_empty()
                && report.domain.mappings_without_qr == 0
                && report.domain.legacy_passage_sets == 0
                && report.domain.dangling_mappings == 0;
            let message = (!clean).then(|| "store needs maintenance".to_string());
            emit_ok(report, message)
        }
    }
}

fn run_docs(command: DocsCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        DocsCommand::Import(args) => {
            let report = api.import_ndjson(&args.collection, &args.input, args.skip_existing)?;
            let message = format!(
                "imported {} of {} documents into {}",
                report.imported, report.records, report.collection
            );
            emit_ok(report, Some(message))
        }
    }
}

fn run_mappings(command: MappingsCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        MappingsCommand::List => emit_ok(api.list_all_mappings()?, None),
        MappingsCommand::PurgeWithoutQr(args) => {
            let outcome = api.purge_mappings_without_qr(args.dry_run)?;
            let message = if outcome.dry_run {
                format!("{} mappings without qr code would be deleted", outcome.candidates.len())
            } else {
                format!("deleted {} mappings without qr code", outcome.deleted)
            };
            emit_ok(outcome, Some(message))
        }
        MappingsCommand::Report => emit_ok(api.report_current_mappings()?, None),
        MappingsCommand::Link(args) => {
            let mapping = api.link_passage_set(&LinkRequest {
                textbook_id: args.pair.textbook_id,
                passage_set_id: args.pair.passage_set_id,
                order: args.order,
                qr_code: args.qr_code,
            })?;
            emit_ok(mapping, None)
        }
        MappingsCommand::Unlink(args) => {
            emit_ok(api.unlink_passage_set(&args.textbook_id, &args.passage_set_id)?, None)
        }
    }
}

fn run_passage_sets(command: PassageSetsCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        PassageSetsCommand::DetectLegacy => emit_ok(api.detect_legacy_passage_sets()?, None),
        PassageSetsCommand::StripLegacy(args) => {
            let report = api.strip_legacy_fields(RepairOptions {
                create_missing_mappings: args.create_missing_mappings,
                dry_run: args.dry_run,
            })?;
            let message = (report.skipped > 0).then(|| {
                format!(
                    "{} legacy passage sets skipped; rerun with --create-missing-mappings to link them",
                    report.skipped
                )
            });
            emit_ok(report, message)
        }
    }
}

fn run_textbook(command: TextbookCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        TextbookCommand::PassageSets(args) => {
            emit_ok(api.textbook_passage_sets(&args.textbook_id)?, None)
        }
    }
}

fn run_prompts(command: PromptsCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        PromptsCommand::Save(args) => {
            let content = match (args.content, args.content_file) {
                (Some(content), _) => content,
                (None, Some(path)) => fs::read_to_string(&path)
                    .with_context(|| format!("failed to read prompt file {}", path.display()))?,
                (None, None) => return Err(anyhow!("either --content or --content-file is required")),
            };
            let revision = api.save_prompt(&PromptDraft {
                key: args.key,
                name: args.name,
                description: args.description,
                content,
                change_note: args.note,
            })?;
            let message = (!revision.changed).then(|| "content unchanged; no new version".to_string());
            emit_ok(revision, message)
        }
        PromptsCommand::Versions(args) => {
            let order = match args.order {
                OrderArg::Version => PromptVersionOrder::Version,
                OrderArg::CreatedAt => PromptVersionOrder::CreatedAt,
            };
            emit_ok(api.list_prompt_versions(&args.key, order, args.limit)?, None)
        }
        PromptsCommand::Restore(args) => {
            emit_ok(api.restore_prompt_version(&args.key, args.version)?, None)
        }
        PromptsCommand::SetActive(args) => {
            emit_ok(api.set_prompt_active(&args.key, args.active)?, None)
        }
    }
}

fn run_questions(command: QuestionsCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        QuestionsCommand::Explanation(args) => {
            let transition = match (args.status, args.text) {
                (StatusArg::Generating, _) => ExplanationTransition::Start,
                (StatusArg::Completed, Some(explanation)) => {
                    ExplanationTransition::Complete { explanation }
                }
                (StatusArg::Failed, Some(error)) => ExplanationTransition::Fail { error },
                (StatusArg::Completed | StatusArg::Failed, None) => {
                    return Err(KernelError::Validation(
                        "--text is required for completed and failed".to_string(),
                    )
                    .into());
                }
            };
            emit_ok(api.transition_explanation(&args.question_id, transition)?, None)
        }
    }
}

fn run_tombstones(command: TombstonesCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        TombstonesCommand::List(args) => {
            emit_ok(api.list_tombstones(args.collection.as_deref())?, None)
        }
        TombstonesCommand::Restore(args) => {
            emit_ok(api.restore_tombstone(&args.tombstone_id)?, None)
        }
    }
}
