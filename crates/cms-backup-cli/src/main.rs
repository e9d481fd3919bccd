use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cms_backup_core::{
    export_archive, inspect_archive, restore_archive, BackupSettings, TableRegistry,
};
use cms_backup_store_sqlite::SqliteDatabase;
use serde_json::Value;

mod logging;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "cmsb")]
#[command(about = "CMS backup and restore")]
struct Cli {
    #[arg(long, global = true, default_value = "./cms.sqlite3")]
    db: PathBuf,

    /// YAML settings file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log level. `RUST_LOG` still takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    Export(ExportArgs),
    Restore(RestoreArgs),
    Inspect(InspectArgs),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema",
            Self::Export(_) => "export",
            Self::Restore(_) => "restore",
            Self::Inspect(_) => "inspect",
        }
    }
}

#[derive(Debug, Subcommand)]
enum SchemaCommand {
    /// Create every canonical table that does not exist yet.
    Init,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    archive: PathBuf,
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long)]
    archive: PathBuf,
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

fn load_settings(path: Option<&Path>) -> Result<BackupSettings> {
    match path {
        Some(path) => BackupSettings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => Ok(BackupSettings::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;
    logging::init(cli.log_level.as_deref().unwrap_or(settings.log_level.as_str()));
    tracing::debug!(db = %cli.db.display(), command = cli.command.name(), "Running command");

    let result = match cli.command {
        Command::Schema { command } => {
            let db = SqliteDatabase::open(&cli.db)?;
            run_schema(&command, &db)
        }
        Command::Export(args) => {
            let db = SqliteDatabase::open(&cli.db)?;
            run_export(&args, &db, &settings)
        }
        Command::Restore(args) => {
            let mut db = SqliteDatabase::open(&cli.db)?;
            run_restore(&args, &mut db)
        }
        Command::Inspect(args) => run_inspect(&args),
    };
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "Command failed");
    }
    result
}

fn run_schema(command: &SchemaCommand, db: &SqliteDatabase) -> Result<()> {
    match command {
        SchemaCommand::Init => {
            db.apply_schema()?;
            emit_json(serde_json::json!({
                "status": "initialized",
                "tables": TableRegistry::global().tables(),
            }))
        }
    }
}

fn run_export(args: &ExportArgs, db: &SqliteDatabase, settings: &BackupSettings) -> Result<()> {
    let file = File::create(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let summary = export_archive(db, file, settings)
        .with_context(|| format!("failed to write archive {}", args.out.display()))?;
    tracing::info!(
        out = %args.out.display(),
        rows = summary.total_rows,
        skipped = summary.skipped.len(),
        "Archive written"
    );
    emit_json(serde_json::json!({
        "out": args.out.display().to_string(),
        "skipped": summary.skipped,
        "total_rows": summary.total_rows,
        "manifest": summary.manifest,
    }))
}

fn run_restore(args: &RestoreArgs, db: &mut SqliteDatabase) -> Result<()> {
    let file = File::open(&args.archive)
        .with_context(|| format!("failed to open {}", args.archive.display()))?;
    let summary = restore_archive(db, BufReader::new(file))
        .with_context(|| format!("restore of {} failed", args.archive.display()))?;
    tracing::info!(
        archive = %args.archive.display(),
        tables = summary.tables.len(),
        ignored = summary.ignored_entries.len(),
        "Restore committed"
    );
    emit_json(serde_json::to_value(&summary)?)
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    let file = File::open(&args.archive)
        .with_context(|| format!("failed to open {}", args.archive.display()))?;
    let plan = inspect_archive(BufReader::new(file))
        .with_context(|| format!("failed to scan {}", args.archive.display()))?;
    emit_json(serde_json::json!({
        "tables": plan.in_import_order(),
        "shadowed": plan.shadowed,
        "ignored": plan.ignored,
        "assets": plan.assets,
        "manifest": plan.manifest,
    }))
}
