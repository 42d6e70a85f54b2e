//! pg-live-migrate CLI - live migration of Oracle/MySQL/PostgreSQL
//! databases to a distributed PostgreSQL-compatible cluster.

use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use pg_live_migrate::config::{ExportType, MigrationConfig, SourceConfig, TargetConfig};
use pg_live_migrate::datafile::Descriptor;
use pg_live_migrate::error::{MigrateError, Result};
use pg_live_migrate::exporter::{create_migration_project, SnapshotExporter};
use pg_live_migrate::importer::{
    start_apply_channels, BatchSizeLimits, EventStreamImporter, SnapshotFileImporter,
    StreamingConfig,
};
use pg_live_migrate::metadb::MetaDb;
use pg_live_migrate::namereg::NameRegistry;
use pg_live_migrate::sqlname::{Dialect, Role};
use pg_live_migrate::srcdb::{SourceDb, SourceDbImpl};
use pg_live_migrate::state::ImportDataState;
use pg_live_migrate::status;
use pg_live_migrate::tgtdb::{AttributeNameRegistry, ImportBatchArgs, TargetDb};

#[derive(Parser)]
#[command(name = "pg-live-migrate")]
#[command(about = "Live database migration to a distributed PostgreSQL-compatible cluster")]
#[command(version)]
struct Cli {
    /// Export directory holding all migration state
    #[arg(long, global = true, default_value = ".")]
    export_dir: PathBuf,

    /// Log format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, global = true, default_value = "info")]
    verbosity: String,

    /// Answer yes to all confirmation prompts
    #[arg(long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export schema or data from the source database
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Import schema or data into the target cluster
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
    /// Combined snapshot and streaming progress report
    GetDataMigrationReport {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Mark the migration finished and clean up source-side artifacts
    EndMigration {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Subcommand)]
enum ExportCommands {
    /// Export the schema via the source's dump tool
    Schema {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Export table data (add `status` for a progress report)
    Data(ExportDataArgs),
}

#[derive(Args)]
struct ExportDataArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Comma-separated table list; default is every table in the schema
    #[arg(long)]
    table_list: Option<String>,

    /// What to export: snapshot-only, changes-only, snapshot-and-changes
    #[arg(long, default_value = "snapshot-only")]
    export_type: String,

    /// Parallel dump jobs
    #[arg(long)]
    parallel_jobs: Option<usize>,

    #[command(subcommand)]
    command: Option<StatusCommand>,
}

#[derive(Subcommand)]
enum StatusCommand {
    /// Progress report
    Status,
}

#[derive(Subcommand)]
enum ImportCommands {
    /// Apply the exported schema to the target
    Schema {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Import snapshot data and, in live mode, stream changes (add
    /// `status` for a progress report, `file` for a standalone file)
    Data(ImportDataArgs),
}

#[derive(Args)]
struct ImportDataFileArgs {
    /// Path of the data file
    #[arg(long)]
    data_file_path: PathBuf,

    /// Target table (optionally schema-qualified)
    #[arg(long)]
    table: String,

    /// File format: text or csv
    #[arg(long, default_value = "text")]
    format: String,

    /// Field delimiter
    #[arg(long)]
    delimiter: Option<String>,

    /// First line is a header
    #[arg(long)]
    has_header: bool,
}

#[derive(Args)]
struct ImportDataArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Parallel writer connections (also the apply channel count)
    #[arg(long)]
    parallel_jobs: Option<usize>,

    /// Discard previous import state and start over
    #[arg(long)]
    start_clean: bool,

    /// Records per snapshot batch
    #[arg(long)]
    batch_size: Option<i64>,

    /// Truncate batch files once they are imported
    #[arg(long)]
    truncate_splits: bool,

    #[command(subcommand)]
    command: Option<ImportDataSub>,
}

#[derive(Subcommand)]
enum ImportDataSub {
    /// Progress report
    Status,
    /// Import a standalone data file into one target table
    File(ImportDataFileArgs),
}

#[derive(Args, Clone)]
struct SourceArgs {
    /// Source database type: postgresql, oracle, mysql
    #[arg(long, default_value = "postgresql")]
    source_db_type: String,

    #[arg(long, default_value = "127.0.0.1")]
    source_db_host: String,

    #[arg(long, default_value_t = 5432)]
    source_db_port: u16,

    #[arg(long)]
    source_db_name: Option<String>,

    #[arg(long)]
    source_db_user: Option<String>,

    /// Read from SOURCE_DB_PASSWORD when not given
    #[arg(long)]
    source_db_password: Option<String>,

    #[arg(long, default_value = "public")]
    source_db_schema: String,
}

impl SourceArgs {
    fn to_config(&self) -> Result<SourceConfig> {
        let database = self
            .source_db_name
            .clone()
            .ok_or_else(|| MigrateError::Config("--source-db-name is required".into()))?;
        let user = self
            .source_db_user
            .clone()
            .ok_or_else(|| MigrateError::Config("--source-db-user is required".into()))?;
        Ok(SourceConfig {
            db_type: Dialect::parse(&self.source_db_type)?,
            host: self.source_db_host.clone(),
            port: self.source_db_port,
            database,
            user,
            password: self.source_db_password.clone(),
            schema: self.source_db_schema.clone(),
            ssl_mode: "prefer".to_string(),
        })
    }
}

#[derive(Args, Clone)]
struct TargetArgs {
    #[arg(long, default_value = "127.0.0.1")]
    target_db_host: String,

    #[arg(long, default_value_t = 5433)]
    target_db_port: u16,

    /// Further cluster endpoints for the writer pool
    #[arg(long, value_delimiter = ',')]
    target_endpoints: Vec<String>,

    #[arg(long)]
    target_db_name: Option<String>,

    #[arg(long)]
    target_db_user: Option<String>,

    /// Read from TARGET_DB_PASSWORD when not given
    #[arg(long)]
    target_db_password: Option<String>,

    #[arg(long, default_value = "public")]
    target_db_schema: String,

    #[arg(long, default_value = "prefer")]
    target_ssl_mode: String,
}

impl TargetArgs {
    fn to_config(&self) -> Result<TargetConfig> {
        let database = self
            .target_db_name
            .clone()
            .ok_or_else(|| MigrateError::Config("--target-db-name is required".into()))?;
        let user = self
            .target_db_user
            .clone()
            .ok_or_else(|| MigrateError::Config("--target-db-user is required".into()))?;
        Ok(TargetConfig {
            host: self.target_db_host.clone(),
            port: self.target_db_port,
            additional_endpoints: self.target_endpoints.clone(),
            database,
            user,
            password: self.target_db_password.clone(),
            schema: self.target_db_schema.clone(),
            ssl_mode: self.target_ssl_mode.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity, &cli.log_format);

    let cancel = setup_signal_handler();
    let export_dir = cli.export_dir.clone();
    let assume_yes = cli.yes;

    match cli.command {
        Commands::Export { command } => match command {
            ExportCommands::Schema { source } => {
                export_schema(assume_yes, &export_dir, source).await
            }
            ExportCommands::Data(args) => match args.command {
                Some(StatusCommand::Status) => {
                    let rows = status::export_status_rows(&export_dir)?;
                    print!("{}", status::format_export_status(&rows));
                    Ok(())
                }
                None => export_data(assume_yes, &export_dir, args, cancel).await,
            },
        },
        Commands::Import { command } => match command {
            ImportCommands::Schema { target } => import_schema(&export_dir, target).await,
            ImportCommands::Data(mut args) => match args.command.take() {
                Some(ImportDataSub::Status) => {
                    let rows = status::import_status_rows(&export_dir, Role::TargetDbImporter)?;
                    print!("{}", status::format_import_status(&rows));
                    Ok(())
                }
                Some(ImportDataSub::File(file_args)) => {
                    import_data_file(&export_dir, args.target.clone(), file_args, cancel).await
                }
                None => import_data(&export_dir, args, cancel).await,
            },
        },
        Commands::GetDataMigrationReport { target } => {
            data_migration_report(&export_dir, target).await
        }
        Commands::EndMigration { source } => end_migration(&export_dir, source).await,
    }
}

async fn export_schema(
    assume_yes: bool,
    export_dir: &PathBuf,
    source: SourceArgs,
) -> Result<()> {
    let mut source_conf = source.to_config()?;
    resolve_source_password(&mut source_conf)?;
    create_migration_project(export_dir)?;
    let meta_db = Arc::new(MetaDb::init(export_dir)?);
    let db = SourceDbImpl::from_config(&source_conf).await?;
    check_charset(assume_yes, &db).await?;

    // the schema dump has no post-processing step, run it directly
    let cmd = db.export_schema_command(export_dir);
    info!("running: {}", cmd.display());
    let mut command = tokio::process::Command::new(&cmd.program);
    command.args(&cmd.args);
    for (key, value) in &cmd.env {
        command.env(key, value);
    }
    let status = command
        .status()
        .await
        .map_err(|e| MigrateError::Export(format!("spawn {}: {}", cmd.program, e)))?;
    if !status.success() {
        return Err(MigrateError::Child {
            command: cmd.program,
            status: status.to_string(),
        });
    }
    meta_db
        .update(|record| {
            record.source_db_conf = Some(source_conf.clone());
            record.schema_exported = true;
        })
        .await?;
    println!("schema export complete");
    Ok(())
}

async fn export_data(
    assume_yes: bool,
    export_dir: &PathBuf,
    args: ExportDataArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let mut source_conf = args.source.to_config()?;
    resolve_source_password(&mut source_conf)?;
    let export_type = parse_export_type(&args.export_type)?;

    create_migration_project(export_dir)?;
    let meta_db = Arc::new(MetaDb::init(export_dir)?);
    meta_db
        .update(|record| {
            record.source_db_conf = Some(source_conf.clone());
            record.export_type = export_type;
        })
        .await?;

    let db = SourceDbImpl::from_config(&source_conf).await?;
    check_charset(assume_yes, &db).await?;

    let tables = match &args.table_list {
        Some(list) => list.split(',').map(|t| t.trim().to_string()).collect(),
        None => db.get_all_table_names().await?,
    };
    if tables.is_empty() {
        return Err(MigrateError::Config(
            "no tables to export in the configured schema".into(),
        ));
    }
    println!("num tables to export: {}", tables.len());
    println!("table list for data export: {:?}", tables);

    let migration = MigrationConfig {
        parallel_jobs: args.parallel_jobs,
        ..Default::default()
    };
    let exporter = SnapshotExporter {
        export_dir: export_dir.clone(),
        meta_db,
        parallel_jobs: migration.get_parallel_jobs(),
        shutdown_grace: Duration::from_secs(migration.shutdown_grace_secs),
        cancel,
    };
    exporter.export_data(&db, &tables).await?;

    let rows = status::export_status_rows(export_dir)?;
    print!("{}", status::format_export_status(&rows));
    Ok(())
}

async fn import_schema(export_dir: &PathBuf, target: TargetArgs) -> Result<()> {
    let mut target_conf = target.to_config()?;
    resolve_target_password(&mut target_conf)?;
    let schema_file = export_dir.join("schema").join("schema.sql");
    let script = std::fs::read_to_string(&schema_file).map_err(|e| {
        MigrateError::Config(format!("read schema file {:?}: {}", schema_file, e))
    })?;

    let db = TargetDb::new(target_conf, 1, vec![]).await?;
    db.apply_schema_script(&script).await?;
    println!("schema import complete");
    Ok(())
}

async fn import_data(
    export_dir: &PathBuf,
    args: ImportDataArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let mut target_conf = args.target.to_config()?;
    resolve_target_password(&mut target_conf)?;

    let meta_db = Arc::new(MetaDb::open(export_dir)?);
    let record = meta_db.migration_status_record()?;
    if !record.export_data_done {
        return Err(MigrateError::State(
            "data export has not completed for this export dir; run export data first".into(),
        ));
    }
    let source_conf = record.source_db_conf.clone().ok_or_else(|| {
        MigrateError::State("migration status record carries no source config".into())
    })?;
    let migration_uuid = record.migration_uuid;

    let migration = MigrationConfig {
        parallel_jobs: args.parallel_jobs,
        batch_size_rows: args.batch_size,
        truncate_splits: args.truncate_splits,
        ..Default::default()
    };
    let parallel_jobs = migration.get_parallel_jobs();

    let db = TargetDb::new(target_conf.clone(), parallel_jobs, vec![]).await?;
    db.create_metadata_schema().await?;
    meta_db
        .update(|r| r.target_db_conf = Some(target_conf.clone()))
        .await?;

    // resolve every table reference through the registry
    let mut registry = NameRegistry::new(
        Role::TargetDbImporter,
        source_conf.db_type,
        source_conf.default_schema().map(|s| s.to_string()),
        db.conf().schema.clone(),
    );
    for table in &record.table_list_exported_from_source {
        registry.register_table(table)?;
    }
    for (leaf, root) in &record.source_rename_tables_map {
        registry.register_renamed(leaf, root)?;
    }
    let registry = Arc::new(registry);
    let attr_registry = Arc::new(AttributeNameRegistry::new(db.clone(), Dialect::Postgres));

    // snapshot phase
    let descriptor = Descriptor::load(export_dir)?;
    let state = Arc::new(ImportDataState::new(export_dir, Role::TargetDbImporter));
    let importer = SnapshotFileImporter {
        state: state.clone(),
        db: db.clone(),
        migration_uuid,
        limits: BatchSizeLimits {
            max_records: migration.get_batch_size_rows(),
            max_bytes: migration.get_batch_size_bytes(),
        },
        truncate_splits: migration.truncate_splits,
        cancel: cancel.clone(),
    };
    for entry in &descriptor.data_file_list {
        let table = registry.lookup(&entry.table_name)?;
        if args.start_clean {
            state.clean(&entry.file_path, &table)?;
            let (schema, table_name) = table.for_catalog_query();
            db.clean_file_import_state(
                migration_uuid,
                &entry.file_path.to_string_lossy(),
                schema,
                table_name,
            )
            .await?;
        }
        let columns = match descriptor.table_to_exported_columns.get(&entry.table_name) {
            Some(columns) => attr_registry.quote_attribute_names(&table, columns).await?,
            None => vec![],
        };
        let import_args = ImportBatchArgs {
            table: table.clone(),
            columns,
            file_format: descriptor.file_format,
            delimiter: descriptor.delimiter.clone(),
            null_string: descriptor.null_string.clone(),
            has_header: descriptor.has_header,
            quote_char: descriptor.quote_char,
            escape_char: descriptor.escape_char,
        };
        importer
            .import_file(&entry.file_path, &table, &import_args)
            .await?;
    }
    db.restore_sequences(&record.sequence_initial_values).await?;
    print!(
        "{}",
        status::format_import_status(&status::import_status_rows(
            export_dir,
            Role::TargetDbImporter
        )?)
    );

    if !record.export_type.includes_changes() {
        return Ok(());
    }

    // streaming phase
    db.prepare_for_streaming();
    let num_channels = migration.get_num_event_channels();
    let table_keys: Vec<String> = registry.all_tables().iter().map(|t| t.for_key()).collect();
    db.init_live_migration_state(migration_uuid, num_channels, args.start_clean, &table_keys)
        .await?;

    let mut unique_key_columns = HashMap::new();
    for tuple in registry.all_tables() {
        let (schema, table_name) = tuple.for_catalog_query();
        let columns = db.get_unique_key_columns(schema, table_name).await?;
        unique_key_columns.insert(tuple.clone(), columns);
    }

    let applier_cancel = cancel.child_token();
    let pipeline = start_apply_channels(
        db.clone(),
        attr_registry,
        unique_key_columns,
        migration_uuid,
        db.event_channels_meta_info(migration_uuid).await?,
        StreamingConfig {
            num_channels,
            max_batch_size: migration.get_event_batch_max_size(),
            max_batch_interval: Duration::from_millis(migration.get_event_batch_max_interval_ms()),
        },
        applier_cancel.clone(),
    );

    let stream_importer = EventStreamImporter {
        export_dir: export_dir.clone(),
        registry,
        dispatcher: pipeline.dispatcher.clone(),
        meta_db,
        importer_role: Role::TargetDbImporter,
        cancel,
    };
    stream_importer.run().await?;

    // the dispatcher is quiet now; let the appliers drain and stop
    applier_cancel.cancel();
    for applier in pipeline.appliers {
        applier
            .await
            .map_err(|e| MigrateError::State(format!("applier task: {}", e)))??;
    }
    println!("streaming import finished");
    Ok(())
}

async fn import_data_file(
    export_dir: &PathBuf,
    target: TargetArgs,
    args: ImportDataFileArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let ImportDataFileArgs {
        data_file_path,
        table,
        format,
        delimiter,
        has_header,
    } = args;
    let mut target_conf = target.to_config()?;
    resolve_target_password(&mut target_conf)?;
    create_migration_project(export_dir)?;
    let meta_db = MetaDb::init(export_dir)?;
    let migration_uuid = meta_db.migration_uuid()?;

    let file_format = match format.as_str() {
        "text" => pg_live_migrate::datafile::FileFormat::Text,
        "csv" => pg_live_migrate::datafile::FileFormat::Csv,
        other => {
            return Err(MigrateError::Config(format!(
                "unknown file format {:?} (supported: text, csv)",
                other
            )))
        }
    };
    let migration = MigrationConfig::default();
    let parallel_jobs = migration.get_parallel_jobs();
    let db = TargetDb::new(target_conf, parallel_jobs, vec![]).await?;
    db.create_metadata_schema().await?;

    let mut registry = NameRegistry::new(
        Role::ImportFile,
        Dialect::Postgres,
        Some(db.conf().schema.clone()),
        db.conf().schema.clone(),
    );
    registry.register_table(&table)?;
    let tuple = registry.lookup(&table)?;

    let delimiter = delimiter.unwrap_or_else(|| {
        match file_format {
            pg_live_migrate::datafile::FileFormat::Csv => ",",
            _ => "\t",
        }
        .to_string()
    });
    let import_args = ImportBatchArgs {
        table: tuple.clone(),
        columns: vec![],
        file_format,
        delimiter,
        null_string: match file_format {
            pg_live_migrate::datafile::FileFormat::Csv => String::new(),
            _ => "\\N".to_string(),
        },
        has_header,
        quote_char: None,
        escape_char: None,
    };

    let importer = SnapshotFileImporter {
        state: Arc::new(ImportDataState::new(export_dir, Role::ImportFile)),
        db,
        migration_uuid,
        limits: BatchSizeLimits {
            max_records: migration.get_batch_size_rows(),
            max_bytes: migration.get_batch_size_bytes(),
        },
        truncate_splits: false,
        cancel,
    };
    let data_file_path = data_file_path.canonicalize()?;
    importer
        .import_file(&data_file_path, &tuple, &import_args)
        .await?;
    println!("import of {:?} complete", data_file_path);
    Ok(())
}

async fn data_migration_report(export_dir: &PathBuf, target: TargetArgs) -> Result<()> {
    let mut target_conf = target.to_config()?;
    resolve_target_password(&mut target_conf)?;
    let meta_db = MetaDb::open(export_dir)?;
    let record = meta_db.migration_status_record()?;
    let source_conf = record.source_db_conf.clone().ok_or_else(|| {
        MigrateError::State("migration status record carries no source config".into())
    })?;

    let db = TargetDb::new(target_conf, 1, vec![]).await?;
    let mut registry = NameRegistry::new(
        Role::TargetDbImporter,
        source_conf.db_type,
        source_conf.default_schema().map(|s| s.to_string()),
        db.conf().schema.clone(),
    );
    for table in &record.table_list_exported_from_source {
        registry.register_table(table)?;
    }

    // key exported counts by tuple so descriptor spellings and registry
    // spellings cannot drift apart
    let mut exported = HashMap::new();
    if Descriptor::exists(export_dir) {
        for entry in &Descriptor::load(export_dir)?.data_file_list {
            let tuple = registry.lookup(&entry.table_name)?;
            *exported.entry(tuple).or_insert(0i64) += entry.row_count.max(0);
        }
    }

    let mut rows = Vec::new();
    for tuple in registry.all_tables() {
        let (schema, table_name) = tuple.for_catalog_query();
        let imported = db
            .imported_snapshot_row_count_for_table(record.migration_uuid, schema, table_name)
            .await?;
        let events = db
            .imported_event_counts_for_table(record.migration_uuid, &tuple.for_key())
            .await?;
        rows.push(status::MigrationReportRow {
            table: tuple.to_string(),
            exported_snapshot_rows: exported.get(tuple).copied().unwrap_or_default(),
            imported_snapshot_rows: imported,
            imported_events: events,
        });
    }
    print!("{}", status::format_migration_report(&rows));
    Ok(())
}

async fn end_migration(export_dir: &PathBuf, source: SourceArgs) -> Result<()> {
    let mut source_conf = source.to_config()?;
    resolve_source_password(&mut source_conf)?;
    let meta_db = MetaDb::open(export_dir)?;
    let record = meta_db.migration_status_record()?;

    if source_conf.db_type == Dialect::Postgres {
        let db = SourceDbImpl::from_config(&source_conf).await?;
        if let Some(pg) = db.as_postgres() {
            pg.drop_replication_artifacts(
                record.pg_replication_slot_name.as_deref(),
                record.pg_publication_name.as_deref(),
            )
            .await?;
        }
    }
    meta_db
        .update(|r| r.end_migration_requested = true)
        .await?;
    println!("migration ended; durable state retained under {:?}", export_dir);
    Ok(())
}

fn parse_export_type(s: &str) -> Result<ExportType> {
    match s {
        "snapshot-only" => Ok(ExportType::SnapshotOnly),
        "changes-only" => Ok(ExportType::ChangesOnly),
        "snapshot-and-changes" => Ok(ExportType::SnapshotAndChanges),
        other => Err(MigrateError::Config(format!(
            "unknown export type {:?} (supported: snapshot-only, changes-only, snapshot-and-changes)",
            other
        ))),
    }
}

fn resolve_source_password(conf: &mut SourceConfig) -> Result<()> {
    if conf.password.is_none() {
        conf.password = Some(std::env::var("SOURCE_DB_PASSWORD").map_err(|_| {
            MigrateError::Config(
                "no source password given and SOURCE_DB_PASSWORD is not set".into(),
            )
        })?);
    }
    Ok(())
}

fn resolve_target_password(conf: &mut TargetConfig) -> Result<()> {
    if conf.password.is_none() {
        conf.password = Some(std::env::var("TARGET_DB_PASSWORD").map_err(|_| {
            MigrateError::Config(
                "no target password given and TARGET_DB_PASSWORD is not set".into(),
            )
        })?);
    }
    Ok(())
}

/// Non-UTF8 source charsets can silently corrupt text columns; require
/// explicit consent before proceeding.
async fn check_charset(assume_yes: bool, db: &SourceDbImpl) -> Result<()> {
    let charset = db.get_charset().await?;
    let normalized = charset.to_uppercase().replace('-', "");
    if normalized.contains("UTF8") {
        return Ok(());
    }
    eprintln!(
        "source database charset is {:?}; text may need conversion on import.",
        charset
    );
    if assume_yes || confirm("continue anyway?")? {
        Ok(())
    } else {
        Err(MigrateError::Config(format!(
            "aborted: source charset {:?} not confirmed",
            charset
        )))
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);
    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// SIGINT/SIGTERM flip the shared cancellation token; every stage observes
/// it at its suspension points.
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => eprintln!("\nreceived SIGINT, shutting down gracefully..."),
                _ = sigterm.recv() => eprintln!("\nreceived SIGTERM, shutting down gracefully..."),
            }
            token.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl-C handler");
            eprintln!("\nreceived Ctrl-C, shutting down gracefully...");
            token.cancel();
        });
    }

    cancel
}
