//! Source database access behind a capability interface.
//!
//! Each dialect implements [`SourceDb`]; there is no shared base beyond the
//! trait. Vendor dump tools are external processes — the dialects only
//! describe how to invoke them ([`DumpCommand`]) and how to read their
//! catalogs.

pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "oracle")]
pub mod oracle;

use async_trait::async_trait;
use std::path::Path;

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::sqlname::Dialect;

pub use postgres::{PostgresSource, ReplicationSlotInfo};

/// An external dump-tool invocation.
#[derive(Debug, Clone)]
pub struct DumpCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl DumpCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Redacted single-line rendering for logs.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Capability interface every source dialect provides.
#[async_trait]
pub trait SourceDb: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Tag recorded in the MSR as the snapshot mechanism.
    fn snapshot_mechanism(&self) -> &'static str;

    /// Qualified source references of every base table in the configured
    /// schema(s).
    async fn get_all_table_names(&self) -> Result<Vec<String>>;

    /// Column names of one table in ordinal order.
    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Columns under a unique constraint or unique index, excluding the
    /// primary key (primary-key ordering is already preserved by channel
    /// hashing).
    async fn get_unique_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Database character set, checked before export; non-UTF8 charsets
    /// need explicit user consent.
    async fn get_charset(&self) -> Result<String>;

    /// Dump invocation for the data snapshot.
    fn export_data_command(
        &self,
        export_dir: &Path,
        tables: &[String],
        snapshot_name: Option<&str>,
        parallel_jobs: usize,
    ) -> DumpCommand;

    /// Dump invocation for the schema.
    fn export_schema_command(&self, export_dir: &Path) -> DumpCommand;
}

/// Static dispatch over the compiled-in dialects.
pub enum SourceDbImpl {
    Postgres(PostgresSource),
    #[cfg(feature = "mysql")]
    Mysql(mysql::MysqlSource),
    #[cfg(feature = "oracle")]
    Oracle(oracle::OracleSource),
}

impl SourceDbImpl {
    pub async fn from_config(conf: &SourceConfig) -> Result<Self> {
        match conf.db_type {
            Dialect::Postgres => Ok(Self::Postgres(PostgresSource::connect(conf).await?)),
            Dialect::Mysql => {
                #[cfg(feature = "mysql")]
                {
                    Ok(Self::Mysql(mysql::MysqlSource::connect(conf).await?))
                }
                #[cfg(not(feature = "mysql"))]
                {
                    Err(MigrateError::Config(
                        "MySQL sources require the 'mysql' feature.\n\n\
                         Rebuild with: cargo build --features mysql"
                            .into(),
                    ))
                }
            }
            Dialect::Oracle => {
                #[cfg(feature = "oracle")]
                {
                    Ok(Self::Oracle(oracle::OracleSource::connect(conf).await?))
                }
                #[cfg(not(feature = "oracle"))]
                {
                    Err(MigrateError::Config(
                        "Oracle sources require the 'oracle' feature (ODBC based).\n\n\
                         Rebuild with: cargo build --features oracle"
                            .into(),
                    ))
                }
            }
        }
    }

    pub fn as_postgres(&self) -> Option<&PostgresSource> {
        match self {
            Self::Postgres(src) => Some(src),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

#[async_trait]
impl SourceDb for SourceDbImpl {
    fn dialect(&self) -> Dialect {
        match self {
            Self::Postgres(src) => src.dialect(),
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.dialect(),
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.dialect(),
        }
    }

    fn snapshot_mechanism(&self) -> &'static str {
        match self {
            Self::Postgres(src) => src.snapshot_mechanism(),
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.snapshot_mechanism(),
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.snapshot_mechanism(),
        }
    }

    async fn get_all_table_names(&self) -> Result<Vec<String>> {
        match self {
            Self::Postgres(src) => src.get_all_table_names().await,
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.get_all_table_names().await,
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.get_all_table_names().await,
        }
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        match self {
            Self::Postgres(src) => src.get_columns(schema, table).await,
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.get_columns(schema, table).await,
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.get_columns(schema, table).await,
        }
    }

    async fn get_unique_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        match self {
            Self::Postgres(src) => src.get_unique_key_columns(schema, table).await,
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.get_unique_key_columns(schema, table).await,
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.get_unique_key_columns(schema, table).await,
        }
    }

    async fn get_charset(&self) -> Result<String> {
        match self {
            Self::Postgres(src) => src.get_charset().await,
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.get_charset().await,
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.get_charset().await,
        }
    }

    fn export_data_command(
        &self,
        export_dir: &Path,
        tables: &[String],
        snapshot_name: Option<&str>,
        parallel_jobs: usize,
    ) -> DumpCommand {
        match self {
            Self::Postgres(src) => {
                src.export_data_command(export_dir, tables, snapshot_name, parallel_jobs)
            }
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => {
                src.export_data_command(export_dir, tables, snapshot_name, parallel_jobs)
            }
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => {
                src.export_data_command(export_dir, tables, snapshot_name, parallel_jobs)
            }
        }
    }

    fn export_schema_command(&self, export_dir: &Path) -> DumpCommand {
        match self {
            Self::Postgres(src) => src.export_schema_command(export_dir),
            #[cfg(feature = "mysql")]
            Self::Mysql(src) => src.export_schema_command(export_dir),
            #[cfg(feature = "oracle")]
            Self::Oracle(src) => src.export_schema_command(export_dir),
        }
    }
}
