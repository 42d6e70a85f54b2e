//! Oracle source dialect (requires the `oracle` cargo feature).
//!
//! Catalog access goes through ODBC; each call opens a short-lived
//! connection on a blocking thread. The snapshot is produced by ora2pg.

use async_trait::async_trait;
use odbc_api::{ConnectionOptions, Cursor, Environment};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::sqlname::Dialect;

use super::{DumpCommand, SourceDb};

static ODBC_ENV: OnceLock<Environment> = OnceLock::new();

fn odbc_env() -> Result<&'static Environment> {
    if ODBC_ENV.get().is_none() {
        let env = Environment::new()
            .map_err(|e| MigrateError::Config(format!("initialize ODBC environment: {}", e)))?;
        let _ = ODBC_ENV.set(env);
    }
    Ok(ODBC_ENV.get().expect("set above"))
}

pub struct OracleSource {
    conf: SourceConfig,
    connection_string: String,
}

impl OracleSource {
    pub async fn connect(conf: &SourceConfig) -> Result<Self> {
        let connection_string = format!(
            "Driver={{Oracle}};Dbq=//{}:{}/{};Uid={};Pwd={};",
            conf.host,
            conf.port,
            conf.database,
            conf.user,
            conf.password.as_deref().unwrap_or("")
        );
        let source = Self {
            conf: conf.clone(),
            connection_string,
        };
        // fail fast on bad credentials
        source.query_strings("SELECT 1 FROM dual".to_string()).await?;
        info!("connected to oracle source {}:{}", conf.host, conf.port);
        Ok(source)
    }

    /// Run a query on a blocking thread and collect the first column as
    /// text.
    async fn query_strings(&self, sql: String) -> Result<Vec<String>> {
        let connection_string = self.connection_string.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let env = odbc_env()?;
            let conn = env
                .connect_with_connection_string(&connection_string, ConnectionOptions::default())
                .map_err(|e| MigrateError::Config(format!("connect to oracle source: {}", e)))?;
            let mut result = Vec::new();
            let cursor = conn
                .execute(&sql, ())
                .map_err(|e| MigrateError::State(format!("oracle query [{}]: {}", sql, e)))?;
            if let Some(mut cursor) = cursor {
                while let Some(mut row) = cursor
                    .next_row()
                    .map_err(|e| MigrateError::State(format!("oracle fetch: {}", e)))?
                {
                    let mut value = Vec::new();
                    row.get_text(1, &mut value)
                        .map_err(|e| MigrateError::State(format!("oracle fetch: {}", e)))?;
                    result.push(String::from_utf8_lossy(&value).into_owned());
                }
            }
            Ok(result)
        })
        .await
        .map_err(|e| MigrateError::State(format!("oracle query task: {}", e)))?
    }
}

#[async_trait]
impl SourceDb for OracleSource {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    fn snapshot_mechanism(&self) -> &'static str {
        "ora2pg"
    }

    async fn get_all_table_names(&self) -> Result<Vec<String>> {
        let schema = self.conf.schema.to_uppercase();
        let tables = self
            .query_strings(format!(
                "SELECT table_name FROM all_tables WHERE owner = '{}' \
                 AND temporary = 'N' ORDER BY table_name",
                schema.replace('\'', "''")
            ))
            .await?;
        Ok(tables
            .into_iter()
            .map(|t| format!("{}.{}", schema, t))
            .collect())
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.query_strings(format!(
            "SELECT column_name FROM all_tab_columns \
             WHERE owner = '{}' AND table_name = '{}' ORDER BY column_id",
            schema.replace('\'', "''"),
            table.replace('\'', "''")
        ))
        .await
    }

    async fn get_unique_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.query_strings(format!(
            "SELECT DISTINCT acc.column_name \
             FROM all_cons_columns acc \
             JOIN all_constraints ac \
               ON ac.owner = acc.owner AND ac.constraint_name = acc.constraint_name \
             WHERE ac.owner = '{}' AND ac.table_name = '{}' AND ac.constraint_type = 'U'",
            schema.replace('\'', "''"),
            table.replace('\'', "''")
        ))
        .await
    }

    async fn get_charset(&self) -> Result<String> {
        let values = self
            .query_strings(
                "SELECT value FROM nls_database_parameters \
                 WHERE parameter = 'NLS_CHARACTERSET'"
                    .to_string(),
            )
            .await?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| MigrateError::State("oracle charset query returned no rows".into()))
    }

    fn export_data_command(
        &self,
        export_dir: &Path,
        tables: &[String],
        _snapshot_name: Option<&str>,
        parallel_jobs: usize,
    ) -> DumpCommand {
        let table_list: Vec<&str> = tables
            .iter()
            .map(|t| t.rsplit('.').next().unwrap_or(t))
            .collect();
        DumpCommand::new("ora2pg")
            .arg("-t")
            .arg("COPY")
            .arg("--source")
            .arg(format!(
                "dbi:Oracle:host={};service_name={};port={}",
                self.conf.host, self.conf.database, self.conf.port
            ))
            .arg("--user")
            .arg(self.conf.user.clone())
            .arg("--namespace")
            .arg(self.conf.schema.clone())
            .arg("--jobs")
            .arg(parallel_jobs.to_string())
            .arg("--tables")
            .arg(table_list.join(","))
            .arg("--basedir")
            .arg(export_dir.join("data").display().to_string())
            .env(
                "ORA2PG_PASSWD",
                self.conf.password.clone().unwrap_or_default(),
            )
    }

    fn export_schema_command(&self, export_dir: &Path) -> DumpCommand {
        DumpCommand::new("ora2pg")
            .arg("-t")
            .arg("TABLE")
            .arg("--source")
            .arg(format!(
                "dbi:Oracle:host={};service_name={};port={}",
                self.conf.host, self.conf.database, self.conf.port
            ))
            .arg("--user")
            .arg(self.conf.user.clone())
            .arg("--namespace")
            .arg(self.conf.schema.clone())
            .arg("--basedir")
            .arg(export_dir.join("schema").display().to_string())
            .env(
                "ORA2PG_PASSWD",
                self.conf.password.clone().unwrap_or_default(),
            )
    }
}
