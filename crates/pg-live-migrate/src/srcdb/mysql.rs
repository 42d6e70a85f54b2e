//! MySQL source dialect (requires the `mysql` cargo feature).
//!
//! Catalog access goes through `mysql_async`; the data snapshot itself is
//! produced by ora2pg in COPY mode, like the Oracle dialect.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use std::path::Path;
use tracing::info;

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::sqlname::Dialect;

use super::{DumpCommand, SourceDb};

pub struct MysqlSource {
    conf: SourceConfig,
    pool: mysql_async::Pool,
}

impl MysqlSource {
    pub async fn connect(conf: &SourceConfig) -> Result<Self> {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(conf.host.clone())
            .tcp_port(conf.port)
            .user(Some(conf.user.clone()))
            .pass(conf.password.clone())
            .db_name(Some(conf.database.clone()));
        let pool = mysql_async::Pool::new(opts);
        // fail fast on bad credentials
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| MigrateError::Config(format!("connect to mysql source: {}", e)))?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| MigrateError::Config(format!("mysql source ping: {}", e)))?;
        info!("connected to mysql source {}:{}", conf.host, conf.port);
        Ok(Self {
            conf: conf.clone(),
            pool,
        })
    }

    async fn query_strings(
        &self,
        sql: &str,
        params: mysql_async::Params,
    ) -> Result<Vec<String>> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| MigrateError::State(format!("mysql source connection: {}", e)))?;
        conn.exec(sql, params)
            .await
            .map_err(|e| MigrateError::State(format!("mysql source query [{}]: {}", sql, e)))
    }
}

#[async_trait]
impl SourceDb for MysqlSource {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn snapshot_mechanism(&self) -> &'static str {
        "ora2pg"
    }

    async fn get_all_table_names(&self) -> Result<Vec<String>> {
        let tables = self
            .query_strings(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = ? AND table_type = 'BASE TABLE' ORDER BY table_name",
                mysql_async::Params::Positional(vec![self.conf.database.clone().into()]),
            )
            .await?;
        Ok(tables
            .into_iter()
            .map(|t| format!("{}.{}", self.conf.database, t))
            .collect())
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
            mysql_async::Params::Positional(vec![schema.into(), table.into()]),
        )
        .await
    }

    async fn get_unique_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT DISTINCT column_name FROM information_schema.statistics \
             WHERE table_schema = ? AND table_name = ? \
               AND non_unique = 0 AND index_name <> 'PRIMARY'",
            mysql_async::Params::Positional(vec![schema.into(), table.into()]),
        )
        .await
    }

    async fn get_charset(&self) -> Result<String> {
        let values = self
            .query_strings(
                "SELECT @@character_set_database",
                mysql_async::Params::Empty,
            )
            .await?;
        values
            .into_iter()
            .next()
            .ok_or_else(|| MigrateError::State("mysql charset query returned no rows".into()))
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
            .arg("-m") // mysql mode
            .arg("--source")
            .arg(format!(
                "dbi:mysql:database={};host={};port={}",
                self.conf.database, self.conf.host, self.conf.port
            ))
            .arg("--user")
            .arg(self.conf.user.clone())
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
            .arg("-m")
            .arg("--source")
            .arg(format!(
                "dbi:mysql:database={};host={};port={}",
                self.conf.database, self.conf.host, self.conf.port
            ))
            .arg("--user")
            .arg(self.conf.user.clone())
            .arg("--basedir")
            .arg(export_dir.join("schema").display().to_string())
            .env(
                "ORA2PG_PASSWD",
                self.conf.password.clone().unwrap_or_default(),
            )
    }
}
