//! PostgreSQL source dialect.
//!
//! Besides the shared catalog capabilities this dialect owns the live-
//! migration plumbing: the publication over the selected tables and the
//! logical replication slot whose exported snapshot the dump is pinned to,
//! so that slot and snapshot are causally aligned.

use async_trait::async_trait;
use std::path::Path;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::error::{MigrateError, Result};
use crate::sqlname::Dialect;
use crate::tgtdb::conn_pool::redact_uri;

use super::{DumpCommand, SourceDb};

/// Slot creation result handed to the dump tool.
#[derive(Debug, Clone)]
pub struct ReplicationSlotInfo {
    pub slot_name: String,
    pub snapshot_name: String,
}

pub struct PostgresSource {
    conf: SourceConfig,
    client: Client,
}

impl PostgresSource {
    pub async fn connect(conf: &SourceConfig) -> Result<Self> {
        let uri = conf.connection_uri();
        let (client, connection) = tokio_postgres::connect(&uri, NoTls)
            .await
            .map_err(|e| MigrateError::Config(format!("connect to source {}: {}", redact_uri(&uri), e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("source connection task ended: {}", e);
            }
        });
        info!("connected to source {}", redact_uri(&uri));
        Ok(Self {
            conf: conf.clone(),
            client,
        })
    }

    fn schema_list(&self) -> Vec<String> {
        self.conf
            .schema
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Create the publication covering the selected tables. Must happen
    /// before the slot so no change between the two is lost.
    pub async fn create_publication(&self, name: &str, tables: &[String]) -> Result<()> {
        let stmt = format!("CREATE PUBLICATION {} FOR TABLE {}", name, tables.join(", "));
        info!("creating publication: {}", stmt);
        self.client.simple_query(&stmt).await?;
        Ok(())
    }

    /// Create the logical replication slot and export a snapshot from the
    /// same session so the dump observes exactly the state the slot starts
    /// streaming after. The caller must hold the session open (and call
    /// [`Self::release_snapshot`]) until the dump is finished.
    pub async fn create_replication_slot(&self, slot_name: &str) -> Result<ReplicationSlotInfo> {
        self.client
            .simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ")
            .await?;
        let row = self
            .client
            .query_one(
                "SELECT slot_name::text FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                &[&slot_name],
            )
            .await?;
        let slot_name: String = row.get(0);
        let row = self
            .client
            .query_one("SELECT pg_export_snapshot()", &[])
            .await?;
        let snapshot_name: String = row.get(0);
        info!(
            "created replication slot {:?} with exported snapshot {:?}",
            slot_name, snapshot_name
        );
        Ok(ReplicationSlotInfo {
            slot_name,
            snapshot_name,
        })
    }

    /// Close the snapshot-exporting transaction once the dump completed.
    pub async fn release_snapshot(&self) -> Result<()> {
        self.client.simple_query("COMMIT").await?;
        Ok(())
    }

    /// Cleanup at end-migration.
    pub async fn drop_replication_artifacts(
        &self,
        slot_name: Option<&str>,
        publication_name: Option<&str>,
    ) -> Result<()> {
        if let Some(slot) = slot_name {
            self.client
                .execute(
                    "SELECT pg_drop_replication_slot(slot_name) \
                     FROM pg_replication_slots WHERE slot_name = $1",
                    &[&slot],
                )
                .await?;
        }
        if let Some(publication) = publication_name {
            self.client
                .simple_query(&format!("DROP PUBLICATION IF EXISTS {}", publication))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceDb for PostgresSource {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn snapshot_mechanism(&self) -> &'static str {
        "pg_dump"
    }

    async fn get_all_table_names(&self) -> Result<Vec<String>> {
        let schemas = self.schema_list();
        let rows = self
            .client
            .query(
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' AND table_schema = ANY($1) \
                 ORDER BY table_schema, table_name",
                &[&schemas],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let schema: String = row.get(0);
                let table: String = row.get(1);
                format!("{}.\"{}\"", schema, table)
            })
            .collect())
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    async fn get_unique_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT a.attname \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                   AND i.indisunique AND NOT i.indisprimary",
                &[&schema, &table],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    async fn get_charset(&self) -> Result<String> {
        let row = self
            .client
            .query_one(
                "SELECT pg_encoding_to_char(encoding) FROM pg_database WHERE datname = $1",
                &[&self.conf.database],
            )
            .await?;
        Ok(row.get(0))
    }

    fn export_data_command(
        &self,
        export_dir: &Path,
        tables: &[String],
        snapshot_name: Option<&str>,
        parallel_jobs: usize,
    ) -> DumpCommand {
        let dump_dir = export_dir.join("data").join("dump");
        let mut cmd = DumpCommand::new("pg_dump")
            .arg(format!("--host={}", self.conf.host))
            .arg(format!("--port={}", self.conf.port))
            .arg(format!("--username={}", self.conf.user))
            .arg(format!("--dbname={}", self.conf.database))
            .arg("--data-only")
            .arg("--format=directory")
            .arg("--compress=0")
            .arg(format!("--file={}", dump_dir.display()));
        if parallel_jobs > 1 {
            cmd = cmd.arg(format!("--jobs={}", parallel_jobs));
        }
        if let Some(snapshot) = snapshot_name {
            cmd = cmd.arg(format!("--snapshot={}", snapshot));
        }
        for table in tables {
            cmd = cmd.arg(format!("--table={}", table));
        }
        if let Some(password) = &self.conf.password {
            cmd = cmd.env("PGPASSWORD", password.clone());
        }
        cmd
    }

    fn export_schema_command(&self, export_dir: &Path) -> DumpCommand {
        let schema_file = export_dir.join("schema").join("schema.sql");
        let mut cmd = DumpCommand::new("pg_dump")
            .arg(format!("--host={}", self.conf.host))
            .arg(format!("--port={}", self.conf.port))
            .arg(format!("--username={}", self.conf.user))
            .arg(format!("--dbname={}", self.conf.database))
            .arg("--schema-only")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg(format!("--file={}", schema_file.display()));
        for schema in self.schema_list() {
            cmd = cmd.arg(format!("--schema={}", schema));
        }
        if let Some(password) = &self.conf.password {
            cmd = cmd.env("PGPASSWORD", password.clone());
        }
        cmd
    }
}
