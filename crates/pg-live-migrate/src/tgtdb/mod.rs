//! Target cluster access.
//!
//! Two kinds of connections are held: a small deadpool-managed control pool
//! for metadata queries, and the N-slot [`ConnectionPool`] every parallel
//! writer goes through. Durable progress lives in the `ybvoyager_metadata`
//! schema on the target:
//!
//! - `ybvoyager_import_data_batches_metainfo_v3` — one row per imported
//!   snapshot batch, written in the same transaction as the bulk load;
//! - `ybvoyager_import_data_event_channels_metainfo` — per-channel
//!   `last_applied_vsn` plus counters;
//! - `ybvoyager_imported_event_count_by_table` — per (table, channel)
//!   counters.

pub mod attr;
pub mod conn_pool;
pub mod event;
pub mod tls;

use bytes::Bytes;
use futures::{pin_mut, SinkExt};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

pub use attr::AttributeNameRegistry;
pub use conn_pool::{ConnectionParams, ConnectionPool, PooledConn};
pub use event::{Event, EventBatch, EventCounter, RawEvent};
pub use tls::SslMode;

use crate::config::TargetConfig;
use crate::datafile::FileFormat;
use crate::error::{MigrateError, Result};
use crate::sqlname::NameTuple;
use crate::state::Batch;

pub const BATCH_METADATA_TABLE_SCHEMA: &str = "ybvoyager_metadata";
pub const BATCH_METADATA_TABLE_NAME: &str =
    "ybvoyager_metadata.ybvoyager_import_data_batches_metainfo_v3";
pub const EVENT_CHANNELS_METADATA_TABLE_NAME: &str =
    "ybvoyager_metadata.ybvoyager_import_data_event_channels_metainfo";
pub const EVENTS_PER_TABLE_METADATA_TABLE_NAME: &str =
    "ybvoyager_metadata.ybvoyager_imported_event_count_by_table";

const IS_BATCH_IMPORTED_SQL: &str = "SELECT rows_imported \
     FROM ybvoyager_metadata.ybvoyager_import_data_batches_metainfo_v3 \
     WHERE migration_uuid = $1 AND data_file_name = $2 AND batch_number = $3 \
       AND schema_name = $4 AND table_name = $5";

const RECORD_BATCH_SQL: &str = "INSERT INTO \
     ybvoyager_metadata.ybvoyager_import_data_batches_metainfo_v3 \
     (migration_uuid, data_file_name, batch_number, schema_name, table_name, rows_imported) \
     VALUES ($1, $2, $3, $4, $5, $6)";

const UPDATE_CHANNEL_SQL: &str = "UPDATE \
     ybvoyager_metadata.ybvoyager_import_data_event_channels_metainfo \
     SET last_applied_vsn = $1, num_inserts = num_inserts + $2, \
         num_updates = num_updates + $3, num_deletes = num_deletes + $4 \
     WHERE migration_uuid = $5 AND channel_no = $6";

const UPDATE_TABLE_STATS_SQL: &str = "UPDATE \
     ybvoyager_metadata.ybvoyager_imported_event_count_by_table \
     SET total_events = total_events + $1, num_inserts = num_inserts + $2, \
         num_updates = num_updates + $3, num_deletes = num_deletes + $4 \
     WHERE migration_uuid = $5 AND table_name = $6 AND channel_no = $7";

const INSERT_TABLE_STATS_SQL: &str = "INSERT INTO \
     ybvoyager_metadata.ybvoyager_imported_event_count_by_table \
     (migration_uuid, table_name, channel_no, total_events, num_inserts, num_updates, num_deletes) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

/// How one batch file is presented to the target's COPY protocol.
#[derive(Debug, Clone)]
pub struct ImportBatchArgs {
    pub table: NameTuple,
    /// Quoted target column spellings; empty means the table's full column
    /// list.
    pub columns: Vec<String>,
    pub file_format: FileFormat,
    pub delimiter: String,
    pub null_string: String,
    pub has_header: bool,
    pub quote_char: Option<u8>,
    pub escape_char: Option<u8>,
}

impl ImportBatchArgs {
    /// The COPY command the batch payload is streamed through. Batch files
    /// always carry bare COPY payload rows; vendor-SQL dumps are normalized
    /// during split.
    pub fn copy_statement(&self) -> String {
        let target = if self.columns.is_empty() {
            self.table.for_user_query()
        } else {
            format!("{} ({})", self.table.for_user_query(), self.columns.join(", "))
        };
        let mut options = vec![
            format!("FORMAT {}", match self.file_format {
                FileFormat::Csv => "CSV",
                FileFormat::Text | FileFormat::Sql => "TEXT",
            }),
            format!("DELIMITER {}", sql_char_literal(&self.delimiter)),
        ];
        if !self.null_string.is_empty() || self.file_format != FileFormat::Csv {
            options.push(format!("NULL {}", sql_string_literal(&self.null_string)));
        }
        if self.file_format == FileFormat::Csv {
            options.push(format!("HEADER {}", self.has_header));
            if let Some(q) = self.quote_char {
                options.push(format!("QUOTE {}", sql_char_literal(&(q as char).to_string())));
            }
            if let Some(e) = self.escape_char {
                options.push(format!("ESCAPE {}", sql_char_literal(&(e as char).to_string())));
            }
        }
        format!("COPY {} FROM STDIN WITH ({})", target, options.join(", "))
    }
}

fn sql_string_literal(s: &str) -> String {
    // standard_conforming_strings: only single quotes need doubling
    format!("'{}'", s.replace('\'', "''"))
}

fn sql_char_literal(s: &str) -> String {
    match s {
        "\t" => "E'\\t'".to_string(),
        other => format!("'{}'", other.replace('\'', "''")),
    }
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Naive statement splitter for dump-produced DDL scripts: semicolons at
/// line ends, dollar-quoted bodies kept intact.
fn split_sql_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_dollar_quote = false;
    for line in script.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        if trimmed.matches("$$").count() % 2 == 1 {
            in_dollar_quote = !in_dollar_quote;
        }
        current.push_str(line);
        current.push('\n');
        if !in_dollar_quote && trimmed.ends_with(';') {
            statements.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
}

/// Handle to the target cluster.
pub struct TargetDb {
    conf: TargetConfig,
    control_pool: deadpool_postgres::Pool,
    writer_pool: Arc<ConnectionPool>,
}

impl TargetDb {
    /// Connect the control pool and size the writer pool to `parallel_jobs`
    /// slots spread over every configured endpoint.
    pub async fn new(
        conf: TargetConfig,
        parallel_jobs: usize,
        session_init_script: Vec<String>,
    ) -> Result<Arc<Self>> {
        let ssl_mode = SslMode::parse(&conf.ssl_mode)?;
        let tls = tls::build_tls(ssl_mode)?;

        let pg_config = tokio_postgres::Config::from_str(&conf.connection_uri_for(&conf.host))
            .map_err(|e| MigrateError::Config(format!("invalid target connection config: {}", e)))?;
        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let manager = match &tls {
            Some(tls) => deadpool_postgres::Manager::from_config(
                pg_config,
                tls.clone(),
                mgr_config,
            ),
            None => deadpool_postgres::Manager::from_config(
                pg_config,
                tokio_postgres::NoTls,
                mgr_config,
            ),
        };
        let control_pool = deadpool_postgres::Pool::builder(manager)
            .max_size(4)
            .build()
            .map_err(|e| MigrateError::Config(format!("build control pool: {}", e)))?;

        let writer_pool = Arc::new(ConnectionPool::new(
            ConnectionParams {
                num_connections: parallel_jobs,
                conn_uri_list: conf.connection_uri_list(),
                session_init_script,
            },
            tls,
        ));

        let db = Arc::new(Self {
            conf,
            control_pool,
            writer_pool,
        });
        db.test_connection().await?;
        Ok(db)
    }

    pub fn writer_pool(&self) -> Arc<ConnectionPool> {
        self.writer_pool.clone()
    }

    pub fn conf(&self) -> &TargetConfig {
        &self.conf
    }

    /// Streaming phase: acquire must always succeed.
    pub fn prepare_for_streaming(&self) {
        info!("preparing target for streaming: disable pool throttling");
        self.writer_pool.disable_throttling();
    }

    pub async fn test_connection(&self) -> Result<()> {
        let conn = self.control_pool.get().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    pub async fn server_version(&self) -> Result<String> {
        let conn = self.control_pool.get().await?;
        let row = conn
            .query_one(
                "SELECT setting FROM pg_settings WHERE name = 'server_version'",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Create the metadata schema and its three tables. Transient errors are
    /// retried; a fresh cluster node may still be coming up.
    pub async fn create_metadata_schema(&self) -> Result<()> {
        let cmds = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", BATCH_METADATA_TABLE_SCHEMA),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    migration_uuid uuid,
                    data_file_name VARCHAR(250),
                    batch_number INT,
                    schema_name VARCHAR(250),
                    table_name VARCHAR(250),
                    rows_imported BIGINT,
                    PRIMARY KEY (migration_uuid, data_file_name, batch_number, schema_name, table_name)
                )",
                BATCH_METADATA_TABLE_NAME
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    migration_uuid uuid,
                    channel_no INT,
                    last_applied_vsn BIGINT,
                    num_inserts BIGINT,
                    num_updates BIGINT,
                    num_deletes BIGINT,
                    PRIMARY KEY (migration_uuid, channel_no)
                )",
                EVENT_CHANNELS_METADATA_TABLE_NAME
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    migration_uuid uuid,
                    table_name VARCHAR(250),
                    channel_no INT,
                    total_events BIGINT,
                    num_inserts BIGINT,
                    num_updates BIGINT,
                    num_deletes BIGINT,
                    PRIMARY KEY (migration_uuid, table_name, channel_no)
                )",
                EVENTS_PER_TABLE_METADATA_TABLE_NAME
            ),
        ];
        for cmd in &cmds {
            let mut last_err = None;
            for attempt in 1..=5u32 {
                let conn = self.control_pool.get().await?;
                match conn.execute(cmd.as_str(), &[]).await {
                    Ok(_) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!("error while running [{}] attempt {}: {}", cmd, attempt, e);
                        last_err = Some(e);
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
            if let Some(e) = last_err {
                return Err(MigrateError::State(format!(
                    "create metadata schema on target: {}",
                    e
                )));
            }
        }
        Ok(())
    }

    /// Seed the channel and per-table metadata rows; no-op when rows for
    /// this migration already exist, so restarts keep their counters.
    pub async fn init_live_migration_state(
        &self,
        migration_uuid: Uuid,
        num_channels: usize,
        start_clean: bool,
        table_keys: &[String],
    ) -> Result<()> {
        let mut conn = self.control_pool.get().await?;

        if start_clean {
            for table in [
                EVENT_CHANNELS_METADATA_TABLE_NAME,
                EVENTS_PER_TABLE_METADATA_TABLE_NAME,
            ] {
                let n = conn
                    .execute(
                        &format!("DELETE FROM {} WHERE migration_uuid = $1", table),
                        &[&migration_uuid],
                    )
                    .await?;
                info!("cleared {} rows from {}", n, table);
            }
        }

        let existing: i64 = conn
            .query_one(
                &format!(
                    "SELECT count(*) FROM {} WHERE migration_uuid = $1",
                    EVENT_CHANNELS_METADATA_TABLE_NAME
                ),
                &[&migration_uuid],
            )
            .await?
            .get(0);
        if existing == 0 {
            let tx = conn.transaction().await?;
            for chan in 0..num_channels as i32 {
                tx.execute(
                    &format!(
                        "INSERT INTO {} VALUES ($1, $2, -1, 0, 0, 0)",
                        EVENT_CHANNELS_METADATA_TABLE_NAME
                    ),
                    &[&migration_uuid, &chan],
                )
                .await?;
            }
            tx.commit().await?;
        } else {
            info!("event channels metadata already initialized, skipping");
        }

        let tx = conn.transaction().await?;
        for table_key in table_keys {
            let existing: i64 = tx
                .query_one(
                    &format!(
                        "SELECT count(*) FROM {} WHERE migration_uuid = $1 AND table_name = $2",
                        EVENTS_PER_TABLE_METADATA_TABLE_NAME
                    ),
                    &[&migration_uuid, table_key],
                )
                .await?
                .get(0);
            if existing > 0 {
                info!("event stats for {} already initialized, skipping", table_key);
                continue;
            }
            for chan in 0..num_channels as i32 {
                tx.execute(
                    &format!(
                        "INSERT INTO {} VALUES ($1, $2, $3, 0, 0, 0, 0)",
                        EVENTS_PER_TABLE_METADATA_TABLE_NAME
                    ),
                    &[&migration_uuid, table_key, &chan],
                )
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// channel_no -> last_applied_vsn for this migration.
    pub async fn event_channels_meta_info(
        &self,
        migration_uuid: Uuid,
    ) -> Result<HashMap<usize, i64>> {
        let conn = self.control_pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT channel_no, last_applied_vsn FROM {} WHERE migration_uuid = $1",
                    EVENT_CHANNELS_METADATA_TABLE_NAME
                ),
                &[&migration_uuid],
            )
            .await?;
        let mut result = HashMap::new();
        for row in rows {
            let chan: i32 = row.get(0);
            let vsn: i64 = row.get(1);
            result.insert(chan as usize, vsn);
        }
        Ok(result)
    }

    /// Sum of per-channel counters (inserts, updates, deletes).
    pub async fn total_event_counts(&self, migration_uuid: Uuid) -> Result<EventCounter> {
        let conn = self.control_pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COALESCE(SUM(num_inserts), 0)::BIGINT, \
                            COALESCE(SUM(num_updates), 0)::BIGINT, \
                            COALESCE(SUM(num_deletes), 0)::BIGINT \
                     FROM {} WHERE migration_uuid = $1",
                    EVENT_CHANNELS_METADATA_TABLE_NAME
                ),
                &[&migration_uuid],
            )
            .await?;
        let num_inserts: i64 = row.get(0);
        let num_updates: i64 = row.get(1);
        let num_deletes: i64 = row.get(2);
        Ok(EventCounter {
            total_events: num_inserts + num_updates + num_deletes,
            num_inserts,
            num_updates,
            num_deletes,
        })
    }

    /// Counters for one table, summed over channels.
    pub async fn imported_event_counts_for_table(
        &self,
        migration_uuid: Uuid,
        table_key: &str,
    ) -> Result<EventCounter> {
        let conn = self.control_pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COALESCE(SUM(total_events), 0)::BIGINT, \
                            COALESCE(SUM(num_inserts), 0)::BIGINT, \
                            COALESCE(SUM(num_updates), 0)::BIGINT, \
                            COALESCE(SUM(num_deletes), 0)::BIGINT \
                     FROM {} WHERE migration_uuid = $1 AND table_name = $2",
                    EVENTS_PER_TABLE_METADATA_TABLE_NAME
                ),
                &[&migration_uuid, &table_key],
            )
            .await?;
        Ok(EventCounter {
            total_events: row.get(0),
            num_inserts: row.get(1),
            num_updates: row.get(2),
            num_deletes: row.get(3),
        })
    }

    /// Rows imported for one table across all of its snapshot batches.
    pub async fn imported_snapshot_row_count_for_table(
        &self,
        migration_uuid: Uuid,
        schema_name: &str,
        table_name: &str,
    ) -> Result<i64> {
        let conn = self.control_pool.get().await?;
        let row = conn
            .query_one(
                &format!(
                    "SELECT COALESCE(SUM(rows_imported), 0)::BIGINT FROM {} \
                     WHERE migration_uuid = $1 AND schema_name = $2 AND table_name = $3",
                    BATCH_METADATA_TABLE_NAME
                ),
                &[&migration_uuid, &schema_name, &table_name],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Delete the metadata rows of a (table, file); pairs with
    /// [`crate::state::ImportDataState::clean`].
    pub async fn clean_file_import_state(
        &self,
        migration_uuid: Uuid,
        data_file_name: &str,
        schema_name: &str,
        table_name: &str,
    ) -> Result<()> {
        let conn = self.control_pool.get().await?;
        let n = conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE migration_uuid = $1 AND data_file_name = $2 \
                     AND schema_name = $3 AND table_name = $4",
                    BATCH_METADATA_TABLE_NAME
                ),
                &[&migration_uuid, &data_file_name, &schema_name, &table_name],
            )
            .await?;
        info!(
            "removed {} batch metadata rows for {}.{} ({})",
            n, schema_name, table_name, data_file_name
        );
        Ok(())
    }

    /// Import one batch: begin, short-circuit if the metadata row already
    /// exists, stream the payload through COPY, record the metadata row,
    /// commit. Returns rows imported.
    pub async fn import_batch(
        &self,
        migration_uuid: Uuid,
        batch: &Batch,
        args: &ImportBatchArgs,
    ) -> Result<i64> {
        let copy_stmt = args.copy_statement();
        self.writer_pool
            .with_conn(async move |conn: &mut PooledConn| {
                let result =
                    Self::import_batch_on_conn(conn, migration_uuid, batch, &copy_stmt).await;
                // retries are implemented by the caller
                (false, result)
            })
            .await
    }

    async fn import_batch_on_conn(
        conn: &mut PooledConn,
        migration_uuid: Uuid,
        batch: &Batch,
        copy_stmt: &str,
    ) -> Result<i64> {
        let (schema_name, table_name) = {
            let (s, t) = batch.table.for_catalog_query();
            (s.to_string(), t.to_string())
        };
        let data_file_name = batch.base_file_path.to_string_lossy().into_owned();
        let batch_number = batch.number as i32;

        let tx = conn.transaction().await?;

        let existing = tx
            .query_opt(
                IS_BATCH_IMPORTED_SQL,
                &[
                    &migration_uuid,
                    &data_file_name,
                    &batch_number,
                    &schema_name,
                    &table_name,
                ],
            )
            .await?;
        if let Some(row) = existing {
            let rows_imported: i64 = row.get(0);
            info!(
                "batch {} of {:?} already imported ({} rows), skipping",
                batch.number, data_file_name, rows_imported
            );
            tx.commit().await?;
            return Ok(rows_imported);
        }

        info!("importing {:?} using [{}]", batch.file_path, copy_stmt);
        let sink = tx.copy_in(copy_stmt).await?;
        pin_mut!(sink);
        let mut file = tokio::fs::File::open(&batch.file_path).await?;
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
        let rows_affected = sink.finish().await? as i64;

        tx.execute(
            RECORD_BATCH_SQL,
            &[
                &migration_uuid,
                &data_file_name,
                &batch_number,
                &schema_name,
                &table_name,
                &rows_affected,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(rows_affected)
    }

    /// Apply one event batch in a single transaction: queued statements,
    /// then the channel high-water mark, then per-table stats.
    pub async fn execute_event_batch(
        &self,
        migration_uuid: Uuid,
        batch: &EventBatch,
    ) -> Result<()> {
        info!(
            "executing batch of {} events on channel {}",
            batch.events.len(),
            batch.chan_no
        );
        self.writer_pool
            .with_conn(async move |conn: &mut PooledConn| {
                let result = Self::execute_event_batch_on_conn(conn, migration_uuid, batch).await;
                (false, result)
            })
            .await
    }

    async fn execute_event_batch_on_conn(
        conn: &mut PooledConn,
        migration_uuid: Uuid,
        batch: &EventBatch,
    ) -> Result<()> {
        // Prepared statements are session-scoped; get them in place before
        // the transaction starts.
        let mut statements = HashMap::new();
        for event in &batch.events {
            if event.op == event::OP_UPDATE {
                continue;
            }
            let name = event.prepared_stmt_name();
            if !statements.contains_key(&name) {
                let stmt = conn.prepare_cached(&name, &event.prepared_stmt(true)).await?;
                statements.insert(name, stmt);
            }
        }

        let tx = conn.transaction().await?;
        for event in &batch.events {
            let result = if event.op == event::OP_UPDATE {
                tx.execute(event.update_stmt().as_str(), &[]).await
            } else {
                let stmt = statements
                    .get(&event.prepared_stmt_name())
                    .expect("statement prepared above");
                tx.execute(stmt, &event.params()).await
            };
            // missing row on update/delete is benign: rows_affected 0
            if let Err(e) = result {
                return Err(MigrateError::Event(format!(
                    "apply event vsn={}: {}",
                    event.vsn, e
                )));
            }
        }

        let counts = &batch.event_counts;
        let last_vsn = batch.last_vsn();
        let chan_no = batch.chan_no as i32;
        let n = tx
            .execute(
                UPDATE_CHANNEL_SQL,
                &[
                    &last_vsn,
                    &counts.num_inserts,
                    &counts.num_updates,
                    &counts.num_deletes,
                    &migration_uuid,
                    &chan_no,
                ],
            )
            .await?;
        if n != 1 {
            return Err(MigrateError::Event(format!(
                "channel {} metadata update affected {} rows, expected 1",
                batch.chan_no, n
            )));
        }

        for (table, counter) in &batch.counts_by_table {
            let table_key = table.for_key();
            let n = tx
                .execute(
                    UPDATE_TABLE_STATS_SQL,
                    &[
                        &counter.total_events,
                        &counter.num_inserts,
                        &counter.num_updates,
                        &counter.num_deletes,
                        &migration_uuid,
                        &table_key,
                        &chan_no,
                    ],
                )
                .await?;
            if n == 0 {
                tx.execute(
                    INSERT_TABLE_STATS_SQL,
                    &[
                        &migration_uuid,
                        &table_key,
                        &chan_no,
                        &counter.total_events,
                        &counter.num_inserts,
                        &counter.num_updates,
                        &counter.num_deletes,
                    ],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Columns under a unique (non-primary-key) constraint or index on the
    /// target; feeds the conflict cache's table map.
    pub async fn get_unique_key_columns(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Vec<String>> {
        let conn = self.control_pool.get().await?;
        let rows = conn
            .query(
                "SELECT DISTINCT a.attname \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                   AND i.indisunique AND NOT i.indisprimary",
                &[&schema_name, &table_name],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Apply an exported schema script statement by statement. Statements
    /// already applied ("already exists") are tolerated so the command can
    /// be re-run.
    pub async fn apply_schema_script(&self, script: &str) -> Result<()> {
        let conn = self.control_pool.get().await?;
        for statement in split_sql_statements(script) {
            if let Err(e) = conn.simple_query(&statement).await {
                if e.to_string().contains("already exists") {
                    warn!("skipping statement, object already exists: {}", e);
                    continue;
                }
                return Err(MigrateError::State(format!(
                    "apply schema statement [{}]: {}",
                    statement.lines().next().unwrap_or(""),
                    e
                )));
            }
        }
        Ok(())
    }

    /// Target column list for the attribute registry.
    pub async fn get_list_of_table_attributes(&self, table: &NameTuple) -> Result<Vec<String>> {
        let (schema_name, table_name) = table.for_catalog_query();
        let conn = self.control_pool.get().await?;
        let rows = conn
            .query(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name ILIKE $2",
                &[&schema_name, &table_name],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    /// Restore sequence last-values captured from the dump's post-data
    /// script.
    pub async fn restore_sequences(&self, sequences: &BTreeMap<String, i64>) -> Result<()> {
        let conn = self.control_pool.get().await?;
        for (sequence_name, last_value) in sequences {
            if *last_value == 0 {
                continue;
            }
            info!("restore sequence {} to {}", sequence_name, last_value);
            conn.execute(
                &format!(
                    "SELECT pg_catalog.setval('{}', {}, true)",
                    escape_literal(sequence_name),
                    last_value
                ),
                &[],
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlname::{Dialect, ObjectName, Role};

    fn users_tuple() -> NameTuple {
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        NameTuple::new(None, Some(tgt), Role::TargetDbImporter).unwrap()
    }

    #[test]
    fn test_copy_statement_text_format() {
        let args = ImportBatchArgs {
            table: users_tuple(),
            columns: vec!["\"id\"".into(), "\"email\"".into()],
            file_format: FileFormat::Text,
            delimiter: "\t".into(),
            null_string: "\\N".into(),
            has_header: false,
            quote_char: None,
            escape_char: None,
        };
        assert_eq!(
            args.copy_statement(),
            "COPY public.\"users\" (\"id\", \"email\") FROM STDIN WITH \
             (FORMAT TEXT, DELIMITER E'\\t', NULL '\\N')"
        );
    }

    #[test]
    fn test_copy_statement_csv_format() {
        let args = ImportBatchArgs {
            table: users_tuple(),
            columns: vec![],
            file_format: FileFormat::Csv,
            delimiter: ",".into(),
            null_string: String::new(),
            has_header: true,
            quote_char: Some(b'"'),
            escape_char: Some(b'"'),
        };
        let stmt = args.copy_statement();
        assert!(stmt.starts_with("COPY public.\"users\" FROM STDIN WITH (FORMAT CSV"));
        assert!(stmt.contains("HEADER true"));
        assert!(stmt.contains("DELIMITER ','"));
        assert!(stmt.contains("QUOTE '\"'"));
    }

    #[test]
    fn test_metadata_table_names() {
        assert_eq!(
            BATCH_METADATA_TABLE_NAME,
            "ybvoyager_metadata.ybvoyager_import_data_batches_metainfo_v3"
        );
        assert!(EVENT_CHANNELS_METADATA_TABLE_NAME.starts_with(BATCH_METADATA_TABLE_SCHEMA));
        assert!(EVENTS_PER_TABLE_METADATA_TABLE_NAME.starts_with(BATCH_METADATA_TABLE_SCHEMA));
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("public.s'q"), "public.s''q");
        assert_eq!(sql_string_literal("\\N"), "'\\N'");
        assert_eq!(sql_string_literal("it's"), "'it''s'");
        assert_eq!(sql_char_literal("\t"), "E'\\t'");
    }

    #[test]
    fn test_split_sql_statements() {
        let script = "-- comment\nCREATE TABLE a (id int);\n\nCREATE FUNCTION f() RETURNS int AS $$\nSELECT 1;\n$$ LANGUAGE sql;\n";
        let statements = split_sql_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE a"));
        assert!(statements[1].contains("LANGUAGE sql;"));
    }
}
