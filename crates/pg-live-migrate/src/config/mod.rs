//! Configuration types for source, target and migration behavior.
//!
//! Passwords are never serialized and are read from the environment
//! (`SOURCE_DB_PASSWORD`, `TARGET_DB_PASSWORD`, `SOURCE_REPLICA_DB_PASSWORD`)
//! when not supplied explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;
use tracing::info;

use crate::error::{MigrateError, Result};
use crate::sqlname::Dialect;

/// Environment variable names for password fallback.
pub const SOURCE_DB_PASSWORD_ENV: &str = "SOURCE_DB_PASSWORD";
pub const TARGET_DB_PASSWORD_ENV: &str = "TARGET_DB_PASSWORD";
pub const SOURCE_REPLICA_DB_PASSWORD_ENV: &str = "SOURCE_REPLICA_DB_PASSWORD";
/// Opt-in toggle for the parallel dump fast path.
pub const FAST_EXPORT_ENV: &str = "PG_LIVE_MIGRATE_FAST_EXPORT";
/// Optional control-plane event sink DSN; consumed by an external collaborator.
pub const CONTROL_PLANE_DB_URI_ENV: &str = "CONTROL_PLANE_DB_URI";

/// Factor applied to the core count when `--parallel-jobs` is not given.
const DEFAULT_PARALLELISM_FACTOR: usize = 2;

/// What the run moves: the initial snapshot, the change stream, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportType {
    #[default]
    SnapshotOnly,
    ChangesOnly,
    SnapshotAndChanges,
}

impl ExportType {
    pub fn includes_snapshot(&self) -> bool {
        !matches!(self, ExportType::ChangesOnly)
    }

    pub fn includes_changes(&self) -> bool {
        !matches!(self, ExportType::SnapshotOnly)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,

    /// Fall-forward replica, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_replica: Option<SourceConfig>,

    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Fill passwords from the environment where they were not provided.
    pub fn resolve_passwords(&mut self) -> Result<()> {
        resolve_password(&mut self.source.password, SOURCE_DB_PASSWORD_ENV, "source")?;
        resolve_password(&mut self.target.password, TARGET_DB_PASSWORD_ENV, "target")?;
        if let Some(replica) = &mut self.source_replica {
            resolve_password(
                &mut replica.password,
                SOURCE_REPLICA_DB_PASSWORD_ENV,
                "source-replica",
            )?;
        }
        Ok(())
    }
}

fn resolve_password(password: &mut Option<String>, env: &str, which: &str) -> Result<()> {
    if password.is_none() {
        match std::env::var(env) {
            Ok(v) => *password = Some(v),
            Err(_) => {
                return Err(MigrateError::Config(format!(
                    "no {} database password given and {} is not set",
                    which, env
                )))
            }
        }
    }
    Ok(())
}

/// Connection details for a source database (or the fall-forward replica).
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source dialect.
    pub db_type: Dialect,

    pub host: String,

    #[serde(default = "default_source_port")]
    pub port: u16,

    /// Database name (service name for Oracle).
    pub database: String,

    pub user: String,

    /// Never serialized; resolved from the environment when absent.
    #[serde(skip)]
    pub password: Option<String>,

    /// Schema to migrate. Comma-separated list allowed for pg sources.
    pub schema: String,

    #[serde(default = "default_ssl_prefer")]
    pub ssl_mode: String,
}

impl SourceConfig {
    /// The default schema used to resolve unqualified names, or None when a
    /// pg source lists several schemas.
    pub fn default_schema(&self) -> Option<&str> {
        match self.db_type {
            Dialect::Postgres => {
                let mut schemas = self.schema.split(',');
                let first = schemas.next().unwrap_or("public");
                if schemas.next().is_some() {
                    None
                } else {
                    Some(first)
                }
            }
            _ => Some(&self.schema),
        }
    }

    /// libpq-style connection URI for pg-family sources.
    pub fn connection_uri(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}?sslmode={}",
            self.user,
            self.password.as_deref().unwrap_or(""),
            self.host,
            self.port,
            self.database,
            self.ssl_mode
        )
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("db_type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Connection details for the target cluster.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Further cluster endpoints the writer pool rotates through, beyond
    /// `host`. Hostnames or host:port pairs.
    #[serde(default)]
    pub additional_endpoints: Vec<String>,

    pub database: String,

    pub user: String,

    #[serde(skip)]
    pub password: Option<String>,

    #[serde(default = "default_public_schema")]
    pub schema: String,

    #[serde(default = "default_ssl_prefer")]
    pub ssl_mode: String,
}

impl TargetConfig {
    /// Connection URI for one endpoint; `endpoint` may be "host" or
    /// "host:port".
    pub fn connection_uri_for(&self, endpoint: &str) -> String {
        let hostport = if endpoint.contains(':') {
            endpoint.to_string()
        } else {
            format!("{}:{}", endpoint, self.port)
        };
        format!(
            "postgresql://{}:{}@{}/{}?sslmode={}",
            self.user,
            self.password.as_deref().unwrap_or(""),
            hostport,
            self.database,
            self.ssl_mode
        )
    }

    /// URIs for every configured endpoint, primary first.
    pub fn connection_uri_list(&self) -> Vec<String> {
        let mut uris = vec![self.connection_uri_for(&self.host)];
        for ep in &self.additional_endpoints {
            uris.push(self.connection_uri_for(ep));
        }
        uris
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("additional_endpoints", &self.additional_endpoints)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Migration behavior knobs. `Option` fields distinguish "not set" (derive a
/// default) from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Parallel writer connections; also the event channel count unless
    /// overridden. Derived from core count when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_jobs: Option<usize>,

    /// Event apply channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_event_channels: Option<usize>,

    /// Records per snapshot batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size_rows: Option<i64>,

    /// Bytes per snapshot batch; a batch closes on whichever limit is hit
    /// first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size_bytes: Option<i64>,

    /// Events per apply batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_batch_max_size: Option<usize>,

    /// Maximum time an apply batch stays open, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_batch_max_interval_ms: Option<u64>,

    /// Truncate batch files to zero length once they reach done state.
    #[serde(default)]
    pub truncate_splits: bool,

    #[serde(default)]
    pub export_type: ExportType,

    /// Seconds allowed for draining in-flight batches on cancellation.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl MigrationConfig {
    /// Effective parallelism: configured value, or cores x 2.
    pub fn get_parallel_jobs(&self) -> usize {
        self.parallel_jobs.unwrap_or_else(|| {
            let mut sys = System::new();
            sys.refresh_cpu_all();
            let cores = sys.cpus().len().max(1);
            let jobs = cores * DEFAULT_PARALLELISM_FACTOR;
            info!(
                "Using {} parallel jobs by default ({} cores). \
                 Use --parallel-jobs to specify a custom value",
                jobs, cores
            );
            jobs
        })
    }

    pub fn get_num_event_channels(&self) -> usize {
        self.num_event_channels
            .unwrap_or_else(|| self.get_parallel_jobs())
    }

    pub fn get_batch_size_rows(&self) -> i64 {
        self.batch_size_rows.unwrap_or(20_000)
    }

    pub fn get_batch_size_bytes(&self) -> i64 {
        // stays below the cluster's default RPC message ceiling
        self.batch_size_bytes.unwrap_or(200 * 1024 * 1024)
    }

    pub fn get_event_batch_max_size(&self) -> usize {
        self.event_batch_max_size.unwrap_or(500)
    }

    pub fn get_event_batch_max_interval_ms(&self) -> u64 {
        self.event_batch_max_interval_ms.unwrap_or(2_000)
    }
}

fn default_source_port() -> u16 {
    5432
}

fn default_pg_port() -> u16 {
    5433
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_ssl_prefer() -> String {
    "prefer".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    60
}

/// Whether the fast-export path was opted into via the environment.
pub fn fast_export_enabled() -> bool {
    matches!(
        std::env::var(FAST_EXPORT_ENV).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target() -> TargetConfig {
        TargetConfig {
            host: "node1".into(),
            port: 5433,
            additional_endpoints: vec!["node2".into(), "node3:5434".into()],
            database: "app".into(),
            user: "migrator".into(),
            password: Some("s3cret".into()),
            schema: "public".into(),
            ssl_mode: "prefer".into(),
        }
    }

    #[test]
    fn test_connection_uri_list_rotates_all_endpoints() {
        let uris = sample_target().connection_uri_list();
        assert_eq!(uris.len(), 3);
        assert!(uris[0].contains("node1:5433"));
        assert!(uris[1].contains("node2:5433"));
        assert!(uris[2].contains("node3:5434"));
    }

    #[test]
    fn test_target_config_password_not_serialized() {
        let json = serde_json::to_string(&sample_target()).unwrap();
        assert!(!json.contains("s3cret"), "password was serialized: {}", json);
    }

    #[test]
    fn test_default_schema_multi_schema_pg() {
        let cfg = SourceConfig {
            db_type: Dialect::Postgres,
            host: "src".into(),
            port: 5432,
            database: "app".into(),
            user: "u".into(),
            password: None,
            schema: "public,sales".into(),
            ssl_mode: "prefer".into(),
        };
        assert_eq!(cfg.default_schema(), None);

        let cfg = SourceConfig {
            schema: "public".into(),
            ..cfg
        };
        assert_eq!(cfg.default_schema(), Some("public"));
    }

    #[test]
    fn test_export_type_flags() {
        assert!(ExportType::SnapshotOnly.includes_snapshot());
        assert!(!ExportType::SnapshotOnly.includes_changes());
        assert!(ExportType::SnapshotAndChanges.includes_changes());
        assert!(ExportType::ChangesOnly.includes_changes());
        assert!(!ExportType::ChangesOnly.includes_snapshot());
    }

    #[test]
    fn test_migration_defaults() {
        let m = MigrationConfig::default();
        assert_eq!(m.get_batch_size_rows(), 20_000);
        assert_eq!(m.get_event_batch_max_size(), 500);
        assert_eq!(m.get_event_batch_max_interval_ms(), 2_000);
        assert!(!m.truncate_splits);
    }
}
