//! The migration status record (MSR): one durable JSON blob describing the
//! run — identity, configs, phase flags, table list, rename map, cutover
//! state.
//!
//! All mutation goes through [`MetaDb::update`], a single-writer closure
//! executed under a lock; readers always re-read from disk. Writes are
//! atomic (temp file + rename) and the blob carries an HMAC-SHA256 signature
//! keyed by the migration UUID, verified on every load.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::config::{ExportType, SourceConfig, TargetConfig};
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MSR_PATH: &str = "metainfo/msr.json";

/// The record itself. Everything optional starts empty and is filled as the
/// run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatusRecord {
    pub migration_uuid: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_db_conf: Option<SourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_db_conf: Option<TargetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_replica_db_conf: Option<SourceConfig>,

    #[serde(default)]
    pub export_type: ExportType,

    #[serde(default)]
    pub schema_exported: bool,
    #[serde(default)]
    pub export_data_done: bool,

    /// How the snapshot was produced (e.g. "pg_dump", "ora2pg").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_mechanism: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_replication_slot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_publication_name: Option<String>,

    /// Source-side references of every table selected for the migration.
    #[serde(default)]
    pub table_list_exported_from_source: Vec<String>,

    /// Leaf partition -> root table renames applied on export.
    #[serde(default)]
    pub source_rename_tables_map: BTreeMap<String, String>,

    /// Last values of source sequences captured from the dump's post-data
    /// script; initial values for the CDC producer and restorable on the
    /// target.
    #[serde(default)]
    pub sequence_initial_values: BTreeMap<String, i64>,

    #[serde(default)]
    pub fall_forward_enabled: bool,
    #[serde(default)]
    pub fall_back_enabled: bool,

    #[serde(default)]
    pub cutover_to_target_requested: bool,
    #[serde(default)]
    pub cutover_processed_by_source_exporter: bool,
    #[serde(default)]
    pub cutover_processed_by_target_importer: bool,

    #[serde(default)]
    pub end_migration_requested: bool,

    /// Integrity signature over the rest of the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl MigrationStatusRecord {
    fn new() -> Self {
        Self {
            migration_uuid: Uuid::new_v4(),
            source_db_conf: None,
            target_db_conf: None,
            source_replica_db_conf: None,
            export_type: ExportType::default(),
            schema_exported: false,
            export_data_done: false,
            snapshot_mechanism: None,
            pg_replication_slot_name: None,
            pg_publication_name: None,
            table_list_exported_from_source: Vec::new(),
            source_rename_tables_map: BTreeMap::new(),
            sequence_initial_values: BTreeMap::new(),
            fall_forward_enabled: false,
            fall_back_enabled: false,
            cutover_to_target_requested: false,
            cutover_processed_by_source_exporter: false,
            cutover_processed_by_target_importer: false,
            end_migration_requested: false,
            hmac: None,
        }
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.migration_uuid.to_string().as_bytes())
            .map_err(|e| MigrateError::State(format!("create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify_hmac(&self, stored: &str) -> Result<()> {
        let stored_bytes = hex::decode(stored)
            .map_err(|e| MigrateError::State(format!("invalid MSR HMAC format: {}", e)))?;
        let mut unsigned = self.clone();
        unsigned.hmac = None;
        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.migration_uuid.to_string().as_bytes())
            .map_err(|e| MigrateError::State(format!("create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        mac.verify_slice(&stored_bytes).map_err(|_| {
            MigrateError::State(
                "migration status record integrity check failed: HMAC mismatch".to_string(),
            )
        })
    }
}

/// Handle to the MSR file.
pub struct MetaDb {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MetaDb {
    /// Open the MSR under `export_dir`, creating a fresh record (new
    /// migration UUID) when none exists.
    pub fn init(export_dir: &Path) -> Result<Self> {
        let path = export_dir.join(MSR_PATH);
        let db = Self {
            path,
            write_lock: Mutex::new(()),
        };
        if !db.path.exists() {
            if let Some(parent) = db.path.parent() {
                fs::create_dir_all(parent)?;
            }
            db.write(&mut MigrationStatusRecord::new())?;
        }
        Ok(db)
    }

    /// Open an existing MSR; fails when the project was never initialized.
    pub fn open(export_dir: &Path) -> Result<Self> {
        let path = export_dir.join(MSR_PATH);
        if !path.exists() {
            return Err(MigrateError::State(format!(
                "migration status record not found at {:?}; run export first",
                path
            )));
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Re-read the record from disk. No in-memory caching: phase flags may
    /// be flipped by a concurrent command against the same export dir.
    pub fn migration_status_record(&self) -> Result<MigrationStatusRecord> {
        let content = fs::read_to_string(&self.path)?;
        let record: MigrationStatusRecord = serde_json::from_str(&content)?;
        match &record.hmac {
            Some(stored) => record.verify_hmac(stored)?,
            None => warn!("migration status record has no integrity signature"),
        }
        Ok(record)
    }

    /// Single-writer read-modify-write.
    pub async fn update<F>(&self, mutate: F) -> Result<MigrationStatusRecord>
    where
        F: FnOnce(&mut MigrationStatusRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.migration_status_record()?;
        mutate(&mut record);
        self.write(&mut record)?;
        Ok(record)
    }

    pub fn migration_uuid(&self) -> Result<Uuid> {
        Ok(self.migration_status_record()?.migration_uuid)
    }

    fn write(&self, record: &mut MigrationStatusRecord) -> Result<()> {
        record.hmac = Some(record.compute_hmac()?);
        let content = serde_json::to_string_pretty(record)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
