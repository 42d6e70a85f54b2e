//! Snapshot export: drive the vendor dump tool, normalize its output into
//! the descriptor layout, and record progress in the MSR.
//!
//! For pg sources in live-migration mode the exporter first creates the
//! publication and the logical replication slot, and pins the dump to the
//! slot's exported snapshot so the change stream resumes exactly where the
//! snapshot ends.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::fast_export_enabled;
use crate::datafile::{Descriptor, FileEntry, FileFormat};
use crate::error::{MigrateError, Result};
use crate::importer::file::is_data_line;
use crate::metadb::MetaDb;
use crate::sqlname::Dialect;
use crate::srcdb::{DumpCommand, SourceDb, SourceDbImpl};

/// Subdirectories of a migration project, created once at init.
const PROJECT_SUBDIRS: &[&str] = &[
    "schema",
    "data",
    "data/schemas",
    "reports",
    "metainfo",
    "metainfo/import_data_state",
    "temp",
];

/// Set up the export directory skeleton; safe to call repeatedly.
pub fn create_migration_project(export_dir: &Path) -> Result<()> {
    for subdir in PROJECT_SUBDIRS {
        fs::create_dir_all(export_dir.join(subdir))?;
    }
    Ok(())
}

/// One `TABLE DATA` entry of a pg_dump directory-format archive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub schema: String,
    pub table: String,
    pub file_name: String,
}

pub struct SnapshotExporter {
    pub export_dir: PathBuf,
    pub meta_db: Arc<MetaDb>,
    pub parallel_jobs: usize,
    pub shutdown_grace: Duration,
    pub cancel: CancellationToken,
}

impl SnapshotExporter {
    /// Export the snapshot for the selected tables and write the
    /// descriptor. Blocks until the dump tool finishes or the run is
    /// cancelled.
    pub async fn export_data(&self, source: &SourceDbImpl, tables: &[String]) -> Result<()> {
        create_migration_project(&self.export_dir)?;
        self.meta_db
            .update(|record| {
                record.table_list_exported_from_source = tables.to_vec();
                record.snapshot_mechanism = Some(source.snapshot_mechanism().to_string());
            })
            .await?;

        match source.dialect() {
            Dialect::Postgres => self.export_data_pg(source, tables).await?,
            Dialect::Oracle | Dialect::Mysql => self.export_data_ora2pg(source, tables).await?,
        }

        self.meta_db
            .update(|record| record.export_data_done = true)
            .await?;
        info!("snapshot export complete");
        Ok(())
    }

    async fn export_data_pg(&self, source: &SourceDbImpl, tables: &[String]) -> Result<()> {
        let pg = source
            .as_postgres()
            .expect("pg dialect always carries a pg source");
        let record = self.meta_db.migration_status_record()?;

        let mut snapshot_name = None;
        if record.export_type.includes_changes() {
            let uuid_part = record.migration_uuid.to_string().replace('-', "_");
            // the publication must exist before the slot
            let publication_name = format!("voyager_dbz_publication_{}", uuid_part);
            pg.create_publication(&publication_name, tables).await?;
            let slot = pg
                .create_replication_slot(&format!("voyager_{}", uuid_part))
                .await?;
            self.meta_db
                .update(|r| {
                    r.pg_publication_name = Some(publication_name.clone());
                    r.pg_replication_slot_name = Some(slot.slot_name.clone());
                })
                .await?;
            snapshot_name = Some(slot.snapshot_name);
        }

        let jobs = if fast_export_enabled() {
            self.parallel_jobs.max(1)
        } else {
            1
        };
        let cmd = source.export_data_command(&self.export_dir, tables, snapshot_name.as_deref(), jobs);
        let dump_result = self.run_dump_command(cmd).await;
        if snapshot_name.is_some() {
            // the exported snapshot is only valid while our session holds it
            if let Err(e) = pg.release_snapshot().await {
                warn!("release snapshot transaction: {}", e);
            }
        }
        dump_result?;

        self.post_process_pg_dump().await
    }

    /// Map dump archive entries to final per-table data files and write the
    /// descriptor.
    async fn post_process_pg_dump(&self) -> Result<()> {
        let data_dir = self.export_dir.join("data");
        let dump_dir = data_dir.join("dump");

        let listing = self.pg_restore_listing(&dump_dir).await?;
        fs::write(data_dir.join("toc.txt"), &listing)?;
        let toc_entries = parse_toc_listing(&listing);

        // sequences: emit the post-data script and pick out setval() calls
        let postdata_path = data_dir.join("postdata.sql");
        self.run_dump_command(
            DumpCommand::new("pg_restore")
                .arg("--section=post-data")
                .arg(format!("--file={}", postdata_path.display()))
                .arg(dump_dir.display().to_string()),
        )
        .await?;
        let sequences = parse_setval_lines(&fs::read_to_string(&postdata_path)?)?;
        self.meta_db
            .update(|record| record.sequence_initial_values = sequences)
            .await?;

        let mut descriptor = Descriptor::new(&self.export_dir, FileFormat::Text);
        for entry in &toc_entries {
            let source_path = dump_dir.join(&entry.file_name);
            let final_path = data_dir.join(pg_data_file_name(&entry.schema, &entry.table));
            info!("renaming {:?} -> {:?}", source_path, final_path);
            fs::rename(&source_path, &final_path)?;
            let byte_count = fs::metadata(&final_path)?.len() as i64;
            let row_count = count_records(&final_path, FileFormat::Text)?;
            descriptor.add_entry(FileEntry {
                table_name: format!("{}.{}", entry.schema, entry.table),
                file_path: final_path,
                byte_count,
                row_count,
            });
        }
        descriptor.save()?;
        Ok(())
    }

    async fn export_data_ora2pg(&self, source: &SourceDbImpl, tables: &[String]) -> Result<()> {
        let cmd = source.export_data_command(&self.export_dir, tables, None, self.parallel_jobs);
        self.run_dump_command(cmd).await?;

        let data_dir = self.export_dir.join("data");
        let mut descriptor = Descriptor::new(&self.export_dir, FileFormat::Sql);
        for table in tables {
            let bare = table.rsplit('.').next().unwrap_or(table).to_lowercase();
            let final_path = data_dir.join(format!("{}_data.sql", bare));
            let tmp_path = data_dir.join(format!("tmp_{}_data.sql", bare));
            if tmp_path.exists() {
                fs::rename(&tmp_path, &final_path)?;
            }
            if !final_path.exists() {
                warn!("no data file produced for table {}", table);
                continue;
            }
            let byte_count = fs::metadata(&final_path)?.len() as i64;
            let row_count = count_records(&final_path, FileFormat::Sql)?;
            descriptor.add_entry(FileEntry {
                table_name: table.clone(),
                file_path: final_path,
                byte_count,
                row_count,
            });
        }
        descriptor.save()?;
        Ok(())
    }

    async fn pg_restore_listing(&self, dump_dir: &Path) -> Result<String> {
        let output = tokio::process::Command::new("pg_restore")
            .arg("-l")
            .arg(dump_dir)
            .output()
            .await
            .map_err(|e| MigrateError::Export(format!("run pg_restore -l: {}", e)))?;
        if !output.status.success() {
            return Err(MigrateError::Export(format!(
                "pg_restore -l failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a dump-tool invocation under the cancellation scope: graceful
    /// terminate on cancel, hard kill when the grace period expires.
    async fn run_dump_command(&self, cmd: DumpCommand) -> Result<()> {
        info!("running: {}", cmd.display());
        let mut command = tokio::process::Command::new(&cmd.program);
        command.args(&cmd.args);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        let mut child = command
            .spawn()
            .map_err(|e| MigrateError::Export(format!("spawn {}: {}", cmd.program, e)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(MigrateError::Child {
                        command: cmd.program,
                        status: status.to_string(),
                    });
                }
                Ok(())
            }
            _ = self.cancel.cancelled() => {
                warn!("cancellation requested, terminating {}", cmd.program);
                if let Some(pid) = child.id() {
                    let _ = std::process::Command::new("kill")
                        .arg("-TERM")
                        .arg(pid.to_string())
                        .status();
                }
                if tokio::time::timeout(self.shutdown_grace, child.wait())
                    .await
                    .is_err()
                {
                    let _ = child.kill().await;
                }
                Err(MigrateError::Cancelled)
            }
        }
    }
}

/// Final file name of one table's data. Tables of the default `public`
/// schema keep the short form.
fn pg_data_file_name(schema: &str, table: &str) -> String {
    if schema == "public" {
        format!("{}_data.sql", table)
    } else {
        format!("{}.{}_data.sql", schema, table)
    }
}

/// Parse a `pg_restore -l` archive listing for TABLE DATA entries.
/// Example line: `3725; 0 16594 TABLE DATA public categories owner`.
pub fn parse_toc_listing(listing: &str) -> Vec<TocEntry> {
    let mut entries = Vec::new();
    for line in listing.lines() {
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() < 8 || parts[3] != "TABLE" || parts[4] != "DATA" {
            continue;
        }
        entries.push(TocEntry {
            schema: parts[5].to_string(),
            table: parts[6].to_string(),
            file_name: format!("{}.dat", parts[0].trim_end_matches(';')),
        });
    }
    entries
}

/// Pick `setval('<name>', <value>, true)` calls out of a post-data script.
/// Example line: `SELECT pg_catalog.setval('public.actor_actor_id_seq', 200, true);`.
pub fn parse_setval_lines(content: &str) -> Result<BTreeMap<String, i64>> {
    let mut result = BTreeMap::new();
    for line in content.lines() {
        let lower = line.to_lowercase();
        let Some(call_start) = lower.find("setval(") else {
            continue;
        };
        let args_start = call_start + "setval(".len();
        let Some(args_end) = line[args_start..].find(')') else {
            return Err(MigrateError::Export(format!(
                "malformed setval call in line {:?}",
                line
            )));
        };
        let args: Vec<&str> = line[args_start..args_start + args_end].split(',').collect();
        if args.len() < 2 {
            return Err(MigrateError::Export(format!(
                "malformed setval call in line {:?}",
                line
            )));
        }
        let name = args[0].trim().trim_matches('\'').to_string();
        let value: i64 = args[1].trim().parse().map_err(|_| {
            MigrateError::Export(format!("invalid setval value in line {:?}", line))
        })?;
        result.insert(name, value);
    }
    Ok(result)
}

/// Count the records in a data file (non-data framing lines excluded).
fn count_records(path: &Path, format: FileFormat) -> Result<i64> {
    use std::io::{BufRead, BufReader};
    let file = fs::File::open(path)?;
    let reader = BufReader::with_capacity(1024 * 1024, file);
    let mut count = 0i64;
    for line in reader.lines() {
        if is_data_line(format, &line?) {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toc_listing() {
        let listing = "\
;\n\
; Archive created at 2024-01-05 10:00:00 UTC\n\
3725; 0 16594 TABLE DATA public categories ds2\n\
3726; 0 16600 TABLE DATA sales orders ds2\n\
3727; 0 16610 SEQUENCE SET public categories_id_seq ds2\n";
        let entries = parse_toc_listing(listing);
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            TocEntry {
                schema: "public".into(),
                table: "categories".into(),
                file_name: "3725.dat".into(),
            }
        );
        assert_eq!(entries[1].schema, "sales");
        assert_eq!(entries[1].file_name, "3726.dat");
    }

    #[test]
    fn test_parse_setval_lines() {
        let content = "\
-- post-data\n\
SELECT pg_catalog.setval('public.actor_actor_id_seq', 200, true);\n\
SELECT pg_catalog.setval('sales.orders_id_seq', 42, true);\n\
CREATE INDEX idx ON public.actor (name);\n";
        let sequences = parse_setval_lines(content).unwrap();
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences["public.actor_actor_id_seq"], 200);
        assert_eq!(sequences["sales.orders_id_seq"], 42);
    }

    #[test]
    fn test_parse_setval_rejects_garbage() {
        assert!(parse_setval_lines("SELECT setval('broken', x, true);").is_err());
    }

    #[test]
    fn test_pg_data_file_name() {
        assert_eq!(pg_data_file_name("public", "users"), "users_data.sql");
        assert_eq!(pg_data_file_name("sales", "orders"), "sales.orders_data.sql");
    }

    #[test]
    fn test_count_records_skips_sql_framing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users_data.sql");
        fs::write(
            &path,
            "COPY users (id) FROM stdin;\n1\tu1\n2\tu2\n\\.\n",
        )
        .unwrap();
        assert_eq!(count_records(&path, FileFormat::Sql).unwrap(), 2);
        assert_eq!(count_records(&path, FileFormat::Text).unwrap(), 4);
    }

    #[test]
    fn test_create_migration_project_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        create_migration_project(dir.path()).unwrap();
        create_migration_project(dir.path()).unwrap();
        assert!(dir.path().join("metainfo/import_data_state").is_dir());
        assert!(dir.path().join("data/schemas").is_dir());
    }
}
