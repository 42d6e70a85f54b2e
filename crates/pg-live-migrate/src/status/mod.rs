//! Human-readable progress reports for the snapshot and streaming phases.
//!
//! Report assembly is split from data collection so the rendering is
//! testable: callers gather counts (from the descriptor, the batch state
//! directories and the target metadata tables) and hand plain rows to the
//! format functions.

use std::fs;
use std::path::Path;

use crate::datafile::{Descriptor, ROW_COUNT_UNKNOWN};
use crate::error::Result;
use crate::sqlname::Role;
use crate::state::{FileImportState, ImportDataState};
use crate::tgtdb::EventCounter;

/// One table's exported snapshot row count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportStatusRow {
    pub table: String,
    pub row_count: i64,
}

/// Exported row counts per table. The descriptor is authoritative when it
/// exists; otherwise fall back to scanning the data directory for produced
/// files (their row counts are then unknown).
pub fn export_status_rows(export_dir: &Path) -> Result<Vec<ExportStatusRow>> {
    if Descriptor::exists(export_dir) {
        let descriptor = Descriptor::load(export_dir)?;
        let mut rows: Vec<ExportStatusRow> = descriptor
            .exported_row_counts()
            .into_iter()
            .map(|(table, row_count)| ExportStatusRow { table, row_count })
            .collect();
        rows.sort_by(|a, b| a.table.cmp(&b.table));
        return Ok(rows);
    }

    let data_dir = export_dir.join("data");
    let mut rows = Vec::new();
    if data_dir.exists() {
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(table) = name.strip_suffix("_data.sql") {
                rows.push(ExportStatusRow {
                    table: table.to_string(),
                    row_count: ROW_COUNT_UNKNOWN,
                });
            }
        }
    }
    rows.sort_by(|a, b| a.table.cmp(&b.table));
    Ok(rows)
}

pub fn format_export_status(rows: &[ExportStatusRow]) -> String {
    let mut out = String::from("snapshot export report\n\n");
    out.push_str(&format!("{:<40} {:>18}\n", "TABLE", "ROW COUNT"));
    for row in rows {
        let count = if row.row_count == ROW_COUNT_UNKNOWN {
            "unknown".to_string()
        } else {
            row.row_count.to_string()
        };
        out.push_str(&format!("{:<40} {:>18}\n", row.table, count));
    }
    out
}

/// One (table, data file) import status line.
#[derive(Debug, Clone)]
pub struct ImportStatusRow {
    pub table: String,
    pub file: String,
    pub status: FileImportState,
    pub total_rows: i64,
    pub imported_rows: i64,
}

impl ImportStatusRow {
    pub fn percent_complete(&self) -> f64 {
        if self.total_rows <= 0 {
            return 0.0;
        }
        (self.imported_rows as f64 / self.total_rows as f64) * 100.0
    }
}

/// Per-file import progress derived from the descriptor and the batch state
/// directories. Works entirely offline; the metadata rows on the target
/// mirror the done-batch artifacts.
pub fn import_status_rows(export_dir: &Path, role: Role) -> Result<Vec<ImportStatusRow>> {
    let descriptor = Descriptor::load(export_dir)?;
    let state = ImportDataState::new(export_dir, role);
    let mut rows = Vec::new();
    for (table_name, files) in state.discover_table_to_files_mapping()? {
        for file in files {
            let matching = descriptor
                .data_file_list
                .iter()
                .find(|e| e.file_path == file);
            let total_rows = matching.map(|e| e.row_count).unwrap_or(ROW_COUNT_UNKNOWN);
            // state lookups key on the rendered table name, which is what
            // the discovery returned
            let tuple = state_tuple_for(&table_name, role)?;
            rows.push(ImportStatusRow {
                table: table_name.clone(),
                file: file.to_string_lossy().into_owned(),
                status: state.file_import_state(&file, &tuple)?,
                total_rows,
                imported_rows: state.imported_row_count(&file, &tuple)?,
            });
        }
    }
    rows.sort_by(|a, b| (a.table.as_str(), a.file.as_str()).cmp(&(b.table.as_str(), b.file.as_str())));
    Ok(rows)
}

fn state_tuple_for(rendered: &str, role: Role) -> Result<crate::sqlname::NameTuple> {
    use crate::sqlname::{Dialect, NameTuple, ObjectName};
    let name = ObjectName::parse(Dialect::Postgres, Some("public"), rendered)?;
    NameTuple::new(Some(name.clone()), Some(name), role)
}

pub fn format_import_status(rows: &[ImportStatusRow]) -> String {
    let mut out = String::from("snapshot import report\n\n");
    out.push_str(&format!(
        "{:<30} {:<14} {:>14} {:>14} {:>10}\n",
        "TABLE", "STATUS", "TOTAL ROWS", "IMPORTED", "PERCENT"
    ));
    for row in rows {
        let status = match row.status {
            FileImportState::NotStarted => "NOT_STARTED",
            FileImportState::InProgress => "IN_PROGRESS",
            FileImportState::Completed => "DONE",
        };
        out.push_str(&format!(
            "{:<30} {:<14} {:>14} {:>14} {:>9.1}%\n",
            row.table,
            status,
            row.total_rows,
            row.imported_rows,
            row.percent_complete()
        ));
    }
    out
}

/// One table's row in the end-to-end migration report.
#[derive(Debug, Clone)]
pub struct MigrationReportRow {
    pub table: String,
    pub exported_snapshot_rows: i64,
    pub imported_snapshot_rows: i64,
    pub imported_events: EventCounter,
}

pub fn format_migration_report(rows: &[MigrationReportRow]) -> String {
    let mut out = String::from("data migration report\n\n");
    out.push_str(&format!(
        "{:<30} {:>12} {:>12} {:>10} {:>10} {:>10}\n",
        "TABLE", "EXPORTED", "IMPORTED", "INSERTS", "UPDATES", "DELETES"
    ));
    for row in rows {
        out.push_str(&format!(
            "{:<30} {:>12} {:>12} {:>10} {:>10} {:>10}\n",
            row.table,
            row.exported_snapshot_rows,
            row.imported_snapshot_rows,
            row.imported_events.num_inserts,
            row.imported_events.num_updates,
            row.imported_events.num_deletes
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::{FileEntry, FileFormat};

    #[test]
    fn test_export_status_prefers_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        // a stray data file that must be ignored once the descriptor exists
        std::fs::write(dir.path().join("data/ghost_data.sql"), "1\n").unwrap();

        let mut descriptor = Descriptor::new(dir.path(), FileFormat::Text);
        descriptor.add_entry(FileEntry {
            table_name: "public.users".into(),
            file_path: dir.path().join("data/users_data.sql"),
            byte_count: 10,
            row_count: 7,
        });
        descriptor.save().unwrap();

        let rows = export_status_rows(dir.path()).unwrap();
        assert_eq!(
            rows,
            vec![ExportStatusRow {
                table: "public.users".into(),
                row_count: 7
            }]
        );
    }

    #[test]
    fn test_export_status_falls_back_to_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/users_data.sql"), "1\n2\n").unwrap();
        std::fs::write(dir.path().join("data/orders_data.sql"), "1\n").unwrap();
        std::fs::write(dir.path().join("data/toc.txt"), "").unwrap();

        let rows = export_status_rows(dir.path()).unwrap();
        let tables: Vec<&str> = rows.iter().map(|r| r.table.as_str()).collect();
        assert_eq!(tables, vec!["orders", "users"]);
        assert!(rows.iter().all(|r| r.row_count == ROW_COUNT_UNKNOWN));
    }

    #[test]
    fn test_percent_complete() {
        let row = ImportStatusRow {
            table: "users".into(),
            file: "f".into(),
            status: FileImportState::InProgress,
            total_rows: 200,
            imported_rows: 50,
        };
        assert!((row.percent_complete() - 25.0).abs() < f64::EPSILON);

        let unknown = ImportStatusRow {
            total_rows: ROW_COUNT_UNKNOWN,
            ..row
        };
        assert_eq!(unknown.percent_complete(), 0.0);
    }

    #[test]
    fn test_format_export_status_renders_unknown() {
        let rows = vec![
            ExportStatusRow {
                table: "public.users".into(),
                row_count: 100,
            },
            ExportStatusRow {
                table: "public.orders".into(),
                row_count: ROW_COUNT_UNKNOWN,
            },
        ];
        let report = format_export_status(&rows);
        assert!(report.contains("public.users"));
        assert!(report.contains("100"));
        assert!(report.contains("unknown"));
    }

    #[test]
    fn test_format_migration_report() {
        let rows = vec![MigrationReportRow {
            table: "public.users".into(),
            exported_snapshot_rows: 1000,
            imported_snapshot_rows: 1000,
            imported_events: EventCounter {
                total_events: 30,
                num_inserts: 10,
                num_updates: 15,
                num_deletes: 5,
            },
        }];
        let report = format_migration_report(&rows);
        assert!(report.contains("public.users"));
        assert!(report.contains("1000"));
        assert!(report.contains("15"));
    }
}
