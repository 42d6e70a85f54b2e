//! Snapshot file descriptor: the manifest of per-table data files produced
//! by the export stage, persisted as one JSON document per export directory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};

pub const DESCRIPTOR_PATH: &str = "data/descriptor.json";

/// Row count recorded when the producer could not count rows.
pub const ROW_COUNT_UNKNOWN: i64 = -1;

/// Format of an exported data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Tab-delimited, no header (pg_dump COPY text).
    Text,
    /// Comma-delimited with a header line.
    Csv,
    /// Vendor SQL COPY payload.
    Sql,
}

/// One exported data file. Immutable once written to the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Registry key of the table this file belongs to.
    pub table_name: String,
    /// Absolute path of the data file.
    pub file_path: PathBuf,
    pub byte_count: i64,
    /// `ROW_COUNT_UNKNOWN` when the producer does not count rows.
    pub row_count: i64,
}

/// The manifest. Global framing fields apply to every entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub file_format: FileFormat,
    pub delimiter: String,
    pub null_string: String,
    pub has_header: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_char: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escape_char: Option<u8>,
    pub data_file_list: Vec<FileEntry>,
    /// Columns actually present in each exported file, when the dump tool
    /// reports them (a table may have dropped columns on the source).
    #[serde(default)]
    pub table_to_exported_columns: HashMap<String, Vec<String>>,

    #[serde(skip)]
    export_dir: PathBuf,
}

impl Descriptor {
    pub fn new(export_dir: impl Into<PathBuf>, file_format: FileFormat) -> Self {
        let (delimiter, null_string, has_header) = match file_format {
            FileFormat::Text => ("\t".to_string(), "\\N".to_string(), false),
            FileFormat::Csv => (",".to_string(), String::new(), true),
            FileFormat::Sql => ("\t".to_string(), "\\N".to_string(), false),
        };
        Self {
            file_format,
            delimiter,
            null_string,
            has_header,
            quote_char: None,
            escape_char: None,
            data_file_list: Vec::new(),
            table_to_exported_columns: HashMap::new(),
            export_dir: export_dir.into(),
        }
    }

    pub fn exists(export_dir: &Path) -> bool {
        export_dir.join(DESCRIPTOR_PATH).exists()
    }

    pub fn load(export_dir: &Path) -> Result<Self> {
        let path = export_dir.join(DESCRIPTOR_PATH);
        let content = fs::read_to_string(&path).map_err(|e| {
            MigrateError::State(format!("read descriptor {:?}: {}", path, e))
        })?;
        let mut descriptor: Descriptor = serde_json::from_str(&content)?;
        descriptor.export_dir = export_dir.to_path_buf();
        Ok(descriptor)
    }

    /// Atomic write: temp file then rename.
    pub fn save(&self) -> Result<()> {
        let path = self.export_dir.join(DESCRIPTOR_PATH);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn add_entry(&mut self, entry: FileEntry) {
        self.data_file_list.push(entry);
    }

    /// Entries for one table (a table may be split over several files).
    pub fn entries_for_table(&self, table_name: &str) -> Vec<&FileEntry> {
        self.data_file_list
            .iter()
            .filter(|e| e.table_name == table_name)
            .collect()
    }

    /// Exported row count per table, summed across files.
    pub fn exported_row_counts(&self) -> HashMap<String, i64> {
        let mut result: HashMap<String, i64> = HashMap::new();
        for entry in &self.data_file_list {
            *result.entry(entry.table_name.clone()).or_insert(0) += entry.row_count.max(0);
        }
        result
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = Descriptor::new(dir.path(), FileFormat::Text);
        descriptor.add_entry(FileEntry {
            table_name: "public.users".into(),
            file_path: dir.path().join("data/users_data.sql"),
            byte_count: 4096,
            row_count: 100,
        });
        descriptor.add_entry(FileEntry {
            table_name: "public.orders".into(),
            file_path: dir.path().join("data/orders_data.sql"),
            byte_count: 1024,
            row_count: ROW_COUNT_UNKNOWN,
        });
        descriptor.save().unwrap();

        assert!(Descriptor::exists(dir.path()));
        let loaded = Descriptor::load(dir.path()).unwrap();
        assert_eq!(loaded.file_format, FileFormat::Text);
        assert_eq!(loaded.delimiter, "\t");
        assert_eq!(loaded.null_string, "\\N");
        assert!(!loaded.has_header);
        assert_eq!(loaded.data_file_list, descriptor.data_file_list);
    }

    #[test]
    fn test_exported_row_counts_ignore_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = Descriptor::new(dir.path(), FileFormat::Csv);
        for (rows, file) in [(50, "a"), (70, "b")] {
            descriptor.add_entry(FileEntry {
                table_name: "public.users".into(),
                file_path: PathBuf::from(file),
                byte_count: 10,
                row_count: rows,
            });
        }
        descriptor.add_entry(FileEntry {
            table_name: "public.orders".into(),
            file_path: PathBuf::from("c"),
            byte_count: 10,
            row_count: ROW_COUNT_UNKNOWN,
        });

        let counts = descriptor.exported_row_counts();
        assert_eq!(counts["public.users"], 120);
        assert_eq!(counts["public.orders"], 0);
    }

    #[test]
    fn test_missing_descriptor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Descriptor::exists(dir.path()));
        assert!(Descriptor::load(dir.path()).is_err());
    }

    #[test]
    fn test_csv_defaults() {
        let descriptor = Descriptor::new("/tmp/export", FileFormat::Csv);
        assert_eq!(descriptor.delimiter, ",");
        assert!(descriptor.has_header);
    }
}
