//! Per-table column schemas emitted by the CDC producer.
//!
//! One JSON file per table under `data/schemas/<role>/<table>_schema.json`:
//! `{"columns": [{"name", "index", "schema": {"type", "name", "parameters"}}]}`.
//! Used for type conversion during event apply and by the name registry.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, Result};
use crate::sqlname::Role;

/// Parameter carrying the original source column type.
const SOURCE_COLUMN_TYPE_PARAM: &str = "__debezium.source.column.type";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnSchema {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Column {
    pub name: String,
    pub index: i64,
    pub schema: ColumnSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Effective type of one column. `use_source_datatype` substitutes the
    /// original source type for DATE/INTERVAL columns, which oracle imports
    /// need to convert correctly.
    pub fn column_type(
        &self,
        column_name: &str,
        use_source_datatype: bool,
    ) -> Result<(String, &ColumnSchema)> {
        for column in &self.columns {
            if column.name != column_name {
                continue;
            }
            let schema = &column.schema;
            if use_source_datatype {
                if let Some(source_type) = schema.parameters.get(SOURCE_COLUMN_TYPE_PARAM) {
                    if source_type.contains("DATE") || source_type.contains("INTERVAL") {
                        return Ok((source_type.clone(), schema));
                    }
                }
            }
            // producer-specific logical types carry a name; primitives only
            // a type
            let ty = if schema.name.is_empty() {
                schema.r#type.clone()
            } else {
                schema.name.clone()
            };
            return Ok((ty, schema));
        }
        Err(MigrateError::State(format!(
            "column {:?} not found in table schema",
            column_name
        )))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

pub struct SchemaRegistry {
    schema_dir: PathBuf,
    tables: HashMap<String, TableSchema>,
}

impl SchemaRegistry {
    pub fn new(export_dir: &Path, exporter_role: Role) -> Self {
        Self {
            schema_dir: export_dir
                .join("data")
                .join("schemas")
                .join(exporter_role.as_str()),
            tables: HashMap::new(),
        }
    }

    /// Load every `<table>_schema.json` under the role's schema directory.
    pub fn init(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.schema_dir).map_err(|e| {
            MigrateError::State(format!("read schema dir {:?}: {}", self.schema_dir, e))
        })?;
        for entry in entries {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(table) = file_name.strip_suffix("_schema.json") else {
                continue;
            };
            self.tables.insert(table.to_string(), load_schema(&path)?);
        }
        Ok(())
    }

    pub fn table_schema(&mut self, table_name: &str) -> Result<&TableSchema> {
        if !self.tables.contains_key(table_name) {
            // not seen at init time; the producer may have written it since
            let path = self.schema_dir.join(format!("{}_schema.json", table_name));
            let schema = load_schema(&path)?;
            self.tables.insert(table_name.to_string(), schema);
        }
        Ok(&self.tables[table_name])
    }

    /// Types for several columns of one table.
    pub fn column_types(
        &mut self,
        table_name: &str,
        column_names: &[String],
        use_source_datatypes: bool,
    ) -> Result<Vec<String>> {
        let schema = self.table_schema(table_name)?;
        column_names
            .iter()
            .map(|c| Ok(schema.column_type(c, use_source_datatypes)?.0))
            .collect()
    }
}

fn load_schema(path: &Path) -> Result<TableSchema> {
    let content = fs::read_to_string(path)
        .map_err(|e| MigrateError::State(format!("open table schema file {:?}: {}", path, e)))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS_SCHEMA: &str = r#"{
        "columns": [
            {"name": "id", "index": 0, "schema": {"type": "INT32", "name": "", "parameters": {}}},
            {"name": "created", "index": 1, "schema": {
                "type": "INT64",
                "name": "io.debezium.time.Timestamp",
                "parameters": {"__debezium.source.column.type": "DATE"}
            }}
        ]
    }"#;

    fn registry_with_users(dir: &Path) -> SchemaRegistry {
        let schema_dir = dir.join("data").join("schemas").join("source_db_exporter");
        fs::create_dir_all(&schema_dir).unwrap();
        fs::write(schema_dir.join("users_schema.json"), USERS_SCHEMA).unwrap();
        let mut reg = SchemaRegistry::new(dir, Role::SourceDbExporter);
        reg.init().unwrap();
        reg
    }

    #[test]
    fn test_primitive_and_logical_types() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry_with_users(dir.path());
        let schema = reg.table_schema("users").unwrap();
        assert_eq!(schema.column_type("id", false).unwrap().0, "INT32");
        assert_eq!(
            schema.column_type("created", false).unwrap().0,
            "io.debezium.time.Timestamp"
        );
    }

    #[test]
    fn test_source_datatype_override_for_date() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry_with_users(dir.path());
        let schema = reg.table_schema("users").unwrap();
        assert_eq!(schema.column_type("created", true).unwrap().0, "DATE");
        // non-DATE columns are unaffected
        assert_eq!(schema.column_type("id", true).unwrap().0, "INT32");
    }

    #[test]
    fn test_unknown_column_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry_with_users(dir.path());
        let schema = reg.table_schema("users").unwrap();
        assert!(schema.column_type("missing", false).is_err());
        assert!(reg.table_schema("orders").is_err());
    }

    #[test]
    fn test_column_types_bulk_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry_with_users(dir.path());
        let types = reg
            .column_types("users", &["id".into(), "created".into()], false)
            .unwrap();
        assert_eq!(types, vec!["INT32", "io.debezium.time.Timestamp"]);
    }
}
