//! Attribute name registry: resolves a source column reference to its
//! target-side spelling.
//!
//! Column lists are fetched lazily from the target catalog and memoized per
//! table tuple under a mutex. Resolution applies, in order: exact match,
//! case-insensitive match with exactly one candidate, the dialect-preferred
//! casing among several candidates, else an ambiguity / not-found error.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::TargetDb;
use crate::error::{MigrateError, Result};
use crate::sqlname::{Dialect, NameTuple};

pub struct AttributeNameRegistry {
    db: Arc<TargetDb>,
    db_family: Dialect,
    attr_names: Mutex<HashMap<NameTuple, Vec<String>>>,
}

impl AttributeNameRegistry {
    pub fn new(db: Arc<TargetDb>, db_family: Dialect) -> Self {
        Self {
            db,
            db_family,
            attr_names: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve and quote one column reference for `table`.
    pub async fn quote_attribute_name(&self, table: &NameTuple, column: &str) -> Result<String> {
        let target_columns = self.table_attributes(table).await?;
        let resolved = find_best_matching_column(self.db_family, column, &target_columns)
            .map_err(|e| {
                MigrateError::NameResolution(format!(
                    "resolve column {:?} in table {}: {}",
                    column, table, e
                ))
            })?;
        Ok(format!("\"{}\"", resolved))
    }

    /// Resolve and quote several columns at once.
    pub async fn quote_attribute_names(
        &self,
        table: &NameTuple,
        columns: &[String],
    ) -> Result<Vec<String>> {
        let mut result = Vec::with_capacity(columns.len());
        for column in columns {
            result.push(self.quote_attribute_name(table, column).await?);
        }
        Ok(result)
    }

    async fn table_attributes(&self, table: &NameTuple) -> Result<Vec<String>> {
        let mut cache = self.attr_names.lock().await;
        if let Some(columns) = cache.get(table) {
            return Ok(columns.clone());
        }
        let columns = self.db.get_list_of_table_attributes(table).await?;
        info!("columns of table {} in target db: {:?}", table, columns);
        cache.insert(table.clone(), columns.clone());
        Ok(columns)
    }
}

/// The resolution rules, applied in order against the table's column list.
pub fn find_best_matching_column(
    db_family: Dialect,
    column: &str,
    target_columns: &[String],
) -> Result<String> {
    let column = column.trim_matches('"');

    // 1. exact match
    if target_columns.iter().any(|c| c == column) {
        return Ok(column.to_string());
    }

    // 2. case-insensitive match with exactly one candidate
    let candidates: Vec<&String> = target_columns
        .iter()
        .filter(|c| c.eq_ignore_ascii_case(column))
        .collect();
    match candidates.len() {
        1 => Ok(candidates[0].clone()),
        0 => Err(MigrateError::NameResolution(format!(
            "column {:?} not found amongst table columns {:?}",
            column, target_columns
        ))),
        _ => {
            // 3. several candidates: prefer the dialect's folded spelling
            let preferred = match db_family {
                Dialect::Postgres => column.to_lowercase(),
                Dialect::Oracle => column.to_uppercase(),
                Dialect::Mysql => column.to_string(),
            };
            if candidates.iter().any(|c| **c == preferred) {
                return Ok(preferred);
            }
            Err(MigrateError::NameResolution(format!(
                "ambiguous column name {:?} in target table: found column names: {}",
                column,
                candidates
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match_wins() {
        let columns = cols(&["Id", "name"]);
        assert_eq!(
            find_best_matching_column(Dialect::Postgres, "Id", &columns).unwrap(),
            "Id"
        );
    }

    #[test]
    fn test_single_case_insensitive_candidate() {
        let columns = cols(&["Id", "name"]);
        assert_eq!(
            find_best_matching_column(Dialect::Postgres, "id", &columns).unwrap(),
            "Id"
        );
        assert_eq!(
            find_best_matching_column(Dialect::Postgres, "\"id\"", &columns).unwrap(),
            "Id"
        );
    }

    #[test]
    fn test_ambiguous_candidates_prefer_folded_case() {
        // pg family: lowercase candidate wins
        let columns = cols(&["Id", "id"]);
        assert_eq!(
            find_best_matching_column(Dialect::Postgres, "ID", &columns).unwrap(),
            "id"
        );
        // oracle family: uppercase candidate wins
        let columns = cols(&["Name", "NAME"]);
        assert_eq!(
            find_best_matching_column(Dialect::Oracle, "name", &columns).unwrap(),
            "NAME"
        );
    }

    #[test]
    fn test_ambiguous_without_folded_candidate_fails() {
        let columns = cols(&["Id", "iD"]);
        let err = find_best_matching_column(Dialect::Postgres, "ID", &columns).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_not_found() {
        let columns = cols(&["Id", "name"]);
        let err = find_best_matching_column(Dialect::Postgres, "email", &columns).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
