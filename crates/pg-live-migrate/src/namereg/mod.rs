//! Registry of every table known to the migration.
//!
//! Seeded once per run from the migration status record (table list plus the
//! leaf-to-root rename map for partitioned pg sources). All identifier
//! references — CLI table lists, CDC event headers, descriptor entries — are
//! resolved here into [`NameTuple`]s; nothing else in the engine compares
//! name strings directly.

use std::collections::HashMap;

use crate::error::{MigrateError, Result};
use crate::sqlname::{Dialect, NameTuple, ObjectName, Role};

pub struct NameRegistry {
    role: Role,
    source_dialect: Dialect,
    default_source_schema: Option<String>,
    default_target_schema: String,
    tuples: Vec<NameTuple>,
    /// lowercase unquoted qualified name (either side) -> index into tuples
    aliases: HashMap<String, usize>,
}

impl NameRegistry {
    pub fn new(
        role: Role,
        source_dialect: Dialect,
        default_source_schema: Option<String>,
        default_target_schema: String,
    ) -> Self {
        Self {
            role,
            source_dialect,
            default_source_schema,
            default_target_schema,
            tuples: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register one table from its source-side reference (as recorded in the
    /// MSR table list).
    pub fn register_table(&mut self, source_ref: &str) -> Result<()> {
        let source_name = ObjectName::parse(
            self.source_dialect,
            self.default_source_schema.as_deref(),
            source_ref,
        )?;
        let target_name = self.derive_target_name(&source_name);
        let tuple = NameTuple::new(Some(source_name.clone()), Some(target_name.clone()), self.role)?;

        let idx = self.tuples.len();
        self.tuples.push(tuple);
        self.add_alias(&source_name.qualified.unquoted, idx);
        self.add_alias(&target_name.qualified.unquoted, idx);
        Ok(())
    }

    /// Register a leaf partition that was renamed to its root table on
    /// export: references to `leaf_ref` resolve to the root's tuple.
    pub fn register_renamed(&mut self, leaf_ref: &str, root_ref: &str) -> Result<()> {
        let root = self.lookup(root_ref)?;
        let idx = self
            .tuples
            .iter()
            .position(|t| *t == root)
            .expect("lookup returned an unregistered tuple");
        let leaf_name = ObjectName::parse(
            self.source_dialect,
            self.default_source_schema.as_deref(),
            leaf_ref,
        )?;
        self.add_alias(&leaf_name.qualified.unquoted, idx);
        Ok(())
    }

    /// Resolve a raw reference (possibly quoted, possibly unqualified)
    /// against the registry.
    pub fn lookup(&self, raw: &str) -> Result<NameTuple> {
        let name = ObjectName::parse(
            self.source_dialect,
            self.default_source_schema.as_deref(),
            raw,
        )?;
        let key = name.qualified.unquoted.to_lowercase();
        if let Some(&idx) = self.aliases.get(&key) {
            return Ok(self.tuples[idx].clone());
        }

        // Case-insensitive fallback on the bare object name; must be unique.
        let needle = name.unqualified.unquoted.to_lowercase();
        let mut candidates: Vec<usize> = Vec::new();
        for (alias, &idx) in &self.aliases {
            let bare = alias.rsplit('.').next().unwrap_or(alias);
            if bare == needle && !candidates.contains(&idx) {
                candidates.push(idx);
            }
        }
        match candidates.len() {
            1 => Ok(self.tuples[candidates[0]].clone()),
            0 => Err(MigrateError::NameResolution(format!(
                "table {:?} is not part of this migration",
                raw
            ))),
            _ => Err(MigrateError::NameResolution(format!(
                "table reference {:?} is ambiguous across schemas",
                raw
            ))),
        }
    }

    /// Resolve the (schema, table) header of a CDC event.
    pub fn lookup_event_table(&self, schema_name: &str, table_name: &str) -> Result<NameTuple> {
        if schema_name.is_empty() {
            self.lookup(table_name)
        } else {
            self.lookup(&format!("{}.{}", schema_name, table_name))
        }
    }

    /// Every registered tuple, in registration order.
    pub fn all_tables(&self) -> &[NameTuple] {
        &self.tuples
    }

    fn add_alias(&mut self, qualified_unquoted: &str, idx: usize) {
        self.aliases
            .insert(qualified_unquoted.to_lowercase(), idx);
    }

    /// The target-side name of a source object. Oracle and MySQL object
    /// names fold to lowercase in the default target schema; pg sources map
    /// schema-to-schema with the spelling kept.
    fn derive_target_name(&self, source: &ObjectName) -> ObjectName {
        match self.source_dialect {
            Dialect::Postgres => ObjectName::new(
                Dialect::Postgres,
                Some(&self.default_target_schema),
                &source.schema_name,
                &source.unqualified.unquoted,
            ),
            Dialect::Oracle | Dialect::Mysql => ObjectName::new(
                Dialect::Postgres,
                Some(&self.default_target_schema),
                &self.default_target_schema,
                &source.unqualified.unquoted.to_lowercase(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle_registry() -> NameRegistry {
        let mut reg = NameRegistry::new(
            Role::TargetDbImporter,
            Dialect::Oracle,
            Some("HR".to_string()),
            "public".to_string(),
        );
        reg.register_table("EMPLOYEES").unwrap();
        reg.register_table("DEPARTMENTS").unwrap();
        reg
    }

    #[test]
    fn test_lookup_by_source_and_target_spelling() {
        let reg = oracle_registry();
        let by_source = reg.lookup("HR.EMPLOYEES").unwrap();
        let by_target = reg.lookup("public.employees").unwrap();
        assert_eq!(by_source, by_target);
        assert_eq!(by_source.for_user_query(), "public.\"employees\"");
    }

    #[test]
    fn test_lookup_unqualified_uses_default_schema() {
        let reg = oracle_registry();
        let tuple = reg.lookup("employees").unwrap();
        assert_eq!(tuple.for_catalog_query(), ("public", "employees"));
    }

    #[test]
    fn test_lookup_unknown_table_fails() {
        let reg = oracle_registry();
        let err = reg.lookup("SALARIES").unwrap_err();
        assert!(err.to_string().contains("not part of this migration"));
    }

    #[test]
    fn test_unqualified_without_default_schema_fails() {
        let mut reg = NameRegistry::new(
            Role::TargetDbImporter,
            Dialect::Postgres,
            None,
            "public".to_string(),
        );
        reg.register_table("sales.orders").unwrap();
        assert!(reg.lookup("orders").is_err());
        assert!(reg.lookup("sales.orders").is_ok());
    }

    #[test]
    fn test_renamed_leaf_resolves_to_root() {
        let mut reg = NameRegistry::new(
            Role::TargetDbImporter,
            Dialect::Postgres,
            Some("public".to_string()),
            "public".to_string(),
        );
        reg.register_table("public.sales").unwrap();
        reg.register_renamed("public.sales_2024_q1", "public.sales")
            .unwrap();

        let leaf = reg.lookup("sales_2024_q1").unwrap();
        let root = reg.lookup("sales").unwrap();
        assert_eq!(leaf, root);
    }

    #[test]
    fn test_event_header_lookup() {
        let reg = oracle_registry();
        let tuple = reg.lookup_event_table("HR", "EMPLOYEES").unwrap();
        assert_eq!(tuple.for_catalog_query().1, "employees");
    }
}
