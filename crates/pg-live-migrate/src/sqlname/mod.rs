//! SQL object names across dialects.
//!
//! An [`ObjectName`] carries every rendering of a (schema, object) pair that
//! the engine ever needs: quoted, unquoted, and minimally-quoted (quoted only
//! when the spelling is case-sensitive for the dialect or collides with a
//! reserved keyword). A [`NameTuple`] pairs the source-side and target-side
//! object names and is the single key type for every per-table map in the
//! engine — code never follows pointers between source and target objects,
//! it looks things up by tuple.

pub mod keywords;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MigrateError, Result};
pub use keywords::{is_reserved_keyword_oracle, is_reserved_keyword_pg};

/// SQL dialect an identifier belongs to. `Postgres` covers both PostgreSQL
/// sources and the PostgreSQL-wire target cluster; their folding and quoting
/// rules are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Postgres,
    Oracle,
    Mysql,
}

impl Dialect {
    /// Quote `name` unconditionally. MySQL identifiers are never quoted by
    /// this layer; its dump tooling emits names verbatim.
    pub fn quote(&self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Oracle => format!("\"{}\"", name),
            Dialect::Mysql => name.to_string(),
        }
    }

    /// Quote `name` only when required: case-sensitive spelling or reserved
    /// keyword.
    pub fn min_quote(&self, name: &str) -> String {
        match self {
            Dialect::Postgres => {
                if name == name.to_lowercase() && !is_reserved_keyword_pg(name) {
                    name.to_string()
                } else {
                    format!("\"{}\"", name)
                }
            }
            Dialect::Oracle => {
                if name == name.to_uppercase() && !is_reserved_keyword_oracle(name) {
                    name.to_string()
                } else {
                    format!("\"{}\"", name)
                }
            }
            Dialect::Mysql => name.to_string(),
        }
    }

    /// Apply the dialect's case folding to an unquoted identifier.
    pub fn fold_case(&self, name: &str) -> String {
        match self {
            Dialect::Postgres => name.to_lowercase(),
            Dialect::Oracle => name.to_uppercase(),
            Dialect::Mysql => name.to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::Oracle => "oracle",
            Dialect::Mysql => "mysql",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(Dialect::Postgres),
            "oracle" => Ok(Dialect::Oracle),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            other => Err(MigrateError::Config(format!(
                "unknown source db type {:?} (supported: postgresql, oracle, mysql)",
                other
            ))),
        }
    }
}

/// Role the current process is playing. Selects which side of a
/// [`NameTuple`] is "current", which state directory is used, and which
/// stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SourceDbExporter,
    TargetDbImporter,
    SourceReplicaDbImporter,
    TargetDbExporterFf,
    TargetDbExporterFb,
    SourceDbImporter,
    ImportFile,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SourceDbExporter => "source_db_exporter",
            Role::TargetDbImporter => "target_db_importer",
            Role::SourceReplicaDbImporter => "source_replica_db_importer",
            Role::TargetDbExporterFf => "target_db_exporter_ff",
            Role::TargetDbExporterFb => "target_db_exporter_fb",
            Role::SourceDbImporter => "source_db_importer",
            Role::ImportFile => "import_file",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "source_db_exporter" => Ok(Role::SourceDbExporter),
            "target_db_importer" => Ok(Role::TargetDbImporter),
            "source_replica_db_importer" => Ok(Role::SourceReplicaDbImporter),
            "target_db_exporter_ff" => Ok(Role::TargetDbExporterFf),
            "target_db_exporter_fb" => Ok(Role::TargetDbExporterFb),
            "source_db_importer" => Ok(Role::SourceDbImporter),
            "import_file" => Ok(Role::ImportFile),
            other => Err(MigrateError::Config(format!("unknown role {:?}", other))),
        }
    }

    /// Events produced by these roles come out of the target cluster's CDC
    /// (fall-forward / fall-back streams).
    pub fn is_target_exporter(&self) -> bool {
        matches!(self, Role::TargetDbExporterFf | Role::TargetDbExporterFb)
    }

    /// Which side of a name tuple this role operates on.
    pub fn current_side(&self) -> Side {
        match self {
            Role::SourceDbExporter
            | Role::SourceReplicaDbImporter
            | Role::SourceDbImporter => Side::Source,
            Role::TargetDbImporter
            | Role::TargetDbExporterFf
            | Role::TargetDbExporterFb
            | Role::ImportFile => Side::Target,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a name tuple is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Target,
}

/// The three renderings of one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub quoted: String,
    pub unquoted: String,
    pub min_quoted: String,
}

/// Name of a table, sequence, or other schema object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectName {
    pub dialect: Dialect,
    pub schema_name: String,
    pub from_default_schema: bool,

    pub qualified: Identifier,
    pub unqualified: Identifier,
    pub min_qualified: Identifier,
}

impl ObjectName {
    /// Build an object name from an already case-folded (schema, object)
    /// pair. `object_name` must carry the exact stored-case spelling.
    pub fn new(
        dialect: Dialect,
        default_schema: Option<&str>,
        schema_name: &str,
        object_name: &str,
    ) -> Self {
        let from_default_schema = default_schema == Some(schema_name);
        let unqualified = Identifier {
            quoted: dialect.quote(object_name),
            unquoted: object_name.to_string(),
            min_quoted: dialect.min_quote(object_name),
        };
        let qualified = Identifier {
            quoted: format!("{}.{}", schema_name, unqualified.quoted),
            unquoted: format!("{}.{}", schema_name, unqualified.unquoted),
            min_quoted: format!("{}.{}", schema_name, unqualified.min_quoted),
        };
        let min_qualified = if from_default_schema {
            unqualified.clone()
        } else {
            qualified.clone()
        };
        Self {
            dialect,
            schema_name: schema_name.to_string(),
            from_default_schema,
            qualified,
            unqualified,
            min_qualified,
        }
    }

    /// Parse a possibly-qualified, possibly-quoted reference. Unquoted parts
    /// are case-folded per the dialect; quoted parts keep their exact
    /// spelling. Fails for unqualified references without a default schema
    /// and for references with more than two parts.
    pub fn parse(dialect: Dialect, default_schema: Option<&str>, raw: &str) -> Result<Self> {
        let parts = split_qualified(raw);
        let (schema_part, object_part) = match parts.len() {
            1 => {
                let schema = default_schema.ok_or_else(|| {
                    MigrateError::NameResolution(format!(
                        "reference {:?} is unqualified and no default schema applies",
                        raw
                    ))
                })?;
                (schema.to_string(), parts[0].clone())
            }
            2 => (unquote_fold(dialect, &parts[0]), parts[1].clone()),
            _ => {
                return Err(MigrateError::NameResolution(format!(
                    "invalid object reference {:?}",
                    raw
                )))
            }
        };
        let object = unquote_fold(dialect, &object_part);
        Ok(Self::new(dialect, default_schema, &schema_part, &object))
    }

    /// The canonical rendering: minimally-quoted, qualified only when the
    /// schema is not the default.
    pub fn render(&self) -> &str {
        &self.min_qualified.min_quoted
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.render())
    }
}

/// Split `a.b` into parts, respecting double quotes so `sch."a.b"` stays two
/// parts.
fn split_qualified(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '.' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);
    parts
}

/// Strip surrounding quotes (keeping the exact case) or fold the case of an
/// unquoted part.
fn unquote_fold(dialect: Dialect, part: &str) -> String {
    if part.len() >= 2 && part.starts_with('"') && part.ends_with('"') {
        part[1..part.len() - 1].to_string()
    } else {
        dialect.fold_case(part)
    }
}

/// Pairing of the source-side and target-side names of one object, plus the
/// side currently in effect. Structural equality; usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameTuple {
    pub source_name: Option<ObjectName>,
    pub target_name: Option<ObjectName>,
    current: Side,
}

impl NameTuple {
    pub fn new(
        source_name: Option<ObjectName>,
        target_name: Option<ObjectName>,
        role: Role,
    ) -> Result<Self> {
        let current = role.current_side();
        let tuple = Self {
            source_name,
            target_name,
            current,
        };
        if tuple.current_opt().is_none() {
            return Err(MigrateError::NameResolution(format!(
                "name tuple has no {:?}-side name for role {}",
                current, role
            )));
        }
        Ok(tuple)
    }

    fn current_opt(&self) -> Option<&ObjectName> {
        match self.current {
            Side::Source => self.source_name.as_ref(),
            Side::Target => self.target_name.as_ref(),
        }
    }

    /// The object name on the side the current role operates on.
    pub fn current_name(&self) -> &ObjectName {
        self.current_opt()
            .expect("name tuple constructed without a current-side name")
    }

    /// Fully qualified, fully quoted — safe to splice into SQL sent to the
    /// current side.
    pub fn for_user_query(&self) -> String {
        self.current_name().qualified.quoted.clone()
    }

    /// (schema, bare object) pair for catalog lookups on the current side.
    pub fn for_catalog_query(&self) -> (&str, &str) {
        let name = self.current_name();
        (&name.schema_name, &name.unqualified.unquoted)
    }

    /// Stable key string: the source rendering when present, else target.
    /// Used wherever a tuple must be stored in a durable string column.
    pub fn for_key(&self) -> String {
        match (&self.source_name, &self.target_name) {
            (Some(src), _) => src.qualified.quoted.clone(),
            (None, Some(tgt)) => tgt.qualified.quoted.clone(),
            (None, None) => unreachable!("name tuple with neither side"),
        }
    }
}

impl fmt::Display for NameTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.current_name().render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_quote_pg() {
        let d = Dialect::Postgres;
        assert_eq!(d.min_quote("users"), "users");
        assert_eq!(d.min_quote("Users"), "\"Users\"");
        assert_eq!(d.min_quote("user"), "\"user\""); // reserved
    }

    #[test]
    fn test_min_quote_oracle() {
        let d = Dialect::Oracle;
        assert_eq!(d.min_quote("EMPLOYEES"), "EMPLOYEES");
        assert_eq!(d.min_quote("Employees"), "\"Employees\"");
        assert_eq!(d.min_quote("NUMBER"), "\"NUMBER\""); // reserved
    }

    #[test]
    fn test_mysql_never_quoted() {
        let d = Dialect::Mysql;
        assert_eq!(d.quote("Orders"), "Orders");
        assert_eq!(d.min_quote("Orders"), "Orders");
    }

    #[test]
    fn test_object_name_renderings() {
        let name = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        assert_eq!(name.qualified.quoted, "public.\"users\"");
        assert_eq!(name.qualified.unquoted, "public.users");
        assert_eq!(name.min_qualified.min_quoted, "users");
        assert!(name.from_default_schema);

        let name = ObjectName::new(Dialect::Postgres, Some("public"), "sales", "Orders");
        assert_eq!(name.min_qualified.min_quoted, "sales.\"Orders\"");
        assert!(!name.from_default_schema);
    }

    #[test]
    fn test_parse_round_trip_pg() {
        for raw in ["users", "sales.orders", "sales.\"Orders\"", "\"User Data\""] {
            let name = ObjectName::parse(Dialect::Postgres, Some("public"), raw).unwrap();
            let reparsed =
                ObjectName::parse(Dialect::Postgres, Some("public"), name.render()).unwrap();
            assert_eq!(name, reparsed, "round trip failed for {:?}", raw);
        }
    }

    #[test]
    fn test_parse_round_trip_oracle() {
        for raw in ["EMPLOYEES", "HR.EMPLOYEES", "HR.\"Employees\""] {
            let name = ObjectName::parse(Dialect::Oracle, Some("HR"), raw).unwrap();
            let reparsed = ObjectName::parse(Dialect::Oracle, Some("HR"), name.render()).unwrap();
            assert_eq!(name, reparsed, "round trip failed for {:?}", raw);
        }
    }

    #[test]
    fn test_parse_case_folding() {
        let name = ObjectName::parse(Dialect::Postgres, Some("public"), "USERS").unwrap();
        assert_eq!(name.unqualified.unquoted, "users");

        let name = ObjectName::parse(Dialect::Oracle, Some("HR"), "employees").unwrap();
        assert_eq!(name.unqualified.unquoted, "EMPLOYEES");

        // quoted spelling survives untouched
        let name = ObjectName::parse(Dialect::Postgres, Some("public"), "\"USERS\"").unwrap();
        assert_eq!(name.unqualified.unquoted, "USERS");
    }

    #[test]
    fn test_parse_rejects_unqualified_without_default_schema() {
        assert!(ObjectName::parse(Dialect::Postgres, None, "users").is_err());
        assert!(ObjectName::parse(Dialect::Postgres, None, "public.users").is_ok());
    }

    #[test]
    fn test_parse_rejects_too_many_parts() {
        assert!(ObjectName::parse(Dialect::Postgres, Some("public"), "a.b.c").is_err());
    }

    #[test]
    fn test_name_tuple_sides() {
        let src = ObjectName::new(Dialect::Oracle, Some("HR"), "HR", "EMPLOYEES");
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "employees");
        let tuple = NameTuple::new(Some(src), Some(tgt), Role::TargetDbImporter).unwrap();

        assert_eq!(tuple.for_user_query(), "public.\"employees\"");
        assert_eq!(tuple.for_catalog_query(), ("public", "employees"));
        // key side prefers the source rendering
        assert_eq!(tuple.for_key(), "HR.\"EMPLOYEES\"");
    }

    #[test]
    fn test_name_tuple_requires_current_side() {
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "employees");
        assert!(NameTuple::new(None, Some(tgt.clone()), Role::SourceDbImporter).is_err());
        assert!(NameTuple::new(None, Some(tgt), Role::TargetDbImporter).is_ok());
    }

    #[test]
    fn test_tuple_equality_is_structural() {
        let mk = || {
            let src = ObjectName::new(Dialect::Mysql, Some("app"), "app", "Orders");
            let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "orders");
            NameTuple::new(Some(src), Some(tgt), Role::TargetDbImporter).unwrap()
        };
        assert_eq!(mk(), mk());
        let mut set = std::collections::HashSet::new();
        set.insert(mk());
        assert!(set.contains(&mk()));
    }
}
