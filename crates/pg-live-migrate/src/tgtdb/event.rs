//! Change events and event batches.
//!
//! Events arrive from the CDC producer as JSON with text-encoded values and
//! are applied in vsn order per channel. Inserts and deletes go through
//! prepared statements; updates are executed as literal statements because
//! the SET clause depends on which columns each event carries. Inserts get
//! `ON CONFLICT (<key cols>) DO NOTHING` so replay under at-least-once
//! delivery is idempotent.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::types::ToSql;

use crate::error::Result;
use crate::namereg::NameRegistry;
use crate::sqlname::{NameTuple, Role};

pub const OP_INSERT: &str = "c";
pub const OP_UPDATE: &str = "u";
pub const OP_DELETE: &str = "d";
pub const OP_CUTOVER_TARGET: &str = "cutover.target";
pub const OP_CUTOVER_SOURCE_REPLICA: &str = "cutover.source_replica";
pub const OP_CUTOVER_SOURCE: &str = "cutover.source";

/// The wire shape written by the CDC producer.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub vsn: i64,
    pub op: String,
    #[serde(default)]
    pub schema_name: String,
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub key: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub fields: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub before_fields: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub exporter_role: String,
}

/// One decoded change event. Maps are ordered so generated column lists and
/// parameter positions are deterministic.
#[derive(Debug, Clone)]
pub struct Event {
    pub vsn: i64,
    pub op: String,
    /// None only for cutover markers, which never reach an apply channel.
    pub table: Option<NameTuple>,
    pub key: BTreeMap<String, Option<String>>,
    pub fields: BTreeMap<String, Option<String>>,
    pub before_fields: BTreeMap<String, Option<String>>,
    pub exporter_role: Role,
}

impl Event {
    /// Decode a raw event, resolving its table header through the registry.
    pub fn from_raw(raw: RawEvent, registry: &NameRegistry) -> Result<Self> {
        let exporter_role = if raw.exporter_role.is_empty() {
            Role::SourceDbExporter
        } else {
            Role::parse(&raw.exporter_role)?
        };
        let is_cutover = raw.op.starts_with("cutover.");
        let table = if is_cutover {
            None
        } else {
            Some(registry.lookup_event_table(&raw.schema_name, &raw.table_name)?)
        };
        Ok(Self {
            vsn: raw.vsn,
            op: raw.op,
            table,
            key: raw.key,
            fields: raw.fields,
            before_fields: raw.before_fields,
            exporter_role,
        })
    }

    pub fn is_cutover_to_target(&self) -> bool {
        self.op == OP_CUTOVER_TARGET
    }

    pub fn is_cutover_to_source_replica(&self) -> bool {
        self.op == OP_CUTOVER_SOURCE_REPLICA
    }

    pub fn is_cutover_to_source(&self) -> bool {
        self.op == OP_CUTOVER_SOURCE
    }

    pub fn is_cutover_event(&self) -> bool {
        self.op.starts_with("cutover.")
    }

    pub fn table(&self) -> &NameTuple {
        self.table
            .as_ref()
            .expect("cutover events are never routed to an apply channel")
    }

    /// Whether this update touches any of the table's unique-key columns.
    pub fn is_unique_key_changed(&self, unique_key_columns: &[String]) -> bool {
        self.op == OP_UPDATE
            && !unique_key_columns.is_empty()
            && self.fields.keys().any(|c| unique_key_columns.contains(c))
    }

    /// Name under which the prepared statement for this event is cached.
    /// Updates include the sorted changed-column list because their
    /// statement shape varies per event.
    pub fn prepared_stmt_name(&self) -> String {
        let mut name = format!("{}_{}", self.table().for_user_query(), self.op);
        if self.op == OP_UPDATE {
            name.push(':');
            name.push_str(&self.fields.keys().cloned().collect::<Vec<_>>().join(","));
        }
        name
    }

    /// Parameterized statement for inserts and deletes. `pg_family` appends
    /// the conflict clause making replayed inserts no-ops.
    pub fn prepared_stmt(&self, pg_family: bool) -> String {
        match self.op.as_str() {
            OP_INSERT => {
                let columns: Vec<&str> = self.fields.keys().map(String::as_str).collect();
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("${}", i)).collect();
                let mut stmt = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    self.table().for_user_query(),
                    columns.join(", "),
                    placeholders.join(", ")
                );
                if pg_family {
                    let key_columns: Vec<&str> = self.key.keys().map(String::as_str).collect();
                    stmt = format!("{} ON CONFLICT ({}) DO NOTHING", stmt, key_columns.join(","));
                }
                stmt
            }
            OP_DELETE => {
                let clauses: Vec<String> = self
                    .key
                    .keys()
                    .enumerate()
                    .map(|(i, col)| format!("{} = ${}", col, i + 1))
                    .collect();
                format!(
                    "DELETE FROM {} WHERE {}",
                    self.table().for_user_query(),
                    clauses.join(" AND ")
                )
            }
            other => panic!("no prepared statement for op: {}", other),
        }
    }

    /// Literal statement for updates; values are spliced as produced by the
    /// CDC converter.
    pub fn update_stmt(&self) -> String {
        let set_clauses: Vec<String> = self
            .fields
            .iter()
            .map(|(col, value)| match value {
                Some(v) => format!("{} = {}", col, v),
                None => format!("{} = NULL", col),
            })
            .collect();
        let where_clauses: Vec<String> = self
            .key
            .iter()
            .map(|(col, value)| {
                let v = value.as_ref().expect("key value is never null");
                format!("{} = {}", col, v)
            })
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.table().for_user_query(),
            set_clauses.join(", "),
            where_clauses.join(" AND ")
        )
    }

    /// Rewrite column references to their target-side spellings. Runs in
    /// the applier, after conflict tracking: the cache holds a pre-quoting
    /// clone and compares source spellings.
    pub async fn quote_column_names(
        &mut self,
        registry: &super::attr::AttributeNameRegistry,
    ) -> Result<()> {
        let table = self.table().clone();
        for map in [&mut self.key, &mut self.fields, &mut self.before_fields] {
            let mut quoted = BTreeMap::new();
            for (column, value) in std::mem::take(map) {
                quoted.insert(registry.quote_attribute_name(&table, &column).await?, value);
            }
            *map = quoted;
        }
        Ok(())
    }

    /// Bind parameters matching [`Event::prepared_stmt`] placeholder order.
    pub fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        match self.op.as_str() {
            OP_INSERT => map_values(&self.fields),
            OP_DELETE => map_values(&self.key),
            other => panic!("no parameters for op: {}", other),
        }
    }
}

fn map_values(m: &BTreeMap<String, Option<String>>) -> Vec<&(dyn ToSql + Sync)> {
    m.values().map(|v| v as &(dyn ToSql + Sync)).collect()
}

//==============================================================================

/// Running insert/update/delete totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounter {
    pub total_events: i64,
    pub num_inserts: i64,
    pub num_updates: i64,
    pub num_deletes: i64,
}

impl EventCounter {
    pub fn count_event(&mut self, event: &Event) {
        self.total_events += 1;
        match event.op.as_str() {
            OP_INSERT => self.num_inserts += 1,
            OP_UPDATE => self.num_updates += 1,
            OP_DELETE => self.num_deletes += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: &EventCounter) {
        self.total_events += other.total_events;
        self.num_inserts += other.num_inserts;
        self.num_updates += other.num_updates;
        self.num_deletes += other.num_deletes;
    }
}

//==============================================================================

/// Ordered events for one channel plus derived counters.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub chan_no: usize,
    pub event_counts: EventCounter,
    pub counts_by_table: HashMap<NameTuple, EventCounter>,
}

impl EventBatch {
    pub fn new(events: Vec<Event>, chan_no: usize) -> Self {
        let mut batch = Self {
            events,
            chan_no,
            event_counts: EventCounter::default(),
            counts_by_table: HashMap::new(),
        };
        let events = std::mem::take(&mut batch.events);
        for event in &events {
            batch.event_counts.count_event(event);
            batch
                .counts_by_table
                .entry(event.table().clone())
                .or_default()
                .count_event(event);
        }
        batch.events = events;
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events arrive in vsn order, so the last one carries the high-water
    /// mark recorded in the channel metadata row.
    pub fn last_vsn(&self) -> i64 {
        self.events
            .last()
            .expect("empty batches are never applied")
            .vsn
    }

    pub fn table_names(&self) -> Vec<NameTuple> {
        self.counts_by_table.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlname::{Dialect, ObjectName};

    fn users_table() -> NameTuple {
        let src = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        NameTuple::new(Some(src), Some(tgt), Role::TargetDbImporter).unwrap()
    }

    fn insert_event(vsn: i64, id: &str, email: &str) -> Event {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), Some(id.to_string()));
        fields.insert("email".to_string(), Some(email.to_string()));
        let mut key = BTreeMap::new();
        key.insert("id".to_string(), Some(id.to_string()));
        Event {
            vsn,
            op: OP_INSERT.to_string(),
            table: Some(users_table()),
            key,
            fields,
            before_fields: BTreeMap::new(),
            exporter_role: Role::SourceDbExporter,
        }
    }

    fn delete_event(vsn: i64, id: &str) -> Event {
        let mut key = BTreeMap::new();
        key.insert("id".to_string(), Some(id.to_string()));
        Event {
            vsn,
            op: OP_DELETE.to_string(),
            table: Some(users_table()),
            key,
            fields: BTreeMap::new(),
            before_fields: BTreeMap::new(),
            exporter_role: Role::SourceDbExporter,
        }
    }

    #[test]
    fn test_prepared_insert_is_idempotent_on_pg_family() {
        let event = insert_event(1, "1", "'a@x'");
        assert_eq!(
            event.prepared_stmt(true),
            "INSERT INTO public.\"users\" (email, id) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING"
        );
        assert_eq!(
            event.prepared_stmt(false),
            "INSERT INTO public.\"users\" (email, id) VALUES ($1, $2)"
        );
        assert_eq!(event.params().len(), 2);
    }

    #[test]
    fn test_prepared_delete() {
        let event = delete_event(2, "1");
        assert_eq!(
            event.prepared_stmt(true),
            "DELETE FROM public.\"users\" WHERE id = $1"
        );
        assert_eq!(event.params().len(), 1);
    }

    #[test]
    fn test_update_stmt_is_literal_and_handles_null() {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), Some("'new@x'".to_string()));
        fields.insert("nickname".to_string(), None);
        let mut key = BTreeMap::new();
        key.insert("id".to_string(), Some("7".to_string()));
        let event = Event {
            vsn: 3,
            op: OP_UPDATE.to_string(),
            table: Some(users_table()),
            key,
            fields,
            before_fields: BTreeMap::new(),
            exporter_role: Role::SourceDbExporter,
        };
        assert_eq!(
            event.update_stmt(),
            "UPDATE public.\"users\" SET email = 'new@x', nickname = NULL WHERE id = 7"
        );
    }

    #[test]
    fn test_prepared_stmt_name_includes_sorted_update_columns() {
        let mut fields = BTreeMap::new();
        fields.insert("b".to_string(), Some("1".to_string()));
        fields.insert("a".to_string(), Some("2".to_string()));
        let event = Event {
            vsn: 4,
            op: OP_UPDATE.to_string(),
            table: Some(users_table()),
            key: BTreeMap::new(),
            fields,
            before_fields: BTreeMap::new(),
            exporter_role: Role::SourceDbExporter,
        };
        assert_eq!(event.prepared_stmt_name(), "public.\"users\"_u:a,b");

        let insert = insert_event(5, "1", "'x'");
        assert_eq!(insert.prepared_stmt_name(), "public.\"users\"_c");
    }

    #[test]
    fn test_unique_key_change_detection() {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), Some("'x'".to_string()));
        let event = Event {
            vsn: 5,
            op: OP_UPDATE.to_string(),
            table: Some(users_table()),
            key: BTreeMap::new(),
            fields,
            before_fields: BTreeMap::new(),
            exporter_role: Role::SourceDbExporter,
        };
        assert!(event.is_unique_key_changed(&["email".to_string()]));
        assert!(!event.is_unique_key_changed(&["phone".to_string()]));
        assert!(!event.is_unique_key_changed(&[]));
    }

    #[test]
    fn test_batch_counts() {
        let batch = EventBatch::new(
            vec![
                insert_event(10, "1", "'a'"),
                insert_event(11, "2", "'b'"),
                delete_event(12, "1"),
            ],
            0,
        );
        assert_eq!(batch.last_vsn(), 12);
        assert_eq!(batch.event_counts.total_events, 3);
        assert_eq!(batch.event_counts.num_inserts, 2);
        assert_eq!(batch.event_counts.num_deletes, 1);
        assert_eq!(batch.event_counts.num_updates, 0);
        let per_table = batch.counts_by_table.get(&users_table()).unwrap();
        assert_eq!(per_table.total_events, 3);
    }

    #[test]
    fn test_raw_event_decoding() {
        let json = r#"{
            "vsn": 42,
            "op": "c",
            "schema_name": "public",
            "table_name": "users",
            "key": {"id": "1"},
            "fields": {"id": "1", "email": "'a@x'"},
            "exporter_role": "source_db_exporter"
        }"#;
        let raw: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(raw.vsn, 42);
        assert_eq!(raw.op, "c");
        assert_eq!(raw.fields.len(), 2);
        assert!(raw.before_fields.is_empty());
    }

    #[test]
    fn test_cutover_event_recognition() {
        let event = Event {
            vsn: 100,
            op: OP_CUTOVER_TARGET.to_string(),
            table: None,
            key: BTreeMap::new(),
            fields: BTreeMap::new(),
            before_fields: BTreeMap::new(),
            exporter_role: Role::SourceDbExporter,
        };
        assert!(event.is_cutover_event());
        assert!(event.is_cutover_to_target());
        assert!(!event.is_cutover_to_source());
    }
}
