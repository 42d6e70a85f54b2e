//! Conflict detection across parallel apply channels.
//!
//! Events are hash-partitioned by primary key, so two events touching the
//! same *unique* key (but different primary keys) can land on different
//! channels and be applied out of order. Example, `users(id PK, email
//! UNIQUE)` holding `(1, 'a@x')`:
//!
//! ```text
//! e1: DELETE FROM users WHERE id = 1          -> channel A
//! e2: INSERT INTO users VALUES (2, 'a@x')     -> channel B
//! ```
//!
//! Applying e2 before e1 raises a unique violation, and retrying e2 is not
//! enough: a later insert of the same email can make e2 permanently
//! unappliable. The cache therefore blocks an incoming event until every
//! cached event it conflicts with has been applied and removed.
//!
//! The four conflict shapes are DELETE-INSERT, DELETE-UPDATE,
//! UPDATE-INSERT and UPDATE-UPDATE, always via a shared unique-key value.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::sqlname::NameTuple;
use crate::tgtdb::event::{Event, OP_DELETE, OP_UPDATE};

use super::dispatcher::DispatchMessage;

pub struct ConflictDetectionCache {
    /// vsn -> a clone of the in-flight event. A clone, not a shared
    /// reference: downstream conversion mutates table and column spellings,
    /// which would corrupt the comparisons here.
    cache: Mutex<HashMap<i64, Event>>,
    /// Version counter bumped on every removal; waiters re-scan on change.
    removal_tx: watch::Sender<u64>,
    table_to_unique_key_columns: HashMap<NameTuple, Vec<String>>,
    /// Senders for every apply channel, used to push flush tokens so
    /// conflicting predecessors drain without waiting out the batch
    /// interval.
    event_channels: Vec<mpsc::Sender<DispatchMessage>>,
}

impl ConflictDetectionCache {
    pub fn new(
        table_to_unique_key_columns: HashMap<NameTuple, Vec<String>>,
        event_channels: Vec<mpsc::Sender<DispatchMessage>>,
    ) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            removal_tx: watch::channel(0).0,
            table_to_unique_key_columns,
            event_channels,
        }
    }

    /// Whether this event must be tracked while in flight: only deletes and
    /// unique-key updates on tables that have unique keys can conflict with
    /// a later event.
    pub fn needs_tracking(&self, event: &Event) -> bool {
        let Some(columns) = self.table_to_unique_key_columns.get(event.table()) else {
            return false;
        };
        if columns.is_empty() {
            return false;
        }
        event.op == OP_DELETE || event.is_unique_key_changed(columns)
    }

    pub fn put(&self, event: &Event) {
        let mut cache = self.cache.lock().expect("conflict cache lock poisoned");
        cache.insert(event.vsn, event.clone());
        debug!("added event vsn({}) to conflict cache", event.vsn);
    }

    /// Block until no cached event conflicts with `incoming`. Re-scans the
    /// whole cache after every removal: an incoming event can conflict with
    /// several cached events (e.g. one per unique key column).
    pub async fn wait_until_no_conflict(&self, incoming: &Event) {
        let mut removals = self.removal_tx.subscribe();
        loop {
            // mark the current version seen before scanning so a removal
            // racing with the scan still wakes us
            removals.borrow_and_update();

            let conflicting_vsn = {
                let cache = self.cache.lock().expect("conflict cache lock poisoned");
                cache
                    .values()
                    .find(|cached| self.events_conflict(cached, incoming))
                    .map(|cached| cached.vsn)
            };
            let Some(vsn) = conflicting_vsn else {
                return;
            };

            for tx in &self.event_channels {
                let _ = tx.send(DispatchMessage::FlushBatch).await;
            }
            info!(
                "waiting for event(vsn={}) to complete before processing event(vsn={})",
                vsn, incoming.vsn
            );
            if removals.changed().await.is_err() {
                // all appliers gone; nothing left to wait for
                return;
            }
        }
    }

    /// Remove applied events by vsn and wake every waiter for a re-scan.
    pub fn remove_events(&self, events: &[Event]) {
        let mut removed = false;
        {
            let mut cache = self.cache.lock().expect("conflict cache lock poisoned");
            for event in events {
                if cache.remove(&event.vsn).is_some() {
                    removed = true;
                }
            }
        }
        if removed {
            self.removal_tx.send_modify(|version| *version += 1);
        }
    }

    fn events_conflict(&self, cached: &Event, incoming: &Event) -> bool {
        if cached.table() != incoming.table() {
            return false;
        }
        let empty = Vec::new();
        let unique_key_columns = self
            .table_to_unique_key_columns
            .get(cached.table())
            .unwrap_or(&empty);

        if incoming.exporter_role.is_target_exporter() {
            // Reverse streams: before-values from the target CDC can be
            // inconsistent, so conflict is declared on table match alone for
            // cached deletes and unique-key updates.
            let conflict = match cached.op.as_str() {
                OP_DELETE => true,
                OP_UPDATE => {
                    let touched: Vec<&String> = cached
                        .fields
                        .keys()
                        .filter(|c| unique_key_columns.contains(c))
                        .collect();
                    incoming.fields.keys().any(|c| touched.contains(&c))
                }
                _ => false,
            };
            if conflict {
                info!(
                    "conflict detected for table {}, between event1(vsn={}) and event2(vsn={})",
                    cached.table(),
                    cached.vsn,
                    incoming.vsn
                );
            }
            return conflict;
        }

        for column in unique_key_columns {
            let cached_value = match cached.before_fields.get(column) {
                Some(Some(v)) => v,
                // other columns may still collide (multiple unique keys)
                _ => continue,
            };
            let incoming_value = match incoming.fields.get(column) {
                Some(Some(v)) => v,
                _ => continue,
            };
            if cached_value == incoming_value {
                info!(
                    "conflict detected for table {}, column {}, between event1(vsn={}, value={}) \
                     and event2(vsn={}, value={})",
                    cached.table(),
                    column,
                    cached.vsn,
                    cached_value,
                    incoming.vsn,
                    incoming_value
                );
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlname::{Dialect, ObjectName, Role};
    use crate::tgtdb::event::{OP_INSERT, OP_UPDATE};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn users_table() -> NameTuple {
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        NameTuple::new(None, Some(tgt), Role::TargetDbImporter).unwrap()
    }

    fn event(vsn: i64, op: &str, fields: &[(&str, &str)], before: &[(&str, &str)]) -> Event {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                .collect::<BTreeMap<_, _>>()
        };
        Event {
            vsn,
            op: op.to_string(),
            table: Some(users_table()),
            key: BTreeMap::new(),
            fields: to_map(fields),
            before_fields: to_map(before),
            exporter_role: Role::SourceDbExporter,
        }
    }

    fn cache_with_email_unique(
        channels: Vec<mpsc::Sender<DispatchMessage>>,
    ) -> ConflictDetectionCache {
        let mut map = HashMap::new();
        map.insert(users_table(), vec!["email".to_string()]);
        ConflictDetectionCache::new(map, channels)
    }

    #[test]
    fn test_delete_insert_conflict_on_unique_value() {
        let cache = cache_with_email_unique(vec![]);
        // e1: DELETE id=1 (before email a@x); e2: INSERT (2, a@x)
        let e1 = event(1, OP_DELETE, &[], &[("email", "a@x")]);
        let e2 = event(2, OP_INSERT, &[("email", "a@x"), ("id", "2")], &[]);
        assert!(cache.events_conflict(&e1, &e2));

        // different unique value: no conflict
        let e3 = event(3, OP_INSERT, &[("email", "b@x"), ("id", "3")], &[]);
        assert!(!cache.events_conflict(&e1, &e3));
    }

    #[test]
    fn test_update_update_conflict_chain() {
        let cache = cache_with_email_unique(vec![]);
        // e1: UPDATE id=2 email u2 -> u2new; e2: UPDATE id=3 email -> u2
        let e1 = event(1, OP_UPDATE, &[("email", "u2new")], &[("email", "u2")]);
        let e2 = event(2, OP_UPDATE, &[("email", "u2")], &[("email", "u3")]);
        assert!(cache.events_conflict(&e1, &e2));
        // and not the other way: e2's before value is not e1's new value
        assert!(!cache.events_conflict(&e2, &e1));
    }

    #[test]
    fn test_no_conflict_across_tables() {
        let cache = cache_with_email_unique(vec![]);
        let e1 = event(1, OP_DELETE, &[], &[("email", "a@x")]);
        let other_table = ObjectName::new(Dialect::Postgres, Some("public"), "public", "orders");
        let mut e2 = event(2, OP_INSERT, &[("email", "a@x")], &[]);
        e2.table =
            Some(NameTuple::new(None, Some(other_table), Role::TargetDbImporter).unwrap());
        assert!(!cache.events_conflict(&e1, &e2));
    }

    #[test]
    fn test_reverse_stream_is_conservative() {
        let cache = cache_with_email_unique(vec![]);
        let cached = event(1, OP_DELETE, &[], &[]);
        let mut incoming = event(2, OP_INSERT, &[("id", "9")], &[]);
        incoming.exporter_role = Role::TargetDbExporterFb;
        // cached delete + same table is enough, no value comparison
        assert!(cache.events_conflict(&cached, &incoming));

        let cached_insert = event(3, OP_INSERT, &[("id", "1")], &[]);
        assert!(!cache.events_conflict(&cached_insert, &incoming));
    }

    #[test]
    fn test_needs_tracking() {
        let cache = cache_with_email_unique(vec![]);
        assert!(cache.needs_tracking(&event(1, OP_DELETE, &[], &[])));
        assert!(cache.needs_tracking(&event(2, OP_UPDATE, &[("email", "x")], &[])));
        assert!(!cache.needs_tracking(&event(3, OP_UPDATE, &[("name", "x")], &[])));
        assert!(!cache.needs_tracking(&event(4, OP_INSERT, &[("email", "x")], &[])));
    }

    #[tokio::test]
    async fn test_waiter_unblocks_on_removal_and_flushes_channels() {
        let (tx, mut rx) = mpsc::channel(8);
        let cache = Arc::new(cache_with_email_unique(vec![tx]));

        let e1 = event(1, OP_DELETE, &[], &[("email", "a@x")]);
        cache.put(&e1);

        let incoming = event(2, OP_INSERT, &[("email", "a@x")], &[]);
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_until_no_conflict(&incoming).await })
        };

        // the waiter pushes a flush token to every channel before blocking
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("expected a flush token")
            .unwrap();
        assert!(matches!(msg, DispatchMessage::FlushBatch));
        assert!(!waiter.is_finished());

        cache.remove_events(std::slice::from_ref(&e1));
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should unblock once the conflict clears")
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_conflicting_event_does_not_wait() {
        let cache = cache_with_email_unique(vec![]);
        let e1 = event(1, OP_DELETE, &[], &[("email", "a@x")]);
        cache.put(&e1);

        let unrelated = event(2, OP_INSERT, &[("email", "other@x")], &[]);
        tokio::time::timeout(
            Duration::from_millis(200),
            cache.wait_until_no_conflict(&unrelated),
        )
        .await
        .expect("must not block");
    }
}
