//! # pg-live-migrate
//!
//! Live data-movement engine for migrating Oracle, MySQL and PostgreSQL
//! databases to a distributed PostgreSQL-compatible cluster.
//!
//! The engine has two cooperating halves:
//!
//! - **Snapshot**: an exporter drives a vendor dump tool and records the
//!   produced data files in a descriptor; an importer splits each file into
//!   restartable batches and bulk-loads them through a pool of parallel
//!   writer connections.
//! - **Streaming**: row-level change events keyed by a monotonically
//!   increasing sequence number are hash-partitioned into ordered apply
//!   channels; a conflict-detection cache preserves unique-key ordering
//!   across channels.
//!
//! Every stage records durable progress (batch artifacts on disk, metadata
//! rows on the target, the migration status record) so a crashed run can be
//! resumed from where it stopped.

pub mod config;
pub mod datafile;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod metadb;
pub mod namereg;
pub mod schemareg;
pub mod sqlname;
pub mod srcdb;
pub mod state;
pub mod status;
pub mod tgtdb;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use error::{MigrateError, Result};
pub use metadb::{MetaDb, MigrationStatusRecord};
pub use sqlname::{Dialect, NameTuple, ObjectName, Role};
pub use tgtdb::{ConnectionPool, Event, EventBatch, TargetDb};
