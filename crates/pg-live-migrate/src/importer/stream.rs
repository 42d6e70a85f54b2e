//! Streaming import: wires the apply channels together and feeds them from
//! the CDC producer's event segments.
//!
//! The producer writes JSON-lines segment files under `data/events/`; a
//! segment is closed once its successor exists. The reader tails the open
//! segment, decodes events through the name registry, lets cutover markers
//! flip the MSR flags, and pushes everything else into the dispatcher.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{MigrateError, Result};
use crate::metadb::MetaDb;
use crate::namereg::NameRegistry;
use crate::sqlname::{NameTuple, Role};
use crate::tgtdb::event::{Event, RawEvent};
use crate::tgtdb::{AttributeNameRegistry, TargetDb};

use super::conflict::ConflictDetectionCache;
use super::dispatcher::{ChannelApplier, DispatchMessage, EventDispatcher};

const SEGMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHANNEL_BUFFER: usize = 200;

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub num_channels: usize,
    pub max_batch_size: usize,
    pub max_batch_interval: Duration,
}

/// The dispatcher plus the running applier tasks.
pub struct StreamingPipeline {
    pub dispatcher: Arc<EventDispatcher>,
    pub appliers: Vec<tokio::task::JoinHandle<Result<()>>>,
}

/// Build N apply channels, seed their skip marks from the channel metadata
/// rows, and spawn one applier task per channel.
pub fn start_apply_channels(
    db: Arc<TargetDb>,
    attr_registry: Arc<AttributeNameRegistry>,
    table_to_unique_key_columns: HashMap<NameTuple, Vec<String>>,
    migration_uuid: Uuid,
    last_applied_vsns: HashMap<usize, i64>,
    config: StreamingConfig,
    cancel: CancellationToken,
) -> StreamingPipeline {
    let mut senders = Vec::with_capacity(config.num_channels);
    let mut receivers = Vec::with_capacity(config.num_channels);
    for _ in 0..config.num_channels {
        let (tx, rx) = mpsc::channel::<DispatchMessage>(CHANNEL_BUFFER);
        senders.push(tx);
        receivers.push(rx);
    }

    let cache = Arc::new(ConflictDetectionCache::new(
        table_to_unique_key_columns,
        senders.clone(),
    ));

    let skip_marks: Vec<i64> = (0..config.num_channels)
        .map(|chan| last_applied_vsns.get(&chan).copied().unwrap_or(-1))
        .collect();
    let dispatcher = Arc::new(EventDispatcher::new(senders, cache.clone(), skip_marks));

    let mut appliers = Vec::with_capacity(config.num_channels);
    for (chan_no, rx) in receivers.into_iter().enumerate() {
        let applier = ChannelApplier {
            chan_no,
            rx,
            db: db.clone(),
            cache: cache.clone(),
            attr_registry: attr_registry.clone(),
            migration_uuid,
            max_batch_size: config.max_batch_size,
            max_batch_interval: config.max_batch_interval,
            cancel: cancel.clone(),
        };
        appliers.push(tokio::spawn(Box::pin(applier.run())));
    }

    StreamingPipeline {
        dispatcher,
        appliers,
    }
}

/// Tails event segments and feeds the dispatcher.
pub struct EventStreamImporter {
    pub export_dir: PathBuf,
    pub registry: Arc<NameRegistry>,
    pub dispatcher: Arc<EventDispatcher>,
    pub meta_db: Arc<MetaDb>,
    pub importer_role: Role,
    pub cancel: CancellationToken,
}

impl EventStreamImporter {
    /// Consume segments until cancelled or until the cutover marker for our
    /// role arrives; drains the channels before returning.
    pub async fn run(&self) -> Result<()> {
        let mut segment = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let path = self.segment_path(segment);
            if !path.exists() {
                tokio::time::sleep(SEGMENT_POLL_INTERVAL).await;
                continue;
            }
            info!("consuming event segment {:?}", path);
            if self.process_segment(segment).await? {
                break;
            }
            segment += 1;
        }
        let _ = self.dispatcher.broadcast_flush().await;
        Ok(())
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.export_dir
            .join("data")
            .join("events")
            .join(format!("segment.{}.jsonl", segment))
    }

    /// Tail one segment. Returns true when the stream is finished (cutover
    /// processed or cancellation).
    async fn process_segment(&self, segment: u64) -> Result<bool> {
        let path = self.segment_path(segment);
        let mut pos: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(pos)).await?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).await?;

            // only complete lines; a partially-written trailing line is
            // re-read on the next poll
            let complete = buf
                .iter()
                .rposition(|&b| b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            if complete > 0 {
                let text = std::str::from_utf8(&buf[..complete]).map_err(|e| {
                    MigrateError::Event(format!("segment {:?} is not UTF-8: {}", path, e))
                })?;
                for line in text.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let raw: RawEvent = serde_json::from_str(line).map_err(|e| {
                        MigrateError::Event(format!("decode event in {:?}: {}", path, e))
                    })?;
                    let event = Event::from_raw(raw, &self.registry)?;
                    if event.is_cutover_event() {
                        if self.handle_cutover(&event).await? {
                            return Ok(true);
                        }
                        continue;
                    }
                    self.dispatcher.dispatch(event).await?;
                }
                pos += complete as u64;
                continue;
            }

            if self.segment_path(segment + 1).exists() {
                return Ok(false);
            }
            tokio::time::sleep(SEGMENT_POLL_INTERVAL).await;
        }
    }

    /// Flip the MSR flag matching our role. Returns true when this importer
    /// is the cutover's addressee and should stop.
    async fn handle_cutover(&self, event: &Event) -> Result<bool> {
        let addressed = matches!(
            (self.importer_role, event.op.as_str()),
            (Role::TargetDbImporter, "cutover.target")
                | (Role::SourceReplicaDbImporter, "cutover.source_replica")
                | (Role::SourceDbImporter, "cutover.source")
        );
        if !addressed {
            warn!(
                "ignoring cutover marker {:?} (vsn {}) for role {}",
                event.op, event.vsn, self.importer_role
            );
            return Ok(false);
        }
        info!("processing cutover marker {:?} (vsn {})", event.op, event.vsn);
        self.meta_db
            .update(|record| record.cutover_processed_by_target_importer = true)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlname::Dialect;
    use std::io::Write;

    fn write_segment(export_dir: &std::path::Path, segment: u64, lines: &[&str]) {
        let dir = export_dir.join("data").join("events");
        std::fs::create_dir_all(&dir).unwrap();
        let mut f =
            std::fs::File::create(dir.join(format!("segment.{}.jsonl", segment))).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    fn registry() -> Arc<NameRegistry> {
        let mut reg = NameRegistry::new(
            Role::TargetDbImporter,
            Dialect::Postgres,
            Some("public".to_string()),
            "public".to_string(),
        );
        reg.register_table("public.users").unwrap();
        Arc::new(reg)
    }

    #[tokio::test]
    async fn test_stream_dispatches_until_cutover() {
        let dir = tempfile::tempdir().unwrap();
        let meta_db = Arc::new(MetaDb::init(dir.path()).unwrap());

        let (tx, mut rx) = mpsc::channel(16);
        let cache = Arc::new(ConflictDetectionCache::new(HashMap::new(), vec![tx.clone()]));
        let dispatcher = Arc::new(EventDispatcher::new(vec![tx], cache, vec![-1]));

        write_segment(
            dir.path(),
            0,
            &[
                r#"{"vsn": 1, "op": "c", "schema_name": "public", "table_name": "users", "key": {"id": "1"}, "fields": {"id": "1"}}"#,
                r#"{"vsn": 2, "op": "d", "schema_name": "public", "table_name": "users", "key": {"id": "1"}}"#,
                r#"{"vsn": 3, "op": "cutover.target"}"#,
            ],
        );

        let importer = EventStreamImporter {
            export_dir: dir.path().to_path_buf(),
            registry: registry(),
            dispatcher,
            meta_db: meta_db.clone(),
            importer_role: Role::TargetDbImporter,
            cancel: CancellationToken::new(),
        };
        tokio::time::timeout(Duration::from_secs(10), importer.run())
            .await
            .expect("run must stop at the cutover marker")
            .unwrap();

        let mut vsns = Vec::new();
        let mut flushes = 0;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                DispatchMessage::Event(e) => vsns.push(e.vsn),
                DispatchMessage::FlushBatch => flushes += 1,
            }
        }
        assert_eq!(vsns, vec![1, 2]);
        assert!(flushes >= 1, "run drains the channels before returning");

        let record = meta_db.migration_status_record().unwrap();
        assert!(record.cutover_processed_by_target_importer);
    }

    #[tokio::test]
    async fn test_stream_rolls_to_next_segment() {
        let dir = tempfile::tempdir().unwrap();
        let meta_db = Arc::new(MetaDb::init(dir.path()).unwrap());

        let (tx, mut rx) = mpsc::channel(16);
        let cache = Arc::new(ConflictDetectionCache::new(HashMap::new(), vec![tx.clone()]));
        let dispatcher = Arc::new(EventDispatcher::new(vec![tx], cache, vec![-1]));

        write_segment(
            dir.path(),
            0,
            &[r#"{"vsn": 1, "op": "c", "schema_name": "public", "table_name": "users", "key": {"id": "1"}, "fields": {"id": "1"}}"#],
        );
        write_segment(
            dir.path(),
            1,
            &[
                r#"{"vsn": 2, "op": "c", "schema_name": "public", "table_name": "users", "key": {"id": "2"}, "fields": {"id": "2"}}"#,
                r#"{"vsn": 3, "op": "cutover.target"}"#,
            ],
        );

        let importer = EventStreamImporter {
            export_dir: dir.path().to_path_buf(),
            registry: registry(),
            dispatcher,
            meta_db,
            importer_role: Role::TargetDbImporter,
            cancel: CancellationToken::new(),
        };
        tokio::time::timeout(Duration::from_secs(10), importer.run())
            .await
            .expect("run must finish")
            .unwrap();

        let mut vsns = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let DispatchMessage::Event(e) = msg {
                vsns.push(e.vsn);
            }
        }
        assert_eq!(vsns, vec![1, 2]);
    }
}
