//! Snapshot file import: split a data file into restartable batches, then
//! bulk-load every pending batch through the writer pool.
//!
//! Ordering across files, and across batches of one file, is not
//! guaranteed; every batch carries its own record offsets. Idempotence
//! comes from the batch metadata row written in the same transaction as the
//! COPY — a re-picked batch whose row exists is skipped.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::datafile::FileFormat;
use crate::error::{MigrateError, Result};
use crate::sqlname::NameTuple;
use crate::state::{Batch, ImportDataState};
use crate::tgtdb::{ImportBatchArgs, TargetDb};

const MAX_IMPORT_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Batch size caps; a batch closes on whichever is hit first.
#[derive(Debug, Clone, Copy)]
pub struct BatchSizeLimits {
    pub max_records: i64,
    pub max_bytes: i64,
}

pub struct SnapshotFileImporter {
    pub state: Arc<ImportDataState>,
    pub db: Arc<TargetDb>,
    pub migration_uuid: Uuid,
    pub limits: BatchSizeLimits,
    pub truncate_splits: bool,
    pub cancel: CancellationToken,
}

impl SnapshotFileImporter {
    /// Import one data file end to end: recover prior state, finish
    /// splitting, import every pending batch in parallel.
    pub async fn import_file(
        &self,
        data_file: &Path,
        table: &NameTuple,
        args: &ImportBatchArgs,
    ) -> Result<()> {
        self.state.prepare_for_file_import(data_file, table)?;
        let recovery = self.state.recover(data_file, table)?;
        let mut batches = recovery.pending;
        if !recovery.file_fully_split {
            let produced = split_data_file(
                self.state.as_ref(),
                data_file,
                table,
                args,
                self.limits,
                recovery.last_batch_number,
                recovery.last_offset,
            )?;
            batches.extend(produced);
        }
        info!(
            "importing {} pending batches of {:?} into {}",
            batches.len(),
            data_file,
            table
        );

        let semaphore = Arc::new(Semaphore::new(self.db.writer_pool().size()));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        for batch in batches {
            if self.cancel.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| MigrateError::Cancelled)?;
            let db = self.db.clone();
            let args = args.clone();
            let cancel = self.cancel.clone();
            let migration_uuid = self.migration_uuid;
            let truncate = self.truncate_splits;
            join_set.spawn(Box::pin(async move {
                let _permit = permit;
                import_batch_with_retries(db, migration_uuid, batch, &args, truncate, cancel).await
            }));
        }
        while let Some(joined) = join_set.join_next().await {
            joined.map_err(|e| MigrateError::State(format!("batch import task: {}", e)))??;
        }
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }
}

/// Import one batch, retrying transient failures. Non-retryable data errors
/// (bad input syntax, unique violation, oversized RPC) surface immediately
/// with the file and batch number attached.
pub async fn import_batch_with_retries(
    db: Arc<TargetDb>,
    migration_uuid: Uuid,
    mut batch: Batch,
    args: &ImportBatchArgs,
    truncate_splits: bool,
    cancel: CancellationToken,
) -> Result<()> {
    if batch.is_not_started() {
        batch.mark_pending()?;
    }
    let file = batch.base_file_path.to_string_lossy().into_owned();
    let mut attempt: u32 = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        match db.import_batch(migration_uuid, &batch, args).await {
            Ok(rows) => {
                info!(
                    "imported batch {} of {:?}: {} rows",
                    batch.number, file, rows
                );
                batch.mark_done(truncate_splits)?;
                return Ok(());
            }
            Err(e) if e.is_non_retryable_data_error() => {
                return Err(MigrateError::batch(file, batch.number, e.to_string()));
            }
            Err(e) if attempt >= MAX_IMPORT_ATTEMPTS => {
                return Err(MigrateError::batch(
                    file,
                    batch.number,
                    format!("giving up after {} attempts: {}", attempt, e),
                ));
            }
            Err(e) => {
                warn!(
                    "batch {} of {:?} failed on attempt {}: {}; retrying",
                    batch.number, file, attempt, e
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
        }
    }
}

/// Split the remainder of a data file into batch artifacts, resuming after
/// `last_offset` records. The final batch always takes the sentinel number,
/// even when it holds zero records, so recovery can tell a fully-split file
/// from an interrupted split.
pub fn split_data_file(
    state: &ImportDataState,
    data_file: &Path,
    table: &NameTuple,
    args: &ImportBatchArgs,
    limits: BatchSizeLimits,
    last_batch_number: i64,
    last_offset: i64,
) -> Result<Vec<Batch>> {
    let file = fs::File::open(data_file)
        .map_err(|e| MigrateError::State(format!("open data file {:?}: {}", data_file, e)))?;
    let reader = BufReader::with_capacity(4 * 1024 * 1024, file);

    let mut batches = Vec::new();
    let mut header: Option<String> = None;
    let mut saw_header = false;
    let mut writer = None;
    let mut batch_number = last_batch_number;
    let mut offset: i64 = 0;
    let mut batch_bytes: i64 = 0;

    for line in reader.lines() {
        let line = line?;
        if args.has_header && !saw_header {
            saw_header = true;
            header = Some(line);
            continue;
        }
        if !is_data_line(args.file_format, &line) {
            continue;
        }
        offset += 1;
        if offset <= last_offset {
            continue;
        }

        if writer.is_none() {
            batch_number += 1;
            let mut w = state.new_batch_writer(data_file, table, batch_number)?;
            if let Some(h) = &header {
                w.write_header(h)?;
            }
            writer = Some(w);
        }
        let w = writer.as_mut().expect("writer initialized above");
        w.write_record(&line)?;
        batch_bytes += line.len() as i64 + 1;

        if w.records_written() >= limits.max_records || batch_bytes >= limits.max_bytes {
            let batch = writer.take().expect("writer present").done(false, offset, batch_bytes)?;
            batches.push(batch);
            batch_bytes = 0;
        }
    }

    // whatever is left becomes the sentinel batch
    let last = match writer.take() {
        Some(w) => w.done(true, offset, batch_bytes)?,
        None => {
            let mut w = state.new_batch_writer(data_file, table, batch_number + 1)?;
            if let Some(h) = &header {
                w.write_header(h)?;
            }
            w.done(true, offset, 0)?
        }
    };
    batches.push(last);
    Ok(batches)
}

/// Whether a line of the given format carries a record. Vendor-SQL dumps
/// interleave COPY framing and session statements with the payload rows.
pub(crate) fn is_data_line(format: FileFormat, line: &str) -> bool {
    match format {
        FileFormat::Text | FileFormat::Csv => true,
        FileFormat::Sql => {
            let trimmed = line.trim();
            !(trimmed.is_empty()
                || trimmed == "\\."
                || trimmed.starts_with("--")
                || trimmed.starts_with("COPY ")
                || trimmed.starts_with("SET "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlname::{Dialect, ObjectName, Role};
    use crate::state::LAST_BATCH_NUMBER;
    use std::io::Write;

    fn users_tuple() -> NameTuple {
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        NameTuple::new(None, Some(tgt), Role::TargetDbImporter).unwrap()
    }

    fn text_args() -> ImportBatchArgs {
        ImportBatchArgs {
            table: users_tuple(),
            columns: vec![],
            file_format: FileFormat::Text,
            delimiter: "\t".into(),
            null_string: "\\N".into(),
            has_header: false,
            quote_char: None,
            escape_char: None,
        }
    }

    fn write_data_file(dir: &Path, name: &str, lines: &[String]) -> std::path::PathBuf {
        let data_dir = dir.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        let path = data_dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn test_split_into_sized_batches_with_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let table = users_tuple();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let lines: Vec<String> = (0..50).map(|i| format!("{}\tuser{}", i, i)).collect();
        let data_file = write_data_file(dir.path(), "users_data.sql", &lines);
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let limits = BatchSizeLimits {
            max_records: 20,
            max_bytes: i64::MAX,
        };
        let batches =
            split_data_file(&state, &data_file, &table, &text_args(), limits, 0, 0).unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].number, 1);
        assert_eq!(batches[0].record_count, 20);
        assert_eq!(batches[0].offset_start, 0);
        assert_eq!(batches[0].offset_end, 20);
        assert_eq!(batches[1].offset_end, 40);
        // the final batch takes the sentinel number
        assert_eq!(batches[2].number, LAST_BATCH_NUMBER);
        assert_eq!(batches[2].record_count, 10);
        assert_eq!(batches[2].offset_end, 50);
        // invariant: offset_end - offset_start == record_count
        for batch in &batches {
            assert_eq!(batch.offset_end - batch.offset_start, batch.record_count);
        }
    }

    #[test]
    fn test_split_resumes_after_last_offset() {
        let dir = tempfile::tempdir().unwrap();
        let table = users_tuple();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let lines: Vec<String> = (0..50).map(|i| format!("{}\tuser{}", i, i)).collect();
        let data_file = write_data_file(dir.path(), "users_data.sql", &lines);
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let limits = BatchSizeLimits {
            max_records: 20,
            max_bytes: i64::MAX,
        };
        // batches 1 and 2 (40 records) were split before the crash
        let batches =
            split_data_file(&state, &data_file, &table, &text_args(), limits, 2, 40).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].number, LAST_BATCH_NUMBER);
        assert_eq!(batches[0].offset_start, 40);
        assert_eq!(batches[0].offset_end, 50);
    }

    #[test]
    fn test_split_fully_consumed_file_emits_empty_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let table = users_tuple();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let lines: Vec<String> = (0..40).map(|i| i.to_string()).collect();
        let data_file = write_data_file(dir.path(), "users_data.sql", &lines);
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let limits = BatchSizeLimits {
            max_records: 20,
            max_bytes: i64::MAX,
        };
        let batches =
            split_data_file(&state, &data_file, &table, &text_args(), limits, 2, 40).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].number, LAST_BATCH_NUMBER);
        assert_eq!(batches[0].record_count, 0);
    }

    #[test]
    fn test_csv_header_replicated_into_every_batch() {
        let dir = tempfile::tempdir().unwrap();
        let table = users_tuple();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let mut lines = vec!["id,email".to_string()];
        lines.extend((0..4).map(|i| format!("{},u{}@x", i, i)));
        let data_file = write_data_file(dir.path(), "users_data.csv", &lines);
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let mut args = text_args();
        args.file_format = FileFormat::Csv;
        args.has_header = true;
        let limits = BatchSizeLimits {
            max_records: 2,
            max_bytes: i64::MAX,
        };
        let batches = split_data_file(&state, &data_file, &table, &args, limits, 0, 0).unwrap();
        assert_eq!(batches.len(), 2);
        // header line is not counted as a record
        assert_eq!(batches[0].record_count, 2);
        for batch in &batches {
            let content = fs::read_to_string(&batch.file_path).unwrap();
            assert!(content.starts_with("id,email\n"));
        }
    }

    #[test]
    fn test_sql_format_skips_framing_lines() {
        assert!(is_data_line(FileFormat::Sql, "1\tuser1"));
        assert!(!is_data_line(FileFormat::Sql, "COPY users (id) FROM stdin;"));
        assert!(!is_data_line(FileFormat::Sql, "\\."));
        assert!(!is_data_line(FileFormat::Sql, "SET client_encoding = 'UTF8';"));
        assert!(!is_data_line(FileFormat::Sql, "-- data for table users"));
        assert!(!is_data_line(FileFormat::Sql, ""));
        assert!(is_data_line(FileFormat::Text, ""));
    }
}
