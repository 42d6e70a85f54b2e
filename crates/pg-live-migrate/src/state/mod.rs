//! On-disk batch state machine for snapshot import.
//!
//! Layout per (table, data file):
//!
//! ```text
//! <export-dir>/metainfo/import_data_state/<role>/table::<T>/file::<base>::<hash8>/
//!     link                                            -> absolute data file
//!     batch::<n>.<offset_end>.<records>.<bytes>.<C|P|D>
//! ```
//!
//! A batch artifact changes state exclusively by filesystem rename, which is
//! atomic on POSIX: `tmp::<n>` -> `...C` (created) -> `...P` (in progress)
//! -> `...D` (done). The `<hash8>` component is the first 8 hex chars of the
//! SHA-1 of the data file path with the export-dir prefix stripped, so the
//! state survives a move of the export directory.

use sha1::{Digest, Sha1};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{MigrateError, Result};
use crate::sqlname::{NameTuple, Role};

/// Sentinel batch number marking that its file has been fully split.
/// Ordinary batches are numbered from 1. Exactly one sentinel exists per
/// fully-split file.
pub const LAST_BATCH_NUMBER: i64 = 0;

/// Lifecycle state of a batch, encoded in the artifact's file-name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Split from the data file, not yet picked up.
    Created,
    /// Picked up by an importer; a crash leaves the batch in this state.
    InProgress,
    /// Imported and recorded in the target metadata table.
    Done,
}

impl BatchState {
    pub fn suffix(&self) -> char {
        match self {
            BatchState::Created => 'C',
            BatchState::InProgress => 'P',
            BatchState::Done => 'D',
        }
    }

    fn from_suffix(s: &str) -> Result<Self> {
        match s {
            "C" => Ok(BatchState::Created),
            "P" => Ok(BatchState::InProgress),
            "D" => Ok(BatchState::Done),
            other => Err(MigrateError::State(format!(
                "invalid batch state suffix {:?}",
                other
            ))),
        }
    }
}

/// Import progress of one data file, derived from its batch artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileImportState {
    NotStarted,
    InProgress,
    Completed,
}

/// Result of crash recovery for one (table, file).
#[derive(Debug)]
pub struct Recovery {
    /// Batches in Created or InProgress state, to be (re-)imported.
    pub pending: Vec<Batch>,
    /// Highest ordinary batch number seen.
    pub last_batch_number: i64,
    /// Highest record offset covered by any batch; splitting resumes here.
    pub last_offset: i64,
    /// Whether the sentinel batch exists.
    pub file_fully_split: bool,
}

pub struct ImportDataState {
    export_dir: PathBuf,
    state_dir: PathBuf,
}

impl ImportDataState {
    pub fn new(export_dir: impl Into<PathBuf>, role: Role) -> Self {
        let export_dir = export_dir.into();
        let state_dir = export_dir
            .join("metainfo")
            .join("import_data_state")
            .join(role.as_str());
        Self {
            export_dir,
            state_dir,
        }
    }

    /// Create the state directory for (table, file) and the informational
    /// `link` symlink back to the data file.
    pub fn prepare_for_file_import(&self, file_path: &Path, table: &NameTuple) -> Result<()> {
        let file_state_dir = self.file_state_dir(file_path, table);
        info!("creating {:?}", file_state_dir);
        fs::create_dir_all(&file_state_dir)?;
        create_link(&file_state_dir.join("link"), file_path)?;
        Ok(())
    }

    pub fn pending_batches(&self, file_path: &Path, table: &NameTuple) -> Result<Vec<Batch>> {
        self.batches(
            file_path,
            table,
            &[BatchState::Created, BatchState::InProgress],
        )
    }

    pub fn completed_batches(&self, file_path: &Path, table: &NameTuple) -> Result<Vec<Batch>> {
        self.batches(file_path, table, &[BatchState::Done])
    }

    pub fn all_batches(&self, file_path: &Path, table: &NameTuple) -> Result<Vec<Batch>> {
        self.batches(
            file_path,
            table,
            &[BatchState::Created, BatchState::InProgress, BatchState::Done],
        )
    }

    /// Derive the file's import state from its batches: COMPLETED requires
    /// the sentinel plus every batch done.
    pub fn file_import_state(&self, file_path: &Path, table: &NameTuple) -> Result<FileImportState> {
        let batches = self.all_batches(file_path, table)?;
        if batches.is_empty() {
            return Ok(FileImportState::NotStarted);
        }
        let mut fully_split = false;
        let mut done = 0usize;
        let mut interrupted = 0usize;
        for batch in &batches {
            if batch.is_done() {
                done += 1;
            } else if batch.is_interrupted() {
                interrupted += 1;
            }
            if batch.number == LAST_BATCH_NUMBER {
                fully_split = true;
            }
        }
        if done == batches.len() && fully_split {
            Ok(FileImportState::Completed)
        } else if done == 0 && interrupted == 0 {
            Ok(FileImportState::NotStarted)
        } else {
            Ok(FileImportState::InProgress)
        }
    }

    /// Scan the batch directory after a restart. Offsets are 0-based record
    /// positions in the original data file; `offset_end` of one batch is
    /// `offset_start` of the next.
    pub fn recover(&self, file_path: &Path, table: &NameTuple) -> Result<Recovery> {
        let batches = self.all_batches(file_path, table)?;
        let mut recovery = Recovery {
            pending: Vec::new(),
            last_batch_number: 0,
            last_offset: 0,
            file_fully_split: false,
        };
        for batch in batches {
            if batch.number == LAST_BATCH_NUMBER {
                recovery.file_fully_split = true;
            }
            if batch.number > recovery.last_batch_number {
                recovery.last_batch_number = batch.number;
            }
            if batch.offset_end > recovery.last_offset {
                recovery.last_offset = batch.offset_end;
            }
            if !batch.is_done() {
                recovery.pending.push(batch);
            }
        }
        // interrupted batches first, then creation order
        recovery
            .pending
            .sort_by_key(|b| (b.is_not_started(), b.offset_start));
        Ok(recovery)
    }

    /// Remove all batch state for (table, file). The caller is responsible
    /// for deleting the matching metadata rows on the target.
    pub fn clean(&self, file_path: &Path, table: &NameTuple) -> Result<()> {
        let file_state_dir = self.file_state_dir(file_path, table);
        info!("removing {:?}", file_state_dir);
        if file_state_dir.exists() {
            fs::remove_dir_all(&file_state_dir)?;
        }
        Ok(())
    }

    /// Sum of record counts over done batches.
    pub fn imported_row_count(&self, file_path: &Path, table: &NameTuple) -> Result<i64> {
        Ok(self
            .completed_batches(file_path, table)?
            .iter()
            .map(|b| b.record_count)
            .sum())
    }

    /// Sum of byte counts over done batches.
    pub fn imported_byte_count(&self, file_path: &Path, table: &NameTuple) -> Result<i64> {
        Ok(self
            .completed_batches(file_path, table)?
            .iter()
            .map(|b| b.byte_count)
            .sum())
    }

    /// Rebuild the table -> data files mapping from the state directory
    /// alone (used by status reporting when the descriptor is absent).
    pub fn discover_table_to_files_mapping(&self) -> Result<Vec<(String, Vec<PathBuf>)>> {
        let mut result = Vec::new();
        if !self.state_dir.exists() {
            return Ok(result);
        }
        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_dir() || !name.starts_with("table::") {
                continue;
            }
            let table_name = name["table::".len()..].to_string();
            let mut files = Vec::new();
            for file_entry in fs::read_dir(entry.path())? {
                let file_entry = file_entry?;
                let file_name = file_entry.file_name().to_string_lossy().into_owned();
                if file_entry.file_type()?.is_dir() && file_name.starts_with("file::") {
                    files.push(read_link_target(&file_entry.path().join("link"))?);
                }
            }
            files.sort();
            result.push((table_name, files));
        }
        result.sort();
        Ok(result)
    }

    pub fn new_batch_writer(
        &self,
        file_path: &Path,
        table: &NameTuple,
        batch_number: i64,
    ) -> Result<BatchWriter> {
        BatchWriter::new(
            self.file_state_dir(file_path, table),
            file_path.to_path_buf(),
            table.clone(),
            batch_number,
        )
    }

    fn batches(
        &self,
        file_path: &Path,
        table: &NameTuple,
        states: &[BatchState],
    ) -> Result<Vec<Batch>> {
        let mut result = Vec::new();
        let file_state_dir = self.file_state_dir(file_path, table);
        if !file_state_dir.exists() {
            return Ok(result);
        }
        for entry in fs::read_dir(&file_state_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_file() || !name.starts_with("batch::") {
                continue;
            }
            let (number, offset_end, record_count, byte_count, state) =
                parse_batch_file_name(&name)?;
            if !states.contains(&state) {
                continue;
            }
            result.push(Batch {
                number,
                table: table.clone(),
                file_path: entry.path(),
                base_file_path: file_path.to_path_buf(),
                offset_start: offset_end - record_count,
                offset_end,
                record_count,
                byte_count,
            });
        }
        Ok(result)
    }

    fn table_state_dir(&self, table: &NameTuple) -> PathBuf {
        self.state_dir
            .join(format!("table::{}", table.current_name().render()))
    }

    fn file_state_dir(&self, file_path: &Path, table: &NameTuple) -> PathBuf {
        let hash = compute_path_hash(file_path, &self.export_dir);
        let base_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.table_state_dir(table)
            .join(format!("file::{}::{}", base_name, hash))
    }
}

/// First 8 hex chars of the SHA-1 of the file path. The export-dir prefix is
/// stripped first so files produced by the export stage keep their hash when
/// the export directory moves.
fn compute_path_hash(file_path: &Path, export_dir: &Path) -> String {
    let path_str = file_path.to_string_lossy();
    let stripped = path_str
        .strip_prefix(&*export_dir.to_string_lossy())
        .map(|s| s.to_string())
        .unwrap_or_else(|| path_str.into_owned());
    let mut hasher = Sha1::new();
    hasher.update(stripped.as_bytes());
    hex::encode(hasher.finalize())[0..8].to_string()
}

fn parse_batch_file_name(name: &str) -> Result<(i64, i64, i64, i64, BatchState)> {
    let meta = name
        .split_once("::")
        .map(|(_, rest)| rest)
        .ok_or_else(|| MigrateError::State(format!("invalid batch file name {:?}", name)))?;
    let parts: Vec<&str> = meta.split('.').collect();
    if parts.len() != 5 {
        return Err(MigrateError::State(format!(
            "invalid batch file name {:?}",
            name
        )));
    }
    let parse_int = |part: &str, what: &str| -> Result<i64> {
        part.parse::<i64>().map_err(|_| {
            MigrateError::State(format!("invalid {} {:?} in batch file name {:?}", what, part, name))
        })
    };
    let number = parse_int(parts[0], "batch number")?;
    let offset_end = parse_int(parts[1], "offset end")?;
    let record_count = parse_int(parts[2], "record count")?;
    let byte_count = parse_int(parts[3], "byte count")?;
    let state = BatchState::from_suffix(parts[4])?;
    Ok((number, offset_end, record_count, byte_count, state))
}

#[cfg(unix)]
fn create_link(link_path: &Path, target: &Path) -> Result<()> {
    match std::os::unix::fs::symlink(target, link_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn create_link(link_path: &Path, target: &Path) -> Result<()> {
    fs::write(link_path, target.to_string_lossy().as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn read_link_target(link_path: &Path) -> Result<PathBuf> {
    Ok(fs::read_link(link_path)?)
}

#[cfg(not(unix))]
fn read_link_target(link_path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(fs::read_to_string(link_path)?))
}

//============================================================================

/// One slice of a source data file, with its lifecycle artifact on disk.
#[derive(Debug, Clone)]
pub struct Batch {
    pub number: i64,
    pub table: NameTuple,
    /// Path of the batch artifact (current state encoded in the suffix).
    pub file_path: PathBuf,
    /// Path of the original data file.
    pub base_file_path: PathBuf,
    pub offset_start: i64,
    pub offset_end: i64,
    pub record_count: i64,
    pub byte_count: i64,
}

impl Batch {
    pub fn is_not_started(&self) -> bool {
        self.has_suffix('C')
    }

    pub fn is_interrupted(&self) -> bool {
        self.has_suffix('P')
    }

    pub fn is_done(&self) -> bool {
        self.has_suffix('D')
    }

    pub fn open(&self) -> Result<fs::File> {
        Ok(fs::File::open(&self.file_path)?)
    }

    /// `...C` -> `...P`. A crash after this leaves the batch interrupted and
    /// recovery re-picks it.
    pub fn mark_pending(&mut self) -> Result<()> {
        let to = self.with_suffix('P');
        info!("renaming {:?} -> {:?}", self.file_path, to);
        fs::rename(&self.file_path, &to)?;
        self.file_path = to;
        Ok(())
    }

    /// `...P` -> `...D`. Must happen only after the metadata row for this
    /// batch is committed on the target; the row is authoritative from then
    /// on, which is what makes `truncate` safe.
    pub fn mark_done(&mut self, truncate: bool) -> Result<()> {
        let from = self.with_suffix('P');
        let to = self.with_suffix('D');
        info!("renaming {:?} -> {:?}", from, to);
        fs::rename(&from, &to)?;
        if truncate {
            if let Err(e) = fs::File::create(&to) {
                warn!("truncate {:?}: {}", to, e);
            }
        }
        self.file_path = to;
        Ok(())
    }

    fn has_suffix(&self, suffix: char) -> bool {
        self.file_path
            .to_string_lossy()
            .ends_with(&format!(".{}", suffix))
    }

    fn with_suffix(&self, suffix: char) -> PathBuf {
        let current = self.file_path.to_string_lossy();
        PathBuf::from(format!("{}{}", &current[..current.len() - 1], suffix))
    }
}

//============================================================================

/// Accumulates records into `tmp::<n>` and atomically promotes the file to a
/// Created batch artifact on completion.
pub struct BatchWriter {
    file_state_dir: PathBuf,
    base_file_path: PathBuf,
    table: NameTuple,
    batch_number: i64,

    tmp_path: PathBuf,
    out: BufWriter<fs::File>,
    records_written: i64,
    first_record_written: bool,
}

impl BatchWriter {
    fn new(
        file_state_dir: PathBuf,
        base_file_path: PathBuf,
        table: NameTuple,
        batch_number: i64,
    ) -> Result<Self> {
        let tmp_path = file_state_dir.join(format!("tmp::{}", batch_number));
        let file = fs::File::create(&tmp_path)?;
        Ok(Self {
            file_state_dir,
            base_file_path,
            table,
            batch_number,
            tmp_path,
            out: BufWriter::with_capacity(4 * 1024 * 1024, file),
            records_written: 0,
            first_record_written: false,
        })
    }

    pub fn records_written(&self) -> i64 {
        self.records_written
    }

    pub fn write_header(&mut self, header: &str) -> Result<()> {
        self.out.write_all(header.as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    pub fn write_record(&mut self, record: &str) -> Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        if self.first_record_written {
            self.out.write_all(b"\n")?;
        }
        self.out.write_all(record.as_bytes())?;
        self.records_written += 1;
        self.first_record_written = true;
        Ok(())
    }

    /// Flush and rename to the Created artifact. The last batch of a file
    /// takes the sentinel number instead of its ordinal.
    pub fn done(mut self, is_last_batch: bool, offset_end: i64, byte_count: i64) -> Result<Batch> {
        self.out.flush()?;
        drop(self.out);

        let number = if is_last_batch {
            LAST_BATCH_NUMBER
        } else {
            self.batch_number
        };
        let batch_path = self.file_state_dir.join(format!(
            "batch::{}.{}.{}.{}.C",
            number, offset_end, self.records_written, byte_count
        ));
        info!("renaming {:?} -> {:?}", self.tmp_path, batch_path);
        fs::rename(&self.tmp_path, &batch_path)?;
        Ok(Batch {
            number,
            table: self.table,
            file_path: batch_path,
            base_file_path: self.base_file_path,
            offset_start: offset_end - self.records_written,
            offset_end,
            record_count: self.records_written,
            byte_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlname::{Dialect, ObjectName};

    fn users_tuple() -> NameTuple {
        let src = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        let tgt = ObjectName::new(Dialect::Postgres, Some("public"), "public", "users");
        NameTuple::new(Some(src), Some(tgt), Role::TargetDbImporter).unwrap()
    }

    fn write_batch(
        state: &ImportDataState,
        file: &Path,
        table: &NameTuple,
        number: i64,
        offset_end: i64,
        records: usize,
        is_last: bool,
    ) -> Batch {
        let mut writer = state.new_batch_writer(file, table, number).unwrap();
        for i in 0..records {
            writer.write_record(&format!("{}\tuser{}", i, i)).unwrap();
        }
        writer.done(is_last, offset_end, 100).unwrap()
    }

    #[test]
    fn test_parse_batch_file_name() {
        let (n, end, rec, bytes, state) =
            parse_batch_file_name("batch::3.60000.20000.524288.P").unwrap();
        assert_eq!((n, end, rec, bytes), (3, 60000, 20000, 524288));
        assert_eq!(state, BatchState::InProgress);

        assert!(parse_batch_file_name("batch::3.60000.20000.P").is_err());
        assert!(parse_batch_file_name("batch::x.1.1.1.C").is_err());
        assert!(parse_batch_file_name("batch::1.1.1.1.X").is_err());
        assert!(parse_batch_file_name("nonsense").is_err());
    }

    #[test]
    fn test_path_hash_independent_of_export_dir() {
        let h1 = compute_path_hash(Path::new("/a/export/data/users_data.sql"), Path::new("/a/export"));
        let h2 = compute_path_hash(Path::new("/b/export/data/users_data.sql"), Path::new("/b/export"));
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);

        // files outside the export dir hash their full path
        let h3 = compute_path_hash(Path::new("/tmp/users.csv"), Path::new("/a/export"));
        let h4 = compute_path_hash(Path::new("/var/users.csv"), Path::new("/a/export"));
        assert_ne!(h3, h4);
    }

    #[test]
    fn test_batch_lifecycle_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let mut batch = write_batch(&state, &data_file, &table, 1, 3, 3, false);
        assert!(batch.is_not_started());
        assert_eq!(batch.record_count, 3);
        assert_eq!(batch.offset_start, 0);

        batch.mark_pending().unwrap();
        assert!(batch.is_interrupted());
        assert!(batch.file_path.exists());

        batch.mark_done(false).unwrap();
        assert!(batch.is_done());
        assert_eq!(state.imported_row_count(&data_file, &table).unwrap(), 3);
    }

    #[test]
    fn test_mark_done_truncates_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let mut batch = write_batch(&state, &data_file, &table, 1, 5, 5, false);
        batch.mark_pending().unwrap();
        batch.mark_done(true).unwrap();
        assert_eq!(fs::metadata(&batch.file_path).unwrap().len(), 0);
        // the parsed record count is still carried by the file name
        let recovered = state.completed_batches(&data_file, &table).unwrap();
        assert_eq!(recovered[0].record_count, 5);
    }

    #[test]
    fn test_recovery_after_partial_import() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        // batches 1 and 2 imported, batch 3 split but not picked up
        let mut b1 = write_batch(&state, &data_file, &table, 1, 20, 20, false);
        b1.mark_pending().unwrap();
        b1.mark_done(false).unwrap();
        let mut b2 = write_batch(&state, &data_file, &table, 2, 40, 20, false);
        b2.mark_pending().unwrap();
        b2.mark_done(false).unwrap();
        write_batch(&state, &data_file, &table, 3, 55, 15, false);

        let recovery = state.recover(&data_file, &table).unwrap();
        assert_eq!(recovery.pending.len(), 1);
        assert_eq!(recovery.pending[0].number, 3);
        assert!(recovery.pending[0].is_not_started());
        assert_eq!(recovery.last_batch_number, 3);
        assert_eq!(recovery.last_offset, 55);
        assert!(!recovery.file_fully_split);
        assert_eq!(
            state.file_import_state(&data_file, &table).unwrap(),
            FileImportState::InProgress
        );
    }

    #[test]
    fn test_recovery_resumes_split_after_last_done_batch() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let mut b1 = write_batch(&state, &data_file, &table, 1, 20, 20, false);
        b1.mark_pending().unwrap();
        b1.mark_done(false).unwrap();
        let mut b2 = write_batch(&state, &data_file, &table, 2, 40, 20, false);
        b2.mark_pending().unwrap();
        b2.mark_done(false).unwrap();

        // killed before batch 3 was split: splitting resumes at offset 40
        let recovery = state.recover(&data_file, &table).unwrap();
        assert!(recovery.pending.is_empty());
        assert_eq!(recovery.last_offset, 40);
        assert_eq!(recovery.last_batch_number, 2);
        assert!(!recovery.file_fully_split);
    }

    #[test]
    fn test_interrupted_batches_are_repicked_first() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        write_batch(&state, &data_file, &table, 1, 10, 10, false);
        let mut b2 = write_batch(&state, &data_file, &table, 2, 20, 10, false);
        b2.mark_pending().unwrap(); // crashed mid-import

        let recovery = state.recover(&data_file, &table).unwrap();
        assert_eq!(recovery.pending.len(), 2);
        assert_eq!(recovery.pending[0].number, 2);
        assert!(recovery.pending[0].is_interrupted());
    }

    #[test]
    fn test_sentinel_completes_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let mut b1 = write_batch(&state, &data_file, &table, 1, 20, 20, false);
        b1.mark_pending().unwrap();
        b1.mark_done(false).unwrap();
        // second and final batch takes the sentinel number
        let mut last = write_batch(&state, &data_file, &table, 2, 30, 10, true);
        assert_eq!(last.number, LAST_BATCH_NUMBER);
        last.mark_pending().unwrap();
        last.mark_done(false).unwrap();

        let recovery = state.recover(&data_file, &table).unwrap();
        assert!(recovery.file_fully_split);
        assert!(recovery.pending.is_empty());
        assert_eq!(
            state.file_import_state(&data_file, &table).unwrap(),
            FileImportState::Completed
        );
        // invariant: sum of done record counts is the imported row count
        assert_eq!(state.imported_row_count(&data_file, &table).unwrap(), 30);

        let sentinels = state
            .all_batches(&data_file, &table)
            .unwrap()
            .into_iter()
            .filter(|b| b.number == LAST_BATCH_NUMBER)
            .count();
        assert_eq!(sentinels, 1);
    }

    #[test]
    fn test_not_started_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");

        assert_eq!(
            state.file_import_state(&data_file, &table).unwrap(),
            FileImportState::NotStarted
        );

        state.prepare_for_file_import(&data_file, &table).unwrap();
        write_batch(&state, &data_file, &table, 1, 10, 10, false);
        // split but nothing picked up yet: still not started
        assert_eq!(
            state.file_import_state(&data_file, &table).unwrap(),
            FileImportState::NotStarted
        );

        state.clean(&data_file, &table).unwrap();
        assert!(state.all_batches(&data_file, &table).unwrap().is_empty());
    }

    #[test]
    fn test_discover_table_to_files_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let state = ImportDataState::new(dir.path(), Role::TargetDbImporter);
        let table = users_tuple();
        let data_file = dir.path().join("data").join("users_data.sql");
        state.prepare_for_file_import(&data_file, &table).unwrap();

        let mapping = state.discover_table_to_files_mapping().unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[0].0, "users");
        assert_eq!(mapping[0].1, vec![data_file]);
    }
}
