//! Batched, append-only attendance persistence.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::AttendanceEvent;

/// Header row of the attendance log.
pub const LOG_HEADER: [&str; 6] = ["Name", "RollNo", "Branch", "Section", "Date", "Time"];

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("attendance log I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance log encoding: {0}")]
    Csv(#[from] csv::Error),
    #[error("attendance log rejected write: {0}")]
    Rejected(String),
}

/// Durable destination for attendance rows. Writers only ever append.
pub trait AttendanceLog {
    /// Append every event in order, or none of them.
    fn append(&mut self, events: &[AttendanceEvent]) -> Result<(), PersistenceError>;

    /// Every event currently in the log.
    fn history(&self) -> Result<Vec<AttendanceEvent>, PersistenceError>;
}

/// CSV attendance log with a fixed header row.
pub struct CsvLog {
    path: PathBuf,
    file: File,
}

impl CsvLog {
    /// Open `path` for appending, writing the header if the file is new or
    /// empty. A log whose last line lacks its newline gets one.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(b"\n")?;
                file.sync_data()?;
                tracing::warn!(path = %path.display(), "attendance log missing final newline; repaired");
            }
        } else {
            let mut wtr = csv::Writer::from_writer(Vec::new());
            wtr.write_record(LOG_HEADER)?;
            let header = wtr
                .into_inner()
                .map_err(|e| PersistenceError::Rejected(e.to_string()))?;
            file.write_all(&header)?;
            file.sync_data()?;
            tracing::info!(path = %path.display(), "created attendance log");
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttendanceLog for CsvLog {
    fn append(&mut self, events: &[AttendanceEvent]) -> Result<(), PersistenceError> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for event in events {
            wtr.serialize(event)?;
        }
        let rows = wtr
            .into_inner()
            .map_err(|e| PersistenceError::Rejected(e.to_string()))?;

        // One write per batch; a torn append is cut back to the prior length.
        let before = self.file.metadata()?.len();
        if let Err(e) = self.file.write_all(&rows).and_then(|()| self.file.sync_data()) {
            if let Err(trunc) = self.file.set_len(before) {
                tracing::error!(error = %trunc, path = %self.path.display(), "failed to roll back torn append");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn history(&self) -> Result<Vec<AttendanceEvent>, PersistenceError> {
        read_log(&self.path)
    }
}

/// In-memory log for dry runs and tests. Records each appended batch.
#[derive(Debug, Default)]
pub struct MemoryLog {
    batches: Vec<Vec<AttendanceEvent>>,
    failures_left: usize,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` appends.
    pub fn failing(count: usize) -> Self {
        Self {
            batches: Vec::new(),
            failures_left: count,
        }
    }

    pub fn batches(&self) -> &[Vec<AttendanceEvent>] {
        &self.batches
    }

    pub fn events(&self) -> Vec<&AttendanceEvent> {
        self.batches.iter().flatten().collect()
    }

    /// Pre-populate the log as if `events` were written by an earlier session.
    pub fn with_history(mut self, events: Vec<AttendanceEvent>) -> Self {
        self.batches.push(events);
        self
    }
}

impl AttendanceLog for MemoryLog {
    fn append(&mut self, events: &[AttendanceEvent]) -> Result<(), PersistenceError> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(PersistenceError::Rejected("injected failure".into()));
        }
        self.batches.push(events.to_vec());
        Ok(())
    }

    fn history(&self) -> Result<Vec<AttendanceEvent>, PersistenceError> {
        Ok(self.events().into_iter().cloned().collect())
    }
}

/// FIFO queue in front of an [`AttendanceLog`].
///
/// Queued events survive failed flushes and are written on the next attempt.
/// Anything still queued when the writer is dropped gets one last flush.
pub struct AttendanceWriter<L: AttendanceLog> {
    log: L,
    queue: VecDeque<AttendanceEvent>,
    written: usize,
}

impl<L: AttendanceLog> AttendanceWriter<L> {
    pub fn new(log: L) -> Self {
        Self {
            log,
            queue: VecDeque::new(),
            written: 0,
        }
    }

    pub fn enqueue(&mut self, event: AttendanceEvent) {
        self.queue.push_back(event);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Events successfully flushed over the writer's lifetime.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Append the whole queue to the log and clear it. Returns the number of
    /// events written; an empty queue never touches the log.
    ///
    /// A failed append is retried once before the error is returned.
    pub fn flush(&mut self) -> Result<usize, PersistenceError> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        let batch = self.queue.make_contiguous();

        if let Err(first) = self.log.append(batch) {
            tracing::warn!(error = %first, pending = batch.len(), "flush failed; retrying once");
            self.log.append(batch)?;
        }

        let count = self.queue.len();
        self.queue.clear();
        self.written += count;
        tracing::debug!(count, total = self.written, "flushed attendance events");
        Ok(count)
    }
}

impl<L: AttendanceLog> Drop for AttendanceWriter<L> {
    fn drop(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, lost = self.queue.len(), "final flush on drop failed");
        }
    }
}

/// Read every well-formed row of a log. A missing file reads as empty;
/// malformed rows are skipped.
pub fn read_log(path: &Path) -> Result<Vec<AttendanceEvent>, PersistenceError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut rdr = csv::Reader::from_path(path)?;
    let mut events = Vec::new();
    for (idx, row) in rdr.deserialize::<AttendanceEvent>().enumerate() {
        match row {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!(row = idx + 1, error = %e, "skipping malformed attendance row"),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(name: &str, roll: &str) -> AttendanceEvent {
        AttendanceEvent {
            name: name.into(),
            roll_no: roll.into(),
            branch: "CSE".into(),
            section: "A".into(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            time: chrono::NaiveTime::from_hms_opt(9, 15, 2).unwrap(),
        }
    }

    #[test]
    fn test_flush_moves_queue_in_order() {
        let mut writer = AttendanceWriter::new(MemoryLog::new());
        writer.enqueue(event("Asha Rao", "CSEA001"));
        writer.enqueue(event("Vikram Iyer", "CSEA002"));
        writer.enqueue(event("Meera Das", "CSEA003"));

        assert_eq!(writer.flush().unwrap(), 3);
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.log().batches().len(), 1);
        let rolls: Vec<&str> = writer.log().events().iter().map(|e| e.roll_no.as_str()).collect();
        assert_eq!(rolls, vec!["CSEA001", "CSEA002", "CSEA003"]);
    }

    #[test]
    fn test_flush_empty_queue_skips_log() {
        let mut writer = AttendanceWriter::new(MemoryLog::new());
        assert_eq!(writer.flush().unwrap(), 0);
        writer.enqueue(event("Asha Rao", "CSEA001"));
        writer.flush().unwrap();
        assert_eq!(writer.flush().unwrap(), 0);
        assert_eq!(writer.log().batches().len(), 1);
    }

    #[test]
    fn test_flush_retries_once() {
        let mut writer = AttendanceWriter::new(MemoryLog::failing(1));
        writer.enqueue(event("Asha Rao", "CSEA001"));
        assert_eq!(writer.flush().unwrap(), 1);
        assert_eq!(writer.log().events().len(), 1);
    }

    #[test]
    fn test_failed_flush_retains_queue() {
        let mut writer = AttendanceWriter::new(MemoryLog::failing(2));
        writer.enqueue(event("Asha Rao", "CSEA001"));
        assert!(writer.flush().is_err());
        assert_eq!(writer.pending(), 1);
        assert!(writer.log().batches().is_empty());

        writer.enqueue(event("Vikram Iyer", "CSEA002"));
        assert_eq!(writer.flush().unwrap(), 2);
        assert_eq!(writer.written(), 2);
    }

    #[test]
    fn test_csv_log_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");

        {
            let mut writer = AttendanceWriter::new(CsvLog::open(&path).unwrap());
            writer.enqueue(event("Asha Rao", "CSEA001"));
            writer.flush().unwrap();
        }
        {
            let mut writer = AttendanceWriter::new(CsvLog::open(&path).unwrap());
            writer.enqueue(event("Vikram Iyer", "CSEA002"));
            writer.flush().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "Name,RollNo,Branch,Section,Date,Time\n\
             Asha Rao,CSEA001,CSE,A,2026-03-02,09:15:02\n\
             Vikram Iyer,CSEA002,CSE,A,2026-03-02,09:15:02\n"
        );
    }

    #[test]
    fn test_open_terminates_unfinished_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(
            &path,
            "Name,RollNo,Branch,Section,Date,Time\n\
             Asha Rao,CSEA001,CSE,A,2026-03-02,09:15:02",
        )
        .unwrap();

        let mut writer = AttendanceWriter::new(CsvLog::open(&path).unwrap());
        writer.enqueue(event("Vikram Iyer", "CSEA002"));
        writer.flush().unwrap();

        let events = read_log(&path).unwrap();
        assert_eq!(
            events,
            vec![event("Asha Rao", "CSEA001"), event("Vikram Iyer", "CSEA002")]
        );
        assert!(std::fs::read_to_string(&path).unwrap().ends_with("09:15:02\n"));
    }

    #[test]
    fn test_drop_flushes_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        {
            let mut writer = AttendanceWriter::new(CsvLog::open(&path).unwrap());
            writer.enqueue(event("Asha Rao", "CSEA001"));
        }
        let events = read_log(&path).unwrap();
        assert_eq!(events, vec![event("Asha Rao", "CSEA001")]);
    }

    #[test]
    fn test_read_log_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.csv");
        std::fs::write(
            &path,
            "Name,RollNo,Branch,Section,Date,Time\n\
             Asha Rao,CSEA001,CSE,A,2026-03-02,09:15:02\n\
             Broken,CSEA002,CSE,A,yesterday,noon\n",
        )
        .unwrap();
        let events = read_log(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].roll_no, "CSEA001");
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_log(&dir.path().join("none.csv")).unwrap().is_empty());
    }
}
