//! Purpose: Offline inspection of a queue file without taking it over.
//! Exports: `inspect_queue`, `QueueReport`, `QueueStatus`, `QueueIssue`, `QueueRecord`.
//! Role: Backs the `backstore info` and `backstore dump` commands.
//! Invariants: Reads a byte snapshot; never locks exclusively, maps, or writes the file.
//! Invariants: Structural problems become report issues; only I/O failures are errors.
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::core::backlog::{Backlog, RingView};
use crate::core::codec::unpack;
use crate::core::command::CommandKind;
use crate::core::error::{Error, ErrorKind};
use crate::core::header::{HEADER_SIZE, RingHeader, resize_interrupted};
use crate::core::plan::check_max_record_size;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueStatus {
    Ok,
    Corrupt,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueIssue {
    pub code: String,
    pub message: String,
    pub offset: Option<u64>,
}

/// One unread record, decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueRecord {
    /// Write counter at which the record starts.
    pub counter: u64,
    pub timestamp: u32,
    pub command: CommandKind,
    pub args: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueReport {
    pub path: PathBuf,
    pub file_size: u64,
    pub capacity: usize,
    pub header: RingHeader,
    /// Another handle holds the queue open; the snapshot may be mid-update.
    pub in_use: bool,
    pub status: QueueStatus,
    pub record_count: usize,
    pub issues: Vec<QueueIssue>,
    pub remediation_hints: Vec<String>,
    /// Decoded records, up to the requested limit.
    pub records: Vec<QueueRecord>,
}

impl QueueReport {
    fn corrupt(mut self, code: &str, message: impl Into<String>, offset: Option<u64>) -> Self {
        self.status = QueueStatus::Corrupt;
        self.issues.push(QueueIssue {
            code: code.to_string(),
            message: message.into(),
            offset,
        });
        self.remediation_hints = vec![if self.in_use {
            "Queue is open elsewhere; re-run once the owning process has stopped.".to_string()
        } else {
            "Queue appears corrupt. Move the file aside to start with an empty queue.".to_string()
        }];
        self
    }
}

/// Reads `path` and walks its unread records. `record_limit` caps how many
/// decoded records are kept in the report; all of them are still checked.
pub fn inspect_queue(
    path: &Path,
    max_record_size: usize,
    record_limit: usize,
) -> Result<QueueReport, Error> {
    check_max_record_size(max_record_size)?;
    let in_use = queue_in_use(path)?;
    let bytes = std::fs::read(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read queue file")
            .with_path(path)
            .with_source(err)
    })?;

    let mut report = QueueReport {
        path: path.to_path_buf(),
        file_size: bytes.len() as u64,
        capacity: bytes.len().saturating_sub(HEADER_SIZE),
        header: RingHeader::default(),
        in_use,
        status: QueueStatus::Ok,
        record_count: 0,
        issues: Vec::new(),
        remediation_hints: Vec::new(),
        records: Vec::new(),
    };

    if bytes.len() <= HEADER_SIZE {
        return Ok(report.corrupt("corrupt", "queue file shorter than its header", None));
    }
    if resize_interrupted(&bytes) {
        return Ok(report.corrupt("corrupt", "queue file was left in the middle of a resize", None));
    }
    report.header = match RingHeader::decode(&bytes) {
        Ok(header) => header,
        Err(err) => return Ok(report.corrupt("corrupt", err.to_string(), None)),
    };
    if let Err(err) = report.header.validate(report.capacity) {
        return Ok(report.corrupt("corrupt", err.to_string(), None));
    }

    let view = RingView {
        base: bytes[HEADER_SIZE..].as_ptr(),
        capacity: report.capacity,
        max_record_size,
        dirty_size: report.header.dirty_size as usize,
    };
    // The snapshot is owned here and outlives the walk.
    let backlog =
        unsafe { Backlog::new(view, report.header.read_count, report.header.write_count) };
    let mut records = Vec::new();
    let mut failure = None;
    for frame in backlog {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                failure = Some(("corrupt", err.message().unwrap_or("bad frame").to_string(), None));
                break;
            }
        };
        let job = match unpack(frame.payload) {
            Ok(job) => job,
            Err(err) => {
                let message = format!("undecodable record: {}", err.message().unwrap_or("corrupt"));
                failure = Some(("record", message, Some(frame.counter)));
                break;
            }
        };
        if records.len() < record_limit {
            records.push(QueueRecord {
                counter: frame.counter,
                timestamp: job.timestamp,
                command: job.command,
                args: job.args.iter().map(|arg| arg.to_vec()).collect(),
            });
        }
        report.record_count += 1;
    }
    report.records = records;

    Ok(match failure {
        Some((code, message, offset)) => report.corrupt(code, message, offset),
        None => report,
    })
}

fn queue_in_use(path: &Path) -> Result<bool, Error> {
    let file = File::open(path).map_err(|err| {
        let kind = if err.kind() == io::ErrorKind::NotFound {
            ErrorKind::Usage
        } else {
            ErrorKind::Io
        };
        Error::new(kind)
            .with_message("failed to open queue file")
            .with_path(path)
            .with_source(err)
    })?;
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(false)
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(true),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message("failed to probe queue lock")
            .with_path(path)
            .with_source(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueStatus, inspect_queue};
    use crate::core::codec::pack;
    use crate::core::command::CommandKind;
    use crate::core::error::ErrorKind;
    use crate::core::header::{HEADER_SIZE, RingHeader};
    use crate::core::ring::{RingOptions, open};

    fn fill(path: &std::path::Path, keys: &[&str]) {
        let (mut producer, _consumer) =
            open(RingOptions::new(256, 64).with_path(path)).expect("open");
        let mut record = Vec::new();
        for key in keys {
            pack(CommandKind::Incr, 1_700_000_000, &[*key], 64, &mut record).expect("pack");
            producer.push(&record).expect("push");
        }
    }

    #[test]
    fn report_lists_unread_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        fill(&path, &["a", "b", "c"]);

        let report = inspect_queue(&path, 64, 2).expect("inspect");
        assert_eq!(report.status, QueueStatus::Ok);
        assert!(!report.in_use);
        assert_eq!(report.capacity, 256);
        assert_eq!(report.file_size, (HEADER_SIZE + 256) as u64);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].command, CommandKind::Incr);
        assert_eq!(report.records[1].args, vec![b"b".to_vec()]);
        assert_eq!(report.records[0].timestamp, 1_700_000_000);
    }

    #[test]
    fn open_queue_is_reported_in_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        let _ring = open(RingOptions::new(256, 64).with_path(&path)).expect("open");
        let report = inspect_queue(&path, 64, 0).expect("inspect");
        assert!(report.in_use);
        assert_eq!(report.record_count, 0);
    }

    #[test]
    fn garbage_record_is_reported_not_returned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        {
            let (mut producer, _consumer) =
                open(RingOptions::new(256, 64).with_path(&path)).expect("open");
            producer.push(&[9, 9, 9, 9, 9, 9, 9, 9, 9]).expect("push");
        }
        let report = inspect_queue(&path, 64, 10).expect("inspect");
        assert_eq!(report.status, QueueStatus::Corrupt);
        assert_eq!(report.issues[0].code, "record");
        assert_eq!(report.issues[0].offset, Some(0));
        assert_eq!(report.remediation_hints.len(), 1);
    }

    #[test]
    fn inconsistent_header_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        let mut bytes = vec![0u8; HEADER_SIZE + 64];
        let header = RingHeader {
            write_count: 1,
            read_count: 2,
            dirty_size: 0,
        };
        bytes[..HEADER_SIZE].copy_from_slice(&header.encode());
        std::fs::write(&path, &bytes).expect("write");

        let report = inspect_queue(&path, 16, 0).expect("inspect");
        assert_eq!(report.status, QueueStatus::Corrupt);
    }

    #[test]
    fn out_of_range_record_size_is_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        fill(&path, &["a"]);
        for bad in [0, 1, usize::MAX] {
            let err = inspect_queue(&path, bad, 0).expect_err("limit");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn interrupted_resize_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.ring");
        fill(&path, &["a", "b"]);
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[20..HEADER_SIZE].copy_from_slice(&1u32.to_le_bytes());
        std::fs::write(&path, &bytes).expect("write");

        let report = inspect_queue(&path, 64, 10).expect("inspect");
        assert_eq!(report.status, QueueStatus::Corrupt);
        assert_eq!(report.record_count, 0);
        assert!(report.issues[0].message.contains("resize"));
    }

    #[test]
    fn missing_file_is_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = inspect_queue(&dir.path().join("nope.ring"), 64, 0).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
