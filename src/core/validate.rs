// Pool validation: a full oldest-to-newest scan for explicit checks plus a debug-only tail assertion.
// Full scans are for `verify`; the deposit path only checks the tail.
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::frame::RECORD_OVERHEAD;
use crate::core::plan::{self, Ring};
use crate::core::store::{Store, retry_stompled};

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    pub message: String,
}

impl ValidationIssue {
    fn at(offset: u64, index: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            offset: Some(offset),
            index,
            message: message.into(),
        }
    }

    fn global(message: impl Into<String>) -> Self {
        Self {
            offset: None,
            index: None,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ValidationReport {
    pub records: u64,
    pub oldest_index: Option<u64>,
    pub newest_index: Option<u64>,
    pub index_samples: u64,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Converts the first issue into a `Corrupt` error.
    pub fn into_result(self) -> Result<Self, Error> {
        match self.issues.first() {
            None => Ok(self),
            Some(issue) => {
                let mut err = Error::new(ErrorKind::Corrupt).with_message(format!(
                    "{} ({} issue(s) total)",
                    issue.message,
                    self.issues.len()
                ));
                if let Some(offset) = issue.offset {
                    err = err.with_offset(offset);
                }
                if let Some(index) = issue.index {
                    err = err.with_index(index);
                }
                Err(err)
            }
        }
    }
}

/// Walks every live record and index sample. Retries if a concurrent deposit overtakes the scan.
pub fn scan(store: &Store) -> Result<ValidationReport, Error> {
    retry_stompled(|| scan_once(store))
}

fn scan_once(store: &Store) -> Result<ValidationReport, Error> {
    let ring = store.ring();
    let mut report = ValidationReport::default();
    if !check_pointers(&ring, &mut report) || ring.is_empty() {
        return Ok(report);
    }
    scan_records(store, &ring, &mut report)?;
    scan_index(store, &ring, &mut report)?;
    Ok(report)
}

fn check_pointers(ring: &Ring, report: &mut ValidationReport) -> bool {
    let before = report.issues.len();
    if ring.file_size <= ring.header_size {
        report
            .issues
            .push(ValidationIssue::global("file size does not exceed header size"));
        return false;
    }
    if ring.oldest % ring.file_size < ring.header_size {
        report
            .issues
            .push(ValidationIssue::at(ring.oldest, None, "oldest pointer inside header"));
    }
    if !ring.is_empty() {
        if ring.newest % ring.file_size < ring.header_size {
            report
                .issues
                .push(ValidationIssue::at(ring.newest, None, "newest pointer inside header"));
        }
        if ring.newest >= ring.oldest + ring.file_size {
            report.issues.push(ValidationIssue::at(
                ring.newest,
                None,
                "newest pointer more than one lap ahead of oldest",
            ));
        }
    }
    report.issues.len() == before
}

fn scan_records(store: &Store, ring: &Ring, report: &mut ValidationReport) -> Result<(), Error> {
    let max_steps = ring.capacity() / RECORD_OVERHEAD as u64 + 2;
    let mut pos = ring.oldest;
    let mut expected: Option<u64> = None;
    let mut steps = 0u64;

    loop {
        if steps > max_steps {
            report
                .issues
                .push(ValidationIssue::global("scan exceeded ring capacity"));
            return Ok(());
        }
        let record = match store.read_record(pos) {
            Ok(record) => record,
            Err(err) if err.kind() == ErrorKind::Corrupt => {
                report
                    .issues
                    .push(ValidationIssue::at(pos, expected, err.to_string()));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if let Some(want) = expected {
            if record.index != want {
                report.issues.push(ValidationIssue::at(
                    pos,
                    Some(record.index),
                    format!("expected record {want}, found {}", record.index),
                ));
            }
        } else {
            report.oldest_index = Some(record.index);
        }
        report.records += 1;
        report.newest_index = Some(record.index);

        if pos == ring.newest {
            return Ok(());
        }
        let next = plan::position_after(store.mem(), ring, record.end, record.index);
        if next > ring.newest {
            report.issues.push(ValidationIssue::at(
                next,
                Some(record.index),
                "record chain skips past the newest pointer",
            ));
            return Ok(());
        }
        expected = Some(record.index + 1);
        pos = next;
        steps += 1;
    }
}

fn scan_index(store: &Store, ring: &Ring, report: &mut ValidationReport) -> Result<(), Error> {
    let Some(index) = store.view().index() else {
        return Ok(());
    };
    let meta = index.meta(store.mem());
    if meta.count > meta.capacity {
        report.issues.push(ValidationIssue::global(format!(
            "index count {} exceeds capacity {}",
            meta.count, meta.capacity
        )));
        return Ok(());
    }

    let mut previous: Option<(i64, f64)> = None;
    for n in 0..meta.count {
        let entry = index.entry(store.mem(), n);
        let expected = meta.first + n * meta.step;
        if let Some((offset, timestamp)) = previous {
            if entry.offset <= offset || entry.timestamp < timestamp {
                report.issues.push(ValidationIssue::at(
                    entry.offset.max(0) as u64,
                    Some(expected),
                    "index samples are not monotonic",
                ));
            }
        }
        previous = Some((entry.offset, entry.timestamp));

        // Samples behind `oldest` are dropped lazily on the next compaction.
        if entry.offset < ring.oldest as i64 || entry.offset > ring.newest as i64 {
            continue;
        }
        let offset = entry.offset as u64;
        match store.index_at(offset) {
            Ok(found) if found == expected => report.index_samples += 1,
            Ok(found) => report.issues.push(ValidationIssue::at(
                offset,
                Some(found),
                format!("index sample {n} names record {expected}, found {found}"),
            )),
            Err(err) if err.kind() == ErrorKind::Corrupt => {
                report
                    .issues
                    .push(ValidationIssue::at(offset, Some(expected), err.to_string()));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Panics in debug builds when the oldest record no longer decodes.
pub fn debug_assert_tail(store: &Store) {
    if !cfg!(debug_assertions) {
        return;
    }
    let ring = store.ring();
    if ring.is_empty() {
        return;
    }
    if let Err(err) = plan::record_head_at(store.mem(), &ring, ring.oldest) {
        if err.kind() == ErrorKind::Corrupt {
            panic!("pool tail invariant failed: {err}");
        }
    }
}
