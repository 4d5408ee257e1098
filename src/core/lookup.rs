//! Purpose: Resolve a timestamp to a record index/offset under a direction policy.
//! Exports: `Whence`, `Direction`, `LookupHit`, `lookup`.
//! Role: Uses the sparse index as a coarse anchor, then walks backward record by record.
//! Invariants: Runs on a scratch cursor; the caller's read position is never disturbed.
//! Invariants: Strict directions with no qualifying record fail with `NoSuchRecord`.
use crate::core::cursor::Cursor;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Record;
use crate::core::index::IndexHit;
use crate::core::store::Store;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
    Absolute,
    /// Seconds relative to the timestamp of the given record index.
    Relative(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Nearest,
    NotEarlierThan,
    NotLaterThan,
}

impl Direction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "nearest" => Some(Direction::Nearest),
            "not-earlier-than" | "after" => Some(Direction::NotEarlierThan),
            "not-later-than" | "before" => Some(Direction::NotLaterThan),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LookupHit {
    pub index: u64,
    pub timestamp: f64,
    pub offset: u64,
}

impl From<&Record> for LookupHit {
    fn from(record: &Record) -> Self {
        Self {
            index: record.index,
            timestamp: record.timestamp,
            offset: record.start,
        }
    }
}

pub fn lookup(
    store: &Store,
    timestamp: f64,
    whence: Whence,
    direction: Direction,
) -> Result<LookupHit, Error> {
    let mut scratch = Cursor::new();
    let target = match whence {
        Whence::Absolute => timestamp,
        Whence::Relative(index) => scratch.nth(store, index)?.timestamp + timestamp,
    };

    let anchor = anchor_record(store, &mut scratch, target)?;
    let (earlier, later) = bracket(store, &mut scratch, anchor, target)?;
    tracing::debug!(
        target,
        earlier = earlier.as_ref().map(|record| record.index),
        later = later.as_ref().map(|record| record.index),
        "bracketed lookup"
    );

    let chosen = match direction {
        Direction::Nearest => match (earlier, later) {
            (Some(earlier), Some(later)) => {
                if target - earlier.timestamp < later.timestamp - target {
                    Some(earlier)
                } else {
                    Some(later)
                }
            }
            (earlier, later) => later.or(earlier),
        },
        Direction::NotEarlierThan => later,
        Direction::NotLaterThan => match later {
            Some(later) if later.timestamp == target => Some(later),
            _ => earlier,
        },
    };
    chosen.map(|record| LookupHit::from(&record)).ok_or_else(|| {
        Error::new(ErrorKind::NoSuchRecord)
            .with_message(format!("no record {direction:?} timestamp {target}"))
    })
}

/// First sampled record at or after `target`, or the newest record.
fn anchor_record(store: &Store, scratch: &mut Cursor, target: f64) -> Result<Record, Error> {
    if let Some(region) = store.view().index() {
        if let Some(hit) = region
            .timefind(store.mem(), target)
            .filter(|hit| sample_matches(store, hit))
        {
            match scratch.nth(store, hit.index) {
                Ok(record) => return Ok(record),
                Err(err) if err.kind() == ErrorKind::NoSuchRecord => {
                    tracing::debug!(index = hit.index, "sampled anchor reclaimed; using newest");
                }
                Err(err) => return Err(err),
            }
        }
    }
    let newest = store.newest_index()?;
    scratch.nth(store, newest)
}

/// True when the record at the sampled offset still carries the sampled index.
fn sample_matches(store: &Store, hit: &IndexHit) -> bool {
    match store.index_at(hit.offset) {
        Ok(found) if found == hit.index => true,
        Ok(found) => {
            tracing::debug!(sampled = hit.index, found, "index sample relabelled; using newest");
            false
        }
        Err(_) => false,
    }
}

/// Walks backward from `anchor` until a record earlier than `target` is found.
fn bracket(
    store: &Store,
    scratch: &mut Cursor,
    anchor: Record,
    target: f64,
) -> Result<(Option<Record>, Option<Record>), Error> {
    if anchor.timestamp < target {
        return Ok((Some(anchor), None));
    }
    let mut later = anchor;
    loop {
        if later.index == 0 {
            return Ok((None, Some(later)));
        }
        let prev = match scratch.nth(store, later.index - 1) {
            Ok(record) => record,
            Err(err) if err.kind() == ErrorKind::NoSuchRecord => return Ok((None, Some(later))),
            Err(err) => return Err(err),
        };
        if prev.timestamp < target {
            return Ok((Some(prev), Some(later)));
        }
        later = prev;
    }
}
