//! Purpose: Maintain the sparse record-index → (offset, timestamp) table stored in the header.
//! Exports: `IndexRegion`, `IndexMeta`, `IndexEntry`, `IndexHit`.
//! Role: Coarse anchor for index seeks and timestamp lookups; lives in the mapped file.
//! Invariants: `count <= capacity`; samples are monotonic in both index and timestamp.
//! Invariants: Sample `n` describes record `first + n * step` and lives in slot `(start + n) % capacity`.
//! Invariants: Readers are lock-free; they re-check `first`/`step`/`start` after reading an entry.
//! Invariants: `count` reads zero while `start`/`first`/`step` are rewritten, so a reader that
//! overlaps a rewrite sees either a changed field or a zero count on its re-check.
use std::sync::atomic::{Ordering, fence};

use crate::core::chunk::{FIELD_LEN, INDEX_ENTRY_LEN, INDEX_FIELD_COUNT, INDEX_SIGNATURE};
use crate::core::error::{Error, ErrorKind};

const SIGNATURE: usize = 0;
const CAPACITY: usize = 1;
const COUNT: usize = 2;
const START: usize = 3;
const STEP: usize = 4;
const FIRST: usize = 5;
const LAST: usize = 6;

/// Upper bound on optimistic retries before a reader gives up on the index.
const MAX_READ_ATTEMPTS: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexMeta {
    pub capacity: u64,
    pub count: u64,
    pub start: u64,
    pub step: u64,
    pub first: u64,
    pub last: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexEntry {
    pub offset: i64,
    pub timestamp: f64,
}

/// A sample located by `find`/`timefind`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexHit {
    pub index: u64,
    pub offset: u64,
    pub timestamp: f64,
}

/// Field offsets of an index table inside the mapped file, fixed at open time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexRegion {
    base: usize,
    capacity: u64,
}

impl IndexRegion {
    pub fn new(base: usize, capacity: u64) -> Self {
        Self { base, capacity }
    }

    /// Bytes occupied by the metadata fields plus the entry table.
    pub fn byte_len(capacity: u64) -> usize {
        INDEX_FIELD_COUNT * FIELD_LEN + capacity as usize * INDEX_ENTRY_LEN
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn end(&self) -> usize {
        self.base + Self::byte_len(self.capacity)
    }

    /// Checks the signature and stored capacity against the layout.
    pub fn verify(&self, mem: &[u8]) -> Result<(), Error> {
        if self.end() > mem.len() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("index exceeds mapped file"));
        }
        if self.get(mem, SIGNATURE) != INDEX_SIGNATURE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad index signature"));
        }
        if self.get(mem, CAPACITY) != self.capacity {
            return Err(Error::new(ErrorKind::Corrupt).with_message("index capacity mismatch"));
        }
        let meta = self.meta(mem);
        if meta.count > meta.capacity || meta.step == 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("index metadata out of range"));
        }
        Ok(())
    }

    /// Writes empty metadata and the `(-1, -1.0)` sentinel into slot 0.
    pub fn initialize(&self, mem: &mut [u8]) {
        self.set(mem, SIGNATURE, INDEX_SIGNATURE);
        self.set(mem, CAPACITY, self.capacity);
        self.set(mem, COUNT, 0);
        self.set(mem, START, 0);
        self.set(mem, STEP, 1);
        self.set(mem, FIRST, 0);
        self.set(mem, LAST, 0);
        for slot in 0..self.capacity {
            self.write_slot(mem, slot, IndexEntry { offset: 0, timestamp: 0.0 });
        }
        if self.capacity > 0 {
            self.write_slot(
                mem,
                0,
                IndexEntry {
                    offset: -1,
                    timestamp: -1.0,
                },
            );
        }
    }

    pub fn meta(&self, mem: &[u8]) -> IndexMeta {
        let meta = IndexMeta {
            capacity: self.get(mem, CAPACITY),
            count: self.get(mem, COUNT),
            start: self.get(mem, START),
            step: self.get(mem, STEP).max(1),
            first: self.get(mem, FIRST),
            last: self.get(mem, LAST),
        };
        fence(Ordering::Acquire);
        meta
    }

    /// The `n`th live sample, counted from the oldest.
    pub fn entry(&self, mem: &[u8], n: u64) -> IndexEntry {
        let slot = (self.get(mem, START) + n) % self.capacity.max(1);
        self.read_slot(mem, slot)
    }

    fn entry_in(&self, mem: &[u8], meta: &IndexMeta, n: u64) -> IndexEntry {
        self.read_slot(mem, (meta.start + n) % self.capacity.max(1))
    }

    fn set_entry(&self, mem: &mut [u8], n: u64, entry: IndexEntry) {
        let slot = (self.get(mem, START) + n) % self.capacity.max(1);
        self.write_slot(mem, slot, entry);
    }

    /// Nearest sample at or before `target`.
    pub fn find(&self, mem: &[u8], target: u64) -> Option<IndexHit> {
        for _ in 0..MAX_READ_ATTEMPTS {
            let meta = self.meta(mem);
            if meta.count == 0 || target < meta.first {
                return None;
            }
            let n = ((target - meta.first) / meta.step).min(meta.count - 1);
            let entry = self.entry_in(mem, &meta, n);
            if self.changed_since(mem, &meta, n) {
                continue;
            }
            if entry.offset <= 0 {
                return None;
            }
            return Some(IndexHit {
                index: meta.first + n * meta.step,
                offset: entry.offset as u64,
                timestamp: entry.timestamp,
            });
        }
        tracing::debug!("index kept changing under find; giving up");
        None
    }

    /// First sample whose timestamp is at or after `target`.
    pub fn timefind(&self, mem: &[u8], target: f64) -> Option<IndexHit> {
        'retry: for _ in 0..MAX_READ_ATTEMPTS {
            let meta = self.meta(mem);
            for n in 0..meta.count {
                let entry = self.entry_in(mem, &meta, n);
                if self.changed_since(mem, &meta, n) {
                    tracing::debug!("index compacted while looking for timestamp");
                    continue 'retry;
                }
                if entry.offset > 0 && entry.timestamp >= target {
                    return Some(IndexHit {
                        index: meta.first + n * meta.step,
                        offset: entry.offset as u64,
                        timestamp: entry.timestamp,
                    });
                }
            }
            return None;
        }
        None
    }

    /// Drops leading samples whose record was reclaimed.
    pub fn garbage_collect(&self, mem: &mut [u8], oldest: u64) {
        let meta = self.meta(mem);
        let mut dead = 0;
        while dead < meta.count && self.entry(mem, dead).offset < oldest as i64 {
            dead += 1;
        }
        if dead == 0 {
            return;
        }
        self.begin_rewrite(mem);
        self.set(mem, START, (meta.start + dead) % meta.capacity.max(1));
        self.set(mem, FIRST, meta.first + dead * meta.step);
        self.end_rewrite(mem, meta.count - dead);
    }

    /// Halves a full table by keeping every other sample and doubling `step`.
    pub fn compact(&self, mem: &mut [u8]) {
        let meta = self.meta(mem);
        if meta.count < meta.capacity {
            return;
        }
        let kept = meta.count.div_ceil(2);
        self.begin_rewrite(mem);
        for n in 1..kept {
            let entry = self.entry_in(mem, &meta, 2 * n);
            self.set_entry(mem, n, entry);
        }
        self.set(mem, STEP, meta.step * 2);
        self.end_rewrite(mem, kept);
    }

    /// Hides every sample from readers until `end_rewrite` republishes the count.
    fn begin_rewrite(&self, mem: &mut [u8]) {
        self.set(mem, COUNT, 0);
        fence(Ordering::SeqCst);
    }

    fn end_rewrite(&self, mem: &mut [u8], count: u64) {
        fence(Ordering::Release);
        self.set(mem, COUNT, count);
    }

    /// Records a sample for record `index` when it falls on the sampling grid.
    pub fn add_entry(&self, mem: &mut [u8], offset: u64, timestamp: f64, index: u64, oldest: u64) {
        if self.capacity == 0 {
            return;
        }
        let meta = self.meta(mem);
        if meta.count > 0 && index < meta.first + meta.count * meta.step {
            self.set(mem, LAST, index);
            return;
        }
        if meta.count == meta.capacity {
            self.garbage_collect(mem, oldest);
        }
        if self.meta(mem).count >= meta.capacity {
            self.compact(mem);
        }
        let meta = self.meta(mem);
        if meta.count == 0 {
            self.set(mem, START, 0);
            self.set(mem, STEP, meta.step);
            self.set(mem, FIRST, index);
        }
        let meta = self.meta(mem);
        if index == meta.first + meta.count * meta.step {
            self.set_entry(
                mem,
                meta.count,
                IndexEntry {
                    offset: offset as i64,
                    timestamp,
                },
            );
            self.set(mem, COUNT, meta.count + 1);
        }
        self.set(mem, LAST, index);
    }

    /// True when sample `n` read under `meta` may belong to a different layout.
    fn changed_since(&self, mem: &[u8], meta: &IndexMeta, n: u64) -> bool {
        fence(Ordering::Acquire);
        let now = self.meta(mem);
        now.count <= n
            || now.first != meta.first
            || now.step != meta.step
            || now.start != meta.start
    }

    fn field(&self, n: usize) -> usize {
        self.base + n * FIELD_LEN
    }

    fn get(&self, mem: &[u8], n: usize) -> u64 {
        let at = self.field(n);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mem[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    fn set(&self, mem: &mut [u8], n: usize, value: u64) {
        let at = self.field(n);
        mem[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn slot_offset(&self, slot: u64) -> usize {
        self.base + INDEX_FIELD_COUNT * FIELD_LEN + slot as usize * INDEX_ENTRY_LEN
    }

    fn read_slot(&self, mem: &[u8], slot: u64) -> IndexEntry {
        let at = self.slot_offset(slot);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mem[at..at + 8]);
        let offset = i64::from_le_bytes(buf);
        buf.copy_from_slice(&mem[at + 8..at + 16]);
        let timestamp = f64::from_bits(u64::from_le_bytes(buf));
        IndexEntry { offset, timestamp }
    }

    fn write_slot(&self, mem: &mut [u8], slot: u64, entry: IndexEntry) {
        let at = self.slot_offset(slot);
        mem[at..at + 8].copy_from_slice(&entry.offset.to_le_bytes());
        mem[at + 8..at + 16].copy_from_slice(&entry.timestamp.to_bits().to_le_bytes());
    }
}
