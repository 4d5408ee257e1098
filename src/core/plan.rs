//! Purpose: Plan deposit transitions for the ring without performing any writes.
//! Exports: `Ring`, `DepositPlan`, `plan_deposit`, `record_head_at`, `position_after`.
//! Role: Pure planning layer used by `pool` to apply deterministic writes under the deposit lock.
//! Invariants: No side effects; output depends only on the ring snapshot, `mem`, and `entry_len`.
//! Invariants: A planned record never overlaps bytes at or after the planned `oldest` one lap back.
//! Invariants: Records never straddle the physical end of the file or touch the header.
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, RECORD_HEAD_LEN, RecordHead};

/// Geometry and pointer snapshot of a pool's data region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ring {
    pub file_size: u64,
    pub header_size: u64,
    pub oldest: u64,
    pub newest: u64,
}

impl Ring {
    pub fn is_empty(&self) -> bool {
        self.newest < self.oldest
    }

    /// Largest record the data region can ever hold.
    pub fn capacity(&self) -> u64 {
        self.file_size - self.header_size
    }

    pub fn phys(&self, pos: u64) -> usize {
        (pos % self.file_size) as usize
    }

    /// Moves a position that landed on a lap boundary past the header.
    pub fn normalize(&self, pos: u64) -> u64 {
        let phys = pos % self.file_size;
        if phys < self.header_size {
            pos - phys + self.header_size
        } else {
            pos
        }
    }

    /// First data byte of the lap after the one containing `pos`.
    pub fn next_lap(&self, pos: u64) -> u64 {
        (pos / self.file_size + 1) * self.file_size + self.header_size
    }

    pub fn fits_before_wrap(&self, pos: u64, len: u64) -> bool {
        self.phys(pos) as u64 + len <= self.file_size
    }

    /// Offset of the first record in the newest lap.
    pub fn first_offset(&self) -> u64 {
        if self.newest < self.file_size {
            return self.oldest;
        }
        ((self.newest / self.file_size) * self.file_size + self.header_size).max(self.oldest)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DepositPlan {
    pub index: u64,
    pub start: u64,
    pub entry_len: u64,
    /// `oldest` after reclamation; written before the record bytes.
    pub oldest: u64,
    pub reclaimed: u64,
}

impl DepositPlan {
    pub fn end(&self) -> u64 {
        self.start + self.entry_len
    }
}

pub fn plan_deposit(
    ring: Ring,
    mem: &[u8],
    entry_len: u64,
    next_index: Option<u64>,
    stop_when_full: bool,
) -> Result<DepositPlan, Error> {
    if ring.file_size <= ring.header_size || ring.file_size > mem.len() as u64 {
        return Err(Error::new(ErrorKind::Corrupt).with_message("ring exceeds mapped bounds"));
    }
    if entry_len > ring.capacity() {
        return Err(Error::new(ErrorKind::RecordTooLarge).with_message(format!(
            "record of {entry_len} bytes exceeds pool capacity of {} bytes",
            ring.capacity()
        )));
    }

    let (start, index) = if ring.is_empty() {
        (ring.oldest, next_index.unwrap_or(0))
    } else {
        let head = record_head_at(mem, &ring, ring.newest)?;
        (
            ring.newest + head.total_len,
            next_index.unwrap_or(head.prefix.index + 1),
        )
    };
    let mut start = ring.normalize(start);
    if !ring.fits_before_wrap(start, entry_len) {
        start = ring.next_lap(start);
    }

    let mut oldest = ring.oldest;
    let mut reclaimed = 0;
    if ring.is_empty() {
        oldest = start;
    } else {
        while start + entry_len > oldest + ring.file_size {
            if stop_when_full {
                return Err(Error::new(ErrorKind::Full)
                    .with_message("pool is full and set to stop when full")
                    .with_hint("Clear the stop-when-full flag or consume and recreate the pool."));
            }
            let head = record_head_at(mem, &ring, oldest)?;
            reclaimed += 1;
            if oldest == ring.newest {
                oldest = start;
                break;
            }
            oldest = position_after(mem, &ring, oldest + head.total_len, head.prefix.index);
        }
    }

    Ok(DepositPlan {
        index,
        start,
        entry_len,
        oldest,
        reclaimed,
    })
}

/// Decodes the head of the record stored at unwrapped position `pos`.
pub fn record_head_at(mem: &[u8], ring: &Ring, pos: u64) -> Result<RecordHead, Error> {
    let phys = ring.phys(pos);
    if (phys as u64) < ring.header_size {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("record position inside header")
            .with_offset(pos));
    }
    let head_end = phys + RECORD_HEAD_LEN;
    if head_end as u64 > ring.file_size || head_end > mem.len() {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("record head crosses end of ring")
            .with_offset(pos));
    }
    let head = frame::decode_head(&mem[phys..head_end]).map_err(|err| err.with_offset(pos))?;
    if phys as u64 + head.total_len > ring.file_size {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("record crosses end of ring")
            .with_offset(pos));
    }
    Ok(head)
}

/// Where the record following `index` begins, given that `index` ends at `end`.
/// The live window spans at most two laps, so the only skipped lap remainder
/// sits just before `first_offset`; bytes past `end` are never decoded here.
pub fn position_after(mem: &[u8], ring: &Ring, end: u64, index: u64) -> u64 {
    let candidate = ring.normalize(end);
    let first = ring.first_offset();
    if first > candidate {
        let starts_lap = record_head_at(mem, ring, first)
            .map(|head| head.prefix.index == index + 1)
            .unwrap_or(false);
        if starts_lap {
            return first;
        }
    }
    candidate
}
