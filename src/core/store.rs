//! Purpose: Own one mapped pool file and provide checked record access over it.
//! Exports: `Store`, `HeaderSource`, `io_error`.
//! Role: Storage layer beneath `pool`; readers here are lock-free and re-validate `oldest`.
//! Invariants: `oldest` is written before record bytes; `newest` only after they are complete.
//! Invariants: A read whose position falls behind `oldest` while in flight reports `Stompled`.
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{Ordering, fence};

use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::PoolFlag;
use crate::core::frame::{
    self, RECORD_HEAD_LEN, RECORD_TRAILER_LEN, Record, RecordHead, RecordPrefix,
};
use crate::core::header::{HeaderView, LegacyConf, PermBits};
use crate::core::plan::{self, DepositPlan, Ring};

/// Optimistic reads give up after this many consecutive stomples.
pub(crate) const MAX_STOMPLE_RETRIES: usize = 64;

#[derive(Clone, Copy, Debug)]
pub enum HeaderSource {
    Chunked,
    Legacy(LegacyConf),
}

pub struct Store {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    view: HeaderView,
}

impl Store {
    /// Creates the backing file with its header; fails if it already exists.
    pub fn create(path: &Path, header: &[u8], file_size: u64, mode: Option<u32>) -> Result<(), Error> {
        let mut options = OpenOptions::new();
        options.create_new(true).read(true).write(true);
        if let Some(mode) = mode {
            options.mode(mode);
        }
        let mut file = options.open(path).map_err(|err| io_error(path, err))?;
        file.set_len(file_size).map_err(|err| io_error(path, err))?;
        file.write_all(header).map_err(|err| io_error(path, err))?;
        file.sync_all().map_err(|err| io_error(path, err))?;
        tracing::debug!(path = %path.display(), file_size, "created pool file");
        Ok(())
    }

    pub fn open(path: &Path, source: HeaderSource) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| io_error(path, err))?;
        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| io_error(path, err))?;
        if actual_size == 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("pool file is empty")
                .with_path(path));
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|err| io_error(path, err))? };
        let view = match source {
            HeaderSource::Chunked => HeaderView::load_chunked(&mmap),
            HeaderSource::Legacy(conf) => HeaderView::load_legacy(&mmap, &conf),
        }
        .map_err(|err| err.with_path(path))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            view,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn view(&self) -> &HeaderView {
        &self.view
    }

    pub fn mem(&self) -> &[u8] {
        &self.mmap
    }

    pub fn ring(&self) -> Ring {
        let ring = Ring {
            file_size: self.view.file_size(),
            header_size: self.view.header_size(),
            oldest: self.view.oldest(&self.mmap),
            newest: self.view.newest(&self.mmap),
        };
        fence(Ordering::Acquire);
        ring
    }

    pub fn oldest(&self) -> u64 {
        self.view.oldest(&self.mmap)
    }

    pub fn flags(&self) -> i64 {
        self.view.flags(&self.mmap)
    }

    pub fn has_flag(&self, flag: PoolFlag) -> bool {
        self.flags() & flag.bit() != 0
    }

    pub fn perm(&self) -> Option<PermBits> {
        self.view.perm(&self.mmap)
    }

    pub fn set_flags(&mut self, flags: i64) -> Result<(), Error> {
        let view = self.view;
        view.set_flags(&mut self.mmap, flags)
    }

    pub fn set_perm(&mut self, perm: PermBits) {
        let view = self.view;
        view.set_perm(&mut self.mmap, perm);
    }

    /// Fails with `Stompled` once `oldest` has moved past `pos`.
    fn check_live(&self, pos: u64) -> Result<(), Error> {
        fence(Ordering::Acquire);
        if pos < self.oldest() {
            return Err(Error::new(ErrorKind::Stompled)
                .with_message("record reclaimed while reading")
                .with_offset(pos));
        }
        Ok(())
    }

    /// Rejects positions outside the live `[oldest, newest]` window.
    /// A position behind `oldest` was reclaimed after it was located.
    fn check_readable(&self, ring: &Ring, pos: u64) -> Result<(), Error> {
        if ring.is_empty() {
            return Err(Error::new(ErrorKind::NoSuchRecord).with_message("pool is empty"));
        }
        if pos < ring.oldest {
            return Err(Error::new(ErrorKind::Stompled)
                .with_message("oldest pointer has advanced beyond position")
                .with_offset(pos));
        }
        if pos > ring.newest {
            return Err(Error::new(ErrorKind::NoSuchRecord)
                .with_message("position is beyond the newest record")
                .with_offset(pos));
        }
        Ok(())
    }

    pub fn read_head(&self, pos: u64) -> Result<RecordHead, Error> {
        let ring = self.ring();
        self.check_readable(&ring, pos)?;
        let head = plan::record_head_at(&self.mmap, &ring, pos);
        self.check_live(pos)?;
        head
    }

    pub fn index_at(&self, pos: u64) -> Result<u64, Error> {
        self.read_head(pos).map(|head| head.prefix.index)
    }

    /// Copies out the record starting at unwrapped position `pos`.
    pub fn read_record(&self, pos: u64) -> Result<Record, Error> {
        let ring = self.ring();
        let head = self.read_head(pos)?;
        let phys = ring.phys(pos);
        let body = phys + RECORD_HEAD_LEN;
        let payload = self.mmap[body..body + head.payload_len as usize].to_vec();
        let jumpback = frame::read_u64(
            &self.mmap,
            phys + head.total_len as usize - RECORD_TRAILER_LEN,
        );
        self.check_live(pos)?;
        if jumpback != head.total_len {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "record jumpback {jumpback} disagrees with length {}",
                    head.total_len
                ))
                .with_index(head.prefix.index)
                .with_offset(pos));
        }
        Ok(Record {
            index: head.prefix.index,
            timestamp: head.prefix.timestamp,
            payload,
            start: pos,
            end: pos + head.total_len,
        })
    }

    /// Start of the record preceding the one at `pos`, via its trailing jumpback.
    /// `None` at a lap start, where the predecessor is not adjacent.
    pub fn position_before(&self, pos: u64) -> Result<Option<u64>, Error> {
        let ring = self.ring();
        if ring.is_empty() || pos <= ring.oldest {
            return Err(Error::new(ErrorKind::NoSuchRecord)
                .with_message("already at the oldest record")
                .with_offset(pos));
        }
        let phys = ring.phys(pos);
        if phys as u64 <= ring.header_size {
            return Ok(None);
        }
        let jumpback = frame::read_u64(&self.mmap, phys - 8);
        let prev = pos.saturating_sub(jumpback);
        self.check_live(prev)?;
        if jumpback == 0 || jumpback % 8 != 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("bad jumpback {jumpback}"))
                .with_offset(pos));
        }
        Ok(Some(prev))
    }

    pub fn newest_index(&self) -> Result<u64, Error> {
        retry_stompled(|| {
            let ring = self.ring();
            if ring.is_empty() {
                return Err(Error::new(ErrorKind::NoSuchRecord).with_message("pool is empty"));
            }
            self.index_at(ring.newest)
        })
    }

    pub fn oldest_index(&self) -> Result<u64, Error> {
        retry_stompled(|| {
            let ring = self.ring();
            if ring.is_empty() {
                return Err(Error::new(ErrorKind::NoSuchRecord).with_message("pool is empty"));
            }
            self.index_at(ring.oldest)
        })
    }

    /// Index and offset of the first record in the newest lap; `None` when empty.
    pub fn first_index_and_offset(&self) -> Result<Option<(u64, u64)>, Error> {
        retry_stompled(|| {
            let ring = self.ring();
            if ring.is_empty() {
                return Ok(None);
            }
            let first_pos = ring.first_offset();
            Ok(Some((self.index_at(first_pos)?, first_pos)))
        })
    }

    /// Bytes between `oldest` and the end of the newest record.
    pub fn size_used(&self) -> Result<u64, Error> {
        retry_stompled(|| {
            let ring = self.ring();
            if ring.is_empty() {
                return Ok(0);
            }
            let head = self.read_head(ring.newest)?;
            Ok(ring.newest + head.total_len - ring.oldest)
        })
    }

    /// Applies a deposit plan. Caller holds the deposit lock.
    pub fn apply_deposit(
        &mut self,
        plan: &DepositPlan,
        timestamp: f64,
        payload: &[u8],
    ) -> Result<(), Error> {
        let view = self.view;
        let ring = self.ring();
        let phys = ring.phys(plan.start);
        let end = phys + plan.entry_len as usize;
        if end as u64 > ring.file_size {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("planned record crosses end of ring")
                .with_offset(plan.start));
        }

        view.set_oldest(&mut self.mmap, plan.oldest);
        fence(Ordering::SeqCst);
        let prefix = RecordPrefix {
            timestamp,
            index: plan.index,
        };
        frame::encode_record(&mut self.mmap[phys..end], prefix, payload)?;
        fence(Ordering::Release);
        view.set_newest(&mut self.mmap, plan.start);
        view.set_next_index(&mut self.mmap, plan.index + 1);
        if let Some(index) = view.index() {
            index.add_entry(&mut self.mmap, plan.start, timestamp, plan.index, plan.oldest);
        }
        if self.has_flag(PoolFlag::Sync) {
            self.mmap
                .flush()
                .map_err(|err| io_error(&self.path, err))?;
        }
        Ok(())
    }
}

/// Re-runs `op` while it reports `Stompled`, up to a fixed bound.
pub(crate) fn retry_stompled<T>(mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    let mut attempts = 0;
    loop {
        match op() {
            Err(err) if err.kind() == ErrorKind::Stompled && attempts < MAX_STOMPLE_RETRIES => {
                attempts += 1;
                tracing::debug!(attempts, "retrying stompled read");
            }
            other => return other,
        }
    }
}

pub fn io_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind).with_path(path).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{HeaderSource, Store};
    use crate::core::error::ErrorKind;
    use crate::core::frame::entry_len;
    use crate::core::header::{HeaderSpec, PermBits, encode_chunked_header};
    use crate::core::plan::plan_deposit;

    fn store_with(dir: &tempfile::TempDir, file_size: u64, index_capacity: u64) -> Store {
        let path = dir.path().join("mmap-pool");
        let header = encode_chunked_header(&HeaderSpec {
            file_size,
            index_capacity,
            sem_key: 0,
            flags: 0,
            perm: PermBits::default(),
        })
        .expect("header");
        Store::create(&path, &header, file_size, Some(0o600)).expect("create");
        Store::open(&path, HeaderSource::Chunked).expect("open")
    }

    fn deposit(store: &mut Store, payload: &[u8]) -> u64 {
        let len = entry_len(payload.len()).expect("len");
        let next = store.view().next_index(store.mem());
        let plan = plan_deposit(store.ring(), store.mem(), len, next, false).expect("plan");
        store
            .apply_deposit(&plan, plan.index as f64, payload)
            .expect("apply");
        plan.start
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _store = store_with(&dir, 4096, 0);
        let err = Store::create(&dir.path().join("mmap-pool"), &[], 4096, None)
            .expect_err("exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn empty_pool_has_no_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_with(&dir, 4096, 0);
        assert!(store.ring().is_empty());
        assert_eq!(store.size_used().expect("size"), 0);
        assert_eq!(
            store.newest_index().expect_err("empty").kind(),
            ErrorKind::NoSuchRecord
        );
        assert_eq!(store.first_index_and_offset().expect("first"), None);
    }

    #[test]
    fn deposited_records_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_with(&dir, 4096, 4);
        let first = deposit(&mut store, b"alpha");
        let second = deposit(&mut store, b"beta");

        let record = store.read_record(first).expect("first");
        assert_eq!(record.index, 0);
        assert_eq!(record.payload, b"alpha");
        assert_eq!(record.end, second);
        assert_eq!(store.read_record(second).expect("second").payload, b"beta");
        assert_eq!(store.position_before(second).expect("before"), Some(first));
        assert_eq!(store.newest_index().expect("newest"), 1);
        assert_eq!(store.oldest_index().expect("oldest"), 0);
        assert_eq!(store.view().next_index(store.mem()), Some(2));
        assert_eq!(
            store.size_used().expect("size"),
            second + entry_len(4).expect("len") - first
        );
    }

    #[test]
    fn reads_outside_live_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_with(&dir, 4096, 0);
        let first = deposit(&mut store, b"only");
        let err = store.read_record(first + 4096).expect_err("beyond");
        assert_eq!(err.kind(), ErrorKind::NoSuchRecord);
        let err = store.read_record(first - 8).expect_err("behind");
        assert_eq!(err.kind(), ErrorKind::Stompled);
        let err = store.position_before(first).expect_err("oldest");
        assert_eq!(err.kind(), ErrorKind::NoSuchRecord);
    }

    #[test]
    fn position_reclaimed_after_locating_is_stompled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_with(&dir, 4096, 0);
        let located = deposit(&mut store, &[0u8; 60]);
        assert_eq!(store.read_record(located).expect("live").index, 0);

        for _ in 0..200 {
            deposit(&mut store, &[1u8; 60]);
        }
        assert!(store.oldest_index().expect("oldest") > 0);
        let err = store.read_record(located).expect_err("reclaimed");
        assert_eq!(err.kind(), ErrorKind::Stompled);
        let err = store.read_head(located).expect_err("reclaimed head");
        assert_eq!(err.kind(), ErrorKind::Stompled);
    }

    #[test]
    fn reopen_sees_pointer_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_with(&dir, 4096, 0);
        let pos = deposit(&mut store, b"persisted");
        drop(store);
        let reopened =
            Store::open(&dir.path().join("mmap-pool"), HeaderSource::Chunked).expect("reopen");
        assert_eq!(reopened.ring().newest, pos);
        assert_eq!(reopened.read_record(pos).expect("read").payload, b"persisted");
    }
}
