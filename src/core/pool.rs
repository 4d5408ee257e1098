//! Purpose: The pool engine: lifecycle, deposit, cursor reads, lookups, and blocking waits.
//! Exports: `Pool`, `Deposit`, `Decoded`, `PoolInfo`, `Timeout`.
//! Role: Composes layout, store, cursor, semaphores, notification, and advisory locks.
//! Invariants: Deposits hold the deposit lock from planning until `newest` is published.
//! Invariants: Lock order is config, then deposit, then notification.
//! Invariants: Every open handle holds a shared flock; dispose/rename/sleep need it exclusive.
use std::fs;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;

use crate::core::codec::RecordCodec;
use crate::core::cursor::Cursor;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{PoolFlag, SIZE_MAX};
use crate::core::frame::{self, Record};
use crate::core::header::{
    self, HeaderFormat, HeaderSpec, PermBits, chunked_header_size, legacy_header_size,
};
use crate::core::layout::{
    self, DirPerm, MmapConf, PoolConf, PoolLayout, PoolPaths, SINGLE_FILE_NOTIFICATION_DIR,
};
use crate::core::lock::{self, ConfigLock};
use crate::core::lookup::{self, Direction, LookupHit, Whence};
use crate::core::notify::{self, Awaiter, WaitOutcome};
use crate::core::options::{PoolChanges, PoolOptions};
use crate::core::plan;
use crate::core::semaphore::{LockSlot, PoolSemaphores};
use crate::core::store::{HeaderSource, Store, io_error};
use crate::core::validate::{self, ValidationReport};

const DEFAULT_SEM_MODE: u32 = 0o666;

/// How long a blocking read may wait for a deposit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Fail with `AwaitTimedOut` instead of blocking.
    NoWait,
    Forever,
    After(Duration),
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::After(duration) => Some(Instant::now() + duration),
            Timeout::NoWait | Timeout::Forever => None,
        }
    }

    fn remaining(self, deadline: Option<Instant>) -> Timeout {
        match (self, deadline) {
            (Timeout::After(_), Some(deadline)) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Timeout::NoWait
                } else {
                    Timeout::After(left)
                }
            }
            (other, _) => other,
        }
    }
}

/// Outcome of a successful deposit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Deposit {
    pub index: u64,
    pub timestamp: f64,
    pub offset: u64,
}

/// A record decoded through a codec.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded<T> {
    pub index: u64,
    pub timestamp: f64,
    pub value: T,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolInfo {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub path: PathBuf,
    pub layout: PoolLayout,
    pub size: u64,
    pub size_used: u64,
    pub header_size: u64,
    pub mmap_pool_version: u32,
    pub payload_version: u8,
    pub sem_key: i64,
    pub index_capacity: u64,
    pub index_step: u64,
    pub index_count: u64,
    pub oldest_index: Option<u64>,
    pub newest_index: Option<u64>,
    pub stop_when_full: bool,
    pub frozen: bool,
    pub auto_dispose: bool,
    pub checksum: bool,
    pub sync: bool,
}

pub struct Pool {
    paths: PoolPaths,
    store: Store,
    cursor: Cursor,
    semaphores: PoolSemaphores,
    legacy_perm: Option<PermBits>,
}

impl Pool {
    /// Creates a new pool at `path`. Fails with `AlreadyExists` if anything is there.
    pub fn create(path: impl AsRef<Path>, options: &PoolOptions) -> Result<(), Error> {
        let path = path.as_ref();
        let _config = ConfigLock::acquire(path)?;
        create_unlocked(path, options)
    }

    /// Opens an existing pool with the cursor just after its newest record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let paths = PoolPaths::discover(path.as_ref())?;
        Self::open_paths(paths)
    }

    pub fn participate(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open(path)
    }

    /// Opens `path`, first creating it with `options` if it does not exist.
    pub fn participate_creatingly(
        path: impl AsRef<Path>,
        options: &PoolOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let _config = ConfigLock::acquire(path)?;
        if !Self::exists(path) {
            create_unlocked(path, options)?;
        }
        Self::open(path)
    }

    fn open_paths(paths: PoolPaths) -> Result<Self, Error> {
        let (store, legacy_perm) = open_store(&paths)?;
        lock::lock_shared(store.file(), &paths.mmap_file)?;
        let perm = store.perm().or(legacy_perm).unwrap_or_default();
        let semaphores = PoolSemaphores::attach(store.view().sem_key(), sem_mode(&perm))?;
        let cursor = Cursor::attach(&store)?;
        tracing::debug!(
            pool = %paths.root.display(),
            layout = ?paths.layout,
            "opened pool"
        );
        Ok(Self {
            paths,
            store,
            cursor,
            semaphores,
            legacy_perm,
        })
    }

    /// Closes the handle, disposing the pool if it is auto-dispose and now unused.
    pub fn close(self) -> Result<(), Error> {
        if !self.store.has_flag(PoolFlag::AutoDispose) {
            drop(self);
            return Ok(());
        }
        let root = self.paths.root.clone();
        let _config = ConfigLock::acquire(&root)?;
        drop(self);
        match dispose_unlocked(&root) {
            Err(err) if err.kind() == ErrorKind::InUse => {
                tracing::debug!(pool = %root.display(), "auto-dispose skipped; pool still in use");
                Ok(())
            }
            other => other,
        }
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        layout::characterize(path.as_ref()).is_ok()
    }

    /// True when any handle (this process included) has the pool open.
    pub fn check_in_use(path: impl AsRef<Path>) -> Result<bool, Error> {
        let paths = PoolPaths::discover(path.as_ref())?;
        match lock::try_exclusive(&paths.mmap_file) {
            Ok(_unused) => Ok(false),
            Err(err) if err.kind() == ErrorKind::InUse => Ok(true),
            Err(err) => Err(err),
        }
    }

    /// Destroys the semaphore set and removes every file of an unused pool.
    pub fn dispose(path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let _config = ConfigLock::acquire(path)?;
        dispose_unlocked(path)
    }

    /// Moves an unused pool to `to`.
    pub fn rename(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), Error> {
        let (from, to) = (from.as_ref(), to.as_ref());
        let (from_lock, to_lock) = (lock::config_lock_path(from), lock::config_lock_path(to));
        if from_lock == to_lock {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message("rename target already exists")
                .with_path(to));
        }
        let (_first, _second) = if from_lock < to_lock {
            (ConfigLock::acquire(from)?, ConfigLock::acquire(to)?)
        } else {
            let second = ConfigLock::acquire(to)?;
            (ConfigLock::acquire(from)?, second)
        };
        rename_unlocked(from, to)
    }

    /// Releases the semaphore set of an unused pool; the next open recreates it.
    pub fn sleep(path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let _config = ConfigLock::acquire(path)?;
        let paths = PoolPaths::discover(path)?;
        let _exclusive = lock::try_exclusive(&paths.mmap_file)?;
        let (store, _) = open_store(&paths)?;
        PoolSemaphores::destroy_key(store.view().sem_key())?;
        tracing::debug!(pool = %path.display(), "pool asleep");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &PoolPaths {
        &self.paths
    }

    pub fn layout(&self) -> PoolLayout {
        self.paths.layout
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn file_size(&self) -> u64 {
        self.store.view().file_size()
    }

    pub fn header_size(&self) -> u64 {
        self.store.view().header_size()
    }

    pub fn index_capacity(&self) -> u64 {
        self.store
            .view()
            .index()
            .map(|index| index.capacity())
            .unwrap_or(0)
    }

    pub fn size_used(&self) -> Result<u64, Error> {
        self.store.size_used()
    }

    pub fn has_flag(&self, flag: PoolFlag) -> bool {
        self.store.has_flag(flag)
    }

    /// Appends `payload` as the next record and wakes every awaiter.
    pub fn deposit(&mut self, payload: &[u8]) -> Result<Deposit, Error> {
        self.ensure_thawed()?;
        let entry_len = frame::entry_len(payload.len()).ok_or_else(|| {
            Error::new(ErrorKind::RecordTooLarge)
                .with_message(format!("payload of {} bytes cannot be framed", payload.len()))
        })?;

        let guard = self.semaphores.lock(LockSlot::Deposit)?;
        // The flag may have been set while this handle waited for the lock.
        self.ensure_thawed()?;
        let stop_when_full = self.store.has_flag(PoolFlag::StopWhenFull);
        let next_index = self.store.view().next_index(self.store.mem());
        let plan = plan::plan_deposit(
            self.store.ring(),
            self.store.mem(),
            entry_len,
            next_index,
            stop_when_full,
        )?;
        let timestamp = now_timestamp();
        self.store.apply_deposit(&plan, timestamp, payload)?;
        validate::debug_assert_tail(&self.store);
        guard.release()?;
        if plan.reclaimed > 0 {
            tracing::trace!(reclaimed = plan.reclaimed, index = plan.index, "reclaimed records");
        }

        self.wake_awaiters()?;
        Ok(Deposit {
            index: plan.index,
            timestamp,
            offset: plan.start,
        })
    }

    pub fn deposit_with<C: RecordCodec>(
        &mut self,
        codec: &C,
        record: &C::Record,
    ) -> Result<Deposit, Error> {
        let payload = codec.serialize(record)?;
        self.deposit(&payload)
    }

    fn wake_awaiters(&self) -> Result<(), Error> {
        let guard = self.semaphores.lock(LockSlot::Notification)?;
        match notify::wake_all(&self.paths.notification_dir) {
            Ok(woken) if woken > 0 => tracing::trace!(woken, "woke awaiters"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "failed to scan notification directory"),
        }
        guard.release()
    }

    fn add_awaiter(&self) -> Result<Awaiter, Error> {
        let guard = self.semaphores.lock(LockSlot::Notification)?;
        let awaiter = Awaiter::register(&self.paths.notification_dir)?;
        guard.release()?;
        Ok(awaiter)
    }

    fn remove_awaiter(&self, awaiter: Awaiter) -> Result<(), Error> {
        let guard = self.semaphores.lock(LockSlot::Notification)?;
        awaiter.remove()?;
        guard.release()
    }

    /// Blocks until a record after the cursor exists, the timeout passes, or `interrupt` fires.
    pub fn wait(&mut self, timeout: Timeout, interrupt: Option<BorrowedFd<'_>>) -> Result<(), Error> {
        let awaiter = self.add_awaiter()?;
        let at_end = match self.cursor.at_end(&self.store) {
            Ok(at_end) => at_end,
            Err(err) => {
                self.remove_awaiter(awaiter)?;
                return Err(err);
            }
        };
        if !at_end {
            return self.remove_awaiter(awaiter);
        }
        let limit = match timeout {
            Timeout::NoWait => {
                self.remove_awaiter(awaiter)?;
                return Err(timed_out());
            }
            Timeout::Forever => None,
            Timeout::After(duration) => Some(duration),
        };
        let outcome = awaiter.wait(limit, interrupt);
        self.remove_awaiter(awaiter)?;
        match outcome? {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut => Err(timed_out()),
            WaitOutcome::Interrupted => Err(Error::new(ErrorKind::AwaitInterrupted)
                .with_message("wait interrupted")
                .with_path(&self.paths.root)),
        }
    }

    /// Next record after the cursor, waiting for one to be deposited if needed.
    pub fn await_next(
        &mut self,
        timeout: Timeout,
        interrupt: Option<BorrowedFd<'_>>,
    ) -> Result<Record, Error> {
        let deadline = timeout.deadline();
        loop {
            match self.cursor.next(&self.store) {
                Ok(record) => return Ok(record),
                Err(err) if err.kind() == ErrorKind::NoSuchRecord => {}
                Err(err) => return Err(err),
            }
            let remaining = timeout.remaining(deadline);
            if remaining == Timeout::NoWait {
                return Err(timed_out());
            }
            self.wait(remaining, interrupt)?;
        }
    }

    /// Record `index`, waiting for it to be deposited if it is still in the future.
    pub fn await_nth(
        &mut self,
        index: u64,
        timeout: Timeout,
        interrupt: Option<BorrowedFd<'_>>,
    ) -> Result<Record, Error> {
        let deadline = timeout.deadline();
        loop {
            match self.cursor.nth(&self.store, index) {
                Ok(record) => return Ok(record),
                Err(err) if err.kind() == ErrorKind::NoSuchRecord => {
                    if let Ok(oldest) = self.store.oldest_index() {
                        if index < oldest {
                            return Err(err);
                        }
                    }
                }
                Err(err) => return Err(err),
            }
            let remaining = timeout.remaining(deadline);
            if remaining == Timeout::NoWait {
                return Err(timed_out());
            }
            self.cursor.runout(&self.store)?;
            self.wait(remaining, interrupt)?;
        }
    }

    pub fn next(&mut self) -> Result<Record, Error> {
        self.cursor.next(&self.store)
    }

    pub fn prev(&mut self) -> Result<Record, Error> {
        self.cursor.prev(&self.store)
    }

    pub fn curr(&mut self) -> Result<Record, Error> {
        self.cursor.curr(&self.store)
    }

    pub fn nth(&mut self, index: u64) -> Result<Record, Error> {
        self.cursor.nth(&self.store, index)
    }

    pub fn nth_with<C: RecordCodec>(
        &mut self,
        codec: &C,
        index: u64,
    ) -> Result<Decoded<C::Record>, Error> {
        let record = self.nth(index)?;
        decode(codec, &record)
    }

    /// Positions the cursor so the next read returns record `index`.
    pub fn seek_to(&mut self, index: u64) -> Result<u64, Error> {
        self.cursor.seek_to(&self.store, index)
    }

    pub fn rewind(&mut self) {
        self.cursor.rewind(&self.store);
    }

    pub fn to_last(&mut self) {
        self.cursor.to_last(&self.store);
    }

    pub fn runout(&mut self) -> Result<(), Error> {
        self.cursor.runout(&self.store)
    }

    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    pub fn newest_index(&self) -> Result<u64, Error> {
        self.store.newest_index()
    }

    pub fn oldest_index(&self) -> Result<u64, Error> {
        self.store.oldest_index()
    }

    /// Index of the first record in the newest lap of the ring.
    pub fn first_index(&self) -> Result<Option<u64>, Error> {
        Ok(self.store.first_index_and_offset()?.map(|(index, _)| index))
    }

    pub fn lookup(
        &self,
        timestamp: f64,
        whence: Whence,
        direction: Direction,
    ) -> Result<LookupHit, Error> {
        lookup::lookup(&self.store, timestamp, whence, direction)
    }

    pub fn index_lookup(
        &self,
        timestamp: f64,
        whence: Whence,
        direction: Direction,
    ) -> Result<u64, Error> {
        self.lookup(timestamp, whence, direction).map(|hit| hit.index)
    }

    pub fn offset_lookup(
        &self,
        timestamp: f64,
        whence: Whence,
        direction: Direction,
    ) -> Result<u64, Error> {
        self.lookup(timestamp, whence, direction).map(|hit| hit.offset)
    }

    pub fn info(&self) -> Result<PoolInfo, Error> {
        let view = self.store.view();
        let (index_capacity, index_step, index_count) = match view.index() {
            Some(index) => {
                let meta = index.meta(self.store.mem());
                (meta.capacity, meta.step, meta.count)
            }
            None => (0, 1, 0),
        };
        Ok(PoolInfo {
            kind: "mmap",
            path: self.paths.root.clone(),
            layout: self.paths.layout,
            size: view.file_size(),
            size_used: self.store.size_used()?,
            header_size: view.header_size(),
            mmap_pool_version: match view.format() {
                HeaderFormat::Chunked => 1,
                HeaderFormat::Legacy => 0,
            },
            payload_version: view.payload_version(),
            sem_key: view.sem_key(),
            index_capacity,
            index_step,
            index_count,
            oldest_index: optional_index(self.store.oldest_index())?,
            newest_index: optional_index(self.store.newest_index())?,
            stop_when_full: self.has_flag(PoolFlag::StopWhenFull),
            frozen: self.has_flag(PoolFlag::Frozen),
            auto_dispose: self.has_flag(PoolFlag::AutoDispose),
            checksum: self.has_flag(PoolFlag::Checksum),
            sync: self.has_flag(PoolFlag::Sync),
        })
    }

    fn ensure_thawed(&self) -> Result<(), Error> {
        if self.store.has_flag(PoolFlag::Frozen) {
            return Err(Error::new(ErrorKind::Frozen)
                .with_message("pool is frozen")
                .with_path(&self.paths.root));
        }
        Ok(())
    }

    pub fn set_flag(&mut self, flag: PoolFlag, on: bool) -> Result<(), Error> {
        let guard = self.semaphores.lock(LockSlot::Deposit)?;
        write_flag(&mut self.store, flag, on)?;
        guard.release()
    }

    /// Applies permission and flag edits under the deposit lock.
    pub fn change_options(&mut self, changes: &PoolChanges) -> Result<(), Error> {
        let guard = self.semaphores.lock(LockSlot::Deposit)?;
        if let Some(size) = changes.size {
            if size != self.store.view().file_size() {
                return Err(Error::new(ErrorKind::InvalidSize)
                    .with_message("pools cannot be resized")
                    .with_path(&self.paths.root));
            }
        }
        for (flag, on) in &changes.flags {
            write_flag(&mut self.store, *flag, *on)?;
        }

        let current = self
            .store
            .perm()
            .or(self.legacy_perm)
            .unwrap_or(DirPerm::default().bits());
        let requested = DirPerm {
            mode: changes.mode,
            uid: changes.owner,
            gid: changes.group,
        };
        let updated = PermBits {
            mode: changes.mode.map(i64::from).unwrap_or(current.mode),
            uid: changes.owner.map(i64::from).unwrap_or(current.uid),
            gid: changes.group.map(i64::from).unwrap_or(current.gid),
        };
        if updated != current {
            requested.for_files().apply(&self.paths.mmap_file)?;
            match self.store.view().format() {
                HeaderFormat::Chunked => self.store.set_perm(updated),
                HeaderFormat::Legacy => {
                    save_legacy_pool_conf(&self.paths, updated, self.store.view().sem_key())?;
                    self.legacy_perm = Some(updated);
                }
            }
            tracing::debug!(pool = %self.paths.root.display(), "updated pool permissions");
        }
        guard.release()
    }

    pub fn validate(&self) -> Result<ValidationReport, Error> {
        validate::scan(&self.store)
    }
}

pub fn decode<C: RecordCodec>(codec: &C, record: &Record) -> Result<Decoded<C::Record>, Error> {
    let value = codec
        .deserialize(&record.payload)
        .map_err(|err| err.with_index(record.index))?;
    Ok(Decoded {
        index: record.index,
        timestamp: record.timestamp,
        value,
    })
}

/// Seconds since the Unix epoch.
pub fn now_timestamp() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

fn timed_out() -> Error {
    Error::new(ErrorKind::AwaitTimedOut).with_message("no record arrived before the timeout")
}

fn optional_index(result: Result<u64, Error>) -> Result<Option<u64>, Error> {
    match result {
        Ok(index) => Ok(Some(index)),
        Err(err) if err.kind() == ErrorKind::NoSuchRecord => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_flag(store: &mut Store, flag: PoolFlag, on: bool) -> Result<(), Error> {
    let flags = store.flags();
    let updated = if on {
        flags | flag.bit()
    } else {
        flags & !flag.bit()
    };
    if updated == flags {
        return Ok(());
    }
    store.set_flags(updated).map_err(|err| {
        err.with_message(format!("config-in-file pools cannot set '{}'", flag.name()))
    })?;
    tracing::debug!(flag = flag.name(), on, "changed pool flag");
    Ok(())
}

fn sem_mode(perm: &PermBits) -> u32 {
    if perm.mode >= 0 {
        (perm.mode as u32) & 0o666
    } else {
        DEFAULT_SEM_MODE
    }
}

fn open_store(paths: &PoolPaths) -> Result<(Store, Option<PermBits>), Error> {
    match paths.layout {
        PoolLayout::ConfigInFile => {
            let (conf, perm) = layout::load_legacy_conf(paths)?;
            Ok((Store::open(&paths.mmap_file, HeaderSource::Legacy(conf))?, perm))
        }
        PoolLayout::ConfigInMmap | PoolLayout::SingleFile => {
            Ok((Store::open(&paths.mmap_file, HeaderSource::Chunked)?, None))
        }
    }
}

fn save_legacy_pool_conf(paths: &PoolPaths, perm: PermBits, sem_key: i64) -> Result<(), Error> {
    let Some(pool_conf) = &paths.pool_conf else {
        return Ok(());
    };
    let mode = (perm.mode >= 0).then_some((perm.mode as u32) & 0o666);
    layout::write_json(pool_conf, &PoolConf::legacy(perm, sem_key), mode)
}

fn create_unlocked(path: &Path, options: &PoolOptions) -> Result<(), Error> {
    if fs::symlink_metadata(path).is_ok() {
        return Err(Error::new(ErrorKind::AlreadyExists)
            .with_message("pool already exists")
            .with_path(path));
    }
    let layout = options.layout();
    let header_size = if layout.is_chunked() {
        chunked_header_size(options.index_capacity)
    } else {
        legacy_header_size(options.index_capacity)
    };
    if options.size <= header_size || options.size > SIZE_MAX {
        return Err(Error::new(ErrorKind::InvalidSize)
            .with_message(format!(
                "invalid size {}; must exceed {header_size} and be at most {SIZE_MAX}",
                options.size
            ))
            .with_path(path));
    }
    if !layout.is_chunked() && options.flags() != 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("config-in-file pools cannot carry flags")
            .with_hint("Create the pool with resizable=true to use pool flags."));
    }

    let paths = PoolPaths::new(path, layout)?;
    let perm = options.dir_perm();
    let semaphores = PoolSemaphores::create_fresh(sem_mode(&perm.bits()))?;
    let sem_key = semaphores.key();
    match write_pool_files(&paths, options, header_size, &perm, sem_key) {
        Ok(()) => {
            tracing::debug!(
                pool = %path.display(),
                layout = ?layout,
                size = options.size,
                sem_key = format_args!("{sem_key:#x}"),
                "created pool"
            );
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = semaphores.destroy() {
                tracing::warn!(error = %cleanup, "failed to destroy semaphores of failed create");
            }
            remove_pool_files(&paths);
            Err(err)
        }
    }
}

fn write_pool_files(
    paths: &PoolPaths,
    options: &PoolOptions,
    header_size: u64,
    perm: &DirPerm,
    sem_key: i64,
) -> Result<(), Error> {
    let dirs = perm.for_directories();
    if paths.owns_root() {
        layout::make_dirs(&paths.root, &dirs)?;
    }
    layout::make_dirs(&paths.notification_dir, &dirs)?;

    let header = if paths.layout.is_chunked() {
        header::encode_chunked_header(&HeaderSpec {
            file_size: options.size,
            index_capacity: options.index_capacity,
            sem_key,
            flags: options.flags(),
            perm: perm.bits(),
        })?
    } else {
        header::encode_legacy_header(options.index_capacity)?
    };
    let files = perm.for_files();
    Store::create(&paths.mmap_file, &header, options.size, files.mode)?;
    files.apply(&paths.mmap_file)?;

    if let Some(pool_conf) = &paths.pool_conf {
        let conf = if paths.layout.is_chunked() {
            PoolConf::for_layout(paths.layout)
        } else {
            PoolConf::legacy(perm.bits(), sem_key)
        };
        layout::write_json(pool_conf, &conf, files.mode)?;
    }
    if let Some(mmap_conf) = &paths.mmap_conf {
        let conf = MmapConf {
            header_size,
            file_size: options.size,
            index_capacity: options.index_capacity,
        };
        layout::write_json(mmap_conf, &conf, files.mode)?;
    }
    Ok(())
}

fn dispose_unlocked(path: &Path) -> Result<(), Error> {
    let paths = PoolPaths::discover(path)?;
    let exclusive = lock::try_exclusive(&paths.mmap_file)?;
    match open_store(&paths) {
        Ok((store, _)) => PoolSemaphores::destroy_key(store.view().sem_key())?,
        Err(err) if err.kind() == ErrorKind::Corrupt => {
            tracing::warn!(pool = %path.display(), error = %err, "disposing unreadable pool; semaphores left in place");
        }
        Err(err) => return Err(err),
    }
    remove_pool_files(&paths);
    drop(exclusive);
    tracing::debug!(pool = %path.display(), "disposed pool");
    Ok(())
}

/// Best-effort removal of everything a pool layout creates.
fn remove_pool_files(paths: &PoolPaths) {
    if let Err(err) = fs::remove_dir_all(&paths.notification_dir) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(dir = %paths.notification_dir.display(), error = %err, "failed to remove notification directory");
        }
    }
    let files = [
        paths.pool_conf.as_deref(),
        paths.mmap_conf.as_deref(),
        Some(paths.mmap_file.as_path()),
    ];
    for file in files.into_iter().flatten() {
        if let Err(err) = fs::remove_file(file) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(file = %file.display(), error = %err, "failed to remove pool file");
            }
        }
    }
    if paths.owns_root() {
        layout::remove_dir_if_empty(&paths.root);
    } else if let Some(parent) = paths.notification_dir.parent() {
        layout::remove_dir_if_empty(parent);
    }
}

fn rename_unlocked(from: &Path, to: &Path) -> Result<(), Error> {
    if fs::symlink_metadata(to).is_ok() {
        return Err(Error::new(ErrorKind::AlreadyExists)
            .with_message("rename target already exists")
            .with_path(to));
    }
    let old = PoolPaths::discover(from)?;
    let _exclusive = lock::try_exclusive(&old.mmap_file)?;
    let new = PoolPaths::new(to, old.layout)?;
    if let Some(parent) = to.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        layout::make_dirs(parent, &DirPerm::default())?;
    }

    fs::rename(&old.root, &new.root).map_err(|err| io_error(&old.root, err))?;
    match old.layout {
        PoolLayout::ConfigInFile => {
            let moved = new.root.join(
                old.mmap_file
                    .file_name()
                    .ok_or_else(|| Error::new(ErrorKind::Internal).with_path(&old.mmap_file))?,
            );
            fs::rename(&moved, &new.mmap_file).map_err(|err| io_error(&moved, err))?;
        }
        PoolLayout::SingleFile => {
            if let Some(parent) = new.notification_dir.parent() {
                layout::make_dirs(parent, &DirPerm::default())?;
            }
            match fs::rename(&old.notification_dir, &new.notification_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    layout::make_dirs(&new.notification_dir, &DirPerm::default())?;
                }
                Err(err) => return Err(io_error(&old.notification_dir, err)),
            }
            if let Some(parent) = old.notification_dir.parent() {
                if parent.file_name() == Some(SINGLE_FILE_NOTIFICATION_DIR.as_ref()) {
                    layout::remove_dir_if_empty(parent);
                }
            }
        }
        PoolLayout::ConfigInMmap => {}
    }
    tracing::debug!(from = %from.display(), to = %to.display(), "renamed pool");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::JsonCodec;
    use crate::core::format::SIZE_TINY;
    use serde_json::json;
    use std::thread;

    fn tiny(dir: &tempfile::TempDir, name: &str, options: PoolOptions) -> PathBuf {
        let path = dir.path().join(name);
        Pool::create(&path, &options).expect("create");
        path
    }

    #[test]
    fn create_open_deposit_read_dispose() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "basic", PoolOptions::new(SIZE_TINY).with_index_capacity(8));
        assert!(Pool::exists(&path));
        assert!(!Pool::check_in_use(&path).expect("check"));

        let mut pool = Pool::open(&path).expect("open");
        assert!(Pool::check_in_use(&path).expect("check"));
        let first = pool.deposit(b"hello").expect("deposit");
        let second = pool.deposit(b"world").expect("deposit");
        assert_eq!((first.index, second.index), (0, 1));
        assert!(second.timestamp >= first.timestamp);
        assert_eq!(pool.nth(0).expect("nth").payload, b"hello");
        assert_eq!(pool.next().expect("next").payload, b"world");
        assert_eq!(pool.prev().expect("prev").index, 0);
        assert_eq!(pool.newest_index().expect("newest"), 1);
        assert_eq!(pool.oldest_index().expect("oldest"), 0);

        let err = Pool::dispose(&path).expect_err("still open");
        assert_eq!(err.kind(), ErrorKind::InUse);
        pool.close().expect("close");
        Pool::dispose(&path).expect("dispose");
        assert!(!Pool::exists(&path));
        assert!(!path.exists());
    }

    #[test]
    fn reopened_cursor_sits_after_newest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "resume", PoolOptions::new(SIZE_TINY));
        let mut writer = Pool::open(&path).expect("writer");
        for n in 0..3u8 {
            writer.deposit(&[n]).expect("deposit");
        }
        let mut reader = Pool::open(&path).expect("reader");
        assert_eq!(reader.curr().expect("curr").index, 2);
        assert_eq!(reader.next().expect_err("at end").kind(), ErrorKind::NoSuchRecord);
        writer.deposit(b"late").expect("deposit");
        assert_eq!(reader.next().expect("next").payload, b"late");
        drop((writer, reader));
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn create_refuses_existing_and_bad_sizes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "taken", PoolOptions::new(SIZE_TINY));
        let err = Pool::create(&path, &PoolOptions::new(SIZE_TINY)).expect_err("exists");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = Pool::create(dir.path().join("small"), &PoolOptions::new(64))
            .expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::InvalidSize);
        assert!(!dir.path().join("small").exists());
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn frozen_pool_rejects_deposits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(
            &dir,
            "frozen",
            PoolOptions::new(SIZE_TINY).with_flag(PoolFlag::Frozen, true),
        );
        let mut pool = Pool::open(&path).expect("open");
        assert_eq!(pool.deposit(b"x").expect_err("frozen").kind(), ErrorKind::Frozen);
        pool.set_flag(PoolFlag::Frozen, false).expect("thaw");
        pool.deposit(b"x").expect("deposit");
        assert!(!pool.info().expect("info").frozen);
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn freeze_while_deposit_waits_for_lock_rejects_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "freezing", PoolOptions::new(SIZE_TINY));
        let mut freezer = Pool::open(&path).expect("freezer");
        let guard = freezer.semaphores.lock(LockSlot::Deposit).expect("lock");

        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut writer = Pool::open(&writer_path).expect("writer");
            writer.deposit(b"late").map(|receipt| receipt.index)
        });
        // Let the writer pass the unlocked check and block on the deposit lock.
        thread::sleep(std::time::Duration::from_millis(200));
        write_flag(&mut freezer.store, PoolFlag::Frozen, true).expect("freeze");
        guard.release().expect("release");

        let err = writer.join().expect("join").expect_err("frozen");
        assert_eq!(err.kind(), ErrorKind::Frozen);
        assert_eq!(
            freezer.newest_index().expect_err("empty").kind(),
            ErrorKind::NoSuchRecord
        );
        drop(freezer);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn stop_when_full_refuses_to_reclaim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(
            &dir,
            "full",
            PoolOptions::new(8192).with_flag(PoolFlag::StopWhenFull, true),
        );
        let mut pool = Pool::open(&path).expect("open");
        let mut deposited = 0;
        let err = loop {
            match pool.deposit(&[1u8; 200]) {
                Ok(_) => deposited += 1,
                Err(err) => break err,
            }
        };
        assert_eq!(err.kind(), ErrorKind::Full);
        assert!(deposited > 0);
        assert_eq!(pool.oldest_index().expect("oldest"), 0);
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn info_reports_geometry_and_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(
            &dir,
            "info",
            PoolOptions::new(SIZE_TINY)
                .with_index_capacity(16)
                .with_flag(PoolFlag::Checksum, true),
        );
        let mut pool = Pool::open(&path).expect("open");
        pool.deposit(b"abc").expect("deposit");
        let info = pool.info().expect("info");
        assert_eq!(info.size, SIZE_TINY);
        assert_eq!(info.header_size, chunked_header_size(16));
        assert_eq!(info.index_capacity, 16);
        assert_eq!(info.index_count, 1);
        assert_eq!(info.newest_index, Some(0));
        assert!(info.checksum && !info.sync);
        assert_eq!(info.size_used, frame::entry_len(3).expect("len"));
        let json = serde_json::to_value(&info).expect("json");
        assert_eq!(json["type"], "mmap");
        assert_eq!(json["layout"], "config-in-mmap");
        assert_eq!(json["size-used"], info.size_used);
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn every_layout_round_trips() {
        for layout in [PoolLayout::ConfigInMmap, PoolLayout::ConfigInFile, PoolLayout::SingleFile] {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = tiny(
                &dir,
                "layout",
                PoolOptions::new(SIZE_TINY).with_index_capacity(4).with_layout(layout),
            );
            let mut pool = Pool::open(&path).expect("open");
            assert_eq!(pool.layout(), layout);
            for n in 0..10u64 {
                pool.deposit_with(&JsonCodec, &json!({ "n": n })).expect("deposit");
            }
            let decoded = pool.nth_with(&JsonCodec, 7).expect("nth");
            assert_eq!(decoded.value, json!({ "n": 7 }));
            assert!(pool.validate().expect("validate").is_clean());
            drop(pool);

            let reopened = Pool::open(&path).expect("reopen");
            assert_eq!(reopened.newest_index().expect("newest"), 9);
            drop(reopened);
            Pool::dispose(&path).expect("dispose");
            assert!(!path.exists());
            assert!(!dir.path().join(".notification").exists());
        }
    }

    #[test]
    fn legacy_layout_rejects_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = PoolOptions::new(SIZE_TINY)
            .with_layout(PoolLayout::ConfigInFile)
            .with_flag(PoolFlag::Frozen, true);
        let err = Pool::create(dir.path().join("legacy"), &options).expect_err("flags");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let path = tiny(
            &dir,
            "legacy",
            PoolOptions::new(SIZE_TINY).with_layout(PoolLayout::ConfigInFile),
        );
        let mut pool = Pool::open(&path).expect("open");
        let err = pool.set_flag(PoolFlag::Sync, true).expect_err("no flags");
        assert_eq!(err.kind(), ErrorKind::Usage);
        pool.set_flag(PoolFlag::Sync, false).expect("clearing is a no-op");
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn change_options_updates_mode_and_rejects_resize() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "perm", PoolOptions::new(SIZE_TINY).with_mode(0o644));
        let mut pool = Pool::open(&path).expect("open");
        let err = pool
            .change_options(&PoolChanges {
                size: Some(SIZE_TINY * 2),
                ..PoolChanges::default()
            })
            .expect_err("resize");
        assert_eq!(err.kind(), ErrorKind::InvalidSize);

        pool.change_options(
            &PoolChanges {
                mode: Some(0o600),
                ..PoolChanges::default()
            }
            .set_flag(PoolFlag::AutoDispose, true),
        )
        .expect("change");
        assert_eq!(pool.store().perm().expect("perm").mode, 0o600);
        assert!(pool.has_flag(PoolFlag::AutoDispose));
        pool.close().expect("close disposes");
        assert!(!Pool::exists(&path));
    }

    #[test]
    fn rename_moves_unused_pool() {
        let dir = tempfile::tempdir().expect("tempdir");
        let from = tiny(&dir, "before", PoolOptions::new(SIZE_TINY));
        let to = dir.path().join("after");
        {
            let mut pool = Pool::open(&from).expect("open");
            pool.deposit(b"kept").expect("deposit");
            let err = Pool::rename(&from, &to).expect_err("in use");
            assert_eq!(err.kind(), ErrorKind::InUse);
        }
        Pool::rename(&from, &to).expect("rename");
        assert!(!Pool::exists(&from));
        let mut pool = Pool::open(&to).expect("open renamed");
        assert_eq!(pool.nth(0).expect("nth").payload, b"kept");
        drop(pool);
        Pool::dispose(&to).expect("dispose");
    }

    #[test]
    fn sleeping_pool_reopens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "sleepy", PoolOptions::new(SIZE_TINY));
        Pool::sleep(&path).expect("sleep");
        let mut pool = Pool::open(&path).expect("wake");
        pool.deposit(b"after nap").expect("deposit");
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn participate_creatingly_creates_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lazy");
        let options = PoolOptions::new(SIZE_TINY);
        let mut first = Pool::participate_creatingly(&path, &options).expect("first");
        first.deposit(b"one").expect("deposit");
        let second = Pool::participate_creatingly(&path, &options).expect("second");
        assert_eq!(second.newest_index().expect("newest"), 0);
        drop((first, second));
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn wait_without_data_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "quiet", PoolOptions::new(SIZE_TINY));
        let mut pool = Pool::open(&path).expect("open");
        let err = pool.await_next(Timeout::NoWait, None).expect_err("no wait");
        assert_eq!(err.kind(), ErrorKind::AwaitTimedOut);
        let err = pool
            .await_next(Timeout::After(Duration::from_millis(30)), None)
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::AwaitTimedOut);
        let notification_dir = pool.paths().notification_dir.clone();
        assert_eq!(fs::read_dir(&notification_dir).expect("dir").count(), 0);
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn await_next_wakes_on_deposit_from_another_thread() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "wake", PoolOptions::new(SIZE_TINY));
        let mut reader = Pool::open(&path).expect("reader");
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut pool = Pool::open(&writer_path).expect("writer");
            pool.deposit(b"ping").expect("deposit").index
        });
        let record = reader
            .await_next(Timeout::After(Duration::from_secs(10)), None)
            .expect("await");
        assert_eq!(record.payload, b"ping");
        assert_eq!(writer.join().expect("join"), 0);

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let mut pool = Pool::open(&waiter_path).expect("waiter");
            pool.await_nth(3, Timeout::Forever, None).expect("await nth").payload
        });
        thread::sleep(Duration::from_millis(50));
        let mut writer = Pool::open(&path).expect("writer");
        for n in 1..=3u8 {
            writer.deposit(&[n]).expect("deposit");
        }
        assert_eq!(waiter.join().expect("join"), vec![3u8]);
        drop((reader, writer));
        Pool::dispose(&path).expect("dispose");
    }

    #[test]
    fn await_nth_for_reclaimed_index_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = tiny(&dir, "gone", PoolOptions::new(8192));
        let mut pool = Pool::open(&path).expect("open");
        for _ in 0..100 {
            pool.deposit(&[0u8; 100]).expect("deposit");
        }
        assert!(pool.oldest_index().expect("oldest") > 0);
        let err = pool
            .await_nth(0, Timeout::Forever, None)
            .expect_err("reclaimed");
        assert_eq!(err.kind(), ErrorKind::NoSuchRecord);
        drop(pool);
        Pool::dispose(&path).expect("dispose");
    }
}
