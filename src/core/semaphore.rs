//! Purpose: Cross-process deposit and notification locks on a System V semaphore set.
//! Exports: `PoolSemaphores`, `SemGuard`, `LockSlot`, `random_sem_key`.
//! Role: Serializes appenders and waiter-registry edits across every process sharing a pool.
//! Invariants: Lock order is deposit before notification, never the reverse.
//! Invariants: `EINTR` is retried; every other semaphore failure surfaces to the caller.
//! Invariants: Operations use `SEM_UNDO` so a crashed holder releases its lock.
use std::io;

use crate::core::error::{Error, ErrorKind};

/// High byte pattern shared by every pool semaphore key.
pub const SEM_KEY_BASE: i64 = 0x0b80_0000;
const SEM_KEY_RANDOM_MASK: i64 = 0x00ff_ffff;
const SEM_COUNT: i32 = 2;
const MAX_KEY_ATTEMPTS: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockSlot {
    Deposit = 0,
    Notification = 1,
}

impl LockSlot {
    fn name(self) -> &'static str {
        match self {
            LockSlot::Deposit => "deposit",
            LockSlot::Notification => "notification",
        }
    }
}

pub trait SemaphoreBackend: Clone {
    type Handle: Copy;

    /// Creates a new set under `key`; `AlreadyExists` if the key is taken.
    fn create(&self, key: i64, mode: u32) -> Result<Self::Handle, Error>;
    /// Attaches to an existing set; `NotFound` if none exists.
    fn attach(&self, key: i64) -> Result<Self::Handle, Error>;
    fn acquire(&self, handle: Self::Handle, slot: LockSlot) -> Result<(), Error>;
    fn release(&self, handle: Self::Handle, slot: LockSlot) -> Result<(), Error>;
    fn destroy(&self, handle: Self::Handle) -> Result<(), Error>;
}

pub struct Semaphores<B: SemaphoreBackend> {
    key: i64,
    handle: B::Handle,
    backend: B,
}

impl<B: SemaphoreBackend> Semaphores<B> {
    pub fn create_with_backend(key: i64, mode: u32, backend: B) -> Result<Self, Error> {
        let handle = backend.create(key, mode)?;
        tracing::debug!(key = format_args!("{key:#x}"), "created semaphore set");
        Ok(Self {
            key,
            handle,
            backend,
        })
    }

    /// Attaches to `key`, recreating the set if it was destroyed (pool slept).
    pub fn attach_with_backend(key: i64, mode: u32, backend: B) -> Result<Self, Error> {
        match backend.attach(key) {
            Ok(handle) => Ok(Self {
                key,
                handle,
                backend,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(
                    key = format_args!("{key:#x}"),
                    "semaphore set missing; recreating under the same key"
                );
                match Self::create_with_backend(key, mode, backend.clone()) {
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                        let handle = backend.attach(key)?;
                        Ok(Self {
                            key,
                            handle,
                            backend,
                        })
                    }
                    other => other,
                }
            }
            Err(err) => Err(err),
        }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn lock(&self, slot: LockSlot) -> Result<SemGuard<'_, B>, Error> {
        self.backend.acquire(self.handle, slot)?;
        tracing::trace!(lock = slot.name(), "acquired");
        Ok(SemGuard {
            owner: self,
            slot,
            released: false,
        })
    }

    pub fn destroy(self) -> Result<(), Error> {
        self.backend.destroy(self.handle)?;
        tracing::debug!(key = format_args!("{:#x}", self.key), "destroyed semaphore set");
        Ok(())
    }
}

/// Held lock; released by `release` or, failing that, on drop.
pub struct SemGuard<'a, B: SemaphoreBackend = SysVBackend> {
    owner: &'a Semaphores<B>,
    slot: LockSlot,
    released: bool,
}

impl<B: SemaphoreBackend> SemGuard<'_, B> {
    /// Releases the lock and reports any failure.
    pub fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.owner.backend.release(self.owner.handle, self.slot)
    }
}

impl<B: SemaphoreBackend> Drop for SemGuard<'_, B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.owner.backend.release(self.owner.handle, self.slot) {
            tracing::warn!(lock = self.slot.name(), error = %err, "failed to release lock");
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SysVBackend;

impl SemaphoreBackend for SysVBackend {
    type Handle = libc::c_int;

    fn create(&self, key: i64, mode: u32) -> Result<Self::Handle, Error> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | (mode & 0o777) as libc::c_int;
        let id = unsafe { libc::semget(key as libc::key_t, SEM_COUNT, flags) };
        if id < 0 {
            return Err(sem_error("semget", key));
        }
        // Fresh sets start at zero; raise both to one (unlocked).
        for slot in [LockSlot::Deposit, LockSlot::Notification] {
            if let Err(err) = semop(id, slot, 1, 0) {
                return Err(abandon_set(err, key, || self.destroy(id)));
            }
        }
        Ok(id)
    }

    fn attach(&self, key: i64) -> Result<Self::Handle, Error> {
        let id = unsafe { libc::semget(key as libc::key_t, SEM_COUNT, 0) };
        if id < 0 {
            return Err(sem_error("semget", key));
        }
        Ok(id)
    }

    fn acquire(&self, handle: Self::Handle, slot: LockSlot) -> Result<(), Error> {
        semop(handle, slot, -1, libc::SEM_UNDO as libc::c_short)
    }

    fn release(&self, handle: Self::Handle, slot: LockSlot) -> Result<(), Error> {
        semop(handle, slot, 1, libc::SEM_UNDO as libc::c_short)
    }

    fn destroy(&self, handle: Self::Handle) -> Result<(), Error> {
        let rc = unsafe { libc::semctl(handle, 0, libc::IPC_RMID) };
        if rc < 0 {
            return Err(sem_error("semctl(IPC_RMID)", i64::from(handle)));
        }
        Ok(())
    }
}

/// Tears down a set whose initialization failed; the initialization error wins.
fn abandon_set(err: Error, key: i64, destroy: impl FnOnce() -> Result<(), Error>) -> Error {
    if let Err(cleanup) = destroy() {
        tracing::warn!(
            error = %cleanup,
            key = format_args!("{key:#x}"),
            "failed to destroy half-initialized semaphore set"
        );
    }
    err.with_message(format!("initializing semaphore set {key:#x}"))
}

fn semop(id: libc::c_int, slot: LockSlot, delta: libc::c_short, flags: libc::c_short) -> Result<(), Error> {
    let mut op = libc::sembuf {
        sem_num: slot as libc::c_ushort,
        sem_op: delta,
        sem_flg: flags,
    };
    loop {
        let rc = unsafe { libc::semop(id, &mut op, 1) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(map_sem_error(err, "semop").with_message(format!("{} lock", slot.name())));
    }
}

fn sem_error(call: &str, key: i64) -> Error {
    map_sem_error(io::Error::last_os_error(), call)
        .with_message(format!("{call} failed for semaphore {key:#x}"))
}

fn map_sem_error(err: io::Error, call: &str) -> Error {
    let kind = match err.raw_os_error() {
        Some(code) if code == libc::EACCES || code == libc::EPERM => ErrorKind::Permission,
        Some(code) if code == libc::EEXIST => ErrorKind::AlreadyExists,
        Some(code) if code == libc::ENOENT => ErrorKind::NotFound,
        _ => ErrorKind::Semaphore,
    };
    let hint = match err.raw_os_error() {
        Some(code) if code == libc::ENOSPC => Some("System semaphore limit reached; see `ipcs -s`."),
        Some(code) if code == libc::EIDRM || code == libc::EINVAL => {
            Some("The semaphore set was removed; reopen the pool.")
        }
        _ => None,
    };
    let error = Error::new(kind).with_message(call.to_string()).with_source(err);
    match hint {
        Some(hint) => error.with_hint(hint),
        None => error,
    }
}

/// `0x0b80_0000` with 24 random low bits.
pub fn random_sem_key() -> Result<i64, Error> {
    let mut bytes = [0u8; 3];
    getrandom::fill(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("random source failed: {err}"))
    })?;
    let random = i64::from(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]));
    Ok(SEM_KEY_BASE | (random & SEM_KEY_RANDOM_MASK))
}

pub type PoolSemaphores = Semaphores<SysVBackend>;

impl PoolSemaphores {
    /// Creates a set under a fresh random key.
    pub fn create_fresh(mode: u32) -> Result<Self, Error> {
        let mut last_err = None;
        for _ in 0..MAX_KEY_ATTEMPTS {
            let key = random_sem_key()?;
            match Self::create_with_backend(key, mode, SysVBackend) {
                Ok(set) => return Ok(set),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::new(ErrorKind::Semaphore))
            .with_message("no free semaphore key"))
    }

    pub fn attach(key: i64, mode: u32) -> Result<Self, Error> {
        Self::attach_with_backend(key, mode, SysVBackend)
    }

    /// Removes the set under `key` if one exists.
    pub fn destroy_key(key: i64) -> Result<(), Error> {
        match SysVBackend.attach(key) {
            Ok(handle) => SysVBackend.destroy(handle),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct TestSet {
        held: Mutex<[bool; 2]>,
        ready: Condvar,
    }

    #[derive(Clone, Default)]
    struct TestBackend {
        sets: Arc<Mutex<HashMap<i64, Arc<TestSet>>>>,
    }

    impl SemaphoreBackend for TestBackend {
        type Handle = i64;

        fn create(&self, key: i64, _mode: u32) -> Result<Self::Handle, Error> {
            let mut sets = self.sets.lock().expect("lock");
            if sets.contains_key(&key) {
                return Err(Error::new(ErrorKind::AlreadyExists));
            }
            sets.insert(key, Arc::new(TestSet::default()));
            Ok(key)
        }

        fn attach(&self, key: i64) -> Result<Self::Handle, Error> {
            let sets = self.sets.lock().expect("lock");
            if sets.contains_key(&key) {
                Ok(key)
            } else {
                Err(Error::new(ErrorKind::NotFound))
            }
        }

        fn acquire(&self, handle: Self::Handle, slot: LockSlot) -> Result<(), Error> {
            let set = self.set(handle)?;
            let mut held = set.held.lock().expect("lock");
            while held[slot as usize] {
                held = set.ready.wait(held).expect("wait");
            }
            held[slot as usize] = true;
            Ok(())
        }

        fn release(&self, handle: Self::Handle, slot: LockSlot) -> Result<(), Error> {
            let set = self.set(handle)?;
            let mut held = set.held.lock().expect("lock");
            held[slot as usize] = false;
            set.ready.notify_all();
            Ok(())
        }

        fn destroy(&self, handle: Self::Handle) -> Result<(), Error> {
            self.sets.lock().expect("lock").remove(&handle);
            Ok(())
        }
    }

    impl TestBackend {
        fn set(&self, key: i64) -> Result<Arc<TestSet>, Error> {
            self.sets
                .lock()
                .expect("lock")
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::new(ErrorKind::Semaphore).with_message("set removed"))
        }

        fn is_held(&self, key: i64, slot: LockSlot) -> bool {
            self.set(key).expect("set").held.lock().expect("lock")[slot as usize]
        }
    }

    #[test]
    fn random_keys_share_the_pool_prefix() {
        for _ in 0..32 {
            let key = random_sem_key().expect("key");
            assert_eq!(key & !SEM_KEY_RANDOM_MASK, SEM_KEY_BASE);
        }
    }

    #[test]
    fn guard_releases_on_drop_and_explicitly() {
        let backend = TestBackend::default();
        let set = Semaphores::create_with_backend(7, 0o600, backend.clone()).expect("create");
        {
            let _guard = set.lock(LockSlot::Deposit).expect("lock");
            assert!(backend.is_held(7, LockSlot::Deposit));
            assert!(!backend.is_held(7, LockSlot::Notification));
        }
        assert!(!backend.is_held(7, LockSlot::Deposit));

        let guard = set.lock(LockSlot::Notification).expect("lock");
        guard.release().expect("release");
        assert!(!backend.is_held(7, LockSlot::Notification));
    }

    #[test]
    fn deposit_lock_excludes_other_holders() {
        let backend = TestBackend::default();
        let set = Semaphores::create_with_backend(9, 0o600, backend.clone()).expect("create");
        let guard = set.lock(LockSlot::Deposit).expect("lock");

        let contender = backend.clone();
        let waiter = thread::spawn(move || {
            let other = Semaphores::attach_with_backend(9, 0o600, contender).expect("attach");
            let _guard = other.lock(LockSlot::Deposit).expect("lock");
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        guard.release().expect("release");
        waiter.join().expect("join");
    }

    #[test]
    fn attach_recreates_missing_set() {
        let backend = TestBackend::default();
        let set = Semaphores::create_with_backend(11, 0o600, backend.clone()).expect("create");
        set.destroy().expect("destroy");
        let again = Semaphores::attach_with_backend(11, 0o600, backend.clone()).expect("attach");
        assert_eq!(again.key(), 11);
        let _guard = again.lock(LockSlot::Deposit).expect("lock");
    }

    #[test]
    fn duplicate_create_reports_exists() {
        let backend = TestBackend::default();
        let _set = Semaphores::create_with_backend(13, 0o600, backend.clone()).expect("create");
        let err = Semaphores::create_with_backend(13, 0o600, backend)
            .err()
            .expect("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn abandoned_set_keeps_the_initialization_error() {
        let mut destroyed = false;
        let err = abandon_set(Error::new(ErrorKind::Semaphore), 0x0b80_0042, || {
            destroyed = true;
            Err(Error::new(ErrorKind::Permission).with_message("semctl(IPC_RMID) failed"))
        });
        assert!(destroyed);
        assert_eq!(err.kind(), ErrorKind::Semaphore);
        assert_eq!(err.message(), Some("initializing semaphore set 0xb800042"));

        let err = abandon_set(Error::new(ErrorKind::Semaphore), 0x0b80_0042, || Ok(()));
        assert_eq!(err.kind(), ErrorKind::Semaphore);
    }

    #[test]
    fn errno_mapping() {
        let cases = [
            (libc::EACCES, ErrorKind::Permission),
            (libc::EPERM, ErrorKind::Permission),
            (libc::EEXIST, ErrorKind::AlreadyExists),
            (libc::ENOENT, ErrorKind::NotFound),
            (libc::ENOSPC, ErrorKind::Semaphore),
            (libc::EIDRM, ErrorKind::Semaphore),
        ];
        for (errno, kind) in cases {
            let err = map_sem_error(io::Error::from_raw_os_error(errno), "semop");
            assert_eq!(err.kind(), kind);
        }
        let err = map_sem_error(io::Error::from_raw_os_error(libc::ENOSPC), "semget");
        assert!(err.hint().is_some());
    }

    #[test]
    fn sysv_set_round_trip() {
        let set = PoolSemaphores::create_fresh(0o600).expect("create");
        let key = set.key();
        {
            let deposit = set.lock(LockSlot::Deposit).expect("deposit");
            let notify = set.lock(LockSlot::Notification).expect("notification");
            notify.release().expect("release notification");
            deposit.release().expect("release deposit");
        }
        let attached = PoolSemaphores::attach(key, 0o600).expect("attach");
        drop(attached);
        set.destroy().expect("destroy");
        PoolSemaphores::destroy_key(key).expect("already gone");
    }
}
