//! Purpose: Advisory file locks guarding pool structure and handle presence.
//! Exports: `ConfigLock`, `ExclusiveLock`, `lock_shared`, `try_exclusive`, `config_lock_path`.
//! Role: Create/dispose/rename serialize on a config lock; open handles hold a shared flock.
//! Invariants: Every open handle holds `LOCK_SH` on the mapped file for its lifetime.
//! Invariants: Structural changes need `LOCK_EX` on the mapped file, failing with `InUse` otherwise.
//! Invariants: Locks are released by dropping their guard, never through global state.
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::store::io_error;

/// Serializes structural changes (create, dispose, rename) to one pool.
#[derive(Debug)]
pub struct ConfigLock {
    path: PathBuf,
    file: File,
}

impl ConfigLock {
    /// Blocks until the config lock for `pool_path` is held.
    pub fn acquire(pool_path: &Path) -> Result<Self, Error> {
        let path = config_lock_path(pool_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&path, err))?;
        tracing::debug!(lock = %path.display(), "acquiring config lock");
        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("failed to acquire config lock")
                .with_path(&path)
                .with_source(err)
        })?;
        tracing::debug!(lock = %path.display(), "config lock acquired");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConfigLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %err, "failed to release config lock");
        } else {
            tracing::debug!(lock = %self.path.display(), "config lock released");
        }
    }
}

/// Lock file for `pool_path` under the system temp directory, keyed by a digest of its location.
pub fn config_lock_path(pool_path: &Path) -> PathBuf {
    let canonical = canonical_location(pool_path);
    let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
    let mut hex = String::with_capacity(32);
    for byte in &digest[..16] {
        let _ = write!(hex, "{byte:02x}");
    }
    std::env::temp_dir().join(format!("ringpool-{hex}.lock"))
}

/// Resolves symlinks in the parent so differently spelled paths share one lock.
fn canonical_location(path: &Path) -> PathBuf {
    if let Ok(path) = path.canonicalize() {
        return path;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|parent| parent.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Marks `file` as held by an open handle. Blocks only while a dispose holds it exclusively.
pub fn lock_shared(file: &File, path: &Path) -> Result<(), Error> {
    FileExt::lock_shared(file).map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("failed to take shared pool lock")
            .with_path(path)
            .with_source(err)
    })
}

/// Exclusive hold on a pool's mapped file; proof that no handle is attached.
#[derive(Debug)]
pub struct ExclusiveLock {
    path: PathBuf,
    file: File,
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release pool lock");
        }
    }
}

/// Takes `LOCK_EX | LOCK_NB` on a fresh descriptor for `mmap_file`.
pub fn try_exclusive(mmap_file: &Path) -> Result<ExclusiveLock, Error> {
    let file = OpenOptions::new()
        .read(true)
        .open(mmap_file)
        .map_err(|err| io_error(mmap_file, err))?;
    file.try_lock_exclusive().map_err(|err| {
        let kind = lock_error_kind(&err);
        let err = Error::new(kind).with_path(mmap_file).with_source(err);
        if kind == ErrorKind::InUse {
            err.with_message("pool is in use by another handle")
        } else {
            err
        }
    })?;
    Ok(ExclusiveLock {
        path: mmap_file.to_path_buf(),
        file,
    })
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    if errno == libc::EWOULDBLOCK || errno == libc::EAGAIN {
        return ErrorKind::InUse;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::InUse,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigLock, config_lock_path, lock_error_kind, lock_shared, try_exclusive};
    use crate::core::error::ErrorKind;
    use std::fs::{self, File};

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EAGAIN);
        assert_eq!(lock_error_kind(&err), ErrorKind::InUse);

        let err = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(lock_error_kind(&err), ErrorKind::InUse);

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(lock_error_kind(&err), ErrorKind::Permission);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(lock_error_kind(&err), ErrorKind::Io);
    }

    #[test]
    fn config_lock_path_ignores_spelling() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir(dir.path().join("sub")).expect("mkdir");
        let direct = dir.path().join("pool");
        let dotted = dir.path().join("sub").join("..").join("pool");
        assert_eq!(config_lock_path(&direct), config_lock_path(&dotted));
        assert_ne!(config_lock_path(&direct), config_lock_path(&dir.path().join("other")));
    }

    #[test]
    fn config_lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = dir.path().join("pool");
        let first = ConfigLock::acquire(&pool).expect("first");
        let lock_path = first.path().to_path_buf();
        drop(first);
        let second = ConfigLock::acquire(&pool).expect("second");
        assert_eq!(second.path(), lock_path);
    }

    #[test]
    fn shared_holder_blocks_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mmap-pool");
        fs::write(&path, b"pool").expect("write");

        let free = try_exclusive(&path).expect("unused pool");
        drop(free);

        let holder = File::open(&path).expect("open");
        lock_shared(&holder, &path).expect("shared");
        let err = try_exclusive(&path).expect_err("in use");
        assert_eq!(err.kind(), ErrorKind::InUse);

        drop(holder);
        try_exclusive(&path).expect("released");
    }
}
