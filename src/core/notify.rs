//! Purpose: Wake blocked readers through a directory of per-reader named pipes.
//! Exports: `Awaiter`, `WaitOutcome`, `wake_all`.
//! Role: Deposit-to-reader signaling; each waiting reader owns one fifo in the registry.
//! Invariants: Registry edits (create, remove, wake) happen under the notification lock.
//! Invariants: Waking writes one byte per fifo and unlinks it; a reader re-registers per wait.
//! Invariants: Failing to notify one fifo never fails the deposit that triggered it.
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::store::io_error;

const FIFO_NAME_LEN: usize = 12;
const FIFO_NAME_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const FIFO_MODE: libc::mode_t = 0o622;
const MAX_NAME_ATTEMPTS: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    /// A depositor pinged our fifo.
    Ready,
    TimedOut,
    /// The caller's interrupt handle became readable first.
    Interrupted,
}

/// One registered waiter: a fifo in the notification directory, held open for reading.
#[derive(Debug)]
pub struct Awaiter {
    path: PathBuf,
    fifo: File,
}

impl Awaiter {
    /// Creates a uniquely named fifo under `dir`. Caller holds the notification lock.
    pub fn register(dir: &Path) -> Result<Self, Error> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(random_fifo_name()?);
            match make_fifo(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(io_error(&path, err)),
            }
            // Read-write so the open never blocks waiting for a writer.
            let fifo = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&path)
                .map_err(|err| io_error(&path, err))?;
            tracing::debug!(fifo = %path.display(), "registered awaiter");
            return Ok(Self { path, fifo });
        }
        Err(Error::new(ErrorKind::Io)
            .with_message("could not find a free fifo name")
            .with_path(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until pinged, interrupted, or `timeout` elapses (`None` waits forever).
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        interrupt: Option<BorrowedFd<'_>>,
    ) -> Result<WaitOutcome, Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut fds = vec![libc::pollfd {
            fd: self.fifo.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        if let Some(interrupt) = interrupt {
            fds.push(libc::pollfd {
                fd: interrupt.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        loop {
            let timeout_ms = match deadline {
                None => -1,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    remaining.as_millis().min(i32::MAX as u128) as libc::c_int
                }
            };
            for fd in fds.iter_mut() {
                fd.revents = 0;
            }
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(io_error(&self.path, err));
            }
            if rc == 0 {
                return Ok(WaitOutcome::TimedOut);
            }
            if fds[0].revents & libc::POLLIN != 0 {
                return Ok(WaitOutcome::Ready);
            }
            if fds.len() > 1 && fds[1].revents != 0 {
                return Ok(WaitOutcome::Interrupted);
            }
            if fds[0].revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("notification fifo failed while waiting")
                    .with_path(&self.path));
            }
        }
    }

    /// Unlinks the fifo if a depositor has not already. Caller holds the notification lock.
    pub fn remove(self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(&self.path, err)),
        }
    }
}

/// Pings and unlinks every fifo in `dir`. Caller holds the notification lock.
pub fn wake_all(dir: &Path) -> Result<usize, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(io_error(dir, err)),
    };
    let mut woken = 0;
    for entry in entries {
        let entry = entry.map_err(|err| io_error(dir, err))?;
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_fifo() => {}
            _ => continue,
        }
        match ping(&path) {
            Ok(()) => woken += 1,
            Err(err) => {
                tracing::warn!(fifo = %path.display(), error = %err, "failed to notify awaiter");
            }
        }
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(fifo = %path.display(), error = %err, "failed to remove fifo");
            }
        }
    }
    Ok(woken)
}

fn ping(path: &Path) -> io::Result<()> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    fifo.write_all(&[0u8])
}

fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn random_fifo_name() -> Result<String, Error> {
    let mut bytes = [0u8; FIFO_NAME_LEN];
    getrandom::fill(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("random source failed: {err}"))
    })?;
    Ok(bytes
        .iter()
        .map(|byte| FIFO_NAME_CHARS[*byte as usize % FIFO_NAME_CHARS.len()] as char)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn fifo_names_use_the_expected_alphabet() {
        let name = random_fifo_name().expect("name");
        assert_eq!(name.len(), FIFO_NAME_LEN);
        assert!(name.bytes().all(|byte| FIFO_NAME_CHARS.contains(&byte)));
    }

    #[test]
    fn registered_awaiter_is_a_fifo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let awaiter = Awaiter::register(dir.path()).expect("register");
        let meta = fs::metadata(awaiter.path()).expect("metadata");
        assert!(meta.file_type().is_fifo());
        let path = awaiter.path().to_path_buf();
        awaiter.remove().expect("remove");
        assert!(!path.exists());
    }

    #[test]
    fn wait_times_out_without_deposit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let awaiter = Awaiter::register(dir.path()).expect("register");
        let outcome = awaiter
            .wait(Some(Duration::from_millis(20)), None)
            .expect("wait");
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn wake_all_pings_and_unlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = Awaiter::register(dir.path()).expect("first");
        let second = Awaiter::register(dir.path()).expect("second");
        assert_eq!(wake_all(dir.path()).expect("wake"), 2);
        for awaiter in [first, second] {
            assert!(!awaiter.path().exists());
            assert_eq!(
                awaiter.wait(Some(Duration::from_secs(1)), None).expect("wait"),
                WaitOutcome::Ready
            );
            awaiter.remove().expect("remove after unlink");
        }
    }

    #[test]
    fn wake_from_another_thread_releases_waiter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let awaiter = Awaiter::register(dir.path()).expect("register");
        let registry = dir.path().to_path_buf();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            wake_all(&registry).expect("wake")
        });
        assert_eq!(awaiter.wait(None, None).expect("wait"), WaitOutcome::Ready);
        assert_eq!(waker.join().expect("join"), 1);
    }

    #[test]
    fn interrupt_handle_wins_when_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let awaiter = Awaiter::register(dir.path()).expect("register");
        let (reader, mut writer) = UnixStream::pair().expect("pair");
        writer.write_all(b"!").expect("write");
        let outcome = awaiter
            .wait(Some(Duration::from_secs(5)), Some(reader.as_fd()))
            .expect("wait");
        assert_eq!(outcome, WaitOutcome::Interrupted);
    }

    #[test]
    fn stale_fifo_without_reader_is_cleaned_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("abandonedfifo");
        make_fifo(&stale).expect("mkfifo");
        assert_eq!(wake_all(dir.path()).expect("wake"), 0);
        assert!(!stale.exists());
    }

    #[test]
    fn missing_registry_wakes_nobody() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(wake_all(&dir.path().join("gone")).expect("wake"), 0);
    }
}
