// Engine-level scenarios: fill, wrap, oversize records, index backoff, and racing readers.
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use ringpool::core::error::ErrorKind;
use ringpool::core::format::SIZE_SMALL;
use ringpool::core::frame::entry_len;
use ringpool::core::lookup::{Direction, Whence};
use ringpool::core::options::PoolOptions;
use ringpool::core::pool::{Pool, Timeout};

/// Payload length that frames to a 64-byte record.
const SMALL_RECORD_PAYLOAD: usize = 28;

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Payload whose bytes are derived from its index so torn reads are detectable.
fn payload_for(index: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|n| (index as usize).wrapping_mul(31).wrapping_add(n) as u8)
        .collect()
}

fn create(dir: &Path, name: &str, options: PoolOptions) -> PathBuf {
    let path = dir.join(name);
    Pool::create(&path, &options).expect("create");
    path
}

#[test]
fn fifty_small_records_fit_without_wrapping() {
    assert_eq!(entry_len(SMALL_RECORD_PAYLOAD), Some(64));
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(temp.path(), "fill", PoolOptions::new(4096));
    let mut pool = Pool::open(&path).expect("open");
    for n in 0..50u64 {
        let receipt = pool
            .deposit(&payload_for(n, SMALL_RECORD_PAYLOAD))
            .expect("deposit");
        assert_eq!(receipt.index, n);
    }
    assert_eq!(pool.newest_index().expect("newest"), 49);
    assert_eq!(pool.oldest_index().expect("oldest"), 0);

    pool.rewind();
    for n in 0..50u64 {
        let record = pool.next().expect("next");
        assert_eq!(record.index, n);
        assert_eq!(record.payload, payload_for(n, SMALL_RECORD_PAYLOAD));
    }
    assert_eq!(pool.next().expect_err("end").kind(), ErrorKind::NoSuchRecord);

    let first = pool.nth(17).expect("nth");
    let again = pool.nth(17).expect("nth again");
    assert_eq!(first, again);
    drop(pool);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn two_hundred_small_records_wrap() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(temp.path(), "wrap", PoolOptions::new(4096));
    let mut pool = Pool::open(&path).expect("open");
    for n in 0..200u64 {
        pool.deposit(&payload_for(n, SMALL_RECORD_PAYLOAD))
            .expect("deposit");
    }
    let oldest = pool.oldest_index().expect("oldest");
    let newest = pool.newest_index().expect("newest");
    assert!(oldest > 0);
    assert_eq!(newest, 199);
    assert!(oldest <= newest);

    pool.rewind();
    let mut expected = oldest;
    while let Ok(record) = pool.next() {
        assert_eq!(record.index, expected);
        assert_eq!(record.payload, payload_for(expected, SMALL_RECORD_PAYLOAD));
        expected += 1;
    }
    assert_eq!(expected, 200);
    assert_eq!(
        pool.nth(0).expect_err("reclaimed").kind(),
        ErrorKind::NoSuchRecord
    );
    assert!(pool.validate().expect("validate").is_clean());
    drop(pool);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn oversize_record_leaves_pointers_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(temp.path(), "big", PoolOptions::new(4096));
    let mut pool = Pool::open(&path).expect("open");
    pool.deposit(b"small").expect("deposit");
    let ring = pool.store().ring();

    let err = pool.deposit(&vec![7u8; 4096]).expect_err("too large");
    assert_eq!(err.kind(), ErrorKind::RecordTooLarge);
    assert_eq!(pool.store().ring(), ring);
    assert_eq!(pool.newest_index().expect("newest"), 0);
    assert_eq!(pool.deposit(b"next").expect("deposit").index, 1);
    drop(pool);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn random_sizes_respect_the_wrap_invariant() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(
        temp.path(),
        "random",
        PoolOptions::new(16 * 1024).with_index_capacity(16),
    );
    let mut pool = Pool::open(&path).expect("open");
    let capacity = pool.file_size() - pool.header_size();
    let mut rng = XorShift64::new(0x5eed_cafe_f00d_d00d);
    let mut deposited_bytes = 0u64;

    for n in 0..1_000u64 {
        let len = rng.below(600) as usize;
        let receipt = pool.deposit(&payload_for(n, len)).expect("deposit");
        assert_eq!(receipt.index, n);
        deposited_bytes += entry_len(len).expect("len");

        let oldest = pool.oldest_index().expect("oldest");
        assert!(oldest <= n);
        if deposited_bytes > capacity {
            assert!(oldest > 0, "no reclamation after {deposited_bytes} bytes");
        }
        let ring = pool.store().ring();
        assert!(ring.oldest <= ring.newest);
        assert!(ring.newest < ring.oldest + ring.file_size);

        if n % 97 == 0 {
            let probe = oldest + rng.below(n - oldest + 1);
            let record = pool.nth(probe).expect("probe");
            assert!(record.start >= pool.store().ring().oldest);
            assert_eq!(record.index, probe);
        }
    }
    assert!(pool.validate().expect("validate").is_clean());
    drop(pool);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn index_step_doubles_as_records_accumulate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let capacity = 8u64;
    let path = create(
        temp.path(),
        "index",
        PoolOptions::new(SIZE_SMALL).with_index_capacity(capacity),
    );
    let mut pool = Pool::open(&path).expect("open");
    for n in 0..200u64 {
        pool.deposit(&payload_for(n, SMALL_RECORD_PAYLOAD))
            .expect("deposit");
        let info = pool.info().expect("info");
        assert!(info.index_count <= info.index_capacity);
    }
    let info = pool.info().expect("info");
    assert_eq!(info.index_capacity, capacity);
    // 200 / 8 = 25, so at least ceil(log2(25)) = 5 doublings.
    assert!(info.index_step >= 32, "step {}", info.index_step);
    assert_eq!(pool.oldest_index().expect("oldest"), 0);

    for target in [0u64, 1, 63, 64, 150, 199] {
        assert_eq!(pool.nth(target).expect("nth").index, target);
    }
    drop(pool);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn lookup_brackets_deposit_times() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(
        temp.path(),
        "lookup",
        PoolOptions::new(SIZE_SMALL).with_index_capacity(4),
    );
    let mut pool = Pool::open(&path).expect("open");
    let mut stamps = Vec::new();
    for n in 0..30u64 {
        stamps.push(pool.deposit(&payload_for(n, 8)).expect("deposit").timestamp);
        if n % 10 == 9 {
            thread::sleep(Duration::from_millis(20));
        }
    }

    let between = (stamps[9] + stamps[10]) / 2.0;
    let after = pool
        .index_lookup(between, Whence::Absolute, Direction::NotEarlierThan)
        .expect("after");
    assert_eq!(after, 10);
    let before = pool
        .index_lookup(between, Whence::Absolute, Direction::NotLaterThan)
        .expect("before");
    assert_eq!(before, 9);

    let exact = pool
        .lookup(stamps[25], Whence::Absolute, Direction::Nearest)
        .expect("nearest");
    assert_eq!(pool.nth(exact.index).expect("nth").timestamp, stamps[25]);

    let err = pool
        .lookup(stamps[29] + 60.0, Whence::Absolute, Direction::NotEarlierThan)
        .expect_err("future");
    assert_eq!(err.kind(), ErrorKind::NoSuchRecord);
    drop(pool);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn racing_readers_never_see_torn_records() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(temp.path(), "race", PoolOptions::new(8192).with_index_capacity(8));
    let total = 3_000u64;

    let writer_path = path.clone();
    let writer = thread::spawn(move || {
        let mut pool = Pool::open(&writer_path).expect("writer");
        let mut rng = XorShift64::new(7);
        for n in 0..total {
            let len = 16 + rng.below(200) as usize;
            pool.deposit(&payload_for(n, len)).expect("deposit");
        }
    });

    let mut reader = Pool::open(&path).expect("reader");
    let mut rng = XorShift64::new(11);
    let mut verified = 0u64;
    loop {
        let done = writer.is_finished();
        let bounds = reader
            .oldest_index()
            .and_then(|oldest| Ok((oldest, reader.newest_index()?)));
        let (oldest, newest) = match bounds {
            Ok(bounds) => bounds,
            Err(err) if err.kind().is_retryable() || err.kind() == ErrorKind::NoSuchRecord => {
                continue;
            }
            Err(err) => panic!("bounds: {err}"),
        };
        let target = oldest + rng.below(newest.saturating_sub(oldest) + 1);
        match reader.nth(target) {
            Ok(record) => {
                assert_eq!(record.index, target);
                assert_eq!(record.payload, payload_for(target, record.payload.len()));
                verified += 1;
            }
            Err(err) if matches!(err.kind(), ErrorKind::Stompled | ErrorKind::NoSuchRecord) => {}
            Err(err) => panic!("read {target}: {err}"),
        }
        if done {
            break;
        }
    }
    writer.join().expect("writer");
    assert!(verified > 0);
    drop(reader);
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn stale_reader_skips_forward_never_backward() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(temp.path(), "stale", PoolOptions::new(4096));
    let mut writer = Pool::open(&path).expect("writer");
    let mut reader = Pool::open(&path).expect("reader");
    writer.deposit(b"zero").expect("deposit");
    assert_eq!(reader.next().expect("next").index, 0);

    for n in 1..200u64 {
        writer
            .deposit(&payload_for(n, SMALL_RECORD_PAYLOAD))
            .expect("deposit");
    }
    let oldest = writer.oldest_index().expect("oldest");
    let record = reader.next().expect("next after wrap");
    assert_eq!(record.index, oldest);
    assert!(record.index > 1);
    drop((writer, reader));
    Pool::dispose(&path).expect("dispose");
}

#[test]
fn waiter_in_another_thread_sees_the_next_deposit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = create(temp.path(), "await", PoolOptions::new(SIZE_SMALL));
    let mut reader = Pool::open(&path).expect("reader");
    let notification_dir = reader.paths().notification_dir.clone();

    let waiter = thread::spawn(move || {
        reader
            .await_next(Timeout::Forever, None)
            .map(|record| record.payload)
    });
    for _ in 0..500 {
        if std::fs::read_dir(&notification_dir)
            .map(|entries| entries.count() > 0)
            .unwrap_or(false)
        {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let mut writer = Pool::open(&path).expect("writer");
    writer.deposit(b"wake up").expect("deposit");
    assert_eq!(waiter.join().expect("join").expect("await"), b"wake up");
    drop(writer);
    Pool::dispose(&path).expect("dispose");
}
