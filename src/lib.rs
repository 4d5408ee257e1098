//! Purpose: Shared library crate behind the `ringpool` CLI and its tests.
//! Exports: `core` (pool format, storage, cursors, locking, notification, validation, errors).
//! Role: Embeddable engine for persistent memory-mapped ring-buffer pools.
//! Invariants: Pools are plain files; every process coordinates through the mapped header,
//! Invariants: one System V semaphore set, and fifo wakeups in the notification directory.
pub mod core;
