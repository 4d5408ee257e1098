//! Purpose: Centralize on-disk constants: magic numbers, versions, flags, and size classes.
//! Exports: prefix constants, `PoolFlag`, size classes, `FilePrefix`, `pool_version_error`.
//! Role: Shared policy for gating on-disk compatibility across create/open paths.
//! Invariants: Values here are part of the file format; never renumber existing ones.
//! Invariants: Version list is additive; bump only for incompatible on-disk changes.

use crate::core::error::{Error, ErrorKind};

/// First four bytes of every chunked pool file.
pub const POOL_MAGIC: [u8; 4] = [0xff, 0xff, 0x0b, 0x10];
pub const FILE_PREFIX_LEN: usize = 8;

/// Version of the payload framing stored in the file prefix.
pub const PAYLOAD_VERSION: u8 = 2;
pub const SUPPORTED_PAYLOAD_VERSIONS: &[u8] = &[PAYLOAD_VERSION];
pub const PAYLOAD_TYPE_POOL: u8 = 1;

/// `conf.mmap_version` for chunked headers.
pub const MMAP_VERSION: i64 = 1;

/// Config-in-file pools keep `[oldest][newest][magic]` at the front of the map.
pub const V0_HEADER_LEN: u64 = 24;
pub const V0_MAGIC: u64 = 0x0006_5b00_00af_4c81;
pub const V0_MAGIC_MASK: u64 = 0xffff_ffff_00ff_ffff;
pub const V0_PAYLOAD_VERSION_SHIFT: u32 = 24;

pub const DIRECTORY_VERSION_CONFIG_IN_FILE: u32 = 3;
pub const DIRECTORY_VERSION_CONFIG_IN_MMAP: u32 = 4;
pub const DIRECTORY_VERSION_SINGLE_FILE: u32 = 5;

pub const SIZE_TINY: u64 = 64 * 1024;
pub const SIZE_SMALL: u64 = 1024 * 1024;
pub const SIZE_MEDIUM: u64 = 10 * 1024 * 1024;
pub const SIZE_LARGE: u64 = 100 * 1024 * 1024;
pub const SIZE_OBSCENE: u64 = 2 * 1024 * 1024 * 1024;
pub const SIZE_MAX: u64 = 8 * 1024 * 1024 * 1024 * 1024;
pub const SIZE_GRANULE: u64 = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolFlag {
    StopWhenFull = 0x01,
    Frozen = 0x02,
    AutoDispose = 0x04,
    Checksum = 0x08,
    Sync = 0x10,
}

impl PoolFlag {
    pub const ALL: [PoolFlag; 5] = [
        PoolFlag::StopWhenFull,
        PoolFlag::Frozen,
        PoolFlag::AutoDispose,
        PoolFlag::Checksum,
        PoolFlag::Sync,
    ];

    pub fn bit(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolFlag::StopWhenFull => "stop-when-full",
            PoolFlag::Frozen => "frozen",
            PoolFlag::AutoDispose => "auto-dispose",
            PoolFlag::Checksum => "checksum",
            PoolFlag::Sync => "sync",
        }
    }
}

/// The fixed 8-byte file prefix: magic, payload version, payload type, flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FilePrefix {
    pub payload_version: u8,
    pub payload_type: u8,
    pub flags: u16,
}

impl FilePrefix {
    pub fn current() -> Self {
        Self {
            payload_version: PAYLOAD_VERSION,
            payload_type: PAYLOAD_TYPE_POOL,
            flags: 0,
        }
    }

    pub fn encode(&self) -> [u8; FILE_PREFIX_LEN] {
        let mut buf = [0u8; FILE_PREFIX_LEN];
        buf[0..4].copy_from_slice(&POOL_MAGIC);
        buf[4] = self.payload_version;
        buf[5] = self.payload_type;
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < FILE_PREFIX_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("file prefix too small"));
        }
        if buf[0..4] != POOL_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "bad magic {:02x}{:02x}{:02x}{:02x}",
                buf[0], buf[1], buf[2], buf[3]
            )));
        }
        let payload_version = buf[4];
        if !SUPPORTED_PAYLOAD_VERSIONS.contains(&payload_version) {
            return Err(pool_version_error(u32::from(payload_version)));
        }
        Ok(Self {
            payload_version,
            payload_type: buf[5],
            flags: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

pub fn pool_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_PAYLOAD_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "unsupported pool format version {detected} (supported: {supported})"
        ))
        .with_hint("Recreate the pool with this version of ringpool.")
}
