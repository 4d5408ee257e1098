// Record layout inside the data region, alignment helpers, and payload framing.
use crate::core::error::{Error, ErrorKind};

/// `f64` timestamp followed by `u64` index.
pub const RECORD_PREFIX_LEN: usize = 16;
/// Trailing `u64` jumpback.
pub const RECORD_TRAILER_LEN: usize = 8;
/// `u32` length followed by its complement.
pub const PAYLOAD_HEADER_LEN: usize = 8;
pub const RECORD_OVERHEAD: usize = RECORD_PREFIX_LEN + RECORD_TRAILER_LEN;
pub const MAX_PAYLOAD: usize = u32::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordPrefix {
    pub timestamp: f64,
    pub index: u64,
}

impl RecordPrefix {
    pub fn encode(&self) -> [u8; RECORD_PREFIX_LEN] {
        let mut buf = [0u8; RECORD_PREFIX_LEN];
        write_u64(&mut buf, 0, self.timestamp.to_bits());
        write_u64(&mut buf, 8, self.index);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < RECORD_PREFIX_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("record prefix too small"));
        }
        Ok(Self {
            timestamp: f64::from_bits(read_u64(buf, 0)),
            index: read_u64(buf, 8),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PayloadHeader {
    pub len: u32,
    pub len_xor: u32,
}

impl PayloadHeader {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            len_xor: len ^ 0xFFFF_FFFF,
        }
    }

    pub fn encode(&self) -> [u8; PAYLOAD_HEADER_LEN] {
        let mut buf = [0u8; PAYLOAD_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len_xor.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < PAYLOAD_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("payload header too small"));
        }
        let header = Self {
            len: read_u32(buf, 0),
            len_xor: read_u32(buf, 4),
        };
        if header.len ^ header.len_xor != 0xFFFF_FFFF {
            return Err(Error::new(ErrorKind::Corrupt).with_message("payload length xor mismatch"));
        }
        Ok(header)
    }

    /// Bytes the framed payload occupies, padding included.
    pub fn framed_len(&self) -> usize {
        align8(PAYLOAD_HEADER_LEN + self.len as usize)
    }
}

pub fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Total on-disk length of a record carrying `payload_len` bytes.
pub fn entry_len(payload_len: usize) -> Option<u64> {
    if payload_len > MAX_PAYLOAD {
        return None;
    }
    let framed = PAYLOAD_HEADER_LEN.checked_add(payload_len)?.checked_add(7)? & !7;
    framed
        .checked_add(RECORD_OVERHEAD)
        .map(|total| total as u64)
}

/// Encodes a full record (prefix, framed payload, jumpback) into `buf`,
/// which must be exactly `entry_len(payload.len())` bytes.
pub fn encode_record(buf: &mut [u8], prefix: RecordPrefix, payload: &[u8]) -> Result<(), Error> {
    let total = entry_len(payload.len())
        .ok_or_else(|| Error::new(ErrorKind::RecordTooLarge).with_message("payload too large"))?;
    if buf.len() as u64 != total {
        return Err(Error::new(ErrorKind::Internal).with_message("record buffer length mismatch"));
    }
    buf[..RECORD_PREFIX_LEN].copy_from_slice(&prefix.encode());
    let header = PayloadHeader::new(payload.len() as u32);
    let body = RECORD_PREFIX_LEN + PAYLOAD_HEADER_LEN;
    buf[RECORD_PREFIX_LEN..body].copy_from_slice(&header.encode());
    buf[body..body + payload.len()].copy_from_slice(payload);
    let trailer = buf.len() - RECORD_TRAILER_LEN;
    buf[body + payload.len()..trailer].fill(0);
    write_u64(buf, trailer, total);
    Ok(())
}

/// Bytes needed to learn a record's index and total length.
pub const RECORD_HEAD_LEN: usize = RECORD_PREFIX_LEN + PAYLOAD_HEADER_LEN;

/// Prefix plus the total record length implied by the payload header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordHead {
    pub prefix: RecordPrefix,
    pub payload_len: u32,
    pub total_len: u64,
}

pub fn decode_head(buf: &[u8]) -> Result<RecordHead, Error> {
    if buf.len() < RECORD_HEAD_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record head too small"));
    }
    let prefix = RecordPrefix::decode(buf)?;
    let payload = PayloadHeader::decode(&buf[RECORD_PREFIX_LEN..])?;
    Ok(RecordHead {
        prefix,
        payload_len: payload.len,
        total_len: (RECORD_OVERHEAD + payload.framed_len()) as u64,
    })
}

/// A record copied out of the pool with its unwrapped byte range.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub index: u64,
    pub timestamp: f64,
    pub payload: Vec<u8>,
    pub start: u64,
    pub end: u64,
}

impl Record {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
