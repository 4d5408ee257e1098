//! Purpose: Typed view over the pool header living inside the mapped file.
//! Exports: `HeaderView`, `HeaderSpec`, `HeaderFormat`, `PermBits`, header builders.
//! Role: Resolves field offsets once at open; every later get/set is a direct slice access.
//! Invariants: Offsets are computed from the chunk walk and never change for a mapping.
//! Invariants: Unknown chunk types are skipped by their declared length.
use std::io::Cursor;

use crate::core::chunk::{
    self, ChunkFields, ChunkTag, ConfFields, FIELD_LEN, IndxFields, PermFields, PtrsFields,
};
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    FILE_PREFIX_LEN, FilePrefix, MMAP_VERSION, SUPPORTED_PAYLOAD_VERSIONS, V0_HEADER_LEN,
    V0_MAGIC, V0_MAGIC_MASK, V0_PAYLOAD_VERSION_SHIFT, pool_version_error,
};
use crate::core::index::IndexRegion;

/// Absolute offset of one 8-byte little-endian header field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FieldSlot(usize);

impl FieldSlot {
    fn get(self, mem: &[u8]) -> u64 {
        chunk::read_u64(mem, self.0)
    }

    fn set(self, mem: &mut [u8], value: u64) {
        mem[self.0..self.0 + FIELD_LEN].copy_from_slice(&value.to_le_bytes());
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderFormat {
    /// Prefix plus `conf`/`ptrs`/`perm`/`indx` chunks.
    Chunked,
    /// `[oldest][newest][magic]` followed by a bare index; config lives in side files.
    Legacy,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PermBits {
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
}

/// Inputs for a freshly created header.
#[derive(Clone, Copy, Debug)]
pub struct HeaderSpec {
    pub file_size: u64,
    pub index_capacity: u64,
    pub sem_key: i64,
    pub flags: i64,
    pub perm: PermBits,
}

/// Settings a legacy pool keeps outside the mapped file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LegacyConf {
    pub file_size: u64,
    pub header_size: u64,
    pub index_capacity: u64,
    pub sem_key: i64,
}

#[derive(Clone, Copy, Debug)]
struct PermSlots {
    mode: FieldSlot,
    uid: FieldSlot,
    gid: FieldSlot,
}

#[derive(Clone, Copy, Debug)]
pub struct HeaderView {
    format: HeaderFormat,
    payload_version: u8,
    file_size: u64,
    header_size: u64,
    sem_key: i64,
    oldest: FieldSlot,
    newest: FieldSlot,
    flags: Option<FieldSlot>,
    next_index: Option<FieldSlot>,
    perm: Option<PermSlots>,
    index: Option<IndexRegion>,
}

pub fn chunked_header_size(index_capacity: u64) -> u64 {
    let fixed = FILE_PREFIX_LEN
        + ChunkFields::Conf(empty_conf()).byte_len()
        + ChunkFields::Ptrs(PtrsFields { oldest: 0, newest: 0 }).byte_len()
        + ChunkFields::Perm(PermFields {
            mode: 0,
            uid: 0,
            gid: 0,
        })
        .byte_len();
    let index = if index_capacity > 0 {
        ChunkFields::Indx(IndxFields::empty(index_capacity)).byte_len()
    } else {
        0
    };
    (fixed + index) as u64
}

pub fn legacy_header_size(index_capacity: u64) -> u64 {
    let index = if index_capacity > 0 {
        IndexRegion::byte_len(index_capacity) as u64
    } else {
        0
    };
    V0_HEADER_LEN + index
}

/// Serializes prefix and chunks in their fixed order with an empty ring.
pub fn encode_chunked_header(spec: &HeaderSpec) -> Result<Vec<u8>, Error> {
    let header_size = chunked_header_size(spec.index_capacity);
    let mut buf = Vec::with_capacity(header_size as usize);
    buf.extend_from_slice(&FilePrefix::current().encode());
    let conf = ConfFields {
        mmap_version: MMAP_VERSION,
        file_size: spec.file_size as i64,
        header_size: header_size as i64,
        sem_key: spec.sem_key,
        flags: spec.flags,
        next_index: 0,
    };
    chunk::write_chunk(&mut buf, &ChunkFields::Conf(conf))?;
    chunk::write_chunk(
        &mut buf,
        &ChunkFields::Ptrs(PtrsFields {
            oldest: header_size as i64,
            newest: 0,
        }),
    )?;
    chunk::write_chunk(
        &mut buf,
        &ChunkFields::Perm(PermFields {
            mode: spec.perm.mode,
            uid: spec.perm.uid,
            gid: spec.perm.gid,
        }),
    )?;
    if spec.index_capacity > 0 {
        chunk::write_chunk(
            &mut buf,
            &ChunkFields::Indx(IndxFields::empty(spec.index_capacity)),
        )?;
    }
    debug_assert_eq!(buf.len() as u64, header_size);
    Ok(buf)
}

pub fn encode_legacy_header(index_capacity: u64) -> Result<Vec<u8>, Error> {
    let header_size = legacy_header_size(index_capacity);
    let mut buf = Vec::with_capacity(header_size as usize);
    buf.extend_from_slice(&header_size.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    let payload_version = u64::from(SUPPORTED_PAYLOAD_VERSIONS[0]);
    let magic = V0_MAGIC | (payload_version << V0_PAYLOAD_VERSION_SHIFT);
    buf.extend_from_slice(&magic.to_le_bytes());
    if index_capacity > 0 {
        let fields = IndxFields::empty(index_capacity);
        for word in [
            fields.signature,
            fields.capacity,
            fields.count,
            fields.start,
            fields.step,
            fields.first as u64,
            fields.last as u64,
        ] {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        chunk::write_index_entries(&mut buf, index_capacity)?;
    }
    Ok(buf)
}

impl HeaderView {
    /// Walks the chunked header of a mapped pool file.
    pub fn load_chunked(mem: &[u8]) -> Result<Self, Error> {
        let prefix = FilePrefix::decode(mem)?;
        let mut stream = Cursor::new(mem);
        stream.set_position(FILE_PREFIX_LEN as u64);

        let conf_chunk = chunk::read_chunk(&mut stream)?;
        let ChunkFields::Conf(conf) = conf_chunk.fields else {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("first header chunk is not 'conf'")
                .with_offset(conf_chunk.start));
        };
        if conf.mmap_version != MMAP_VERSION {
            return Err(pool_version_error(conf.mmap_version as u32));
        }
        let file_size = conf.file_size as u64;
        let header_size = conf.header_size as u64;
        if conf.file_size <= 0 || file_size > mem.len() as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "header file size {} disagrees with mapping of {} bytes",
                conf.file_size,
                mem.len()
            )));
        }
        if header_size < conf_chunk.end() || header_size >= file_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("header size {} out of range", conf.header_size)));
        }

        let mut ptrs = None;
        let mut perm = None;
        let mut index = None;
        while stream.position() < header_size {
            let at = stream.position();
            let peeked = chunk::read_chunk_header(&mut stream)?;
            stream.set_position(at);
            if at + peeked.byte_len() > header_size {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("header chunk overruns header")
                    .with_offset(at));
            }
            if peeked.tag().is_none() {
                tracing::warn!(
                    offset = at,
                    tag = %String::from_utf8_lossy(&peeked.name),
                    "skipping unknown header chunk"
                );
                chunk::skip_chunk(&mut stream)?;
                continue;
            }
            let loaded = chunk::read_chunk(&mut stream)?;
            match loaded.fields {
                ChunkFields::Ptrs(_) => {
                    ptrs = Some((
                        FieldSlot(loaded.field_offset(0)),
                        FieldSlot(loaded.field_offset(1)),
                    ));
                }
                ChunkFields::Perm(_) => {
                    perm = Some(PermSlots {
                        mode: FieldSlot(loaded.field_offset(0)),
                        uid: FieldSlot(loaded.field_offset(1)),
                        gid: FieldSlot(loaded.field_offset(2)),
                    });
                }
                ChunkFields::Indx(indx) => {
                    let region = IndexRegion::new(loaded.field_offset(0), indx.capacity);
                    region.verify(mem)?;
                    index = Some(region);
                }
                ChunkFields::Conf(_) => {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_message("duplicate 'conf' chunk")
                        .with_offset(at));
                }
            }
        }

        let Some((oldest, newest)) = ptrs else {
            return Err(missing_chunk(ChunkTag::Ptrs));
        };
        if perm.is_none() {
            return Err(missing_chunk(ChunkTag::Perm));
        }

        Ok(Self {
            format: HeaderFormat::Chunked,
            payload_version: prefix.payload_version,
            file_size,
            header_size,
            sem_key: conf.sem_key,
            oldest,
            newest,
            flags: Some(FieldSlot(conf_chunk.field_offset(4))),
            next_index: Some(FieldSlot(conf_chunk.field_offset(5))),
            perm,
            index,
        })
    }

    /// Binds the fixed legacy layout using settings read from `mmap.conf`/`pool.conf`.
    pub fn load_legacy(mem: &[u8], conf: &LegacyConf) -> Result<Self, Error> {
        if conf.file_size > mem.len() as u64 || conf.header_size >= conf.file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "legacy sizes (file {}, header {}) disagree with mapping of {} bytes",
                conf.file_size,
                conf.header_size,
                mem.len()
            )));
        }
        if conf.header_size < legacy_header_size(conf.index_capacity) {
            return Err(Error::new(ErrorKind::Corrupt).with_message("legacy header too small"));
        }
        let magic = chunk::read_u64(mem, 16);
        if magic & V0_MAGIC_MASK != V0_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("bad legacy pool magic {magic:#018x}")));
        }
        let payload_version = ((magic >> V0_PAYLOAD_VERSION_SHIFT) & 0xff) as u8;
        if !SUPPORTED_PAYLOAD_VERSIONS.contains(&payload_version) {
            return Err(pool_version_error(u32::from(payload_version)));
        }
        let index = if conf.index_capacity > 0 {
            let region = IndexRegion::new(V0_HEADER_LEN as usize, conf.index_capacity);
            region.verify(mem)?;
            Some(region)
        } else {
            None
        };
        Ok(Self {
            format: HeaderFormat::Legacy,
            payload_version,
            file_size: conf.file_size,
            header_size: conf.header_size,
            sem_key: conf.sem_key,
            oldest: FieldSlot(0),
            newest: FieldSlot(8),
            flags: None,
            next_index: None,
            perm: None,
            index,
        })
    }

    pub fn format(&self) -> HeaderFormat {
        self.format
    }

    pub fn payload_version(&self) -> u8 {
        self.payload_version
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn sem_key(&self) -> i64 {
        self.sem_key
    }

    pub fn index(&self) -> Option<&IndexRegion> {
        self.index.as_ref()
    }

    pub fn oldest(&self, mem: &[u8]) -> u64 {
        self.oldest.get(mem)
    }

    pub fn newest(&self, mem: &[u8]) -> u64 {
        self.newest.get(mem)
    }

    pub fn set_oldest(&self, mem: &mut [u8], value: u64) {
        self.oldest.set(mem, value);
    }

    pub fn set_newest(&self, mem: &mut [u8], value: u64) {
        self.newest.set(mem, value);
    }

    /// Flag bits; legacy pools have none.
    pub fn flags(&self, mem: &[u8]) -> i64 {
        self.flags.map_or(0, |slot| slot.get(mem) as i64)
    }

    pub fn has_flags(&self) -> bool {
        self.flags.is_some()
    }

    pub fn set_flags(&self, mem: &mut [u8], flags: i64) -> Result<(), Error> {
        let Some(slot) = self.flags else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("this pool layout has no flags")
                .with_hint("Recreate the pool with the default layout to use flags."));
        };
        slot.set(mem, flags as u64);
        Ok(())
    }

    /// Explicit next-index counter, when the layout keeps one.
    pub fn next_index(&self, mem: &[u8]) -> Option<u64> {
        self.next_index.map(|slot| slot.get(mem))
    }

    pub fn set_next_index(&self, mem: &mut [u8], value: u64) {
        if let Some(slot) = self.next_index {
            slot.set(mem, value);
        }
    }

    pub fn perm(&self, mem: &[u8]) -> Option<PermBits> {
        self.perm.map(|slots| PermBits {
            mode: slots.mode.get(mem) as i64,
            uid: slots.uid.get(mem) as i64,
            gid: slots.gid.get(mem) as i64,
        })
    }

    pub fn set_perm(&self, mem: &mut [u8], perm: PermBits) {
        if let Some(slots) = self.perm {
            slots.mode.set(mem, perm.mode as u64);
            slots.uid.set(mem, perm.uid as u64);
            slots.gid.set(mem, perm.gid as u64);
        }
    }
}

fn empty_conf() -> ConfFields {
    ConfFields {
        mmap_version: MMAP_VERSION,
        file_size: 0,
        header_size: 0,
        sem_key: 0,
        flags: 0,
        next_index: 0,
    }
}

fn missing_chunk(tag: ChunkTag) -> Error {
    Error::new(ErrorKind::Corrupt).with_message(format!(
        "header has no '{}' chunk",
        String::from_utf8_lossy(&tag.name())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunk::ChunkHeader;

    const FILE_SIZE: u64 = 4096;

    fn spec(index_capacity: u64) -> HeaderSpec {
        HeaderSpec {
            file_size: FILE_SIZE,
            index_capacity,
            sem_key: 0x0b80_0042,
            flags: 0,
            perm: PermBits {
                mode: 0o640,
                uid: 1000,
                gid: 100,
            },
        }
    }

    fn mapped(header: Vec<u8>) -> Vec<u8> {
        let mut mem = header;
        mem.resize(FILE_SIZE as usize, 0);
        mem
    }

    #[test]
    fn fresh_chunked_header_is_empty() {
        let mem = mapped(encode_chunked_header(&spec(0)).expect("encode"));
        let view = HeaderView::load_chunked(&mem).expect("load");
        assert_eq!(view.format(), HeaderFormat::Chunked);
        assert_eq!(view.header_size(), chunked_header_size(0));
        assert_eq!(view.file_size(), FILE_SIZE);
        assert_eq!(view.oldest(&mem), view.header_size());
        assert_eq!(view.newest(&mem), 0);
        assert!(view.newest(&mem) < view.oldest(&mem));
        assert_eq!(view.next_index(&mem), Some(0));
        assert_eq!(view.sem_key(), 0x0b80_0042);
        assert_eq!(view.perm(&mem).map(|perm| perm.mode), Some(0o640));
        assert!(view.index().is_none());
    }

    #[test]
    fn field_writes_land_in_place() {
        let mut mem = mapped(encode_chunked_header(&spec(8)).expect("encode"));
        let view = HeaderView::load_chunked(&mem).expect("load");
        view.set_newest(&mut mem, 4000);
        view.set_flags(&mut mem, 5).expect("flags");
        view.set_next_index(&mut mem, 9);

        let reloaded = HeaderView::load_chunked(&mem).expect("reload");
        assert_eq!(reloaded.newest(&mem), 4000);
        assert_eq!(reloaded.flags(&mem), 5);
        assert_eq!(reloaded.next_index(&mem), Some(9));
        assert_eq!(reloaded.index().map(|index| index.capacity()), Some(8));
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut buf = FilePrefix::current().encode().to_vec();
        let extra = ChunkHeader {
            name: *b"xtra",
            words: 4,
        };
        let header_size = chunked_header_size(0) + extra.byte_len();
        let conf = ConfFields {
            file_size: FILE_SIZE as i64,
            header_size: header_size as i64,
            ..empty_conf()
        };
        chunk::write_chunk(&mut buf, &ChunkFields::Conf(conf)).expect("conf");
        buf.extend_from_slice(&extra.encode());
        buf.extend_from_slice(&[0xaa; 16]);
        chunk::write_chunk(
            &mut buf,
            &ChunkFields::Ptrs(PtrsFields {
                oldest: header_size as i64,
                newest: 0,
            }),
        )
        .expect("ptrs");
        chunk::write_chunk(
            &mut buf,
            &ChunkFields::Perm(PermFields {
                mode: 0o600,
                uid: 0,
                gid: 0,
            }),
        )
        .expect("perm");
        let mem = mapped(buf);

        let view = HeaderView::load_chunked(&mem).expect("load");
        assert_eq!(view.header_size(), header_size);
        assert_eq!(view.oldest(&mem), header_size);
    }

    #[test]
    fn missing_pointer_chunk_is_corrupt() {
        let mut buf = FilePrefix::current().encode().to_vec();
        let conf = ConfFields {
            file_size: FILE_SIZE as i64,
            header_size: (FILE_PREFIX_LEN + 64) as i64,
            ..empty_conf()
        };
        chunk::write_chunk(&mut buf, &ChunkFields::Conf(conf)).expect("conf");
        let mem = mapped(buf);
        let err = HeaderView::load_chunked(&mem).expect_err("missing ptrs");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn oversized_file_size_is_corrupt() {
        let mut header = spec(0);
        header.file_size = FILE_SIZE * 2;
        let mem = mapped(encode_chunked_header(&header).expect("encode"));
        let err = HeaderView::load_chunked(&mem).expect_err("bad size");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn legacy_header_round_trip() {
        let mut mem = mapped(encode_legacy_header(4).expect("encode"));
        let conf = LegacyConf {
            file_size: FILE_SIZE,
            header_size: legacy_header_size(4),
            index_capacity: 4,
            sem_key: 7,
        };
        let view = HeaderView::load_legacy(&mem, &conf).expect("load");
        assert_eq!(view.format(), HeaderFormat::Legacy);
        assert_eq!(view.oldest(&mem), conf.header_size);
        assert_eq!(view.next_index(&mem), None);
        assert!(!view.has_flags());
        let err = view.set_flags(&mut mem, 1).expect_err("no flags");
        assert_eq!(err.kind(), ErrorKind::Usage);

        mem[16] ^= 0x01;
        let err = HeaderView::load_legacy(&mem, &conf).expect_err("bad magic");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
