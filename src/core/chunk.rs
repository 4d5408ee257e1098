//! Purpose: Encode and decode the self-describing header chunks of a pool file.
//! Exports: `ChunkTag`, `ChunkHeader`, `ChunkFields`, `read_chunk`, `write_chunk`, `skip_chunk`.
//! Role: Builds the extensible header at create time and walks it at open time.
//! Invariants: Each chunk starts `[0x1badd00d << 32 | tag][length in 8-byte words]`.
//! Invariants: Fields are 8-byte little-endian; the declared length covers the 16-byte header.
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::core::error::{Error, ErrorKind};

pub const CHUNK_MAGIC: u64 = 0x1bad_d00d;
pub const CHUNK_HEADER_LEN: usize = 16;
pub const FIELD_LEN: usize = 8;

pub const INDEX_SIGNATURE: u64 = 0x00be_ef00_feed_0011;
pub const INDEX_FIELD_COUNT: usize = 7;
pub const INDEX_ENTRY_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChunkTag {
    Conf,
    Ptrs,
    Perm,
    Indx,
}

impl ChunkTag {
    pub fn name(self) -> [u8; 4] {
        match self {
            ChunkTag::Conf => *b"conf",
            ChunkTag::Ptrs => *b"ptrs",
            ChunkTag::Perm => *b"perm",
            ChunkTag::Indx => *b"indx",
        }
    }

    pub fn from_name(name: [u8; 4]) -> Option<Self> {
        match &name {
            b"conf" => Some(ChunkTag::Conf),
            b"ptrs" => Some(ChunkTag::Ptrs),
            b"perm" => Some(ChunkTag::Perm),
            b"indx" => Some(ChunkTag::Indx),
            _ => None,
        }
    }

    /// Number of fixed 8-byte fields following the chunk header.
    pub fn field_count(self) -> usize {
        match self {
            ChunkTag::Conf => 6,
            ChunkTag::Ptrs => 2,
            ChunkTag::Perm => 3,
            ChunkTag::Indx => INDEX_FIELD_COUNT,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkHeader {
    pub name: [u8; 4],
    pub words: u64,
}

impl ChunkHeader {
    pub fn for_tag(tag: ChunkTag, byte_len: usize) -> Self {
        Self {
            name: tag.name(),
            words: (byte_len / FIELD_LEN) as u64,
        }
    }

    pub fn tag(&self) -> Option<ChunkTag> {
        ChunkTag::from_name(self.name)
    }

    pub fn byte_len(&self) -> u64 {
        self.words * FIELD_LEN as u64
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];
        let word = (CHUNK_MAGIC << 32) | u64::from(u32::from_be_bytes(self.name));
        buf[0..8].copy_from_slice(&word.to_le_bytes());
        buf[8..16].copy_from_slice(&self.words.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CHUNK_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("chunk header too small"));
        }
        let word = read_u64(buf, 0);
        if word >> 32 != CHUNK_MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                "chunk doesn't start with {CHUNK_MAGIC:#x} ({:#x})",
                word >> 32
            )));
        }
        let name = (word as u32).to_be_bytes();
        let words = read_u64(buf, 8);
        if words < (CHUNK_HEADER_LEN / FIELD_LEN) as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("chunk length too small"));
        }
        Ok(Self { name, words })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConfFields {
    pub mmap_version: i64,
    pub file_size: i64,
    pub header_size: i64,
    pub sem_key: i64,
    pub flags: i64,
    pub next_index: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PtrsFields {
    pub oldest: i64,
    pub newest: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PermFields {
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndxFields {
    pub signature: u64,
    pub capacity: u64,
    pub count: u64,
    pub start: u64,
    pub step: u64,
    pub first: i64,
    pub last: i64,
}

impl IndxFields {
    pub fn empty(capacity: u64) -> Self {
        Self {
            signature: INDEX_SIGNATURE,
            capacity,
            count: 0,
            start: 0,
            step: 1,
            first: 0,
            last: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkFields {
    Conf(ConfFields),
    Ptrs(PtrsFields),
    Perm(PermFields),
    Indx(IndxFields),
}

impl ChunkFields {
    pub fn tag(&self) -> ChunkTag {
        match self {
            ChunkFields::Conf(_) => ChunkTag::Conf,
            ChunkFields::Ptrs(_) => ChunkTag::Ptrs,
            ChunkFields::Perm(_) => ChunkTag::Perm,
            ChunkFields::Indx(_) => ChunkTag::Indx,
        }
    }

    /// Full on-disk length including the chunk header and any index entries.
    pub fn byte_len(&self) -> usize {
        let fixed = CHUNK_HEADER_LEN + self.tag().field_count() * FIELD_LEN;
        match self {
            ChunkFields::Indx(indx) => fixed + indx.capacity as usize * INDEX_ENTRY_LEN,
            _ => fixed,
        }
    }

    fn words(&self) -> Vec<u64> {
        match *self {
            ChunkFields::Conf(c) => vec![
                c.mmap_version as u64,
                c.file_size as u64,
                c.header_size as u64,
                c.sem_key as u64,
                c.flags as u64,
                c.next_index as u64,
            ],
            ChunkFields::Ptrs(p) => vec![p.oldest as u64, p.newest as u64],
            ChunkFields::Perm(p) => vec![p.mode as u64, p.uid as u64, p.gid as u64],
            ChunkFields::Indx(i) => vec![
                i.signature,
                i.capacity,
                i.count,
                i.start,
                i.step,
                i.first as u64,
                i.last as u64,
            ],
        }
    }

    fn from_words(tag: ChunkTag, w: &[u64]) -> Self {
        match tag {
            ChunkTag::Conf => ChunkFields::Conf(ConfFields {
                mmap_version: w[0] as i64,
                file_size: w[1] as i64,
                header_size: w[2] as i64,
                sem_key: w[3] as i64,
                flags: w[4] as i64,
                next_index: w[5] as i64,
            }),
            ChunkTag::Ptrs => ChunkFields::Ptrs(PtrsFields {
                oldest: w[0] as i64,
                newest: w[1] as i64,
            }),
            ChunkTag::Perm => ChunkFields::Perm(PermFields {
                mode: w[0] as i64,
                uid: w[1] as i64,
                gid: w[2] as i64,
            }),
            ChunkTag::Indx => ChunkFields::Indx(IndxFields {
                signature: w[0],
                capacity: w[1],
                count: w[2],
                start: w[3],
                step: w[4],
                first: w[5] as i64,
                last: w[6] as i64,
            }),
        }
    }
}

/// A chunk decoded from a stream, with the stream offset it started at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoadedChunk {
    pub start: u64,
    pub header: ChunkHeader,
    pub fields: ChunkFields,
}

impl LoadedChunk {
    pub fn end(&self) -> u64 {
        self.start + self.header.byte_len()
    }

    /// Absolute offset of the `n`th fixed field.
    pub fn field_offset(&self, n: usize) -> usize {
        self.start as usize + CHUNK_HEADER_LEN + n * FIELD_LEN
    }
}

/// Reads one chunk and leaves the stream positioned after its declared length.
/// Unknown tags are `Corrupt`; use `skip_chunk` to step over them.
pub fn read_chunk<R: Read + Seek>(stream: &mut R) -> Result<LoadedChunk, Error> {
    let start = stream.stream_position().map_err(io_error)?;
    let header = read_chunk_header(stream)?;
    let Some(tag) = header.tag() else {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!(
                "unknown chunk type '{}'",
                String::from_utf8_lossy(&header.name)
            ))
            .with_offset(start));
    };
    let fixed = (CHUNK_HEADER_LEN + tag.field_count() * FIELD_LEN) as u64;
    if header.byte_len() < fixed {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!("chunk '{}' shorter than its fields", tag_str(tag)))
            .with_offset(start));
    }
    let mut words = vec![0u64; tag.field_count()];
    let mut buf = [0u8; FIELD_LEN];
    for word in words.iter_mut() {
        stream.read_exact(&mut buf).map_err(io_error)?;
        *word = u64::from_le_bytes(buf);
    }
    let fields = ChunkFields::from_words(tag, &words);
    stream
        .seek(SeekFrom::Start(start + header.byte_len()))
        .map_err(io_error)?;
    Ok(LoadedChunk {
        start,
        header,
        fields,
    })
}

pub fn read_chunk_header<R: Read>(stream: &mut R) -> Result<ChunkHeader, Error> {
    let mut buf = [0u8; CHUNK_HEADER_LEN];
    stream.read_exact(&mut buf).map_err(io_error)?;
    ChunkHeader::decode(&buf)
}

/// Steps over a chunk of any type by its declared length.
pub fn skip_chunk<R: Read + Seek>(stream: &mut R) -> Result<ChunkHeader, Error> {
    let start = stream.stream_position().map_err(io_error)?;
    let header = read_chunk_header(stream)?;
    stream
        .seek(SeekFrom::Start(start + header.byte_len()))
        .map_err(io_error)?;
    Ok(header)
}

/// Writes a chunk. Index chunks get their entry table zero-filled with the
/// first slot set to the `(-1, -1.0)` sentinel.
pub fn write_chunk<W: Write>(stream: &mut W, fields: &ChunkFields) -> Result<(), Error> {
    let header = ChunkHeader::for_tag(fields.tag(), fields.byte_len());
    stream.write_all(&header.encode()).map_err(io_error)?;
    for word in fields.words() {
        stream.write_all(&word.to_le_bytes()).map_err(io_error)?;
    }
    if let ChunkFields::Indx(indx) = fields {
        write_index_entries(stream, indx.capacity)?;
    }
    Ok(())
}

pub(crate) fn write_index_entries<W: Write>(stream: &mut W, capacity: u64) -> Result<(), Error> {
    for slot in 0..capacity {
        let (offset, timestamp) = if slot == 0 { (-1i64, -1.0f64) } else { (0, 0.0) };
        stream.write_all(&offset.to_le_bytes()).map_err(io_error)?;
        stream
            .write_all(&timestamp.to_bits().to_le_bytes())
            .map_err(io_error)?;
    }
    Ok(())
}

fn tag_str(tag: ChunkTag) -> String {
    String::from_utf8_lossy(&tag.name()).into_owned()
}

fn io_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return Error::new(ErrorKind::Corrupt)
            .with_message("header truncated")
            .with_source(err);
    }
    Error::new(ErrorKind::Io).with_source(err)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}
