// Read cursor over a pool: sequential motion, random access, and a quick position cache.
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::Record;
use crate::core::plan;
use crate::core::store::{Store, retry_stompled};

pub const QUICK_CACHE_SLOTS: usize = 1000;

/// Direct-mapped `index % 1000` cache of record start offsets.
#[derive(Clone, Debug)]
pub struct QuickCache {
    slots: Vec<Option<(u64, u64)>>,
}

impl QuickCache {
    pub fn new() -> Self {
        Self {
            slots: vec![None; QUICK_CACHE_SLOTS],
        }
    }

    pub fn insert(&mut self, index: u64, pos: u64) {
        self.slots[(index % QUICK_CACHE_SLOTS as u64) as usize] = Some((index, pos));
    }

    pub fn get(&self, index: u64) -> Option<u64> {
        match self.slots[(index % QUICK_CACHE_SLOTS as u64) as usize] {
            Some((cached, pos)) if cached == index => Some(pos),
            _ => None,
        }
    }

    pub fn forget(&mut self, index: u64) {
        let slot = &mut self.slots[(index % QUICK_CACHE_SLOTS as u64) as usize];
        if matches!(slot, Some((cached, _)) if *cached == index) {
            *slot = None;
        }
    }
}

impl Default for QuickCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct Cursor {
    pos: u64,
    /// Index of the record ending at `pos`; `None` when `pos` is a record start.
    follows: Option<u64>,
    last: Option<Record>,
    cache: QuickCache,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            pos: 0,
            follows: None,
            last: None,
            cache: QuickCache::new(),
        }
    }

    /// Positions a fresh participant just after the newest record.
    pub fn attach(store: &Store) -> Result<Self, Error> {
        let mut cursor = Self::new();
        let ring = store.ring();
        if ring.is_empty() {
            cursor.pos = ring.oldest;
            return Ok(cursor);
        }
        cursor.pos = ring.newest;
        match cursor.next(store) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NoSuchRecord => {
                cursor.pos = store.oldest();
                cursor.follows = None;
            }
            Err(err) => return Err(err),
        }
        Ok(cursor)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn last(&self) -> Option<&Record> {
        self.last.as_ref()
    }

    pub fn rewind(&mut self, store: &Store) {
        self.pos = store.oldest();
        self.follows = None;
    }

    /// Positions so that `next` returns the newest record.
    pub fn to_last(&mut self, store: &Store) {
        let ring = store.ring();
        self.pos = if ring.is_empty() { ring.oldest } else { ring.newest };
        self.follows = None;
    }

    /// Positions after the newest record so that `next` waits for new data.
    pub fn runout(&mut self, store: &Store) -> Result<(), Error> {
        retry_stompled(|| {
            let ring = store.ring();
            if ring.is_empty() {
                self.pos = ring.oldest;
                self.follows = None;
                return Ok(());
            }
            let head = store.read_head(ring.newest)?;
            self.pos = ring.newest + head.total_len;
            self.follows = Some(head.prefix.index);
            Ok(())
        })
    }

    /// True when no record after the cursor has been deposited yet.
    pub fn at_end(&self, store: &Store) -> Result<bool, Error> {
        let ring = store.ring();
        if ring.is_empty() {
            return Ok(true);
        }
        if self.pos < ring.oldest {
            return Ok(false);
        }
        match self.follows {
            None => Ok(self.pos > ring.newest),
            Some(index) => Ok(index >= store.newest_index()?),
        }
    }

    pub fn next(&mut self, store: &Store) -> Result<Record, Error> {
        retry_stompled(|| self.try_next(store))
    }

    fn try_next(&mut self, store: &Store) -> Result<Record, Error> {
        if store.ring().is_empty() {
            return Err(Error::new(ErrorKind::NoSuchRecord).with_message("pool is empty"));
        }
        if let Some(index) = self.follows {
            if index >= store.newest_index()? {
                return Err(Error::new(ErrorKind::NoSuchRecord)
                    .with_message("no record after the newest")
                    .with_index(index + 1));
            }
        }
        // Snapshot after the newest check so the follower lies inside this ring.
        let ring = store.ring();
        if self.pos < ring.oldest {
            tracing::debug!(pos = self.pos, oldest = ring.oldest, "cursor fell behind oldest");
            self.pos = ring.oldest;
            self.follows = None;
        }
        let target = match self.follows {
            None => self.pos,
            Some(index) => plan::position_after(store.mem(), &ring, self.pos, index),
        };
        let record = store.read_record(target)?;
        if let Some(index) = self.follows {
            if record.index != index + 1 {
                return Err(Error::new(ErrorKind::Stompled)
                    .with_message("record after cursor changed while resolving")
                    .with_index(index + 1)
                    .with_offset(target));
            }
        }
        Ok(self.accept(record))
    }

    /// The last record read, reading forward if nothing has been read yet.
    pub fn curr(&mut self, store: &Store) -> Result<Record, Error> {
        match &self.last {
            Some(record) => Ok(record.clone()),
            None => self.next(store),
        }
    }

    pub fn prev(&mut self, store: &Store) -> Result<Record, Error> {
        if self.last.is_none() {
            let ring = store.ring();
            if ring.is_empty() {
                return Err(Error::new(ErrorKind::NoSuchRecord).with_message("pool is empty"));
            }
            if self.follows.is_none() && self.pos <= ring.oldest {
                return Err(
                    Error::new(ErrorKind::NoSuchRecord).with_message("already at oldest record")
                );
            }
            match self.curr(store) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NoSuchRecord => {
                    // Nothing deposited since attaching: step back onto the newest record.
                    return retry_stompled(|| {
                        let record = store.read_record(store.ring().newest)?;
                        Ok(self.accept(record))
                    });
                }
                Err(err) => return Err(err),
            }
        }
        match self.last.as_ref().map(|record| record.index) {
            Some(index) if index > 0 => self.nth(store, index - 1),
            _ => Err(Error::new(ErrorKind::NoSuchRecord).with_message("already at record zero")),
        }
    }

    /// Reads record `index` and leaves the cursor just after it.
    pub fn nth(&mut self, store: &Store, index: u64) -> Result<Record, Error> {
        retry_stompled(|| {
            let pos = self.locate(store, index)?;
            let record = store.read_record(pos)?;
            if record.index != index {
                self.cache.forget(index);
                return Err(Error::new(ErrorKind::Stompled)
                    .with_message("located record changed before it was read")
                    .with_index(index)
                    .with_offset(pos));
            }
            Ok(self.accept(record))
        })
    }

    /// Positions the cursor so that `next` returns record `index`.
    pub fn seek_to(&mut self, store: &Store, index: u64) -> Result<u64, Error> {
        let pos = retry_stompled(|| self.locate(store, index))?;
        self.pos = pos;
        self.follows = None;
        Ok(index)
    }

    fn accept(&mut self, record: Record) -> Record {
        self.pos = record.end;
        self.follows = Some(record.index);
        self.cache.insert(record.index, record.start);
        self.last = Some(record.clone());
        record
    }

    /// Finds the start offset of record `index` without moving the cursor.
    pub fn locate(&mut self, store: &Store, index: u64) -> Result<u64, Error> {
        let newest_index = store.newest_index()?;
        if index > newest_index {
            return Err(Error::new(ErrorKind::NoSuchRecord)
                .with_message(format!("record {index} not yet in pool"))
                .with_index(index));
        }
        let oldest_index = store.oldest_index()?;
        if index < oldest_index {
            return Err(Error::new(ErrorKind::NoSuchRecord)
                .with_message(format!("record {index} no longer in pool"))
                .with_index(index));
        }
        if let Some(pos) = self.locate_near_last(store, index)? {
            return Ok(pos);
        }

        let ring = store.ring();
        if let Some(pos) = self.cache.get(index) {
            if pos >= ring.oldest && pos <= ring.newest {
                return Ok(pos);
            }
        }

        let (first_index, first_pos) = store
            .first_index_and_offset()?
            .ok_or_else(|| Error::new(ErrorKind::NoSuchRecord).with_message("pool is empty"))?;
        let (mut at_index, mut at_pos) = if index >= first_index {
            (first_index, first_pos)
        } else {
            (oldest_index, ring.oldest)
        };
        if let Some(last) = &self.last {
            if index >= last.index && index - last.index < index - at_index && last.start >= ring.oldest
            {
                at_index = last.index;
                at_pos = last.start;
            }
        }
        if let Some(region) = store.view().index() {
            if let Some(hit) = region.find(store.mem(), index) {
                if hit.offset >= ring.oldest && hit.index <= index && index - hit.index < index - at_index
                {
                    match store.index_at(hit.offset) {
                        Ok(found) if found == hit.index => {
                            at_index = hit.index;
                            at_pos = hit.offset;
                        }
                        Ok(found) => tracing::warn!(
                            sampled = hit.index,
                            offset = hit.offset,
                            found,
                            "sparse index disagrees with record at sampled offset"
                        ),
                        Err(err) if err.kind() == ErrorKind::Stompled => {}
                        Err(err) if err.kind() == ErrorKind::NoSuchRecord => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        loop {
            let head = store.read_head(at_pos)?;
            if head.prefix.index != at_index {
                return Err(Error::new(ErrorKind::Stompled)
                    .with_message("walk landed on an unexpected record")
                    .with_index(at_index)
                    .with_offset(at_pos));
            }
            self.cache.insert(at_index, at_pos);
            if at_index == index {
                return Ok(at_pos);
            }
            at_pos = plan::position_after(store.mem(), &ring, at_pos + head.total_len, at_index);
            at_index += 1;
        }
    }

    /// Shortcuts relative to the last record read.
    fn locate_near_last(&self, store: &Store, index: u64) -> Result<Option<u64>, Error> {
        let Some(last) = &self.last else {
            return Ok(None);
        };
        if let Some((first_index, first_pos)) = store.first_index_and_offset()? {
            if index == first_index {
                return Ok(Some(first_pos));
            }
        }
        if index == last.index {
            return Ok(Some(last.start));
        }
        if index == last.index + 1 && last.index < store.newest_index()? {
            let ring = store.ring();
            return Ok(Some(plan::position_after(
                store.mem(),
                &ring,
                last.end,
                last.index,
            )));
        }
        if index + 1 == last.index {
            return match store.position_before(last.start) {
                Ok(found) => Ok(found),
                Err(err)
                    if matches!(err.kind(), ErrorKind::NoSuchRecord | ErrorKind::Stompled) =>
                {
                    Ok(None)
                }
                Err(err) => Err(err),
            };
        }
        Ok(None)
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}
