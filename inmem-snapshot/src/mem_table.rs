use std::ops::Bound;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use ouroboros::self_referencing;

use crate::iterators::{SeekableIterator, StorageIterator};

/// The shared ordered container, based on crossbeam-skiplist. Keys are ordered by their raw bytes.
pub struct MemTable {
    // needs interior mutability
    map: Arc<SkipMap<Bytes, Bytes>>,
}

impl MemTable {
    /// Create a new mem-table.
    pub fn create() -> Self {
        Self {
            map: Arc::new(SkipMap::<Bytes, Bytes>::new()),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Put a key-value pair into the mem-table.
    pub fn put(&self, key: Bytes, value: Bytes) {
        self.map.insert(key, value);
    }

    /// Remove a key. Returns the removed value, if any.
    pub fn remove(&self, key: &[u8]) -> Option<Bytes> {
        self.map.remove(key).map(|entry| entry.value().clone())
    }

    /// Keys strictly below `key`, from the greatest downwards.
    pub fn keys_before<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = Bytes> + 'a {
        self.map
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .rev()
            .map(|entry| entry.key().clone())
    }

    /// Get an iterator over the whole mem-table, positioned at the first entry.
    pub fn iter(&self) -> MemTableIterator {
        let mut iter = self.cursor();
        let _ = iter.next(); // advancing a mem-table cursor never fails
        iter
    }

    /// Get an unpositioned cursor. It is invalid until `seek`, or `rewind` followed by `next`.
    pub fn cursor(&self) -> MemTableIterator {
        MemTableIteratorBuilder {
            map: self.map.clone(),
            iter_builder: |map| map.range((Bound::Unbounded, Bound::Unbounded)),
            curr: None,
            closed: false,
        }
        .build()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::create()
    }
}

type SkipMapRangeIter<'a> =
    crossbeam_skiplist::map::Range<'a, Bytes, (Bound<Bytes>, Bound<Bytes>), Bytes, Bytes>;

/// A seekable cursor over a `SkipMap`. It observes concurrent writes to the map; isolating a
/// reader from them is the job of the snapshot overlay.
#[self_referencing]
pub struct MemTableIterator {
    map: Arc<SkipMap<Bytes, Bytes>>,
    #[borrows(map)]
    #[not_covariant]
    iter: SkipMapRangeIter<'this>,
    curr: Option<(Bytes, Bytes)>,
    closed: bool,
}

impl MemTableIterator {
    fn reset(&mut self, lower: Bound<Bytes>) {
        self.with_mut(|fields| {
            if *fields.closed {
                return;
            }
            *fields.iter = fields.map.range((lower, Bound::Unbounded));
            *fields.curr = None;
        });
    }

    pub fn is_closed(&self) -> bool {
        self.with_closed(|closed| *closed)
    }
}

impl StorageIterator for MemTableIterator {
    fn value(&self) -> &Bytes {
        self.with_curr(|curr| curr.as_ref().map(|(_, value)| value))
            .unwrap()
    }

    fn key(&self) -> &Bytes {
        self.with_curr(|curr| curr.as_ref().map(|(key, _)| key))
            .unwrap()
    }

    fn is_valid(&self) -> bool {
        self.with_curr(|curr| curr.is_some())
    }

    fn next(&mut self) -> Result<()> {
        self.with_mut(|fields| {
            if *fields.closed {
                return;
            }
            *fields.curr = fields
                .iter
                .next()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
        });

        Ok(())
    }
}

impl SeekableIterator for MemTableIterator {
    fn seek(&mut self, key: &[u8]) -> bool {
        self.reset(Bound::Included(Bytes::copy_from_slice(key)));
        let _ = StorageIterator::next(self);
        self.is_valid()
    }

    fn rewind(&mut self) {
        self.reset(Bound::Unbounded);
    }

    fn close(&mut self) -> Result<()> {
        self.with_mut(|fields| {
            // An empty range holds no entries, so nothing in the map stays pinned.
            *fields.iter = fields.map.range((
                Bound::Excluded(Bytes::new()),
                Bound::Excluded(Bytes::new()),
            ));
            *fields.curr = None;
            *fields.closed = true;
        });

        Ok(())
    }
}
