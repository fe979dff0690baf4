use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use log::debug;
use parking_lot::RwLock;

use crate::mem_table::{MemTable, MemTableIterator};
use crate::options::StoreOptions;
use crate::overlay::Overlay;
use crate::reader_iterator::{OverlaySource, ReaderIterator};

/// Snapshot iterator handed out by a [`Reader`].
pub type SnapshotIterator<'a> = ReaderIterator<MemTableIterator, &'a Reader>;

static EMPTY_OVERLAY: Overlay = Overlay::new();

/// The overlays of all live readers.
#[derive(Default)]
struct ReaderSet {
    next_id: u64,
    overlays: HashMap<u64, Overlay>,
}

impl ReaderSet {
    fn overlay(&self, id: u64) -> &Overlay {
        self.overlays.get(&id).unwrap_or(&EMPTY_OVERLAY)
    }
}

enum WriteOp {
    Put(Bytes, Bytes),
    Delete(Bytes),
}

/// A group of writes applied at once. No reader observes part of a batch.
#[derive(Default)]
pub struct Batch {
    ops: Vec<WriteOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::Put(key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.ops.push(WriteOp::Delete(key.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An in-memory ordered key-value store with snapshot readers.
///
/// Writers record every change into the overlay of each live reader before applying it to the
/// shared container, all under the reader set's write lock. Reader iterators take the same lock
/// shared for the duration of each operation.
#[derive(Clone)]
pub struct Store {
    table: Arc<MemTable>,
    readers: Arc<RwLock<ReaderSet>>,
    options: StoreOptions,
}

impl Default for Store {
    fn default() -> Self {
        Self::with_options(StoreOptions::default())
    }
}

impl Store {
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_options(options))
    }

    fn with_options(options: StoreOptions) -> Self {
        Self {
            table: Arc::new(MemTable::create()),
            readers: Arc::new(RwLock::new(ReaderSet::default())),
            options,
        }
    }

    /// Get the current value of a key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.table.get(key)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(key, value);
        self.write(batch)
    }

    pub fn delete(&self, key: impl Into<Bytes>) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Apply a batch. Nothing is written unless every entry passes validation.
    pub fn write(&self, batch: Batch) -> Result<()> {
        for op in &batch.ops {
            match op {
                WriteOp::Put(key, value) => self.options.check_entry(key, Some(&value[..]))?,
                WriteOp::Delete(key) => self.options.check_entry(key, None)?,
            }
        }

        let mut readers = self.readers.write();
        let num_ops = batch.len();
        for op in batch.ops {
            match op {
                WriteOp::Put(key, value) => {
                    for overlay in readers.overlays.values_mut() {
                        overlay.record_put(&self.table, &key);
                    }
                    self.table.put(key, value);
                }
                WriteOp::Delete(key) => {
                    for overlay in readers.overlays.values_mut() {
                        overlay.record_remove(&self.table, &key);
                    }
                    self.table.remove(&key);
                }
            }
        }
        debug!(
            "store: applied {} writes, {} live readers",
            num_ops,
            readers.overlays.len()
        );

        Ok(())
    }

    /// Take a snapshot of the current contents.
    pub fn reader(&self) -> Reader {
        let mut readers = self.readers.write();
        let id = readers.next_id;
        readers.next_id += 1;
        readers.overlays.insert(id, Overlay::new());
        debug!(
            "store: reader {} created, {} live readers",
            id,
            readers.overlays.len()
        );

        Reader {
            id,
            table: self.table.clone(),
            readers: self.readers.clone(),
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().overlays.len()
    }

    /// Iterate the current contents, without snapshot isolation.
    pub fn iter(&self) -> MemTableIterator {
        self.table.iter()
    }
}

/// A point-in-time view of a [`Store`]. The snapshot is released when the reader is dropped.
pub struct Reader {
    id: u64,
    table: Arc<MemTable>,
    readers: Arc<RwLock<ReaderSet>>,
}

impl Reader {
    /// Get the value of a key as of the snapshot.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let readers = self.readers.read();
        match readers.overlay(self.id).record(key) {
            Some((_, record)) if record.is_new => None,
            Some((_, record)) => Some(record.value.clone()),
            None => self.table.get(key),
        }
    }

    /// Iterate the snapshot, starting from its first key.
    pub fn iter(&self) -> Result<SnapshotIterator<'_>> {
        let mut iter = ReaderIterator::new(self.table.cursor(), self);
        iter.seek_to_first()?;
        Ok(iter)
    }

    /// Number of keys that changed since the snapshot was taken.
    pub fn overlay_len(&self) -> usize {
        self.readers.read().overlay(self.id).len()
    }
}

impl OverlaySource for &Reader {
    fn with_overlay<R>(&self, f: impl FnOnce(&Overlay) -> R) -> R {
        let readers = self.readers.read();
        f(readers.overlay(self.id))
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut readers = self.readers.write();
        readers.overlays.remove(&self.id);
        debug!(
            "store: reader {} released, {} live readers",
            self.id,
            readers.overlays.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_bad_options() {
        let options = StoreOptions {
            max_value_len: 0,
            ..Default::default()
        };
        assert!(Store::open(options).is_err());
    }

    #[test]
    fn test_invalid_batch_writes_nothing() {
        let store = Store::open(StoreOptions {
            max_key_len: 8,
            ..Default::default()
        })
        .unwrap();
        let reader = store.reader();

        let mut batch = Batch::new();
        batch.set("a", "1").set("much-too-long", "2");
        assert_eq!(batch.len(), 2);
        assert!(store.write(batch).is_err());
        assert!(store.is_empty());
        assert_eq!(reader.overlay_len(), 0);

        assert!(store.set("", "1").is_err());
        assert!(store.delete("").is_err());
    }

    #[test]
    fn test_reader_registration() {
        let store = Store::default();
        assert_eq!(store.reader_count(), 0);

        let first = store.reader();
        let second = store.reader();
        assert_eq!(store.reader_count(), 2);

        drop(first);
        assert_eq!(store.reader_count(), 1);
        drop(second);
        assert_eq!(store.reader_count(), 0);
    }

    #[test]
    fn test_writes_without_readers_record_nothing() {
        let store = Store::default();
        store.set("a", "1").unwrap();
        let reader = store.reader();
        assert_eq!(reader.overlay_len(), 0);

        store.set("a", "2").unwrap();
        store.set("b", "1").unwrap();
        assert_eq!(reader.overlay_len(), 2);
    }
}
