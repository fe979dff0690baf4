use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use bytes::Bytes;
use log::trace;

use crate::mem_table::MemTable;

/// What a reader remembers about one key that changed after its snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayRecord {
    /// The snapshot-time value. Empty for new keys.
    pub value: Bytes,
    /// The key did not exist at snapshot time.
    pub is_new: bool,
    /// The key existed at snapshot time and has been removed from the container since.
    pub is_deleted: bool,
    /// The key is the smallest snapshot key and has been removed from the container.
    pub is_first_key: bool,
    /// The snapshot key right before this one. Only set for deleted keys, `None` for the first key.
    pub prev_key: Option<Bytes>,
}

impl OverlayRecord {
    pub fn new_key() -> Self {
        Self {
            is_new: true,
            ..Default::default()
        }
    }

    pub fn changed(value: Bytes) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn deleted(value: Bytes, prev_key: Option<Bytes>) -> Self {
        Self {
            value,
            is_deleted: true,
            is_first_key: prev_key.is_none(),
            prev_key,
            ..Default::default()
        }
    }

    /// Whether the key is part of the snapshot.
    pub fn is_visible(&self) -> bool {
        !self.is_new
    }
}

/// The delta between a reader's snapshot and the current container.
///
/// Only keys that differ from the snapshot have a record. `skip_targets` maps a snapshot key to
/// its snapshot successor whenever that successor has been deleted, so a forward scan can hop
/// over a run of deleted keys without consulting the container.
#[derive(Debug, Default)]
pub struct Overlay {
    records: BTreeMap<Bytes, OverlayRecord>,
    skip_targets: BTreeMap<Bytes, Bytes>,
    /// Index of the deleted records.
    deleted: BTreeSet<Bytes>,
}

impl Overlay {
    pub const fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            skip_targets: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up the record for `key`, together with the stored key.
    pub fn record(&self, key: &[u8]) -> Option<(&Bytes, &OverlayRecord)> {
        self.records.get_key_value(key)
    }

    /// The key to expose right after `key`, if its snapshot successor was deleted.
    pub fn skip_target(&self, key: &[u8]) -> Option<&Bytes> {
        self.skip_targets.get(key)
    }

    /// The smallest deleted key in `[lower, upper)`. No upper bound when `upper` is `None`.
    pub fn first_deleted_in(&self, lower: &[u8], upper: Option<&[u8]>) -> Option<&Bytes> {
        let upper = match upper {
            Some(upper) if upper <= lower => return None,
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        self.deleted
            .range::<[u8], _>((Bound::Included(lower), upper))
            .next()
    }

    /// Add a record built elsewhere. A deleted record also registers the skip target from its
    /// predecessor. Replacing a deleted record drops the skip target that led to it.
    pub fn insert(&mut self, key: Bytes, record: OverlayRecord) {
        let stale = self
            .records
            .get(&key)
            .filter(|old| old.is_deleted)
            .and_then(|old| old.prev_key.clone());
        if let Some(prev_key) = stale {
            if self.skip_targets.get(&prev_key) == Some(&key) {
                self.skip_targets.remove(&prev_key);
            }
        }

        if record.is_deleted {
            self.deleted.insert(key.clone());
            if let Some(prev_key) = &record.prev_key {
                self.skip_targets.insert(prev_key.clone(), key.clone());
            }
        } else {
            self.deleted.remove(&key);
        }
        self.records.insert(key, record);
    }

    /// Record that `key` is about to be written in `table`. Must run before the write is applied.
    pub fn record_put(&mut self, table: &MemTable, key: &[u8]) {
        if self.records.contains_key(key) {
            // The snapshot-time state of this key is already known.
            return;
        }

        let key = Bytes::copy_from_slice(key);
        let record = match table.get(&key) {
            Some(value) => OverlayRecord::changed(value),
            None => OverlayRecord::new_key(),
        };
        trace!("overlay: record put {:?} as {:?}", key, record);
        self.records.insert(key, record);
    }

    /// Record that `key` is about to be removed from `table`. Must run before the removal is
    /// applied.
    pub fn record_remove(&mut self, table: &MemTable, key: &[u8]) {
        let value = match self.records.get(key) {
            Some(record) if record.is_new || record.is_deleted => return,
            Some(record) => record.value.clone(),
            None => match table.get(key) {
                Some(value) => value,
                // Neither in the snapshot nor in the container.
                None => return,
            },
        };

        let key = Bytes::copy_from_slice(key);
        let record = OverlayRecord::deleted(value, self.snapshot_predecessor(table, &key));
        trace!("overlay: record remove {:?} as {:?}", key, record);
        self.insert(key, record);
    }

    /// The greatest snapshot key strictly below `key`. Snapshot keys are the container keys that
    /// are not new, plus the deleted ones.
    fn snapshot_predecessor(&self, table: &MemTable, key: &[u8]) -> Option<Bytes> {
        let live = table.keys_before(key).find(|k| {
            self.records
                .get(k)
                .map_or(true, |record| record.is_visible())
        });
        let deleted = self
            .deleted
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .cloned();

        live.max(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn __(x: &[u8]) -> Bytes {
        Bytes::copy_from_slice(x)
    }

    fn table_with(pairs: &[(&str, &str)]) -> MemTable {
        let table = MemTable::create();
        for (key, value) in pairs {
            table.put(__(key.as_bytes()), __(value.as_bytes()));
        }
        table
    }

    fn remove(overlay: &mut Overlay, table: &MemTable, key: &[u8]) {
        overlay.record_remove(table, key);
        table.remove(key);
    }

    fn put(overlay: &mut Overlay, table: &MemTable, key: &[u8], value: &[u8]) {
        overlay.record_put(table, key);
        table.put(__(key), __(value));
    }

    #[test]
    fn test_record_put() {
        let table = table_with(&[("a", "1")]);
        let mut overlay = Overlay::new();

        put(&mut overlay, &table, b"a", b"2");
        put(&mut overlay, &table, b"b", b"1");
        // Second writes do not change what the snapshot saw.
        put(&mut overlay, &table, b"a", b"3");
        put(&mut overlay, &table, b"b", b"2");

        assert_eq!(overlay.len(), 2);
        assert_eq!(overlay.record(b"a").unwrap().1, &OverlayRecord::changed(__(b"1")));
        assert_eq!(overlay.record(b"b").unwrap().1, &OverlayRecord::new_key());
    }

    #[test]
    fn test_record_remove_chain() {
        let table = table_with(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let mut overlay = Overlay::new();

        remove(&mut overlay, &table, b"c");
        remove(&mut overlay, &table, b"b");

        let (_, c) = overlay.record(b"c").unwrap();
        assert!(c.is_deleted);
        assert_eq!(c.value, __(b"3"));
        assert_eq!(c.prev_key, Some(__(b"b")));

        let (_, b) = overlay.record(b"b").unwrap();
        assert_eq!(b.prev_key, Some(__(b"a")));
        assert!(!b.is_first_key);

        assert_eq!(overlay.skip_target(b"a"), Some(&__(b"b")));
        assert_eq!(overlay.skip_target(b"b"), Some(&__(b"c")));
        assert_eq!(overlay.skip_target(b"c"), None);
    }

    #[test]
    fn test_record_remove_first_key() {
        let table = table_with(&[("a", "1"), ("b", "2")]);
        let mut overlay = Overlay::new();

        remove(&mut overlay, &table, b"a");
        let (_, a) = overlay.record(b"a").unwrap();
        assert!(a.is_first_key);
        assert!(a.is_deleted);
        assert_eq!(a.prev_key, None);
    }

    #[test]
    fn test_record_remove_ignores_new_keys() {
        let table = table_with(&[("a", "1"), ("c", "3")]);
        let mut overlay = Overlay::new();

        put(&mut overlay, &table, b"b", b"2");
        remove(&mut overlay, &table, b"c");
        remove(&mut overlay, &table, b"b");

        // `b` never existed for the snapshot, so `c` follows `a`.
        let (_, c) = overlay.record(b"c").unwrap();
        assert_eq!(c.prev_key, Some(__(b"a")));
        assert!(overlay.record(b"b").unwrap().1.is_new);
        assert_eq!(overlay.skip_target(b"b"), None);

        // Removing a key that is gone everywhere records nothing.
        remove(&mut overlay, &table, b"zz");
        assert_eq!(overlay.len(), 2);
    }

    #[test]
    fn test_record_remove_changed_key() {
        let table = table_with(&[("a", "1"), ("b", "2")]);
        let mut overlay = Overlay::new();

        put(&mut overlay, &table, b"b", b"2x");
        remove(&mut overlay, &table, b"b");

        let (_, b) = overlay.record(b"b").unwrap();
        assert!(b.is_deleted);
        assert_eq!(b.value, __(b"2"));
        assert_eq!(b.prev_key, Some(__(b"a")));
    }

    #[test]
    fn test_insert_replaces_deleted_record() {
        let mut overlay = Overlay::new();
        overlay.insert(__(b"b"), OverlayRecord::deleted(__(b"2"), Some(__(b"a"))));
        overlay.insert(__(b"c"), OverlayRecord::deleted(__(b"3"), Some(__(b"b"))));
        assert_eq!(overlay.skip_target(b"a"), Some(&__(b"b")));

        overlay.insert(__(b"b"), OverlayRecord::changed(__(b"2")));
        assert_eq!(overlay.skip_target(b"a"), None);
        assert_eq!(overlay.skip_target(b"b"), Some(&__(b"c")));
        assert_eq!(overlay.first_deleted_in(b"", None), Some(&__(b"c")));
        assert_eq!(overlay.len(), 2);
    }

    #[test]
    fn test_first_deleted_in() {
        let mut overlay = Overlay::new();
        overlay.insert(__(b"b"), OverlayRecord::deleted(__(b"2"), Some(__(b"a"))));
        overlay.insert(__(b"d"), OverlayRecord::deleted(__(b"4"), Some(__(b"c"))));
        overlay.insert(__(b"e"), OverlayRecord::changed(__(b"5")));

        assert_eq!(overlay.first_deleted_in(b"", None), Some(&__(b"b")));
        assert_eq!(overlay.first_deleted_in(b"b", Some(b"c")), Some(&__(b"b")));
        assert_eq!(overlay.first_deleted_in(b"c", Some(b"d")), None);
        assert_eq!(overlay.first_deleted_in(b"c", None), Some(&__(b"d")));
        assert_eq!(overlay.first_deleted_in(b"d", Some(b"a")), None);
    }
}
