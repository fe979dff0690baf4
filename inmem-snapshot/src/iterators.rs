use bytes::Bytes;

pub trait StorageIterator {
    /// Get the current value.
    fn value(&self) -> &Bytes;

    /// Get the current key.
    fn key(&self) -> &Bytes;

    /// Check if the current iterator is valid.
    fn is_valid(&self) -> bool;

    /// Move to the next position.
    fn next(&mut self) -> anyhow::Result<()>;
}

/// A storage iterator that can be repositioned. This is the capability the snapshot reader
/// consumes from the shared ordered container.
pub trait SeekableIterator: StorageIterator {
    /// Position at the first key that >= `key`. Returns whether the iterator is valid afterwards.
    fn seek(&mut self, key: &[u8]) -> bool;

    /// Position before the first entry. The iterator is invalid until the next call to `next`,
    /// which lands on the first entry.
    fn rewind(&mut self);

    /// Release the underlying cursor. The iterator stays invalid afterwards.
    fn close(&mut self) -> anyhow::Result<()>;
}
