use std::iter::FusedIterator;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use log::trace;

use crate::iterators::SeekableIterator;
use crate::overlay::{Overlay, OverlayRecord};

/// Where a reader iterator gets its overlay from. The overlay must not change while `f` runs.
pub trait OverlaySource {
    fn with_overlay<R>(&self, f: impl FnOnce(&Overlay) -> R) -> R;
}

impl OverlaySource for Arc<Overlay> {
    fn with_overlay<R>(&self, f: impl FnOnce(&Overlay) -> R) -> R {
        f(self.as_ref())
    }
}

impl OverlaySource for &Overlay {
    fn with_overlay<R>(&self, f: impl FnOnce(&Overlay) -> R) -> R {
        f(*self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Invalid,
    /// The entry under the container cursor is exactly what the snapshot saw.
    Container,
    /// The entry comes from the overlay. The container cursor is parked at or before `key`.
    Overlay { key: Bytes, value: Bytes },
}

/// Cursor state, kept apart from the overlay source so each operation can borrow both.
struct Cursor<I> {
    iter: I,
    pos: Position,
}

/// Iterates a snapshot of the container: the live container merged with the reader's overlay.
///
/// Keys created after the snapshot are hidden, keys deleted after it are still produced, and
/// changed keys produce their snapshot-time value.
pub struct ReaderIterator<I: SeekableIterator, S: OverlaySource> {
    source: S,
    cursor: Cursor<I>,
}

impl<I: SeekableIterator, S: OverlaySource> ReaderIterator<I, S> {
    /// Create an unpositioned iterator. Call `seek_to_first` or `seek` before reading.
    pub fn new(iter: I, source: S) -> Self {
        Self {
            source,
            cursor: Cursor {
                iter,
                pos: Position::Invalid,
            },
        }
    }

    /// Position at the smallest key of the snapshot.
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.seek(&[])
    }

    /// Position at the smallest snapshot key that >= `key`. Seeking to a key created after the
    /// snapshot leaves the iterator invalid.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        let cursor = &mut self.cursor;
        self.source.with_overlay(|overlay| cursor.seek(overlay, key))
    }

    /// Move to the next snapshot key. A no-op once the iterator is invalid.
    pub fn next(&mut self) -> Result<()> {
        let cursor = &mut self.cursor;
        self.source.with_overlay(|overlay| cursor.next(overlay))
    }

    pub fn is_valid(&self) -> bool {
        self.cursor.pos != Position::Invalid
    }

    pub fn key(&self) -> Option<&Bytes> {
        match &self.cursor.pos {
            Position::Invalid => None,
            Position::Container => Some(self.cursor.iter.key()),
            Position::Overlay { key, .. } => Some(key),
        }
    }

    pub fn value(&self) -> Option<&Bytes> {
        match &self.cursor.pos {
            Position::Invalid => None,
            Position::Container => Some(self.cursor.iter.value()),
            Position::Overlay { value, .. } => Some(value),
        }
    }

    pub fn current(&self) -> Option<(&Bytes, &Bytes)> {
        self.key().zip(self.value())
    }

    /// Release the container cursor. Its result is passed through unchanged.
    pub fn close(&mut self) -> Result<()> {
        self.cursor.pos = Position::Invalid;
        self.cursor.iter.close()
    }

    /// Drain the remaining entries, starting with the current one. Ends after the first error.
    pub fn entries(&mut self) -> Entries<'_, I, S> {
        Entries {
            iter: self,
            done: false,
        }
    }
}

impl<I: SeekableIterator> Cursor<I> {
    fn seek(&mut self, overlay: &Overlay, target: &[u8]) -> Result<()> {
        trace!("reader iterator: seek {:?}", Bytes::copy_from_slice(target));
        match overlay.record(target) {
            Some((key, record)) => self.seek_recorded(overlay, key, record),
            None => self.seek_unrecorded(overlay, target),
        }
    }

    fn seek_recorded(
        &mut self,
        overlay: &Overlay,
        key: &Bytes,
        record: &OverlayRecord,
    ) -> Result<()> {
        if record.is_new {
            self.pos = Position::Invalid;
            return Ok(());
        }

        if record.is_first_key {
            // Nothing of the snapshot precedes this key, the next step lands on the container's
            // first entry.
            self.iter.rewind();
        } else if record.is_deleted {
            match chain_root(overlay, record) {
                Some(anchor) => {
                    self.iter.seek(anchor);
                }
                None => self.iter.rewind(),
            }
        } else {
            self.iter.seek(key);
        }

        self.pos = Position::Overlay {
            key: key.clone(),
            value: record.value.clone(),
        };
        Ok(())
    }

    fn seek_unrecorded(&mut self, overlay: &Overlay, target: &[u8]) -> Result<()> {
        self.iter.seek(target);
        self.skip_hidden(overlay)?;

        // Deleted keys are not in the container, one of them may come before where it landed.
        let landed = self.iter.is_valid().then(|| self.iter.key().clone());
        if let Some(deleted) = overlay.first_deleted_in(target, landed.as_deref()) {
            if let Some((key, record)) = overlay.record(deleted) {
                return self.seek_recorded(overlay, key, record);
            }
        }

        self.settle(overlay);
        Ok(())
    }

    fn next(&mut self, overlay: &Overlay) -> Result<()> {
        let current = match &self.pos {
            Position::Invalid => return Ok(()),
            Position::Overlay { key, .. } => key.clone(),
            Position::Container => self.iter.key().clone(),
        };

        let jump = overlay
            .skip_target(&current)
            .and_then(|target| overlay.record(target));
        if let Some((key, record)) = jump {
            self.pos = Position::Overlay {
                key: key.clone(),
                value: record.value.clone(),
            };
            return Ok(());
        }

        self.iter.next()?;
        self.skip_hidden(overlay)?;
        self.settle(overlay);
        Ok(())
    }

    /// Advance the container past keys the snapshot must not show here: new keys, and deleted
    /// keys that were put back (those are reached through the skip targets instead).
    fn skip_hidden(&mut self, overlay: &Overlay) -> Result<()> {
        while self.iter.is_valid() {
            match overlay.record(self.iter.key()) {
                Some((_, record)) if record.is_new || record.is_deleted => self.iter.next()?,
                _ => break,
            }
        }
        Ok(())
    }

    /// Take the position from the container cursor, which sits on a snapshot key or the end.
    fn settle(&mut self, overlay: &Overlay) {
        if !self.iter.is_valid() {
            self.pos = Position::Invalid;
            return;
        }

        self.pos = match overlay.record(self.iter.key()) {
            Some((key, record)) => Position::Overlay {
                key: key.clone(),
                value: record.value.clone(),
            },
            None => Position::Container,
        };
    }
}

/// Walk the `prev_key` chain of a deleted key back to the nearest snapshot key that is still in
/// the container. `None` means the chain starts at the deleted first key.
fn chain_root<'a>(overlay: &'a Overlay, record: &'a OverlayRecord) -> Option<&'a Bytes> {
    let mut prev = record.prev_key.as_ref();
    while let Some(key) = prev {
        match overlay.record(key) {
            Some((_, record)) if record.is_deleted => prev = record.prev_key.as_ref(),
            _ => return Some(key),
        }
    }
    None
}

/// Owned entries of a `ReaderIterator`, see [`ReaderIterator::entries`].
pub struct Entries<'a, I: SeekableIterator, S: OverlaySource> {
    iter: &'a mut ReaderIterator<I, S>,
    done: bool,
}

impl<I: SeekableIterator, S: OverlaySource> Iterator for Entries<'_, I, S> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some((key, value)) = self.iter.current() else {
            self.done = true;
            return None;
        };
        let entry = (key.clone(), value.clone());
        match self.iter.next() {
            Ok(()) => Some(Ok(entry)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<I: SeekableIterator, S: OverlaySource> FusedIterator for Entries<'_, I, S> {}
