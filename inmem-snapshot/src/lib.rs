pub mod iterators;
pub mod mem_table;
pub mod options;
pub mod overlay;
pub mod reader_iterator;
pub mod store;

pub use options::StoreOptions;
pub use overlay::{Overlay, OverlayRecord};
pub use reader_iterator::{OverlaySource, ReaderIterator};
pub use store::{Batch, Reader, SnapshotIterator, Store};
