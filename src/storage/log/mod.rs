//! Segmented entry log.
//!
//! Entries go to a data log; one fixed-width index record per entry goes to a
//! parallel index log, so an entry index maps to its bytes without scanning.
//!
//! # Module Structure
//!
//! - `entry`: entry and index record codec
//! - `segment`: one memory-mapped segment file
//! - `manager`: segment rolling over a logical byte stream
//! - `store`: entry-level append, reads and trim

mod entry;
mod manager;
mod segment;
mod store;


pub use entry::{
    END_OF_SEGMENT, ENTRY_HEADER_SIZE, ENTRY_MAGIC, INDEX_MAGIC, INDEX_SIZE, IndexRecord,
    decode_entries, decode_entry, encode_entry,
};

pub use manager::{
    BLANK_THRESHOLD, DEFAULT_OS_PAGE_SIZE, DEFAULT_SEGMENT_SIZE, SegmentedLog,
    SegmentedLogOptions,
};

pub use segment::{Segment, SegmentView};

pub use store::{DATA_DIR, INDEX_DIR, LogStore, LogStoreOptions};
