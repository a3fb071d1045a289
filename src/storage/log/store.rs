use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, info, warn};

use crate::config::{NodeConfig, StoreKind};
use crate::error::StorageError;
use crate::message::Entry;
use crate::state::{NodeState, StateInner};
use crate::traits::StorageResult;

use super::entry::{INDEX_SIZE, IndexRecord, decode_entries, decode_entry, encode_entry};
use super::manager::{SegmentedLog, SegmentedLogOptions};

pub const DATA_DIR: &str = "data";
pub const INDEX_DIR: &str = "index";

#[derive(Clone, Debug)]
pub struct LogStoreOptions {
    pub kind: StoreKind,
    pub base_dir: PathBuf,
    /// Bytes per data segment.
    pub segment_size: u64,
    pub os_page_size: u64,
    pub index_count_per_file: u64,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

impl From<&NodeConfig> for LogStoreOptions {
    fn from(config: &NodeConfig) -> Self {
        Self {
            kind: config.store_kind,
            base_dir: config.base_file_path.clone(),
            segment_size: config.store_file_size,
            os_page_size: config.os_page_size,
            index_count_per_file: config.index_count_per_file,
        }
    }
}

impl LogStoreOptions {
    fn log_dir(&self, name: &str) -> Option<PathBuf> {
        match self.kind {
            StoreKind::File => Some(self.base_dir.join(name)),
            StoreKind::Memory => None,
        }
    }
}

/// Entry log of one node: a data log holding serialized entries and an index
/// log holding one fixed-width `IndexRecord` per entry.
///
/// Appends and trims run under the `NodeState` lock. Reads take no node lock.
pub struct LogStore {
    state: Arc<NodeState>,
    data: SegmentedLog,
    index: SegmentedLog,
    max_index: AtomicU64,
}

impl LogStore {
    /// Map both logs and rebuild the in-memory tail from what survived on disk.
    pub fn open(options: LogStoreOptions, state: Arc<NodeState>) -> StorageResult<Self> {
        let data = SegmentedLog::new(SegmentedLogOptions {
            dir: options.log_dir(DATA_DIR),
            segment_size: options.segment_size,
            os_page_size: options.os_page_size,
            seal_with_sentinel: true,
        });
        let index = SegmentedLog::new(SegmentedLogOptions {
            dir: options.log_dir(INDEX_DIR),
            segment_size: INDEX_SIZE as u64 * options.index_count_per_file,
            os_page_size: options.os_page_size,
            seal_with_sentinel: false,
        });
        data.load()?;
        index.load()?;

        let store = Self {
            state,
            data,
            index,
            max_index: AtomicU64::new(0),
        };
        store.recover()?;
        Ok(store)
    }

    /// Read the index record at slot `count` without the max-index guard.
    fn scan_record(&self, count: u64) -> Option<IndexRecord> {
        let view = self.index.read_slice(count * INDEX_SIZE as u64, Some(INDEX_SIZE as u64))?;
        IndexRecord::decode(&view).ok()
    }

    fn recover(&self) -> StorageResult<()> {
        // 扫描索引直到遇到无效记录
        let mut count = 0u64;
        let mut last: Option<IndexRecord> = None;
        let mut data_end = 0;
        while let Some(record) = self.scan_record(count) {
            if record.data_index != count + 1 || record.data_pos < data_end {
                warn!(
                    "Index scan stopped at slot {}: record {:?} does not follow data end {}",
                    count, record, data_end
                );
                break;
            }
            data_end = record.data_end();
            last = Some(record);
            count += 1;
        }

        // torn tail: index record written, entry bytes not
        let mut tail = None;
        while let Some(record) = last {
            match self
                .data
                .read_slice(record.data_pos, Some(record.data_size))
                .map(|view| decode_entry(&view))
            {
                Some(Ok(entry)) => {
                    tail = Some(entry);
                    break;
                }
                Some(Err(e)) => warn!("Dropping torn tail entry {}: {}", record.data_index, e),
                None => warn!("Dropping tail entry {}: data missing", record.data_index),
            }
            count -= 1;
            last = if count == 0 { None } else { self.scan_record(count - 1) };
        }

        let data_end = last.map(|record| record.data_end()).unwrap_or(0);
        self.index.recover_to(count * INDEX_SIZE as u64)?;
        self.data.recover_to(data_end)?;
        self.max_index.store(count, Ordering::Release);

        let mut st = self.state.lock();
        st.write_id = count;
        st.commit_id = st.commit_id.min(count);
        st.matched_id = st.matched_id.min(count);
        match &tail {
            Some(entry) => {
                st.last_checksum = entry.checksum;
                st.pre_checksum = entry.pre_checksum;
                st.term = st.term.max(entry.term);
            }
            None => {
                st.last_checksum = 0;
                st.pre_checksum = 0;
            }
        }
        info!(
            "Recovered log: max index {}, data end {}, term {}, commit {}",
            count, data_end, st.term, st.commit_id
        );
        Ok(())
    }

    /// Append under the node lock. Returns the entry's position in the data log.
    pub fn append(&self, entry: &mut Entry) -> StorageResult<u64> {
        let mut st = self.state.lock();
        self.append_with(&mut st, entry)
    }

    /// Append while the caller already holds the node lock.
    ///
    /// On the leader the entry is finalized here: index, term, chain
    /// predecessor and checksum. A follower must hand over an intact entry that
    /// continues the log. On failure `entry.pos` stays `Entry::NO_POS`.
    pub fn append_with(&self, st: &mut StateInner, entry: &mut Entry) -> StorageResult<u64> {
        entry.pos = Entry::NO_POS;
        let next_index = self.max_index() + 1;
        if st.is_leader() {
            entry.entry_index = next_index;
            entry.term = st.term;
            entry.pre_checksum = st.last_checksum;
            entry.compute_size();
            entry.seal();
        } else {
            if entry.entry_index != next_index {
                return Err(StorageError::OutOfOrder {
                    expected: next_index,
                    actual: entry.entry_index,
                });
            }
            if !entry.is_intact() {
                return Err(StorageError::Corrupt(format!(
                    "entry {} fails its checksum",
                    entry.entry_index
                )));
            }
        }

        let pos = self.data.allocate_position(entry.total_size as u64)?;
        entry.pos = pos as i64;
        let written = match self.data.append(&encode_entry(entry)) {
            Ok(written) => written,
            Err(e) => {
                entry.pos = Entry::NO_POS;
                return Err(e);
            }
        };
        debug_assert_eq!(written, pos);

        let record = IndexRecord::new(pos, entry.entry_index, entry.total_size as u64);
        if let Err(e) = self.index.append(&record.encode()) {
            // keep data and index in step
            entry.pos = Entry::NO_POS;
            self.data.truncate_after(pos)?;
            return Err(e);
        }

        self.max_index.store(entry.entry_index, Ordering::Release);
        st.write_id = entry.entry_index;
        st.pre_checksum = entry.pre_checksum;
        st.last_checksum = entry.checksum;
        debug!(
            "Appended entry {} (term {}) at {}",
            entry.entry_index, entry.term, pos
        );
        Ok(pos)
    }

    /// Decode one entry of `length` bytes at `pos`.
    pub fn get(&self, pos: u64, length: u64) -> Option<Entry> {
        let view = self.data.read_slice(pos, Some(length))?;
        match decode_entry(&view) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Cannot decode entry at {}: {}", pos, e);
                None
            }
        }
    }

    /// Every entry whose bytes lie in `[from_pos, to_pos)`; `None` reads to the
    /// end of written data. Decoding stops at the first corrupt entry.
    pub fn batch_get(&self, from_pos: u64, to_pos: Option<u64>) -> Option<Vec<Entry>> {
        let views = self.data.read_range(from_pos, to_pos);
        if views.is_empty() {
            return None;
        }
        let mut entries = Vec::new();
        for view in &views {
            if let Err(e) = decode_entries(view, &mut entries) {
                warn!(
                    "Batch read from {} stopped at segment position {}: {}",
                    from_pos,
                    view.position(),
                    e
                );
                break;
            }
        }
        Some(entries)
    }

    /// Index record of `entry_index`, if the entry is present.
    pub fn index_record(&self, entry_index: u64) -> Option<IndexRecord> {
        if entry_index < 1 || entry_index > self.max_index() {
            return None;
        }
        let view = self
            .index
            .read_slice(IndexRecord::position_of(entry_index), Some(INDEX_SIZE as u64))?;
        match IndexRecord::decode(&view) {
            Ok(record) if record.data_index == entry_index => Some(record),
            Ok(record) => {
                warn!(
                    "Index slot for entry {} holds entry {}",
                    entry_index, record.data_index
                );
                None
            }
            Err(e) => {
                warn!("Cannot decode index record {}: {}", entry_index, e);
                None
            }
        }
    }

    pub fn get_by_index(&self, entry_index: u64) -> Option<Entry> {
        let record = self.index_record(entry_index)?;
        self.get(record.data_pos, record.data_size)
    }

    /// Entries `[from_index, to_index)` in index order. A range running past
    /// the tail is cut at the tail.
    pub fn batch_get_by_index(&self, from_index: u64, to_index: u64) -> Vec<Entry> {
        if to_index <= from_index {
            return Vec::new();
        }
        let Some(from) = self.index_record(from_index) else {
            return Vec::new();
        };
        let to_pos = self.index_record(to_index - 1).map(|to| to.data_end());
        self.batch_get(from.data_pos, to_pos).unwrap_or_default()
    }

    /// Discard every entry after `from_index`.
    pub fn trim_after(&self, from_index: u64) -> StorageResult<()> {
        let mut st = self.state.lock();
        self.trim_after_with(&mut st, from_index)
    }

    /// Trim while the caller already holds the node lock.
    pub fn trim_after_with(&self, st: &mut StateInner, from_index: u64) -> StorageResult<()> {
        let max_index = self.max_index();
        if from_index >= max_index {
            return Ok(());
        }

        let first_dropped = self.index_record(from_index + 1).ok_or_else(|| {
            StorageError::Corrupt(format!("index record {} unreadable", from_index + 1))
        })?;
        let (last_checksum, pre_checksum) = if from_index == 0 {
            (0, 0)
        } else {
            let tail = self.get_by_index(from_index).ok_or_else(|| {
                StorageError::Corrupt(format!("entry {} unreadable", from_index))
            })?;
            (tail.checksum, tail.pre_checksum)
        };

        self.data.truncate_after(first_dropped.data_pos)?;
        self.index
            .truncate_after(IndexRecord::position_of(from_index + 1))?;
        self.max_index.store(from_index, Ordering::Release);

        st.write_id = from_index;
        st.commit_id = st.commit_id.min(from_index);
        st.matched_id = st.matched_id.min(from_index);
        st.last_checksum = last_checksum;
        st.pre_checksum = pre_checksum;
        if st.applied_id > from_index {
            warn!(
                "Trimmed below applied index {} (now {})",
                st.applied_id, from_index
            );
        }
        info!("Trimmed log after {} (was {})", from_index, max_index);
        Ok(())
    }

    /// Highest entry index present, zero for an empty log.
    pub fn get_max_index(&self) -> u64 {
        self.max_index()
    }

    fn max_index(&self) -> u64 {
        self.max_index.load(Ordering::Acquire)
    }

    /// Flush both logs. Returns bytes made durable.
    pub fn flush(&self, min_bytes: u64) -> StorageResult<u64> {
        let data = self.data.flush(min_bytes)?;
        let index = self.index.flush(min_bytes)?;
        Ok(data + index)
    }

    pub fn data_segment_count(&self) -> usize {
        self.data.segment_count()
    }

    pub fn index_segment_count(&self) -> usize {
        self.index.segment_count()
    }
}
