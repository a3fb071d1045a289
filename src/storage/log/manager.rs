//! Segment roll management.
//!
//! A `SegmentedLog` presents one unbounded append-only byte stream over many
//! same-sized segments:
//! - positions are absolute stream offsets; `position / segment_size` picks the segment
//! - appends roll to a new segment, named by its starting offset, when the current one is short on room
//! - reads may span several segments

use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::traits::StorageResult;

use super::entry::END_OF_SEGMENT;
use super::segment::{Segment, SegmentView};

/// Default data segment size (40MB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 40 * 1024 * 1024;

/// Default OS page size used to align flushes
pub const DEFAULT_OS_PAGE_SIZE: u64 = 4 * 1024;

/// Room kept free in a data segment so the end-of-segment sentinel always fits.
pub const BLANK_THRESHOLD: u64 = END_OF_SEGMENT.len() as u64;

#[derive(Clone, Debug)]
pub struct SegmentedLogOptions {
    /// Directory holding the segment files; `None` keeps segments in anonymous memory.
    pub dir: Option<PathBuf>,
    pub segment_size: u64,
    pub os_page_size: u64,
    /// Seal full segments with `END_OF_SEGMENT`. Off for fixed-width record
    /// logs, whose segments hold an exact number of records.
    pub seal_with_sentinel: bool,
}

impl Default for SegmentedLogOptions {
    fn default() -> Self {
        Self {
            dir: None,
            segment_size: DEFAULT_SEGMENT_SIZE,
            os_page_size: DEFAULT_OS_PAGE_SIZE,
            seal_with_sentinel: true,
        }
    }
}

pub struct SegmentedLog {
    options: SegmentedLogOptions,
    /// Ordered by `file_from_offset`; the last one receives appends.
    segments: RwLock<Vec<Arc<Segment>>>,
    loaded: AtomicBool,
}

impl SegmentedLog {
    pub fn new(options: SegmentedLogOptions) -> Self {
        Self {
            options,
            segments: RwLock::new(Vec::new()),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn segment_size(&self) -> u64 {
        self.options.segment_size
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    fn blank_threshold(&self) -> u64 {
        if self.options.seal_with_sentinel {
            BLANK_THRESHOLD
        } else {
            0
        }
    }

    /// Scan the directory for numerically named segment files and map them.
    ///
    /// Loaded segments start out fully written; `recover_to` moves the write
    /// cursor back once the owner knows where valid data ends. Only the first
    /// call does anything.
    pub fn load(&self) -> StorageResult<()> {
        if self
            .loaded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let Some(dir) = self.options.dir.clone() else {
            return Ok(());
        };
        fs::create_dir_all(&dir)?;

        let mut files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            match name.parse::<u64>() {
                Ok(offset) => files.push((offset, path)),
                Err(e) => warn!("Skipping segment file {:?}: {}", path, e),
            }
        }
        files.sort_by_key(|(offset, _)| *offset);

        let mut loaded = Vec::with_capacity(files.len());
        for (offset, path) in &files {
            let segment = Segment::open(
                path,
                *offset,
                self.options.segment_size,
                self.options.os_page_size,
            )?;
            segment.mark_full();
            loaded.push(Arc::new(segment));
        }
        Self::check_adjacent(&loaded, self.options.segment_size)?;

        info!(
            "Loaded {} segments from {:?} (segment size {})",
            loaded.len(),
            dir,
            self.options.segment_size
        );
        *self.segments.write() = loaded;
        Ok(())
    }

    fn check_adjacent(segments: &[Arc<Segment>], segment_size: u64) -> StorageResult<()> {
        for pair in segments.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.file_from_offset() + segment_size != next.file_from_offset() {
                return Err(StorageError::Consistency(format!(
                    "segment {} does not follow segment {} (segment size {})",
                    next.file_from_offset(),
                    prev.file_from_offset(),
                    segment_size
                )));
            }
        }
        if let Some(first) = segments.first() {
            if first.file_from_offset() % segment_size != 0 {
                return Err(StorageError::Consistency(format!(
                    "segment offset {} is not a multiple of segment size {}",
                    first.file_from_offset(),
                    segment_size
                )));
            }
        }
        Ok(())
    }

    fn create_segment(&self, file_from_offset: u64) -> StorageResult<Segment> {
        match &self.options.dir {
            Some(dir) => {
                let path = dir.join(file_from_offset.to_string());
                let segment = Segment::open(
                    &path,
                    file_from_offset,
                    self.options.segment_size,
                    self.options.os_page_size,
                )?;
                info!("Created new segment {:?}", path);
                Ok(segment)
            }
            None => Segment::anonymous(
                file_from_offset,
                self.options.segment_size,
                self.options.os_page_size,
            ),
        }
    }

    /// Choose where the next `length` bytes will land, rolling to a fresh
    /// segment when the current one cannot hold them.
    pub fn allocate_position(&self, length: u64) -> StorageResult<u64> {
        let needed = length + self.blank_threshold();
        if needed > self.options.segment_size {
            return Err(StorageError::Allocation {
                requested: length,
                capacity: self.options.segment_size - self.blank_threshold(),
            });
        }

        let mut segments = self.segments.write();
        let next_offset = match segments.last() {
            Some(current) if !current.is_full() && current.remaining() >= needed => {
                return Ok(current.file_from_offset() + current.wrote_position());
            }
            Some(current) => {
                if self.options.seal_with_sentinel && current.remaining() >= BLANK_THRESHOLD {
                    current.append(&END_OF_SEGMENT)?;
                }
                current.mark_full();
                current.file_from_offset() + current.file_size()
            }
            None => 0,
        };

        let segment = self.create_segment(next_offset)?;
        segments.push(Arc::new(segment));
        Ok(next_offset)
    }

    /// Append `data` and return its absolute position.
    pub fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let position = self.allocate_position(data.len() as u64)?;
        let current = self
            .segments
            .read()
            .last()
            .cloned()
            .ok_or_else(|| StorageError::Consistency("no segment after allocation".into()))?;
        let offset = current.append(data)?;
        debug_assert_eq!(current.file_from_offset() + offset, position);
        Ok(position)
    }

    /// Index into `segments` for an absolute position. May be past the end.
    fn slot_of(segments: &[Arc<Segment>], position: u64, segment_size: u64) -> Option<usize> {
        let base = segments.first()?.file_from_offset();
        if position < base {
            return None;
        }
        Some(((position - base) / segment_size) as usize)
    }

    fn segment_for(&self, position: u64) -> Option<Arc<Segment>> {
        let segments = self.segments.read();
        let slot = Self::slot_of(&segments, position, self.options.segment_size)?;
        match segments.get(slot) {
            Some(segment) => Some(segment.clone()),
            None => {
                warn!(
                    "Position {} overflows segment list (size {})",
                    position,
                    segments.len()
                );
                None
            }
        }
    }

    /// View `length` bytes at `position`, or everything written after it in
    /// the owning segment when `length` is `None`.
    pub fn read_slice(&self, position: u64, length: Option<u64>) -> Option<SegmentView> {
        let segment = self.segment_for(position)?;
        segment.read_slice(position - segment.file_from_offset(), length)
    }

    /// Views covering `[from, to)` across segments; `to = None` reads to the
    /// end of written data.
    pub fn read_range(&self, from: u64, to: Option<u64>) -> Vec<SegmentView> {
        let segments: Vec<Arc<Segment>> = self.segments.read().clone();
        let Some(first_slot) = Self::slot_of(&segments, from, self.options.segment_size) else {
            return Vec::new();
        };

        let mut views = Vec::new();
        for segment in segments.iter().skip(first_slot) {
            let seg_from = segment.file_from_offset();
            let wrote = segment.wrote_position();
            let start = from.saturating_sub(seg_from);
            let end = match to {
                Some(to) if to <= seg_from + wrote => to.saturating_sub(seg_from),
                _ => wrote,
            };
            if start >= end {
                break;
            }
            match segment.read_slice(start, Some(end - start)) {
                Some(view) => views.push(view),
                None => break,
            }
            if matches!(to, Some(to) if to <= seg_from + wrote) {
                break;
            }
        }
        views
    }

    /// Discard all bytes at and after `position`. Segments lying wholly after
    /// it are unmapped and their files deleted.
    pub fn truncate_after(&self, position: u64) -> StorageResult<()> {
        let mut segments = self.segments.write();
        let Some(slot) = Self::slot_of(&segments, position, self.options.segment_size) else {
            return Ok(());
        };
        if slot >= segments.len() {
            return Ok(());
        }

        let owner = &segments[slot];
        owner.truncate(position - owner.file_from_offset())?;
        for removed in segments.drain(slot + 1..) {
            Self::remove_file(&removed);
        }
        Ok(())
    }

    /// Place the write cursor at `end` after a restart, dropping segments that
    /// hold no valid data.
    pub fn recover_to(&self, end: u64) -> StorageResult<()> {
        let mut segments = self.segments.write();
        let Some(slot) = Self::slot_of(&segments, end, self.options.segment_size) else {
            return Ok(());
        };
        if slot >= segments.len() {
            return Ok(());
        }

        let owner = &segments[slot];
        owner.set_wrote_position(end - owner.file_from_offset());
        for removed in segments.drain(slot + 1..) {
            Self::remove_file(&removed);
        }
        Ok(())
    }

    fn remove_file(segment: &Segment) {
        if let Some(path) = segment.path() {
            match fs::remove_file(path) {
                Ok(()) => info!("Removed segment {:?}", path),
                Err(e) => warn!("Failed to remove segment {:?}: {}", path, e),
            }
        }
    }

    /// Flush every segment with at least `min_bytes` pending.
    pub fn flush(&self, min_bytes: u64) -> StorageResult<u64> {
        let segments: Vec<Arc<Segment>> = self.segments.read().clone();
        let mut flushed = 0;
        for segment in segments {
            flushed += segment.flush(min_bytes)?;
        }
        Ok(flushed)
    }

    /// One past the last written byte.
    pub fn max_position(&self) -> u64 {
        self.segments
            .read()
            .last()
            .map(|s| s.file_from_offset() + s.wrote_position())
            .unwrap_or(0)
    }
}
