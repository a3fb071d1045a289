use std::{
    fs::OpenOptions,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{ArcRwLockReadGuard, RawRwLock, RwLock};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::traits::StorageResult;

// Segment file layout:
// | record | record | ... | [END_OF_SEGMENT] | zero fill up to file_size |
//
// The file is named by `file_from_offset`, its first byte's position in the
// logical stream of the owning SegmentedLog.

/// A fixed-size region of one logical byte stream, backed by a memory mapping.
pub struct Segment {
    path: Option<PathBuf>,
    file_from_offset: u64,
    file_size: u64,
    os_page_size: u64,
    map: Arc<RwLock<MmapMut>>,
    wrote_position: AtomicU64,
    flushed_position: AtomicU64,
}

/// Read-only view over part of a segment.
///
/// Holds a shared guard on the mapping, so the bytes cannot be truncated or
/// unmapped underneath it. Dropping the view releases the guard.
pub struct SegmentView {
    guard: ArcRwLockReadGuard<RawRwLock, MmapMut>,
    start: usize,
    end: usize,
    position: u64,
}

impl SegmentView {
    /// Absolute stream position of the first byte of the view.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Deref for SegmentView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard[self.start..self.end]
    }
}

impl Segment {
    /// Map `path`, creating and sizing the file if needed.
    pub fn open(
        path: &Path,
        file_from_offset: u64,
        file_size: u64,
        os_page_size: u64,
    ) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(file_size)?;
        } else if len != file_size {
            return Err(StorageError::Consistency(format!(
                "segment {:?} has size {} but {} is configured",
                path, len, file_size
            )));
        }

        // SAFETY: the file is owned by this process and only ever resized above,
        // before the mapping exists.
        let map = unsafe { MmapOptions::new().len(file_size as usize).map_mut(&file)? };
        debug!("Mapped segment {:?} at offset {}", path, file_from_offset);

        Ok(Self {
            path: Some(path.to_path_buf()),
            file_from_offset,
            file_size,
            os_page_size,
            map: Arc::new(RwLock::new(map)),
            wrote_position: AtomicU64::new(0),
            flushed_position: AtomicU64::new(0),
        })
    }

    /// A segment backed by anonymous memory; nothing reaches disk.
    pub fn anonymous(file_from_offset: u64, file_size: u64, os_page_size: u64) -> StorageResult<Self> {
        let map = MmapOptions::new().len(file_size as usize).map_anon()?;
        Ok(Self {
            path: None,
            file_from_offset,
            file_size,
            os_page_size,
            map: Arc::new(RwLock::new(map)),
            wrote_position: AtomicU64::new(0),
            flushed_position: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn file_from_offset(&self) -> u64 {
        self.file_from_offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn wrote_position(&self) -> u64 {
        self.wrote_position.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> u64 {
        self.flushed_position.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.wrote_position())
    }

    pub fn is_full(&self) -> bool {
        self.wrote_position() >= self.file_size
    }

    /// Set the write cursor without touching the bytes. Used while recovering.
    pub(crate) fn set_wrote_position(&self, position: u64) {
        let position = position.min(self.file_size);
        self.wrote_position.store(position, Ordering::Release);
        self.flushed_position.store(position, Ordering::Release);
    }

    /// Mark every byte as written so the next allocation rolls.
    pub(crate) fn mark_full(&self) {
        self.wrote_position.store(self.file_size, Ordering::Release);
    }

    /// Write `data` at the write cursor. Returns the offset inside this segment.
    pub fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let wrote = self.wrote_position();
        let len = data.len() as u64;
        if wrote + len > self.file_size {
            return Err(StorageError::Allocation {
                requested: len,
                capacity: self.file_size - wrote,
            });
        }

        {
            let mut map = self.map.write();
            map[wrote as usize..(wrote + len) as usize].copy_from_slice(data);
        }
        self.wrote_position.store(wrote + len, Ordering::Release);
        Ok(wrote)
    }

    /// View `[offset, offset + len)`, or `[offset, wrote_position)` when `len` is `None`.
    pub fn read_slice(&self, offset: u64, len: Option<u64>) -> Option<SegmentView> {
        let wrote = self.wrote_position();
        if offset > wrote {
            warn!(
                "Segment {}: {}",
                self.file_from_offset,
                StorageError::PositionOutOfRange(offset)
            );
            return None;
        }
        let end = match len {
            Some(len) => offset.checked_add(len),
            None => Some(wrote),
        };
        let Some(end) = end.filter(|end| *end <= wrote) else {
            debug!(
                "Segment {}: {} (length {:?}, wrote position {})",
                self.file_from_offset,
                StorageError::PositionOutOfRange(offset),
                len,
                wrote
            );
            return None;
        };

        Some(SegmentView {
            guard: self.map.read_arc(),
            start: offset as usize,
            end: end as usize,
            position: self.file_from_offset + offset,
        })
    }

    /// Discard everything at and after `offset`. The discarded bytes are zeroed
    /// and flushed so a restart cannot read them back.
    pub fn truncate(&self, offset: u64) -> StorageResult<()> {
        let offset = offset.min(self.file_size);
        let wrote = self.wrote_position();
        if offset < wrote {
            self.map.write()[offset as usize..wrote as usize].fill(0);
            if self.path.is_some() {
                let start = offset - offset % self.os_page_size;
                self.map
                    .read()
                    .flush_range(start as usize, (wrote - start) as usize)?;
            }
        }
        self.wrote_position.store(offset, Ordering::Release);
        let flushed = self.flushed_position();
        self.flushed_position
            .store(flushed.min(offset), Ordering::Release);
        Ok(())
    }

    /// Flush dirty pages once at least `min_bytes` are pending. Returns the
    /// number of bytes made durable.
    pub fn flush(&self, min_bytes: u64) -> StorageResult<u64> {
        let wrote = self.wrote_position();
        let flushed = self.flushed_position();
        if wrote <= flushed || wrote - flushed < min_bytes.max(1) {
            return Ok(0);
        }

        if self.path.is_some() {
            let start = flushed - flushed % self.os_page_size;
            self.map
                .read()
                .flush_range(start as usize, (wrote - start) as usize)?;
        }
        self.flushed_position.store(wrote, Ordering::Release);
        Ok(wrote - flushed)
    }
}
