//! Binary layout of data-log entries and index records.
//!
//! All fields are big-endian.
//!
//! Entry: `| magic u32 | total_size u32 | term u64 | entry_index u64 | pos i64 | pre_checksum u32 | checksum u32 | data ... |`
//!
//! Index record: `| magic u32 | total_size u32 | data_pos u64 | data_index u64 | data_size u64 |`

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use crate::error::StorageError;
use crate::message::Entry;
use crate::traits::StorageResult;

pub const ENTRY_MAGIC: u32 = 0xCAFE_DADD;
pub const INDEX_MAGIC: u32 = 0xCAFE_DADE;

pub const ENTRY_HEADER_SIZE: usize = 40; // 4 + 4 + 8 + 8 + 8 + 4 + 4
pub const INDEX_SIZE: usize = 32; // 4 + 4 + 8 + 8 + 8

/// Written at the tail of a data segment before rolling to the next one.
pub const END_OF_SEGMENT: [u8; 8] = [0xC, 0xA, 0xF, 0xE, 0xD, 0xA, 0xD, 0xD];

/// Fixed-width pointer from a logical entry index to its bytes in the data log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    pub magic: u32,
    pub total_size: u32,
    pub data_pos: u64,
    pub data_index: u64,
    pub data_size: u64,
}

impl IndexRecord {
    pub fn new(data_pos: u64, data_index: u64, data_size: u64) -> Self {
        Self {
            magic: INDEX_MAGIC,
            total_size: INDEX_SIZE as u32,
            data_pos,
            data_index,
            data_size,
        }
    }

    /// Byte offset of the record for `entry_index` in the index log.
    pub fn position_of(entry_index: u64) -> u64 {
        (entry_index - 1) * INDEX_SIZE as u64
    }

    /// One past the last data byte this record points at.
    pub fn data_end(&self) -> u64 {
        self.data_pos.saturating_add(self.data_size)
    }

    pub fn encode(&self) -> [u8; INDEX_SIZE] {
        let mut buf = [0u8; INDEX_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u32(self.magic);
        cursor.put_u32(self.total_size);
        cursor.put_u64(self.data_pos);
        cursor.put_u64(self.data_index);
        cursor.put_u64(self.data_size);
        buf
    }

    pub fn decode(mut data: &[u8]) -> StorageResult<Self> {
        if data.len() < INDEX_SIZE {
            return Err(StorageError::Corrupt(format!(
                "index record needs {} bytes, got {}",
                INDEX_SIZE,
                data.len()
            )));
        }
        let record = Self {
            magic: data.get_u32(),
            total_size: data.get_u32(),
            data_pos: data.get_u64(),
            data_index: data.get_u64(),
            data_size: data.get_u64(),
        };
        if record.magic != INDEX_MAGIC {
            return Err(StorageError::Corrupt(format!(
                "bad index magic {:#x}",
                record.magic
            )));
        }
        if record.total_size as usize != INDEX_SIZE {
            return Err(StorageError::Corrupt(format!(
                "bad index record size {}",
                record.total_size
            )));
        }
        Ok(record)
    }
}

pub fn encode_entry(entry: &Entry) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + entry.data.len());
    buf.put_u32(entry.magic);
    buf.put_u32(entry.total_size);
    buf.put_u64(entry.term);
    buf.put_u64(entry.entry_index);
    buf.put_i64(entry.pos);
    buf.put_u32(entry.pre_checksum);
    buf.put_u32(entry.checksum);
    buf.put_slice(&entry.data);
    buf
}

/// Decode the entry at the start of `data`, verifying magic, length and checksum.
pub fn decode_entry(mut data: &[u8]) -> StorageResult<Entry> {
    if data.len() < ENTRY_HEADER_SIZE {
        return Err(StorageError::Corrupt(format!(
            "entry header needs {} bytes, got {}",
            ENTRY_HEADER_SIZE,
            data.len()
        )));
    }
    let magic = data.get_u32();
    if magic != ENTRY_MAGIC {
        return Err(StorageError::Corrupt(format!("bad entry magic {:#x}", magic)));
    }
    let total_size = data.get_u32();
    let term = data.get_u64();
    let entry_index = data.get_u64();
    let pos = data.get_i64();
    let pre_checksum = data.get_u32();
    let checksum = data.get_u32();

    let body_len = (total_size as usize)
        .checked_sub(ENTRY_HEADER_SIZE)
        .ok_or_else(|| StorageError::Corrupt(format!("bad entry size {}", total_size)))?;
    if data.len() < body_len {
        return Err(StorageError::Corrupt(format!(
            "entry {} truncated: needs {} payload bytes, got {}",
            entry_index,
            body_len,
            data.len()
        )));
    }

    let entry = Entry {
        magic,
        term,
        entry_index,
        pos,
        pre_checksum,
        checksum,
        total_size,
        data: data[..body_len].to_vec(),
    };
    if !entry.is_intact() {
        return Err(StorageError::Corrupt(format!(
            "checksum mismatch for entry {}",
            entry_index
        )));
    }
    Ok(entry)
}

/// Decode back-to-back entries until the buffer ends, an end-of-segment
/// sentinel or zero fill is reached, or an entry fails to verify.
pub fn decode_entries(data: &[u8], out: &mut Vec<Entry>) -> StorageResult<()> {
    let mut offset = 0;
    while data.len() - offset >= ENTRY_HEADER_SIZE {
        let rest = &data[offset..];
        if u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) != ENTRY_MAGIC {
            // sentinel or never-written bytes
            break;
        }
        match decode_entry(rest) {
            Ok(entry) => {
                offset += entry.total_size as usize;
                out.push(entry);
            }
            Err(e) => {
                warn!("Stopping batch decode at offset {}: {}", offset, e);
                return Err(e);
            }
        }
    }
    Ok(())
}
