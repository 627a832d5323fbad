//! Log record framing.
//!
//! Every record in the store log has the layout:
//!
//! ```text
//! | magic (4) | version (2) | type (1) | payload len (4) | payload | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers header and payload.

use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying a store log record.
pub const LOG_MAGIC: [u8; 4] = *b"FSKV";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Size of the fixed record header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Size of the trailing checksum in bytes.
pub const CRC_SIZE: usize = 4;

const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Put a single value.
    Put = 1,
    /// Delete a single key.
    Delete = 2,
    /// Several puts and deletes applied as one unit.
    Batch = 3,
}

impl RecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            3 => Some(Self::Batch),
            _ => None,
        }
    }
}

/// A single mutation of the key/value space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Set `bucket/key` to `value`.
    Put {
        /// Bucket name.
        bucket: String,
        /// Key within the bucket.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// Remove `bucket/key`.
    Delete {
        /// Bucket name.
        bucket: String,
        /// Key within the bucket.
        key: String,
    },
}

impl WriteOp {
    fn validate(&self) -> StorageResult<()> {
        let (bucket, key) = match self {
            Self::Put { bucket, key, .. } | Self::Delete { bucket, key } => (bucket, key),
        };
        if bucket.is_empty() {
            return Err(StorageError::InvalidKey("bucket name is empty".into()));
        }
        if bucket.len() > MAX_NAME_LEN || key.len() > MAX_NAME_LEN {
            return Err(StorageError::InvalidKey(format!(
                "bucket or key longer than {MAX_NAME_LEN} bytes"
            )));
        }
        if let Self::Put { value, .. } = self {
            if value.len() > u32::MAX as usize {
                return Err(StorageError::InvalidKey("value too large".into()));
            }
        }
        Ok(())
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Put { bucket, key, value } => {
                write_name(buf, bucket);
                write_name(buf, key);
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value);
            }
            Self::Delete { bucket, key } => {
                write_name(buf, bucket);
                write_name(buf, key);
            }
        }
    }
}

/// A framed record in the store log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A single write.
    Single(WriteOp),
    /// A group of writes that become visible together.
    Batch(Vec<WriteOp>),
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Single(WriteOp::Put { .. }) => RecordType::Put,
            Self::Single(WriteOp::Delete { .. }) => RecordType::Delete,
            Self::Batch(_) => RecordType::Batch,
        }
    }

    /// Returns the writes carried by this record.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        match self {
            Self::Single(op) => vec![op],
            Self::Batch(ops) => ops,
        }
    }

    /// Encodes the record with header and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if a name or value cannot be framed.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Self::Single(op) => {
                op.validate()?;
                op.encode_into(&mut payload);
            }
            Self::Batch(ops) => {
                payload.extend_from_slice(&(ops.len() as u32).to_le_bytes());
                for op in ops {
                    op.validate()?;
                    let tag = match op {
                        WriteOp::Put { .. } => RecordType::Put,
                        WriteOp::Delete { .. } => RecordType::Delete,
                    };
                    payload.push(tag as u8);
                    op.encode_into(&mut payload);
                }
            }
        }

        if payload.len() > u32::MAX as usize {
            return Err(StorageError::InvalidKey("record too large".into()));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&LOG_MAGIC);
        buf.extend_from_slice(&LOG_VERSION.to_le_bytes());
        buf.push(self.record_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes the record starting at `offset` in `log`.
    ///
    /// Returns `Ok(Some((record, len)))` for a complete record,
    /// `Ok(None)` when the log ends in the middle of a record (a torn
    /// write), and `Err(..)` on corruption.
    ///
    /// # Errors
    ///
    /// Returns an error on bad magic, unknown version or type, checksum
    /// mismatch, or a malformed payload.
    pub fn decode_at(log: &[u8], offset: usize) -> StorageResult<Option<(Self, usize)>> {
        let rest = &log[offset.min(log.len())..];
        if rest.len() < HEADER_SIZE {
            return Ok(None);
        }

        if rest[0..4] != LOG_MAGIC {
            return Err(StorageError::corrupted(format!(
                "invalid magic at offset {offset}"
            )));
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > LOG_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported version {version} at offset {offset}"
            )));
        }

        let type_byte = rest[6];
        let record_type = RecordType::from_byte(type_byte).ok_or_else(|| {
            StorageError::corrupted(format!(
                "unknown record type {type_byte} at offset {offset}"
            ))
        })?;

        let payload_len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if rest.len() < total_len {
            return Ok(None);
        }

        let payload_end = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            rest[payload_end],
            rest[payload_end + 1],
            rest[payload_end + 2],
            rest[payload_end + 3],
        ]);
        let computed_crc = compute_crc32(&rest[..payload_end]);
        if stored_crc != computed_crc {
            return Err(StorageError::ChecksumMismatch {
                offset: offset as u64,
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut reader = Reader::new(&rest[HEADER_SIZE..payload_end], offset);
        let record = match record_type {
            RecordType::Put => Self::Single(reader.read_put()?),
            RecordType::Delete => Self::Single(reader.read_delete()?),
            RecordType::Batch => {
                let count = reader.read_u32()? as usize;
                let mut ops = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let op = match RecordType::from_byte(reader.read_u8()?) {
                        Some(RecordType::Put) => reader.read_put()?,
                        Some(RecordType::Delete) => reader.read_delete()?,
                        _ => {
                            return Err(StorageError::corrupted(format!(
                                "invalid batch entry at offset {offset}"
                            )))
                        }
                    };
                    ops.push(op);
                }
                Self::Batch(ops)
            }
        };
        reader.finish()?;

        Ok(Some((record, total_len)))
    }
}

fn write_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    cursor: usize,
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], offset: usize) -> Self {
        Self {
            data,
            cursor: 0,
            offset,
        }
    }

    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        let end = self.cursor.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.cursor..end];
                self.cursor = end;
                Ok(bytes)
            }
            None => Err(StorageError::corrupted(format!(
                "truncated payload in record at offset {}",
                self.offset
            ))),
        }
    }

    fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> StorageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_name(&mut self) -> StorageResult<String> {
        let b = self.take(2)?;
        let len = u16::from_le_bytes([b[0], b[1]]) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            StorageError::corrupted(format!("non-UTF-8 name at offset {}", self.offset))
        })
    }

    fn read_put(&mut self) -> StorageResult<WriteOp> {
        let bucket = self.read_name()?;
        let key = self.read_name()?;
        let len = self.read_u32()? as usize;
        let value = self.take(len)?.to_vec();
        Ok(WriteOp::Put { bucket, key, value })
    }

    fn read_delete(&mut self) -> StorageResult<WriteOp> {
        let bucket = self.read_name()?;
        let key = self.read_name()?;
        Ok(WriteOp::Delete { bucket, key })
    }

    fn finish(&self) -> StorageResult<()> {
        if self.cursor != self.data.len() {
            return Err(StorageError::corrupted(format!(
                "trailing bytes in record at offset {}",
                self.offset
            )));
        }
        Ok(())
    }
}

/// Computes a CRC32 checksum (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
