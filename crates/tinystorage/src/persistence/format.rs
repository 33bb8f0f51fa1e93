//! Binary format of the backing file
//!
//! ```text
//! Header:  [Magic:8 | Version:4 | WrittenAt:8 | Entries:8 | PayloadLen:8 | CRC32:4 | Reserved:8] = 48 bytes
//! Payload: bincode encoding of BTreeMap<String, StorageValue>
//! ```
//!
//! All header integers are big-endian. The CRC32 covers the payload only.

use crate::persistence::{PersistenceError, Result};
use crate::types::StorageValue;
use crc32fast::Hasher;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Backing file magic number: "TINYSTR1"
pub const FILE_MAGIC: &[u8; 8] = b"TINYSTR1";

/// Backing file format version
pub const FILE_VERSION: u32 = 1;

/// Size of the encoded header in bytes
pub const HEADER_LEN: usize = 48;

/// Backing file header (48 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Unix timestamp in seconds of the flush that wrote the file
    pub written_at: i64,
    pub entry_count: u64,
    pub payload_len: u64,
    pub checksum: u32,
}

impl FileHeader {
    pub fn new(entry_count: u64, payload: &[u8]) -> Self {
        let written_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Self {
            magic: *FILE_MAGIC,
            version: FILE_VERSION,
            written_at,
            entry_count,
            payload_len: payload.len() as u64,
            checksum: calculate_crc32(payload),
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_be_bytes())?;
        writer.write_all(&self.written_at.to_be_bytes())?;
        writer.write_all(&self.entry_count.to_be_bytes())?;
        writer.write_all(&self.payload_len.to_be_bytes())?;
        writer.write_all(&self.checksum.to_be_bytes())?;
        writer.write_all(&[0u8; 8])?; // Reserved
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;

        if &magic != FILE_MAGIC {
            return Err(PersistenceError::InvalidMagic {
                expected: FILE_MAGIC.to_vec(),
                actual: magic.to_vec(),
            });
        }

        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let version = u32::from_be_bytes(buf4);

        if version != FILE_VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }

        let mut buf8 = [0u8; 8];

        reader.read_exact(&mut buf8)?;
        let written_at = i64::from_be_bytes(buf8);

        reader.read_exact(&mut buf8)?;
        let entry_count = u64::from_be_bytes(buf8);

        reader.read_exact(&mut buf8)?;
        let payload_len = u64::from_be_bytes(buf8);

        reader.read_exact(&mut buf4)?;
        let checksum = u32::from_be_bytes(buf4);

        let mut reserved = [0u8; 8];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            magic,
            version,
            written_at,
            entry_count,
            payload_len,
            checksum,
        })
    }
}

/// Calculate CRC32 checksum
pub fn calculate_crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encode a complete mapping into backing file bytes
pub fn encode(entries: &BTreeMap<String, StorageValue>) -> Result<Vec<u8>> {
    let payload = bincode::serialize(entries)?;
    let header = FileHeader::new(entries.len() as u64, &payload);

    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    header.write(&mut buffer)?;
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Read and validate the header, returning it with the payload slice
pub fn inspect(data: &[u8]) -> Result<(FileHeader, &[u8])> {
    if data.len() < HEADER_LEN {
        return Err(PersistenceError::Truncated {
            expected: HEADER_LEN as u64,
            actual: data.len() as u64,
        });
    }

    let header = FileHeader::read(&mut &data[..HEADER_LEN])?;
    let payload = &data[HEADER_LEN..];

    if payload.len() as u64 != header.payload_len {
        return Err(PersistenceError::Truncated {
            expected: HEADER_LEN as u64 + header.payload_len,
            actual: data.len() as u64,
        });
    }

    let actual = calculate_crc32(payload);
    if actual != header.checksum {
        return Err(PersistenceError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }

    Ok((header, payload))
}

/// Decode backing file bytes into the complete mapping
pub fn decode(data: &[u8]) -> Result<BTreeMap<String, StorageValue>> {
    let (header, payload) = inspect(data)?;

    let entries: BTreeMap<String, StorageValue> = bincode::deserialize(payload)
        .map_err(|e| PersistenceError::CorruptedFile(format!("Deserialization failed: {}", e)))?;

    if entries.len() as u64 != header.entry_count {
        return Err(PersistenceError::CorruptedFile(format!(
            "Entry count mismatch: header says {}, payload has {}",
            header.entry_count,
            entries.len()
        )));
    }

    Ok(entries)
}
