//! Sector framing for checksummed memory-mapped files.
//!
//! Files are partitioned into fixed-size sectors; each sector holds records
//! in its data region and a trailing little-endian CRC32 over that region.
//! Records never straddle a sector boundary, so a torn write corrupts at
//! most one sector and recovery can report it precisely.

use crate::error::{Error, Result};

pub const SECTOR_SIZE: usize = 4096;
pub const CHECKSUM_LENGTH: usize = 4;
pub const SECTOR_DATA_LENGTH: usize = SECTOR_SIZE - CHECKSUM_LENGTH;

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Packs variable-length records into sectors.
#[derive(Clone, Copy, Debug)]
pub struct SectorFramer {
    capacity: usize,
}

impl SectorFramer {
    pub fn new(capacity: usize) -> Self {
        debug_assert_eq!(capacity % SECTOR_SIZE, 0);
        Self { capacity }
    }

    pub fn sector_start(position: usize) -> usize {
        position - position % SECTOR_SIZE
    }

    pub fn checksum_offset(position: usize) -> usize {
        Self::sector_start(position) + SECTOR_DATA_LENGTH
    }

    /// Returns the position at which a record of `needed` bytes must be
    /// written: `position` itself when it fits before the current sector's
    /// checksum trailer, otherwise the start of the next sector.
    pub fn claim(&self, position: usize, needed: usize) -> Result<usize> {
        if needed > SECTOR_DATA_LENGTH {
            return Err(Error::CompositeKeyTooLarge(needed));
        }
        let claimed = if position + needed <= Self::checksum_offset(position) {
            position
        } else {
            Self::sector_start(position) + SECTOR_SIZE
        };
        if claimed + needed > Self::checksum_offset(claimed).min(self.capacity) {
            return Err(Error::OutOfSpace);
        }
        Ok(claimed)
    }
}

/// Recompute and store the CRC trailer of the sector owning `position`.
pub fn reframe_sector(buf: &mut [u8], position: usize) {
    let start = SectorFramer::sector_start(position);
    let checksum = crc32(&buf[start..start + SECTOR_DATA_LENGTH]);
    buf[start + SECTOR_DATA_LENGTH..start + SECTOR_SIZE]
        .copy_from_slice(&checksum.to_le_bytes());
}

/// Validate the sector owning `position` against its stored trailer.
pub fn validate_sector(buf: &[u8], position: usize) -> Result<()> {
    let start = SectorFramer::sector_start(position);
    let stored = u32::from_le_bytes(
        buf[start + SECTOR_DATA_LENGTH..start + SECTOR_SIZE]
            .try_into()
            .expect("checksum trailer is four bytes"),
    );
    let computed = crc32(&buf[start..start + SECTOR_DATA_LENGTH]);
    if stored != computed {
        return Err(Error::SectorChecksumMismatch {
            start,
            end: start + SECTOR_SIZE,
        });
    }
    Ok(())
}
