//! The shared sector address space and the append-only stream the image is written into.


use std::io::{self, Write};

use tracing::debug;


/// The number of bytes per logical sector.
///
/// ISO9660 (§ 6.1.2) permits larger sectors, but CD and DVD media use 2048 bytes, and UDF on
/// those media uses the same logical block size.
pub const SECTOR_SIZE: u64 = 2048;

/// The number of sectors at the beginning of the image reserved as the System Area.
///
/// See ISO9660 § 6.2.1 and ECMA-167 2/8.3.1. Volume recognition starts at sector 16.
pub const SYSTEM_AREA_SECTORS: u64 = 16;


/// Converts a byte count into the number of sectors needed to hold it.
pub const fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE)
}


/// The component owning an allocated region.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SectorOwner {
    Image,
    Iso9660,
    Joliet,
    Udf,
    FileData,
}

/// The purpose of an allocated region, distinguishing multiple regions of the same owner.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SectorRegion {
    SystemArea,
    InitialDescriptors,
    MainDescriptors,
    FilesetContents,
    PathTables,
    Directories,
    Data,
}

/// One entry of the sector manager's ledger.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SectorAllocation {
    pub owner: SectorOwner,
    pub region: SectorRegion,
    pub start: u64,
    pub length: u64,
}


/// Bump allocator over the linear sector address space of one image.
///
/// Regions are handed out contiguously in the order they are requested. Sector numbers are 64 bits
/// wide; checking them against the limits of a particular file system is the job of the
/// corresponding writer.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SectorManager {
    allocations: Vec<SectorAllocation>,
    next_free: u64,
    data_start: u64,
    data_length: u64,
}
impl SectorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `count` sectors and returns the first of them.
    pub fn allocate_sectors(&mut self, owner: SectorOwner, region: SectorRegion, count: u64) -> u64 {
        let start = self.next_free;
        self.allocations.push(SectorAllocation {
            owner,
            region,
            start,
            length: count,
        });
        self.next_free += count;
        debug!("allocated sectors {}..{} to {:?}/{:?}", start, self.next_free, owner, region);
        start
    }

    /// Reserves enough sectors for `byte_count` bytes and returns the first of them.
    pub fn allocate_bytes(&mut self, owner: SectorOwner, region: SectorRegion, byte_count: u64) -> u64 {
        self.allocate_sectors(owner, region, bytes_to_sectors(byte_count))
    }

    /// Reserves the region holding the file data shared by all file systems.
    pub fn allocate_data(&mut self, count: u64) -> u64 {
        let start = self.allocate_sectors(SectorOwner::FileData, SectorRegion::Data, count);
        self.data_start = start;
        self.data_length = count;
        start
    }

    /// Returns the first sector of the given region, or `None` if it was never allocated.
    pub fn start(&self, owner: SectorOwner, region: SectorRegion) -> Option<u64> {
        self.find(owner, region)
            .map(|a| a.start)
    }

    /// Returns the length in sectors of the given region, or `None` if it was never allocated.
    pub fn length(&self, owner: SectorOwner, region: SectorRegion) -> Option<u64> {
        self.find(owner, region)
            .map(|a| a.length)
    }

    fn find(&self, owner: SectorOwner, region: SectorRegion) -> Option<&SectorAllocation> {
        self.allocations.iter()
            .find(|a| a.owner == owner && a.region == region)
    }

    /// The sector immediately following the last allocation.
    pub fn next_free(&self) -> u64 { self.next_free }

    pub fn data_start(&self) -> u64 { self.data_start }
    pub fn data_length(&self) -> u64 { self.data_length }

    pub fn allocations(&self) -> &[SectorAllocation] { &self.allocations }
}


/// An append-only output stream that keeps track of its position in sectors.
#[derive(Debug)]
pub struct SectorStream<W: Write> {
    inner: W,
    position: u64,
}
impl<W: Write> SectorStream<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            position: 0,
        }
    }

    /// The number of bytes written so far.
    pub fn position(&self) -> u64 { self.position }

    /// The sector that the next byte will be written into.
    pub fn sector(&self) -> u64 { self.position / SECTOR_SIZE }

    /// Whether the stream is positioned at the start of a sector.
    pub fn is_aligned(&self) -> bool { self.position % SECTOR_SIZE == 0 }

    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<(), io::Error> {
        self.inner.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Writes zero bytes up to the next sector boundary.
    pub fn pad_sector(&mut self) -> Result<(), io::Error> {
        let remainder = self.position % SECTOR_SIZE;
        if remainder != 0 {
            let padding = [0u8; SECTOR_SIZE as usize];
            let needed = (SECTOR_SIZE - remainder) as usize;
            self.write_bytes(&padding[..needed])?;
        }
        Ok(())
    }

    /// Writes `count` sectors filled with zero bytes.
    pub fn write_empty_sectors(&mut self, count: u64) -> Result<(), io::Error> {
        let empty = [0u8; SECTOR_SIZE as usize];
        for _ in 0..count {
            self.write_bytes(&empty)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W { self.inner }
}
impl<W: Write> Write for SectorStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
