//! Building blocks shared by the UDF descriptors.
//!
//! Section numbers refer to ECMA-167 (part/section) unless prefixed with "UDF", in which case they
//! refer to the OSTA Universal Disk Format specification, revision 1.02.


use chrono::{DateTime, Datelike, Offset, TimeZone, Timelike};
use from_to_repr::from_to_other;

use crate::io_util::FieldWriter;
use crate::udf::{DESCRIPTOR_VERSION, UDF_REVISION};


/// CRC calculator for descriptor tags (3/7.2.6).
const TAG_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// The length of a descriptor tag.
pub(crate) const TAG_LENGTH: usize = 16;


/// The identifier stored in a descriptor tag (3/7.2.1 and 4/7.2.1).
#[derive(Clone, Copy, Debug)]
#[from_to_other(base_type = u16, derive_compare = "as_int")]
pub enum TagIdentifier {
    PrimaryVolumeDescriptor = 1,
    AnchorVolumeDescriptorPointer = 2,
    VolumeDescriptorPointer = 3,
    ImplementationUseVolumeDescriptor = 4,
    PartitionDescriptor = 5,
    LogicalVolumeDescriptor = 6,
    UnallocatedSpaceDescriptor = 7,
    TerminatingDescriptor = 8,
    LogicalVolumeIntegrityDescriptor = 9,
    FileSetDescriptor = 256,
    FileIdentifierDescriptor = 257,
    AllocationExtentDescriptor = 258,
    IndirectEntry = 259,
    TerminalEntry = 260,
    FileEntry = 261,
    Other(u16),
}


/// Fills in the descriptor tag at the start of `descriptor`.
///
/// The CRC covers the `descriptor.len() - 16` bytes following the tag. The checksum covers the tag
/// itself except for the checksum byte.
pub(crate) fn finish_tag(descriptor: &mut [u8], identifier: TagIdentifier, location: u32) {
    let crc_length = descriptor.len() - TAG_LENGTH;
    debug_assert!(crc_length <= usize::from(u16::MAX));
    let crc = TAG_CRC.checksum(&descriptor[TAG_LENGTH..]);

    FieldWriter::new(descriptor, 0)
        .u16(identifier.to_base_type())
        .u16(DESCRIPTOR_VERSION)
        .u8(0) // checksum, filled in below
        .u8(0) // reserved
        .u16(0) // serial number
        .u16(crc)
        .u16(crc_length as u16)
        .u32(location);

    let checksum = descriptor[..TAG_LENGTH].iter()
        .enumerate()
        .filter(|(i, _)| *i != 4)
        .fold(0u8, |sum, (_, b)| sum.wrapping_add(*b));
    descriptor[4] = checksum;
}


/// A recording timestamp (1/7.3).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp {
    /// Offset from Coordinated Universal Time in minutes.
    pub utc_offset_minutes: i16,
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub centiseconds: u8,
    pub hundreds_of_microseconds: u8,
    pub microseconds: u8,
}
impl Timestamp {
    pub const LENGTH: usize = 12;

    pub fn from_datetime<Tz: TimeZone>(datetime: &DateTime<Tz>) -> Self {
        let utc_offset_minutes = (datetime.offset().fix().local_minus_utc() / 60) as i16;
        // nanosecond() exceeds 10**9 during a leap second
        let micros = (datetime.nanosecond() / 1000).min(999_999);
        Self {
            utc_offset_minutes,
            year: datetime.year().clamp(1, 9999) as i16,
            month: datetime.month() as u8,
            day: datetime.day() as u8,
            hour: datetime.hour() as u8,
            minute: datetime.minute() as u8,
            second: datetime.second().min(59) as u8,
            centiseconds: (micros / 10_000) as u8,
            hundreds_of_microseconds: ((micros / 100) % 100) as u8,
            microseconds: (micros % 100) as u8,
        }
    }

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        // type 1 (local time) in the top four bits, signed 12-bit offset below
        let type_and_time_zone = (1 << 12) | ((self.utc_offset_minutes as u16) & 0x0FFF);

        let mut buf = [0u8; Self::LENGTH];
        FieldWriter::new(&mut buf, 0)
            .u16(type_and_time_zone)
            .i16(self.year)
            .u8(self.month)
            .u8(self.day)
            .u8(self.hour)
            .u8(self.minute)
            .u8(self.second)
            .u8(self.centiseconds)
            .u8(self.hundreds_of_microseconds)
            .u8(self.microseconds);
        buf
    }
}


/// An extent descriptor: a run of sectors given by its length in bytes and its first sector (3/7.1).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExtentAd {
    pub length: u32,
    pub location: u32,
}
impl ExtentAd {
    pub const LENGTH: usize = 8;

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        let mut buf = [0u8; Self::LENGTH];
        FieldWriter::new(&mut buf, 0)
            .u32(self.length)
            .u32(self.location);
        buf
    }
}

/// A long allocation descriptor pointing at a block within partition 0 (4/14.14.2).
pub(crate) fn long_ad(length: u32, block: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    FieldWriter::new(&mut buf, 0)
        .u32(length)
        .u32(block)
        .u16(0); // partition reference number; six bytes of implementation use follow
    buf
}

/// A short allocation descriptor of a recorded and allocated extent (4/14.14.1).
pub(crate) fn short_ad(length: u32, position: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    FieldWriter::new(&mut buf, 0)
        .u32(length)
        .u32(position);
    buf
}


/// The OSTA CS0 character set specification (UDF 2.1.2).
pub(crate) fn osta_charspec() -> [u8; 64] {
    let mut buf = [0u8; 64];
    buf[0] = 0; // CS0
    let info = b"OSTA Compressed Unicode";
    buf[1..1+info.len()].copy_from_slice(info);
    buf
}

/// An entity identifier (1/7.4) with the given identifier and suffix.
pub(crate) fn entity_id(identifier: &[u8], suffix: [u8; 8]) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let length = identifier.len().min(23);
    buf[1..1+length].copy_from_slice(&identifier[..length]);
    buf[24..32].copy_from_slice(&suffix);
    buf
}

/// The domain identifier suffix: UDF revision followed by the domain flags (UDF 2.1.5.3).
pub(crate) fn domain_suffix() -> [u8; 8] {
    let mut suffix = [0u8; 8];
    suffix[0..2].copy_from_slice(&UDF_REVISION.to_le_bytes());
    suffix
}

/// The implementation identifier suffix: OS class and OS identifier (UDF 2.1.5.3, 6.3).
///
/// The image is not tied to an operating system, so the class "undefined" is recorded.
pub(crate) fn implementation_suffix() -> [u8; 8] {
    [0u8; 8]
}


/// Encodes `text` as OSTA compressed unicode (UDF 2.1.1), using at most `max_length` bytes.
///
/// Uses compression ID 8 if every character fits into a single byte and 16 (big-endian UTF-16)
/// otherwise. Characters that would not fit are dropped. An empty string encodes to no bytes.
pub(crate) fn encode_cs0(text: &str, max_length: usize) -> Vec<u8> {
    if text.is_empty() || max_length == 0 {
        return Vec::new();
    }

    let narrow = text.chars().all(|c| u32::from(c) <= 0xFF);
    let mut ret = Vec::with_capacity(max_length.min(1 + 2 * text.len()));
    if narrow {
        ret.push(8);
        for c in text.chars() {
            if ret.len() + 1 > max_length {
                break;
            }
            ret.push(u32::from(c) as u8);
        }
    } else {
        ret.push(16);
        let mut units = [0u16; 2];
        for c in text.chars() {
            let encoded = c.encode_utf16(&mut units);
            if ret.len() + 2 * encoded.len() > max_length {
                break;
            }
            for unit in encoded.iter() {
                ret.extend_from_slice(&unit.to_be_bytes());
            }
        }
    }
    ret
}

/// Encodes `text` as a fixed-length dstring (1/7.2.12): compressed unicode padded with zeros, with
/// the number of bytes used stored in the last byte.
pub(crate) fn dstring(text: &str, field_length: usize) -> Vec<u8> {
    let mut buf = vec![0u8; field_length];
    let encoded = encode_cs0(text, field_length - 1);
    buf[..encoded.len()].copy_from_slice(&encoded);
    buf[field_length - 1] = encoded.len() as u8;
    buf
}
