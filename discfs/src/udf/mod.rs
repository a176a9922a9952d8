//! Encoding Universal Disk Format file systems.
//!
//! UDF, a profile of ECMA-167 (ISO/IEC 13346), is written here at revision 1.02, the revision
//! readable by the widest range of systems. The structures share the sector address space with
//! ISO9660 and Joliet: the UDF volume recognition sequence follows the ISO9660 volume descriptors,
//! and the file data is shared between all file systems on the image.


mod descriptors;
mod primitives;
mod writer;


pub use crate::udf::descriptors::{FileTimes, Udf};
pub use crate::udf::primitives::{ExtentAd, TagIdentifier, Timestamp};
pub use crate::udf::writer::{UdfOptions, UdfWriter, WriterState};


/// The length of a UDF logical block, which equals the ISO9660 logical sector length.
pub const UDF_SECTOR_SIZE: u64 = crate::sector::SECTOR_SIZE;

/// The smallest unique identifier that may be assigned to a file or directory other than the root.
///
/// UDF 3.2.1.1 reserves the values 1 to 15 for compatibility with Macintosh implementations.
pub const UNIQUE_IDENT_MIN: u64 = 16;

/// The minimum length of a volume descriptor sequence extent in sectors (UDF 2.2.3.1).
pub const VOL_DESC_SEQ_MIN_SECTORS: u64 = 16;

/// The sector containing the first anchor volume descriptor pointer (ECMA-167 3/8.4.2.1).
pub const ANCHOR_SECTOR: u64 = 256;

/// The sector at which the main descriptor region ends and the file set contents begin.
pub const MAIN_DESCRIPTORS_END: u64 = 258;

/// The first sector of the UDF partition, which starts with the file set descriptor.
pub const PARTITION_START: u64 = 257;

/// The descriptor version recorded in every tag (ECMA-167 2nd edition, NSR02).
pub(crate) const DESCRIPTOR_VERSION: u16 = 2;

/// The UDF revision in binary coded decimal.
pub(crate) const UDF_REVISION: u16 = 0x0102;
