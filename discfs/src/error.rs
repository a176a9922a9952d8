use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::sector::{SectorOwner, SectorRegion};


#[derive(Debug)]
pub enum ImageError {
    Io(io::Error),
    Structure { structure: &'static str, error: io::Error },
    Overflow { quantity: &'static str, value: u64 },
    UnallocatedPartition,
    StructuralMismatch { path: PathBuf, predicted: u64, actual: u64 },
    RegionNotAllocated { owner: SectorOwner, region: SectorRegion },
    OutOfOrder { writer: &'static str, step: &'static str },
    MisplacedStructure { structure: &'static str, expected: u64, actual: u64 },
    DescriptorAreaExhausted { next_free: u64 },
    FileSizeChanged { path: PathBuf, expected: u64, actual: u64 },
}
impl ImageError {
    /// Returns a closure wrapping an I/O error with the name of the structure being written.
    pub(crate) fn structure(structure: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |error| Self::Structure { structure, error }
    }
}
impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)
                => write!(f, "I/O error: {}", e),
            Self::Structure { structure, error }
                => write!(f, "failed to write {}: {}", structure, error),
            Self::Overflow { quantity, value }
                => write!(f, "{} ({}) exceeds the range UDF can record", quantity, value),
            Self::UnallocatedPartition
                => write!(f, "cannot write UDF partition since no space has been reserved for it"),
            Self::StructuralMismatch { path, predicted, actual }
                => write!(f, "invalid location for {:?}: predicted sector {}, actual sector {}", path, predicted, actual),
            Self::RegionNotAllocated { owner, region }
                => write!(f, "region {:?} of {:?} has not been allocated", region, owner),
            Self::OutOfOrder { writer, step }
                => write!(f, "{} writer: {} called out of order", writer, step),
            Self::MisplacedStructure { structure, expected, actual }
                => write!(f, "{} must start at byte {} but the image is at byte {}", structure, expected, actual),
            Self::DescriptorAreaExhausted { next_free }
                => write!(f, "no room for UDF volume descriptors below the anchor sector (next free sector is {})", next_free),
            Self::FileSizeChanged { path, expected, actual }
                => write!(f, "size of {:?} changed from {} to {} bytes during imaging", path, expected, actual),
        }
    }
}
impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Structure { error, .. } => Some(error),
            Self::Overflow { .. } => None,
            Self::UnallocatedPartition => None,
            Self::StructuralMismatch { .. } => None,
            Self::RegionNotAllocated { .. } => None,
            Self::OutOfOrder { .. } => None,
            Self::MisplacedStructure { .. } => None,
            Self::DescriptorAreaExhausted { .. } => None,
            Self::FileSizeChanged { .. } => None,
        }
    }
}
impl From<io::Error> for ImageError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}
