//! Building optical disc images from a directory tree.
//!
//! An image is assembled by an [`ImageBuilder`] from one or more file system writers implementing
//! [`FormatWriter`]. All writers share one sector address space, managed by a [`SectorManager`], and
//! one copy of the file data.


mod error;
mod file_tree;
mod format;
mod io_util;
mod sector;
pub mod udf;


pub use crate::error::ImageError;
pub use crate::file_tree::{FileTree, FileTreeNode, NodeFlags, NodeId};
pub use crate::format::{FormatWriter, ImageBuilder};
pub use crate::sector::{
    SECTOR_SIZE, SYSTEM_AREA_SECTORS, SectorAllocation, SectorManager, SectorOwner, SectorRegion,
    SectorStream, bytes_to_sectors,
};
