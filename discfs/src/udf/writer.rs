//! Placement of the UDF structures within the image.


use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing::{debug, error};

use crate::error::ImageError;
use crate::file_tree::{FileTree, NodeId};
use crate::format::FormatWriter;
use crate::sector::{SectorManager, SectorOwner, SectorRegion, SectorStream, bytes_to_sectors};
use crate::udf::{
    ANCHOR_SECTOR, MAIN_DESCRIPTORS_END, PARTITION_START, UDF_SECTOR_SIZE, UNIQUE_IDENT_MIN,
    VOL_DESC_SEQ_MIN_SECTORS,
};
use crate::udf::descriptors::{FileTimes, Udf};
use crate::udf::primitives::{ExtentAd, Timestamp};


/// The number of descriptors in each volume descriptor sequence.
const VOL_DESC_SEQ_DESCRIPTORS: u64 = 6;

const WRITER_NAME: &str = "UDF";


/// Options influencing the content of the UDF file system.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct UdfOptions {
    pub volume_identifier: String,
    pub volume_set_identifier: String,
    pub implementation_identifier: String,

    /// Whether to record the access, modification and creation times of the host files instead of
    /// the time at which the image was created.
    pub use_file_times: bool,
}
impl Default for UdfOptions {
    fn default() -> Self {
        Self {
            volume_identifier: "CDROM".to_owned(),
            volume_set_identifier: "CDROM".to_owned(),
            implementation_identifier: "discfs".to_owned(),
            use_file_times: true,
        }
    }
}


/// The phase a [`UdfWriter`] has completed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum WriterState {
    Created,
    HeaderAllocated,
    PartitionAllocated,
    HeaderWritten,
    PartitionWritten,
    TailWritten,
}


/// Converts a sector number into the 32 bits UDF has room for.
fn to_u32(quantity: &'static str, value: u64) -> Result<u32, ImageError> {
    u32::try_from(value)
        .map_err(|_| {
            error!("{} ({}) does not fit into 32 bits", quantity, value);
            ImageError::Overflow { quantity, value }
        })
}

/// Converts a count into the 16 bits UDF has room for.
fn to_u16(quantity: &'static str, value: u64) -> Result<u16, ImageError> {
    u16::try_from(value)
        .map_err(|_| {
            error!("{} ({}) does not fit into 16 bits", quantity, value);
            ImageError::Overflow { quantity, value }
        })
}

/// Wraps a stream failure while writing `structure`, logging it on the way.
fn failed(structure: &'static str) -> impl FnOnce(io::Error) -> ImageError {
    move |e| {
        error!("failed to write {}: {}", structure, e);
        ImageError::structure(structure)(e)
    }
}

/// Verifies that `stream` is positioned at the start of `sector`.
fn expect_sector<W: Write>(stream: &SectorStream<W>, structure: &'static str, sector: u64) -> Result<(), ImageError> {
    let expected = sector * UDF_SECTOR_SIZE;
    if stream.position() != expected {
        error!("{} must start at byte {} but the image is at byte {}", structure, expected, stream.position());
        return Err(ImageError::MisplacedStructure { structure, expected, actual: stream.position() });
    }
    Ok(())
}


/// Writes the UDF file system of an image.
///
/// The file system consists of the volume recognition sequence written as part of the header, the
/// main and reserve volume descriptor sequences followed by the anchor at sector 256 and the file
/// set written as part of the directory structures, and the closing anchor written after the file
/// data. File entries point into the file data shared with the other file systems.
#[derive(Clone, Debug)]
pub struct UdfWriter {
    udf: Udf,
    use_file_times: bool,
    image_create: Timestamp,
    part_length: u64,
    main_sequence: ExtentAd,
    reserve_sequence: ExtentAd,
    state: WriterState,
}
impl UdfWriter {
    pub fn new(options: &UdfOptions) -> Self {
        Self {
            udf: Udf::new(
                &options.volume_identifier,
                &options.volume_set_identifier,
                &options.implementation_identifier,
            ),
            use_file_times: options.use_file_times,
            image_create: Timestamp::from_datetime(&Local::now()),
            part_length: 0,
            main_sequence: ExtentAd::default(),
            reserve_sequence: ExtentAd::default(),
            state: WriterState::Created,
        }
    }

    /// Replaces the image creation time captured at construction.
    pub fn with_creation_time(mut self, time: Timestamp) -> Self {
        self.image_create = time;
        self
    }

    pub fn state(&self) -> WriterState { self.state }

    /// The number of sectors of file set contents following the file set descriptor.
    pub fn partition_length(&self) -> u64 { self.part_length }

    fn expect_state(&self, expected: WriterState, step: &'static str) -> Result<(), ImageError> {
        if self.state != expected {
            error!("{} called in state {:?}, expected {:?}", step, self.state, expected);
            return Err(ImageError::OutOfOrder { writer: WRITER_NAME, step });
        }
        Ok(())
    }

    /// The number of bytes taken up by the file identifiers of a directory's children and its
    /// parent.
    fn ident_block_size(&self, tree: &FileTree, dir: NodeId) -> u64 {
        let children: u64 = tree.children(dir).iter()
            .map(|&c| self.udf.file_ident_size(&tree.node(c).name))
            .sum();
        children + self.udf.file_ident_parent_size()
    }

    /// Calculates `udf_size` of every node and initializes the totals to it.
    fn calc_node_lengths(&self, tree: &mut FileTree) {
        let mut dir_stack = vec![tree.root()];
        while let Some(dir) = dir_stack.pop() {
            let ident_size = self.ident_block_size(tree, dir);
            let dir_size = bytes_to_sectors(self.udf.file_entry_size(ident_size)) + bytes_to_sectors(ident_size);
            let node = tree.node_mut(dir);
            node.udf_size = dir_size;
            node.udf_size_total = dir_size;

            for i in 0..tree.children(dir).len() {
                let child = tree.children(dir)[i];
                if tree.node(child).is_directory() {
                    dir_stack.push(child);
                } else {
                    let file_size = tree.node(child).file_size;
                    let entry_size = bytes_to_sectors(self.udf.file_entry_size(file_size));
                    let node = tree.node_mut(child);
                    node.udf_size = entry_size;
                    node.udf_size_total = entry_size;
                }
            }
        }
    }

    /// Adds the totals of every subtree to its root. Returns the total of the whole tree.
    fn calc_node_size_total(tree: &mut FileTree) -> u64 {
        for id in tree.post_order() {
            if let Some(parent) = tree.parent(id) {
                let total = tree.node(id).udf_size_total;
                tree.node_mut(parent).udf_size_total += total;
            }
        }
        tree.node(tree.root()).udf_size_total
    }

    /// Counts the subdirectories of every directory.
    fn calc_node_links_total(tree: &mut FileTree) {
        let order = tree.post_order();
        for &id in &order {
            tree.node_mut(id).udf_link_total = 0;
        }
        for id in order {
            if !tree.node(id).is_directory() {
                continue;
            }
            if let Some(parent) = tree.parent(id) {
                tree.node_mut(parent).udf_link_total += 1;
            }
        }
    }

    /// Calculates the number of sectors required by the file and directory entries and the file
    /// identifiers, not counting the file set descriptor.
    fn calc_partition_length(&self, tree: &mut FileTree) -> u64 {
        self.calc_node_lengths(tree);
        Self::calc_node_links_total(tree);
        Self::calc_node_size_total(tree)
    }

    /// The times to record for the file or directory at `path`.
    fn file_times(&self, path: &Path) -> FileTimes {
        if !self.use_file_times {
            return FileTimes::uniform(self.image_create);
        }
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                debug!("no times for {:?} ({}); using image creation time", path, e);
                return FileTimes::uniform(self.image_create);
            },
        };
        let convert = |time: io::Result<SystemTime>| time
            .map(|t| Timestamp::from_datetime(&DateTime::<Local>::from(t)))
            .unwrap_or(self.image_create);
        FileTimes {
            access: convert(metadata.accessed()),
            modify: convert(metadata.modified()),
            create: convert(metadata.created()),
        }
    }

    /// Assigns the unique identifier following `current`, skipping the reserved range after the
    /// root's identifier 0.
    fn next_unique_ident(current: u64) -> u64 {
        if current == 0 {
            UNIQUE_IDENT_MIN
        } else {
            current + 1
        }
    }

    /// Fails if the entry of `node` is about to be written anywhere but where its parent's file
    /// identifier points.
    fn check_prediction(tree: &FileTree, node: NodeId, actual: u32) -> Result<(), ImageError> {
        let predicted = tree.node(node).udf_partition_location;
        if predicted != u64::from(actual) {
            let path = tree.node(node).full_path.clone();
            error!("invalid location for {:?}: predicted sector {}, actual sector {}", path, predicted, actual);
            return Err(ImageError::StructuralMismatch { path, predicted, actual: actual.into() });
        }
        Ok(())
    }

    /// Writes the file entry and file identifiers of a directory.
    ///
    /// Every child's entry location is predicted from the sizes of its preceding siblings' subtrees
    /// and stored in its `udf_partition_location`. The entries of the children's subtrees have to
    /// be written in pre-order directly after this directory for the predictions to hold.
    fn write_local_partition_directory<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        tree: &mut FileTree,
        dir: NodeId,
        current_sector: &mut u32,
        unique_ident: &mut u64,
    ) -> Result<(), ImageError> {
        let entry_sector = *current_sector;
        let ident_sector = entry_sector + 1;
        let ident_size = self.ident_block_size(tree, dir);
        let ident_sectors = bytes_to_sectors(ident_size);
        let mut next_entry_sector = u64::from(ident_sector) + ident_sectors;

        let times = self.file_times(&tree.node(dir).full_path);
        let link_count = to_u16("UDF directory link count", tree.node(dir).udf_link_total + 1)?;
        self.udf.write_file_entry(
            stream,
            entry_sector,
            true,
            link_count,
            *unique_ident,
            ident_sector,
            ident_size,
            &times,
        ).map_err(failed("directory file entry"))?;
        *unique_ident = Self::next_unique_ident(*unique_ident);

        let parent_entry_sector = match tree.parent(dir) {
            None => entry_sector,
            Some(parent) => to_u32("UDF parent entry location", tree.node(parent).udf_partition_location)?,
        };
        self.udf.write_file_ident_parent(stream, ident_sector, parent_entry_sector)
            .map_err(failed("parent file identifier descriptor"))?;

        // identifiers are packed; each is tagged with the sector it starts in
        let mut ident_bytes = self.udf.file_ident_parent_size();
        for i in 0..tree.children(dir).len() {
            let child = tree.children(dir)[i];
            let child_entry_sector = to_u32("UDF entry location", next_entry_sector)?;
            let child_node = tree.node(child);
            let child_ident_sector = to_u32("UDF partition sector", u64::from(ident_sector) + ident_bytes / UDF_SECTOR_SIZE)?;
            self.udf.write_file_ident(stream, child_ident_sector, child_entry_sector, child_node.is_directory(), &child_node.name)
                .map_err(failed("file identifier descriptor"))?;
            ident_bytes += self.udf.file_ident_size(&child_node.name);
            debug!("predicted UDF entry of {:?} at partition sector {}", child_node.full_path, child_entry_sector);

            let child_node = tree.node_mut(child);
            child_node.udf_partition_location = next_entry_sector;
            next_entry_sector += child_node.udf_size_total;
        }
        stream.pad_sector()
            .map_err(failed("file identifier descriptor"))?;

        *current_sector = to_u32("UDF partition sector", u64::from(ident_sector) + ident_sectors)?;
        Ok(())
    }

    /// Writes the file and directory entries and file identifiers of the whole tree, starting with
    /// the root directory at partition sector 1.
    fn write_partition_entries<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        tree: &mut FileTree,
    ) -> Result<(), ImageError> {
        // partition sector 0 holds the file set descriptor
        let mut current_sector = 1u32;
        let mut unique_ident = 0u64;

        let root = tree.root();
        tree.node_mut(root).udf_partition_location = current_sector.into();
        self.write_local_partition_directory(stream, tree, root, &mut current_sector, &mut unique_ident)?;

        let mut pending: Vec<NodeId> = tree.children(root).iter().rev().copied().collect();
        while let Some(id) = pending.pop() {
            Self::check_prediction(tree, id, current_sector)?;

            if tree.node(id).is_directory() {
                self.write_local_partition_directory(stream, tree, id, &mut current_sector, &mut unique_ident)?;
                pending.extend(tree.children(id).iter().rev());
            } else {
                let node = tree.node(id);
                let data_location = node.data_position_normal
                    .checked_sub(PARTITION_START)
                    .ok_or(ImageError::Overflow { quantity: "UDF file data location", value: node.data_position_normal })
                    .and_then(|location| to_u32("UDF file data location", location))?;
                let times = self.file_times(&node.full_path);
                self.udf.write_file_entry(
                    stream,
                    current_sector,
                    false,
                    1,
                    unique_ident,
                    data_location,
                    node.file_size,
                    &times,
                ).map_err(failed("file entry"))?;
                unique_ident = Self::next_unique_ident(unique_ident);
                current_sector = to_u32("UDF partition sector", u64::from(current_sector) + node.udf_size)?;
            }
        }

        debug!("wrote UDF entries up to partition sector {}, last unique identifier {}", current_sector, unique_ident);
        Ok(())
    }

    /// Writes one volume descriptor sequence starting at `start` and pads it to the minimum
    /// sequence length. Returns its extent.
    fn write_volume_descriptor_sequence<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        start: u32,
        partition_length: u32,
        integrity_sequence: ExtentAd,
    ) -> Result<ExtentAd, ImageError> {
        let mut sector = start;
        let mut sequence_number = 0;

        self.udf.write_vol_desc_primary(stream, sequence_number, sector, &self.image_create)
            .map_err(failed("primary volume descriptor"))?;
        sector += 1;
        sequence_number += 1;

        self.udf.write_vol_desc_impl_use(stream, sequence_number, sector)
            .map_err(failed("implementation use volume descriptor"))?;
        sector += 1;
        sequence_number += 1;

        self.udf.write_vol_desc_partition(stream, sequence_number, sector, PARTITION_START as u32, partition_length)
            .map_err(failed("partition descriptor"))?;
        sector += 1;
        sequence_number += 1;

        self.udf.write_vol_desc_logical(stream, sequence_number, sector, integrity_sequence)
            .map_err(failed("logical volume descriptor"))?;
        sector += 1;
        sequence_number += 1;

        self.udf.write_vol_desc_unalloc(stream, sequence_number, sector)
            .map_err(failed("unallocated space descriptor"))?;
        sector += 1;

        self.udf.write_vol_desc_term(stream, sector)
            .map_err(failed("terminating descriptor"))?;

        stream.write_empty_sectors(VOL_DESC_SEQ_MIN_SECTORS - VOL_DESC_SEQ_DESCRIPTORS)
            .map_err(failed("volume descriptor sequence padding"))?;

        Ok(ExtentAd {
            length: (VOL_DESC_SEQ_MIN_SECTORS * UDF_SECTOR_SIZE) as u32,
            location: start,
        })
    }
}
impl<W: Write> FormatWriter<W> for UdfWriter {
    fn name(&self) -> &'static str { WRITER_NAME }

    fn allocate_header(&mut self, sectors: &mut SectorManager) -> Result<(), ImageError> {
        self.expect_state(WriterState::Created, "allocate_header")?;
        sectors.allocate_bytes(SectorOwner::Udf, SectorRegion::InitialDescriptors, self.udf.vol_desc_initial_size());
        self.state = WriterState::HeaderAllocated;
        Ok(())
    }

    fn allocate_directory_structures(&mut self, sectors: &mut SectorManager, tree: &mut FileTree) -> Result<(), ImageError> {
        self.expect_state(WriterState::HeaderAllocated, "allocate_directory_structures")?;

        // the integrity descriptor and both sequences go below the anchor
        let next_free = sectors.next_free();
        if next_free + 1 + 2 * VOL_DESC_SEQ_MIN_SECTORS > ANCHOR_SECTOR {
            error!("UDF main descriptors would start at sector {}, leaving no room below the anchor", next_free);
            return Err(ImageError::DescriptorAreaExhausted { next_free });
        }
        sectors.allocate_sectors(SectorOwner::Udf, SectorRegion::MainDescriptors, MAIN_DESCRIPTORS_END - next_free);

        self.part_length = self.calc_partition_length(tree);
        sectors.allocate_sectors(SectorOwner::Udf, SectorRegion::FilesetContents, self.part_length);
        debug!("UDF file set contents take up {} sectors", self.part_length);

        self.state = WriterState::PartitionAllocated;
        Ok(())
    }

    fn write_header(&mut self, stream: &mut SectorStream<W>, sectors: &SectorManager) -> Result<(), ImageError> {
        self.expect_state(WriterState::PartitionAllocated, "write_header")?;
        let start = sectors.start(SectorOwner::Udf, SectorRegion::InitialDescriptors)
            .ok_or(ImageError::RegionNotAllocated { owner: SectorOwner::Udf, region: SectorRegion::InitialDescriptors })?;
        expect_sector(stream, "UDF volume recognition sequence", start)?;

        self.udf.write_vol_desc_initial(stream)
            .map_err(failed("UDF volume recognition sequence"))?;
        self.state = WriterState::HeaderWritten;
        Ok(())
    }

    fn write_directory_structures(&mut self, stream: &mut SectorStream<W>, sectors: &SectorManager, tree: &mut FileTree) -> Result<(), ImageError> {
        if self.part_length == 0 {
            error!("cannot write UDF partition since no space has been reserved for it");
            return Err(ImageError::UnallocatedPartition);
        }
        self.expect_state(WriterState::HeaderWritten, "write_directory_structures")?;

        to_u32("UDF partition length", self.part_length)?;
        let main_start = sectors.start(SectorOwner::Udf, SectorRegion::MainDescriptors)
            .ok_or(ImageError::RegionNotAllocated { owner: SectorOwner::Udf, region: SectorRegion::MainDescriptors })?;
        let main_start = to_u32("start of UDF main descriptors", main_start)?;
        to_u32("UDF file data length", sectors.data_length())?;
        let partition_length = to_u32(
            "UDF partition length",
            (sectors.data_start() + sectors.data_length()).saturating_sub(PARTITION_START),
        )?;
        let contents_start = sectors.start(SectorOwner::Udf, SectorRegion::FilesetContents)
            .ok_or(ImageError::RegionNotAllocated { owner: SectorOwner::Udf, region: SectorRegion::FilesetContents })?;
        expect_sector(stream, "UDF logical volume integrity descriptor", main_start.into())?;

        // the next unique identifier exceeds all those assigned to entries
        let unique_ident = tree.dir_count() + tree.file_count() + 1 + UNIQUE_IDENT_MIN;
        let integrity_sequence = ExtentAd {
            length: UDF_SECTOR_SIZE as u32,
            location: main_start,
        };
        self.udf.write_vol_desc_log_integrity(
            stream,
            main_start,
            to_u32("UDF file count", tree.file_count())?,
            to_u32("UDF directory count", tree.dir_count() + 1)?,
            partition_length,
            unique_ident,
            &self.image_create,
        ).map_err(failed("logical volume integrity descriptor"))?;

        let main_sequence_start = main_start + 1;
        self.main_sequence = self.write_volume_descriptor_sequence(stream, main_sequence_start, partition_length, integrity_sequence)?;
        let reserve_sequence_start = main_sequence_start + VOL_DESC_SEQ_MIN_SECTORS as u32;
        self.reserve_sequence = self.write_volume_descriptor_sequence(stream, reserve_sequence_start, partition_length, integrity_sequence)?;

        let padding = ANCHOR_SECTOR - (u64::from(reserve_sequence_start) + VOL_DESC_SEQ_MIN_SECTORS);
        stream.write_empty_sectors(padding)
            .map_err(failed("padding before the anchor volume descriptor pointer"))?;

        self.udf.write_anchor_vol_desc_ptr(stream, ANCHOR_SECTOR as u32, self.main_sequence, self.reserve_sequence)
            .map_err(failed("anchor volume descriptor pointer"))?;

        // partition sector 0; the root directory follows at partition sector 1
        self.udf.write_file_set_desc(stream, 0, 1, &self.image_create)
            .map_err(failed("file set descriptor"))?;

        self.write_partition_entries(stream, tree)?;
        expect_sector(stream, "data following the UDF file set contents", contents_start + self.part_length)?;

        self.state = WriterState::PartitionWritten;
        Ok(())
    }

    fn write_tail(&mut self, stream: &mut SectorStream<W>, sectors: &SectorManager) -> Result<(), ImageError> {
        self.expect_state(WriterState::PartitionWritten, "write_tail")?;

        let last_data_sector = sectors.data_start() + sectors.data_length();
        let anchor_sector = to_u32("last UDF data sector", last_data_sector)?;
        expect_sector(stream, "closing anchor volume descriptor pointer", last_data_sector)?;

        self.udf.write_anchor_vol_desc_ptr(stream, anchor_sector, self.main_sequence, self.reserve_sequence)
            .map_err(failed("anchor volume descriptor pointer"))?;
        stream.pad_sector()
            .map_err(failed("anchor volume descriptor pointer"))?;

        self.state = WriterState::TailWritten;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::{UdfOptions, UdfWriter, WriterState};
    use crate::error::ImageError;
    use crate::file_tree::{FileTree, NodeId};
    use crate::format::FormatWriter;
    use crate::sector::{SectorManager, SectorOwner, SectorRegion, SectorStream};
    use crate::udf::primitives::Timestamp;
    use tracing_test::traced_test;

    const SECTOR: usize = 2048;

    fn options() -> UdfOptions {
        UdfOptions {
            volume_identifier: "TEST".to_owned(),
            volume_set_identifier: "TEST".to_owned(),
            implementation_identifier: "discfs".to_owned(),
            use_file_times: false,
        }
    }

    fn writer() -> UdfWriter {
        UdfWriter::new(&options()).with_creation_time(Timestamp {
            year: 2008,
            month: 1,
            day: 1,
            ..Timestamp::default()
        })
    }

    fn u16_at(buf: &[u8], pos: usize) -> u16 { u16::from_le_bytes(buf[pos..pos+2].try_into().unwrap()) }
    fn u32_at(buf: &[u8], pos: usize) -> u32 { u32::from_le_bytes(buf[pos..pos+4].try_into().unwrap()) }
    fn u64_at(buf: &[u8], pos: usize) -> u64 { u64::from_le_bytes(buf[pos..pos+8].try_into().unwrap()) }

    fn sector(image: &[u8], index: usize) -> &[u8] {
        &image[index*SECTOR..(index+1)*SECTOR]
    }

    /// A tree with nested directories and enough children in one directory that its file
    /// identifiers span multiple sectors.
    fn sample_tree() -> FileTree {
        let mut tree = FileTree::new("/nonexistent");
        let docs = tree.add_directory(tree.root(), "docs", "/nonexistent/docs");
        tree.add_file(docs, "manual.txt", "/nonexistent/docs/manual.txt", 5000);
        let deep = tree.add_directory(docs, "deep", "/nonexistent/docs/deep");
        tree.add_file(deep, "leaf", "/nonexistent/docs/deep/leaf", 0);
        let many = tree.add_directory(tree.root(), "many", "/nonexistent/many");
        for i in 0..60 {
            let name = format!("a-rather-long-file-name-number-{:03}.dat", i);
            tree.add_file(many, name, "/nonexistent/many/x", 10);
        }
        tree.add_file(tree.root(), "README", "/nonexistent/README", 100);
        tree
    }

    /// Runs the whole UDF writer the way the image builder does, without copying file data.
    fn build(writer: &mut UdfWriter, tree: &mut FileTree) -> Result<(SectorManager, Vec<u8>), ImageError> {
        let mut sectors = SectorManager::new();
        sectors.allocate_sectors(SectorOwner::Image, SectorRegion::SystemArea, 16);
        FormatWriter::<Vec<u8>>::allocate_header(writer, &mut sectors)?;
        FormatWriter::<Vec<u8>>::allocate_directory_structures(writer, &mut sectors, tree)?;

        let mut data_length = 0;
        let data_start = sectors.next_free();
        for id in tree.pre_order() {
            let node = tree.node_mut(id);
            if !node.is_directory() {
                node.data_position_normal = data_start + data_length;
                data_length += node.file_size.div_ceil(2048);
            }
        }
        sectors.allocate_data(data_length);

        let mut stream = SectorStream::new(Vec::new());
        stream.write_empty_sectors(16)?;
        writer.write_header(&mut stream, &sectors)?;
        writer.write_directory_structures(&mut stream, &sectors, tree)?;
        stream.write_empty_sectors(data_length)?;
        writer.write_tail(&mut stream, &sectors)?;
        Ok((sectors, stream.into_inner()))
    }

    #[test]
    fn test_size_totals_are_consistent() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let mut sectors = SectorManager::new();
        sectors.allocate_sectors(SectorOwner::Image, SectorRegion::SystemArea, 16);
        FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors).unwrap();
        FormatWriter::<Vec<u8>>::allocate_directory_structures(&mut writer, &mut sectors, &mut tree).unwrap();

        for id in tree.pre_order() {
            let node = tree.node(id);
            let children_total: u64 = tree.children(id).iter()
                .map(|&c| tree.node(c).udf_size_total)
                .sum();
            assert_eq!(node.udf_size_total, node.udf_size + children_total);
        }
        assert_eq!(writer.partition_length(), tree.node(tree.root()).udf_size_total);
        assert_eq!(sectors.start(SectorOwner::Udf, SectorRegion::MainDescriptors), Some(19));
        assert_eq!(sectors.start(SectorOwner::Udf, SectorRegion::FilesetContents), Some(258));

        // 60 identifiers of 80 bytes each plus the parent take up three sectors
        let many = tree.children(tree.root())[1];
        assert_eq!(tree.node(many).udf_size, 1 + 3);
    }

    #[test]
    fn test_link_counts() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let (_, image) = build(&mut writer, &mut tree).unwrap();

        let root = tree.root();
        let docs = tree.children(root)[0];
        let deep = tree.children(docs)[1];
        let many = tree.children(root)[1];
        assert_eq!(tree.node(root).udf_link_total, 2);
        assert_eq!(tree.node(docs).udf_link_total, 1);
        assert_eq!(tree.node(deep).udf_link_total, 0);
        assert_eq!(tree.node(many).udf_link_total, 0);

        let entry = |id: NodeId| sector(&image, 257 + tree.node(id).udf_partition_location as usize);
        assert_eq!(u16_at(entry(root), 48), 3);
        assert_eq!(u16_at(entry(docs), 48), 2);
        assert_eq!(u16_at(entry(deep), 48), 1);
        assert_eq!(u16_at(entry(tree.children(many)[0]), 48), 1);
    }

    #[test]
    fn test_identifier_tags_record_their_own_sector() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let (_, image) = build(&mut writer, &mut tree).unwrap();

        let many = tree.children(tree.root())[1];
        let ident_sector = tree.node(many).udf_partition_location as usize + 1;
        let block_start = (257 + ident_sector) * SECTOR;
        let block_length = u64_at(sector(&image, 257 + ident_sector - 1), 56) as usize;
        assert_eq!(block_length, 40 + 60 * 80);

        let mut offset = 0;
        let mut count = 0;
        while offset < block_length {
            let ident = &image[block_start + offset..];
            assert_eq!(u16_at(ident, 0), 257, "no file identifier at offset {}", offset);
            assert_eq!(
                u32_at(ident, 12) as usize, ident_sector + offset / SECTOR,
                "wrong tag location at offset {}", offset,
            );
            let length = 38 + u16_at(ident, 36) as usize + ident[19] as usize;
            offset += length.next_multiple_of(4);
            count += 1;
        }
        assert_eq!(count, 61);
    }

    #[traced_test]
    #[test]
    fn test_predictions_match_entries() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let (_, image) = build(&mut writer, &mut tree).unwrap();
        assert_eq!(writer.state(), WriterState::TailWritten);

        for id in tree.pre_order() {
            let location = tree.node(id).udf_partition_location as usize;
            let entry = sector(&image, 257 + location);
            assert_eq!(u16_at(entry, 0), 261, "no file entry for {:?}", tree.node(id).full_path);
            assert_eq!(u32_at(entry, 12) as usize, location);
        }
        assert!(logs_contain("predicted UDF entry"));
    }

    #[test]
    fn test_unique_identifiers() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let (_, image) = build(&mut writer, &mut tree).unwrap();

        // entries are written in pre-order
        let idents: Vec<u64> = tree.pre_order().into_iter()
            .map(|id| u64_at(sector(&image, 257 + tree.node(id).udf_partition_location as usize), 160))
            .collect();
        assert_eq!(idents[0], 0);
        assert_eq!(idents[1], 16);
        for pair in idents[1..].windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert!(idents.iter().all(|&i| i == 0 || i >= 16));

        // the integrity descriptor records the next free identifier
        let integrity = sector(&image, 19);
        assert_eq!(u16_at(integrity, 0), 9);
        let last = *idents.last().unwrap();
        assert_eq!(u64_at(integrity, 40), tree.len() as u64 - 1 + 1 + 16);
        assert!(u64_at(integrity, 40) > last);
    }

    #[test]
    fn test_volume_descriptor_sequences_and_anchors() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let (sectors, image) = build(&mut writer, &mut tree).unwrap();

        // recognition sequence after the system area
        assert_eq!(&sector(&image, 16)[1..6], b"BEA01");
        assert_eq!(&sector(&image, 17)[1..6], b"NSR02");
        assert_eq!(&sector(&image, 18)[1..6], b"TEA01");

        for start in [20, 36] {
            let tags: Vec<u16> = (start..start+6).map(|s| u16_at(sector(&image, s), 0)).collect();
            assert_eq!(tags, vec![1, 4, 5, 6, 7, 8]);
            for s in start+6..start+16 {
                assert!(sector(&image, s).iter().all(|&b| b == 0));
            }
        }

        let first_anchor = sector(&image, 256);
        let tail_sector = (sectors.data_start() + sectors.data_length()) as usize;
        let second_anchor = sector(&image, tail_sector);
        assert_eq!(u16_at(first_anchor, 0), 2);
        assert_eq!(u16_at(second_anchor, 0), 2);
        assert_eq!(u32_at(first_anchor, 12), 256);
        assert_eq!(u32_at(second_anchor, 12) as usize, tail_sector);
        assert_eq!(&first_anchor[16..32], &second_anchor[16..32]);
        assert_eq!(u32_at(first_anchor, 16), 16 * 2048);
        assert_eq!(u32_at(first_anchor, 20), 20);
        assert_eq!(u32_at(first_anchor, 28), 36);
        assert_eq!(image.len(), (tail_sector + 1) * SECTOR);

        // file set descriptor in partition sector 0 pointing at the root in partition sector 1
        let file_set = sector(&image, 257);
        assert_eq!(u16_at(file_set, 0), 256);
        assert_eq!(u32_at(file_set, 12), 0);
        assert_eq!(u32_at(file_set, 404), 1);

        // partition covers file set and data
        let partition = sector(&image, 22);
        assert_eq!(u16_at(partition, 0), 5);
        assert_eq!(u32_at(partition, 188), 257);
        assert_eq!(u32_at(partition, 192) as usize, tail_sector - 257);
    }

    #[test]
    fn test_file_entries_point_at_data() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let (_, image) = build(&mut writer, &mut tree).unwrap();

        let docs = tree.children(tree.root())[0];
        let manual = tree.children(docs)[0];
        let node = tree.node(manual);
        let entry = sector(&image, 257 + node.udf_partition_location as usize);
        assert_eq!(entry[27], 5);
        assert_eq!(u64_at(entry, 56), 5000);
        assert_eq!(u32_at(entry, 176), 5000);
        assert_eq!(u64::from(u32_at(entry, 180)), node.data_position_normal - 257);
    }

    #[test]
    fn test_empty_tree() {
        let mut tree = FileTree::new("/nonexistent");
        let mut writer = writer();
        let (sectors, image) = build(&mut writer, &mut tree).unwrap();

        let root = tree.node(tree.root());
        assert_eq!(root.udf_size, 2);
        assert_eq!(writer.partition_length(), root.udf_size);
        assert_eq!(sectors.data_start(), 260);
        assert_eq!(sectors.data_length(), 0);

        let entry = sector(&image, 258);
        assert_eq!(u64_at(entry, 160), 0);
        assert_eq!(u16_at(entry, 48), 1);

        // the root's parent is the root itself
        let parent = sector(&image, 259);
        assert_eq!(u16_at(parent, 0), 257);
        assert_eq!(parent[18], 0x0A);
        assert_eq!(u32_at(parent, 24), 1);
        assert_eq!(image.len(), 261 * SECTOR);
    }

    #[test]
    fn test_single_file_follows_root_identifiers() {
        let mut tree = FileTree::new("/nonexistent");
        let file = tree.add_file(tree.root(), "only.txt", "/nonexistent/only.txt", 1);
        let mut writer = writer();
        let (_, image) = build(&mut writer, &mut tree).unwrap();

        // root entry at 1, identifiers at 2, file entry at 3
        assert_eq!(tree.node(file).udf_partition_location, 3);
        let identifiers = sector(&image, 259);
        assert_eq!(u32_at(identifiers, 40 + 24), 3);
        let entry = sector(&image, 260);
        assert_eq!(u16_at(entry, 0), 261);
        assert_eq!(u64_at(entry, 160), 16);
    }

    #[test]
    fn test_partition_length_overflow() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let mut sectors = SectorManager::new();
        sectors.allocate_sectors(SectorOwner::Image, SectorRegion::SystemArea, 16);
        FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors).unwrap();
        FormatWriter::<Vec<u8>>::allocate_directory_structures(&mut writer, &mut sectors, &mut tree).unwrap();
        sectors.allocate_data(0);

        let mut stream = SectorStream::new(Vec::new());
        stream.write_empty_sectors(16).unwrap();
        writer.write_header(&mut stream, &sectors).unwrap();
        let before = stream.position();

        writer.part_length = 0x1_0000_0001;
        match writer.write_directory_structures(&mut stream, &sectors, &mut tree) {
            Err(ImageError::Overflow { value, .. }) => assert_eq!(value, 0x1_0000_0001),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(stream.position(), before);
    }

    #[traced_test]
    #[test]
    fn test_link_count_overflow() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let mut sectors = SectorManager::new();
        sectors.allocate_sectors(SectorOwner::Image, SectorRegion::SystemArea, 16);
        FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors).unwrap();
        FormatWriter::<Vec<u8>>::allocate_directory_structures(&mut writer, &mut sectors, &mut tree).unwrap();
        sectors.allocate_data(0);

        // as many subdirectories as the 16-bit link count can hold, leaving no room for the
        // directory's own identifier
        let root = tree.root();
        tree.node_mut(root).udf_link_total = u16::MAX.into();

        let mut stream = SectorStream::new(Vec::new());
        stream.write_empty_sectors(16).unwrap();
        writer.write_header(&mut stream, &sectors).unwrap();
        match writer.write_directory_structures(&mut stream, &sectors, &mut tree) {
            Err(ImageError::Overflow { quantity, value }) => {
                assert_eq!(quantity, "UDF directory link count");
                assert_eq!(value, 65536);
            },
            other => panic!("unexpected result {:?}", other),
        }
        assert!(logs_contain("does not fit into 16 bits"));
    }

    #[test]
    fn test_unallocated_partition() {
        let mut tree = FileTree::new("/nonexistent");
        let mut writer = writer();
        let sectors = SectorManager::new();
        let mut stream = SectorStream::new(Vec::new());
        match writer.write_directory_structures(&mut stream, &sectors, &mut tree) {
            Err(ImageError::UnallocatedPartition) => {},
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn test_out_of_order_calls() {
        let mut writer = writer();
        let mut sectors = SectorManager::new();
        let mut stream = SectorStream::new(Vec::new());
        assert!(matches!(
            writer.write_header(&mut stream, &sectors),
            Err(ImageError::OutOfOrder { step: "write_header", .. }),
        ));
        FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors).unwrap();
        assert!(matches!(
            FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors),
            Err(ImageError::OutOfOrder { .. }),
        ));
        assert_eq!(writer.state(), WriterState::HeaderAllocated);
    }

    #[test]
    fn test_descriptor_area_exhausted() {
        let mut tree = FileTree::new("/nonexistent");
        let mut writer = writer();
        let mut sectors = SectorManager::new();
        sectors.allocate_sectors(SectorOwner::Iso9660, SectorRegion::Directories, 230);
        FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors).unwrap();
        assert!(matches!(
            FormatWriter::<Vec<u8>>::allocate_directory_structures(&mut writer, &mut sectors, &mut tree),
            Err(ImageError::DescriptorAreaExhausted { next_free: 233 }),
        ));
    }

    #[traced_test]
    #[test]
    fn test_mismatched_prediction_is_fatal() {
        let mut tree = sample_tree();
        let mut writer = writer();
        let mut sectors = SectorManager::new();
        sectors.allocate_sectors(SectorOwner::Image, SectorRegion::SystemArea, 16);
        FormatWriter::<Vec<u8>>::allocate_header(&mut writer, &mut sectors).unwrap();
        FormatWriter::<Vec<u8>>::allocate_directory_structures(&mut writer, &mut sectors, &mut tree).unwrap();
        sectors.allocate_data(0);

        // make the first subtree claim more space than it uses
        let docs = tree.children(tree.root())[0];
        tree.node_mut(docs).udf_size_total += 1;

        let mut stream = SectorStream::new(Vec::new());
        stream.write_empty_sectors(16).unwrap();
        writer.write_header(&mut stream, &sectors).unwrap();
        match writer.write_directory_structures(&mut stream, &sectors, &mut tree) {
            Err(ImageError::StructuralMismatch { path, predicted, actual }) => {
                assert_eq!(path, tree.node(tree.children(tree.root())[1]).full_path);
                assert_eq!(predicted, actual + 1);
            },
            other => panic!("unexpected result {:?}", other),
        }
        assert!(logs_contain("invalid location"));
    }
}
