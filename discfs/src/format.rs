//! The protocol shared by all file system writers and the builder sequencing them.


use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};

use tracing::{debug, error, info};

use crate::error::ImageError;
use crate::file_tree::FileTree;
use crate::sector::{SECTOR_SIZE, SYSTEM_AREA_SECTORS, SectorManager, SectorOwner, SectorRegion, SectorStream, bytes_to_sectors};


/// A writer of one file system on the image.
///
/// Writing happens in two phases. In the first phase, every writer reserves the sectors it needs;
/// in the second, every writer emits its structures into the sectors it has reserved. The sector
/// numbers a writer refers to in the second phase may depend on allocations made by any writer in
/// the first phase.
///
/// The methods are called exactly once each and in the order in which they are declared. A writer
/// fails with [`ImageError::OutOfOrder`] or [`ImageError::UnallocatedPartition`] otherwise.
pub trait FormatWriter<W: Write> : fmt::Debug {
    /// A short name of the file system for diagnostics.
    fn name(&self) -> &'static str;

    fn allocate_header(&mut self, sectors: &mut SectorManager) -> Result<(), ImageError>;
    fn allocate_directory_structures(&mut self, sectors: &mut SectorManager, tree: &mut FileTree) -> Result<(), ImageError>;
    fn write_header(&mut self, stream: &mut SectorStream<W>, sectors: &SectorManager) -> Result<(), ImageError>;
    fn write_directory_structures(&mut self, stream: &mut SectorStream<W>, sectors: &SectorManager, tree: &mut FileTree) -> Result<(), ImageError>;
    fn write_tail(&mut self, stream: &mut SectorStream<W>, sectors: &SectorManager) -> Result<(), ImageError>;
}


/// Builds an image containing one or more file systems sharing the same file data.
#[derive(Debug)]
pub struct ImageBuilder<W: Write> {
    stream: SectorStream<W>,
    sectors: SectorManager,
    writers: Vec<Box<dyn FormatWriter<W>>>,
}
impl<W: Write> ImageBuilder<W> {
    pub fn new(output: W) -> Self {
        Self {
            stream: SectorStream::new(output),
            sectors: SectorManager::new(),
            writers: Vec::new(),
        }
    }

    /// Adds a file system. Writers are run in the order in which they are added.
    pub fn add_writer(&mut self, writer: Box<dyn FormatWriter<W>>) {
        self.writers.push(writer);
    }

    pub fn sectors(&self) -> &SectorManager { &self.sectors }

    /// The number of bytes written so far.
    pub fn position(&self) -> u64 { self.stream.position() }

    pub fn into_inner(self) -> W { self.stream.into_inner() }

    /// Reserves the file data of every file in the tree, in pre-order, as one contiguous region.
    fn allocate_file_data(&mut self, tree: &mut FileTree) {
        let data_start = self.sectors.next_free();
        let mut data_length = 0;
        for id in tree.pre_order() {
            let node = tree.node_mut(id);
            if node.is_directory() {
                continue;
            }
            node.data_position_normal = data_start + data_length;
            data_length += bytes_to_sectors(node.file_size);
        }
        self.sectors.allocate_data(data_length);
    }

    /// Copies the data of every file in the tree into the image, padding each to a sector.
    fn write_file_data(&mut self, tree: &FileTree) -> Result<(), ImageError> {
        for id in tree.pre_order() {
            let node = tree.node(id);
            if node.is_directory() {
                continue;
            }

            let expected = node.data_position_normal * SECTOR_SIZE;
            if self.stream.position() != expected {
                error!("data of {:?} must start at byte {} but the image is at byte {}", node.full_path, expected, self.stream.position());
                return Err(ImageError::MisplacedStructure { structure: "file data", expected, actual: self.stream.position() });
            }

            let file = File::open(&node.full_path)
                .inspect_err(|e| error!("failed to open {:?}: {}", node.full_path, e))?;
            // one byte more than expected reveals files that have grown
            let mut limited = file.take(node.file_size + 1);
            let copied = io::copy(&mut limited, &mut self.stream)
                .inspect_err(|e| error!("failed to copy {:?}: {}", node.full_path, e))?;
            if copied != node.file_size {
                error!("size of {:?} changed from {} to {} bytes", node.full_path, node.file_size, copied);
                return Err(ImageError::FileSizeChanged {
                    path: node.full_path.clone(),
                    expected: node.file_size,
                    actual: copied,
                });
            }
            self.stream.pad_sector()?;
        }
        Ok(())
    }

    /// Allocates and writes the image of `tree` with all file systems.
    ///
    /// On failure, the output contains a partial image that should be discarded.
    pub fn build(&mut self, tree: &mut FileTree) -> Result<(), ImageError> {
        self.sectors.allocate_sectors(SectorOwner::Image, SectorRegion::SystemArea, SYSTEM_AREA_SECTORS);

        for writer in &mut self.writers {
            debug!("allocating {} header", writer.name());
            writer.allocate_header(&mut self.sectors)?;
        }
        for writer in &mut self.writers {
            debug!("allocating {} directory structures", writer.name());
            writer.allocate_directory_structures(&mut self.sectors, tree)?;
        }
        self.allocate_file_data(tree);
        info!(
            "image layout: {} sectors of file data starting at sector {}, {} sectors in total",
            self.sectors.data_length(), self.sectors.data_start(), self.sectors.next_free(),
        );

        self.stream.write_empty_sectors(SYSTEM_AREA_SECTORS)?;
        for writer in &mut self.writers {
            debug!("writing {} header", writer.name());
            writer.write_header(&mut self.stream, &self.sectors)?;
        }
        for writer in &mut self.writers {
            debug!("writing {} directory structures", writer.name());
            writer.write_directory_structures(&mut self.stream, &self.sectors, tree)?;
        }

        debug!("writing file data");
        self.write_file_data(tree)?;

        for writer in &mut self.writers {
            debug!("writing {} tail", writer.name());
            writer.write_tail(&mut self.stream, &self.sectors)?;
        }
        self.stream.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::ImageBuilder;
    use crate::error::ImageError;
    use crate::file_tree::FileTree;
    use crate::udf::{UdfOptions, UdfWriter};
    use std::fs;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn temp_dir(name: &str) -> PathBuf {
        let base = std::env::temp_dir().join(format!("discfs-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn u16_at(buf: &[u8], pos: usize) -> u16 { u16::from_le_bytes(buf[pos..pos+2].try_into().unwrap()) }
    fn u32_at(buf: &[u8], pos: usize) -> u32 { u32::from_le_bytes(buf[pos..pos+4].try_into().unwrap()) }

    #[traced_test]
    #[test]
    fn test_build_udf_image() {
        let base = temp_dir("build");
        fs::create_dir_all(base.join("sub")).unwrap();
        fs::write(base.join("hello.txt"), b"Hello, world!").unwrap();
        fs::write(base.join("sub").join("big.bin"), vec![0xA5u8; 5000]).unwrap();
        fs::write(base.join("sub").join("empty"), b"").unwrap();

        let mut tree = FileTree::scan(&base).unwrap();
        let mut builder = ImageBuilder::new(Vec::new());
        builder.add_writer(Box::new(UdfWriter::new(&UdfOptions::default())));
        builder.build(&mut tree).unwrap();
        let data_start = builder.sectors().data_start() as usize;
        let data_end = data_start + builder.sectors().data_length() as usize;
        let image = builder.into_inner();
        fs::remove_dir_all(&base).unwrap();

        // pre-order: hello.txt (1 sector), sub/big.bin (3 sectors), sub/empty (none)
        assert_eq!(data_end - data_start, 4);
        assert_eq!(image.len(), (data_end + 1) * 2048);
        assert!(image[..16*2048].iter().all(|&b| b == 0));

        let root = tree.root();
        let hello = tree.children(root)[0];
        let sub = tree.children(root)[1];
        let big = tree.children(sub)[0];
        assert_eq!(tree.node(hello).data_position_normal as usize, data_start);
        assert_eq!(tree.node(big).data_position_normal as usize, data_start + 1);

        let big_pos = (data_start + 1) * 2048;
        assert!(image[big_pos..big_pos+5000].iter().all(|&b| b == 0xA5));
        let hello_pos = data_start * 2048;
        assert_eq!(&image[hello_pos..hello_pos+13], b"Hello, world!");
        assert!(image[hello_pos+13..hello_pos+2048].iter().all(|&b| b == 0));

        // closing anchor directly after the data
        let anchor = &image[data_end*2048..];
        assert_eq!(u16_at(anchor, 0), 2);
        assert_eq!(u32_at(anchor, 12) as usize, data_end);

        assert!(logs_contain("image layout"));
    }

    #[test]
    fn test_changed_file_size_is_detected() {
        let base = temp_dir("changed");
        fs::write(base.join("grown.txt"), b"longer than announced").unwrap();

        let mut tree = FileTree::new(&base);
        tree.add_file(tree.root(), "grown.txt", base.join("grown.txt"), 6);
        let mut builder = ImageBuilder::new(Vec::new());
        builder.add_writer(Box::new(UdfWriter::new(&UdfOptions::default())));
        let result = builder.build(&mut tree);
        fs::remove_dir_all(&base).unwrap();

        match result {
            Err(ImageError::FileSizeChanged { expected, actual, .. }) => {
                assert_eq!(expected, 6);
                assert_eq!(actual, 7);
            },
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_fails() {
        let mut tree = FileTree::new("/nonexistent-discfs-root");
        tree.add_file(tree.root(), "gone", "/nonexistent-discfs-root/gone", 1);
        let mut builder = ImageBuilder::new(Vec::new());
        builder.add_writer(Box::new(UdfWriter::new(&UdfOptions::default())));
        assert!(matches!(builder.build(&mut tree), Err(ImageError::Io(_))));
    }
}
