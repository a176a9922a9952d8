//! The UDF descriptors and their binary layout.
//!
//! Section numbers refer to ECMA-167 2nd edition (part/section) unless prefixed with "UDF".


use std::io::{self, Write};

use crate::io_util::FieldWriter;
use crate::sector::{SectorStream, bytes_to_sectors};
use crate::udf::{UDF_REVISION, UDF_SECTOR_SIZE};
use crate::udf::primitives::{
    ExtentAd, TAG_LENGTH, TagIdentifier, Timestamp, domain_suffix, dstring, encode_cs0, entity_id,
    finish_tag, implementation_suffix, long_ad, osta_charspec, short_ad,
};


/// The length of a file entry without extended attributes and allocation descriptors (4/14.9).
const FILE_ENTRY_BASE_LENGTH: u64 = 176;

/// The length of a short allocation descriptor (4/14.14.1).
const SHORT_AD_LENGTH: u64 = 8;

/// The largest extent a single allocation descriptor may describe.
///
/// The length field has 30 bits (4/14.14.1.1) and UDF 2.3.10 requires it to be a multiple of the
/// block size.
const MAX_EXTENT_LENGTH: u64 = (1 << 30) - UDF_SECTOR_SIZE;

/// The length of a file identifier descriptor without identifier and padding (4/14.4).
const FILE_IDENT_BASE_LENGTH: u64 = 38;

/// The longest encoded file identifier that fits into the 8-bit length field.
const MAX_FILE_IDENT_LENGTH: usize = 255;

/// The number of sectors in the volume recognition sequence.
const VOL_DESC_INITIAL_SECTORS: u64 = 3;

const PRIMARY_VOLUME_DESCRIPTOR_LENGTH: usize = 512;
const IMPLEMENTATION_USE_DESCRIPTOR_LENGTH: usize = 512;
const PARTITION_DESCRIPTOR_LENGTH: usize = 512;
const LOGICAL_VOLUME_DESCRIPTOR_LENGTH: usize = 446;
const UNALLOCATED_SPACE_DESCRIPTOR_LENGTH: usize = 24;
const TERMINATING_DESCRIPTOR_LENGTH: usize = 512;
const LOGICAL_VOLUME_INTEGRITY_DESCRIPTOR_LENGTH: usize = 134;
const ANCHOR_VOLUME_DESCRIPTOR_POINTER_LENGTH: usize = 512;
const FILE_SET_DESCRIPTOR_LENGTH: usize = 512;

/// File characteristics of a file identifier descriptor (4/14.4.3).
const FILE_CHARACTERISTIC_DIRECTORY: u8 = 0x02;
const FILE_CHARACTERISTIC_PARENT: u8 = 0x08;

/// File types of an ICB tag (4/14.6.6).
const FILE_TYPE_DIRECTORY: u8 = 4;
const FILE_TYPE_BYTES: u8 = 5;

/// Permissions (4/14.9.5): read and execute for directories, read for files, for everybody.
const PERMISSIONS_DIRECTORY: u32 = 0x14A5;
const PERMISSIONS_FILE: u32 = 0x1084;


/// The access, modification and creation times recorded in a file entry.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FileTimes {
    pub access: Timestamp,
    pub modify: Timestamp,
    pub create: Timestamp,
}
impl FileTimes {
    /// All three times set to the same value.
    pub fn uniform(time: Timestamp) -> Self {
        Self {
            access: time,
            modify: time,
            create: time,
        }
    }
}


/// Encoder for the individual UDF structures.
///
/// Knows the size and layout of every descriptor but nothing about where in the image they go;
/// locations are passed in by the caller.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Udf {
    volume_identifier: String,
    volume_set_identifier: String,
    implementation_identifier: Vec<u8>,
}
impl Udf {
    pub fn new(volume_identifier: &str, volume_set_identifier: &str, implementation_identifier: &str) -> Self {
        let mut implementation = Vec::with_capacity(23);
        implementation.push(b'*');
        implementation.extend(implementation_identifier.bytes().take(22));
        Self {
            volume_identifier: volume_identifier.to_owned(),
            volume_set_identifier: volume_set_identifier.to_owned(),
            implementation_identifier: implementation,
        }
    }

    fn implementation_id(&self) -> [u8; 32] {
        entity_id(&self.implementation_identifier, implementation_suffix())
    }

    /// The number of bytes in the volume recognition sequence.
    pub fn vol_desc_initial_size(&self) -> u64 {
        VOL_DESC_INITIAL_SECTORS * UDF_SECTOR_SIZE
    }

    /// The number of short allocation descriptors needed to describe `data_length` bytes.
    fn allocation_descriptor_count(data_length: u64) -> u64 {
        data_length.div_ceil(MAX_EXTENT_LENGTH).max(1)
    }

    /// The number of bytes in the file entry of a file or directory with `data_length` bytes of
    /// data.
    pub fn file_entry_size(&self, data_length: u64) -> u64 {
        FILE_ENTRY_BASE_LENGTH + SHORT_AD_LENGTH * Self::allocation_descriptor_count(data_length)
    }

    /// The number of bytes in the file identifier descriptor naming `name`.
    pub fn file_ident_size(&self, name: &str) -> u64 {
        let identifier_length = encode_cs0(name, MAX_FILE_IDENT_LENGTH).len() as u64;
        (FILE_IDENT_BASE_LENGTH + identifier_length).next_multiple_of(4)
    }

    /// The number of bytes in the file identifier descriptor of the parent directory.
    pub fn file_ident_parent_size(&self) -> u64 {
        FILE_IDENT_BASE_LENGTH.next_multiple_of(4)
    }

    /// Writes one volume descriptor padded to a whole sector.
    fn write_sector_descriptor<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        descriptor: &mut [u8],
        identifier: TagIdentifier,
        location: u32,
    ) -> Result<(), io::Error> {
        finish_tag(descriptor, identifier, location);
        stream.write_bytes(descriptor)?;
        stream.pad_sector()
    }

    /// Writes the volume recognition sequence (2/9.1): beginning, NSR and terminating extended
    /// area descriptors, one sector each.
    pub fn write_vol_desc_initial<W: Write>(&self, stream: &mut SectorStream<W>) -> Result<(), io::Error> {
        for identifier in [b"BEA01", b"NSR02", b"TEA01"] {
            let mut sector = [0u8; UDF_SECTOR_SIZE as usize];
            FieldWriter::new(&mut sector, 0)
                .u8(0) // structure type
                .bytes(identifier)
                .u8(1); // structure version
            stream.write_bytes(&sector)?;
        }
        Ok(())
    }

    /// Writes the primary volume descriptor (3/10.1).
    pub fn write_vol_desc_primary<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        sequence_number: u32,
        location: u32,
        recording_time: &Timestamp,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; PRIMARY_VOLUME_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .u32(sequence_number)
            .u32(0) // primary volume descriptor number
            .bytes(&dstring(&self.volume_identifier, 32))
            .u16(1) // volume sequence number
            .u16(1) // maximum volume sequence number
            .u16(2) // interchange level
            .u16(3) // maximum interchange level
            .u32(1) // character set list: CS0
            .u32(1) // maximum character set list
            .bytes(&dstring(&self.volume_set_identifier, 128))
            .bytes(&osta_charspec()) // descriptor character set
            .bytes(&osta_charspec()) // explanatory character set
            .skip(ExtentAd::LENGTH) // volume abstract
            .skip(ExtentAd::LENGTH) // volume copyright notice
            .bytes(&self.implementation_id()) // application identifier
            .bytes(&recording_time.encode())
            .bytes(&self.implementation_id());
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::PrimaryVolumeDescriptor, location)
    }

    /// Writes the implementation use volume descriptor carrying the logical volume information
    /// (3/10.4, UDF 2.2.7).
    pub fn write_vol_desc_impl_use<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        sequence_number: u32,
        location: u32,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; IMPLEMENTATION_USE_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .u32(sequence_number)
            .bytes(&entity_id(b"*UDF LV Info", domain_suffix()))
            .bytes(&osta_charspec())
            .bytes(&dstring(&self.volume_identifier, 128))
            .bytes(&dstring("", 36)) // LV info 1
            .bytes(&dstring("", 36)) // LV info 2
            .bytes(&dstring("", 36)) // LV info 3
            .bytes(&self.implementation_id());
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::ImplementationUseVolumeDescriptor, location)
    }

    /// Writes the partition descriptor (3/10.5) of a read-only partition.
    pub fn write_vol_desc_partition<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        sequence_number: u32,
        location: u32,
        partition_start: u32,
        partition_length: u32,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; PARTITION_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .u32(sequence_number)
            .u16(1) // flags: space allocated
            .u16(0) // partition number
            .bytes(&entity_id(b"+NSR02", [0u8; 8]))
            .skip(128) // partition contents use: no space tables
            .u32(1) // access type: read only
            .u32(partition_start)
            .u32(partition_length)
            .bytes(&self.implementation_id());
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::PartitionDescriptor, location)
    }

    /// Writes the logical volume descriptor (3/10.6) with a single type 1 partition map.
    pub fn write_vol_desc_logical<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        sequence_number: u32,
        location: u32,
        integrity_sequence: ExtentAd,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; LOGICAL_VOLUME_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .u32(sequence_number)
            .bytes(&osta_charspec())
            .bytes(&dstring(&self.volume_identifier, 128))
            .u32(UDF_SECTOR_SIZE as u32) // logical block size
            .bytes(&entity_id(b"*OSTA UDF Compliant", domain_suffix()))
            .bytes(&long_ad(UDF_SECTOR_SIZE as u32, 0)) // file set descriptor
            .u32(6) // map table length
            .u32(1) // number of partition maps
            .bytes(&self.implementation_id())
            .skip(128) // implementation use
            .bytes(&integrity_sequence.encode())
            .u8(1) // partition map type
            .u8(6) // partition map length
            .u16(1) // volume sequence number
            .u16(0); // partition number
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::LogicalVolumeDescriptor, location)
    }

    /// Writes an unallocated space descriptor (3/10.8) listing no free extents.
    pub fn write_vol_desc_unalloc<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        sequence_number: u32,
        location: u32,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; UNALLOCATED_SPACE_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .u32(sequence_number)
            .u32(0); // number of allocation descriptors
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::UnallocatedSpaceDescriptor, location)
    }

    /// Writes the terminating descriptor (3/10.9) closing a volume descriptor sequence.
    pub fn write_vol_desc_term<W: Write>(&self, stream: &mut SectorStream<W>, location: u32) -> Result<(), io::Error> {
        let mut descriptor = [0u8; TERMINATING_DESCRIPTOR_LENGTH];
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::TerminatingDescriptor, location)
    }

    /// Writes the logical volume integrity descriptor (3/10.10) marking the volume as closed.
    pub fn write_vol_desc_log_integrity<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        file_count: u32,
        dir_count: u32,
        partition_length: u32,
        unique_ident: u64,
        recording_time: &Timestamp,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; LOGICAL_VOLUME_INTEGRITY_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .bytes(&recording_time.encode())
            .u32(1) // integrity type: close
            .skip(ExtentAd::LENGTH) // next integrity extent
            .u64(unique_ident) // logical volume header descriptor (4/14.15)
            .skip(24)
            .u32(1) // number of partitions
            .u32(46) // length of implementation use
            .u32(0) // free space table
            .u32(partition_length) // size table
            .bytes(&self.implementation_id())
            .u32(file_count)
            .u32(dir_count)
            .u16(UDF_REVISION) // minimum UDF read revision
            .u16(UDF_REVISION) // minimum UDF write revision
            .u16(UDF_REVISION); // maximum UDF write revision
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::LogicalVolumeIntegrityDescriptor, location)
    }

    /// Writes an anchor volume descriptor pointer (3/10.2).
    pub fn write_anchor_vol_desc_ptr<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        main_sequence: ExtentAd,
        reserve_sequence: ExtentAd,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; ANCHOR_VOLUME_DESCRIPTOR_POINTER_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .bytes(&main_sequence.encode())
            .bytes(&reserve_sequence.encode());
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::AnchorVolumeDescriptorPointer, location)
    }

    /// Writes the file set descriptor (4/14.1) pointing at the root directory's file entry.
    pub fn write_file_set_desc<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        root_location: u32,
        recording_time: &Timestamp,
    ) -> Result<(), io::Error> {
        let mut descriptor = [0u8; FILE_SET_DESCRIPTOR_LENGTH];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .bytes(&recording_time.encode())
            .u16(3) // interchange level
            .u16(3) // maximum interchange level
            .u32(1) // character set list
            .u32(1) // maximum character set list
            .u32(0) // file set number
            .u32(0) // file set descriptor number
            .bytes(&osta_charspec()) // logical volume identifier character set
            .bytes(&dstring(&self.volume_identifier, 128))
            .bytes(&osta_charspec()) // file set character set
            .bytes(&dstring(&self.volume_identifier, 32))
            .bytes(&dstring("", 32)) // copyright file identifier
            .bytes(&dstring("", 32)) // abstract file identifier
            .bytes(&long_ad(UDF_SECTOR_SIZE as u32, root_location))
            .bytes(&entity_id(b"*OSTA UDF Compliant", domain_suffix()));
        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::FileSetDescriptor, location)
    }

    /// Writes a file entry (4/14.9) padded to a whole sector.
    ///
    /// The data of `data_length` bytes starts at the partition-relative sector `data_location` and
    /// is described by as many short allocation descriptors as needed.
    pub fn write_file_entry<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        is_directory: bool,
        link_count: u16,
        unique_ident: u64,
        data_location: u32,
        data_length: u64,
        times: &FileTimes,
    ) -> Result<(), io::Error> {
        let entry_length = self.file_entry_size(data_length);
        if entry_length > UDF_SECTOR_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes of data need more allocation descriptors than fit into a file entry", data_length),
            ));
        }
        let descriptor_count = Self::allocation_descriptor_count(data_length);

        let (file_type, permissions) = if is_directory {
            (FILE_TYPE_DIRECTORY, PERMISSIONS_DIRECTORY)
        } else {
            (FILE_TYPE_BYTES, PERMISSIONS_FILE)
        };

        let mut descriptor = vec![0u8; entry_length as usize];
        let mut fields = FieldWriter::new(&mut descriptor, TAG_LENGTH);
        fields
            // ICB tag (4/14.6)
            .u32(0) // prior recorded number of direct entries
            .u16(4) // strategy type
            .u16(0) // strategy parameter
            .u16(1) // maximum number of entries
            .u8(0) // reserved
            .u8(file_type)
            .skip(6) // parent ICB location
            .u16(0) // flags: short allocation descriptors
            // file entry proper
            .u32(u32::MAX) // uid
            .u32(u32::MAX) // gid
            .u32(permissions)
            .u16(link_count)
            .u8(0) // record format
            .u8(0) // record display attributes
            .u32(0) // record length
            .u64(data_length) // information length
            .u64(bytes_to_sectors(data_length)) // logical blocks recorded
            .bytes(&times.access.encode())
            .bytes(&times.modify.encode())
            .bytes(&times.create.encode()) // attribute time
            .u32(1) // checkpoint
            .skip(16) // extended attribute ICB
            .bytes(&self.implementation_id())
            .u64(unique_ident)
            .u32(0) // length of extended attributes
            .u32((descriptor_count * SHORT_AD_LENGTH) as u32);

        let sectors_per_extent = (MAX_EXTENT_LENGTH / UDF_SECTOR_SIZE) as u32;
        let mut remaining = data_length;
        let mut position = data_location;
        for _ in 0..descriptor_count {
            let extent_length = remaining.min(MAX_EXTENT_LENGTH);
            fields.bytes(&short_ad(extent_length as u32, position));
            remaining -= extent_length;
            position = position.wrapping_add(sectors_per_extent);
        }

        self.write_sector_descriptor(stream, &mut descriptor, TagIdentifier::FileEntry, location)
    }

    /// Writes the file identifier descriptor (4/14.4) of a child named `name` whose file entry is
    /// at `entry_location`. The descriptor is not padded to a sector.
    pub fn write_file_ident<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        entry_location: u32,
        is_directory: bool,
        name: &str,
    ) -> Result<(), io::Error> {
        let identifier = encode_cs0(name, MAX_FILE_IDENT_LENGTH);
        let characteristics = if is_directory { FILE_CHARACTERISTIC_DIRECTORY } else { 0 };
        let length = self.file_ident_size(name) as usize;
        self.write_file_ident_common(stream, location, entry_location, characteristics, &identifier, length)
    }

    /// Writes the file identifier descriptor referring to the parent directory.
    pub fn write_file_ident_parent<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        parent_entry_location: u32,
    ) -> Result<(), io::Error> {
        let length = self.file_ident_parent_size() as usize;
        self.write_file_ident_common(
            stream,
            location,
            parent_entry_location,
            FILE_CHARACTERISTIC_DIRECTORY | FILE_CHARACTERISTIC_PARENT,
            &[],
            length,
        )
    }

    fn write_file_ident_common<W: Write>(
        &self,
        stream: &mut SectorStream<W>,
        location: u32,
        entry_location: u32,
        characteristics: u8,
        identifier: &[u8],
        length: usize,
    ) -> Result<(), io::Error> {
        let mut descriptor = vec![0u8; length];
        FieldWriter::new(&mut descriptor, TAG_LENGTH)
            .u16(1) // file version number
            .u8(characteristics)
            .u8(identifier.len() as u8)
            .bytes(&long_ad(UDF_SECTOR_SIZE as u32, entry_location))
            .u16(0) // length of implementation use
            .bytes(identifier);
        finish_tag(&mut descriptor, TagIdentifier::FileIdentifierDescriptor, location);
        stream.write_bytes(&descriptor)
    }
}
