//! Partition Table and Filesystem Probes
//!
//! Reads raw device bytes and recognizes GPT and MBR partition tables plus
//! XFS and FAT32 superblocks. Probes never write and never repair: an
//! unknown layout is [`Error::FilesystemNotFound`], a recognized but
//! inconsistent one is [`Error::Corrupt`] with the byte offset at fault.

pub mod fat32;
pub mod gpt;
pub mod mbr;
pub mod xfs;

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

// =============================================================================
// Types
// =============================================================================

/// Partition table flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTableKind {
    Gpt,
    /// Any of the MBR layouts
    Msdos,
}

impl std::fmt::Display for PartitionTableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionTableKind::Gpt => write!(f, "gpt"),
            PartitionTableKind::Msdos => write!(f, "dos"),
        }
    }
}

/// One entry of a partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// 1-based partition number
    pub number: u32,
    /// GPT type GUID, or `0xNN` for MBR type bytes
    pub type_uuid: String,
    /// GPT unique GUID, or `<disk-signature>-<NN>` for MBR
    pub part_uuid: String,
    pub start_lba: u64,
    pub end_lba: u64,
    pub logical_block_size: u64,
}

impl Partition {
    /// Byte offset of the partition on its parent device
    pub fn start_offset(&self) -> u64 {
        self.start_lba.saturating_mul(self.logical_block_size)
    }

    pub fn size_bytes(&self) -> u64 {
        self.end_lba
            .saturating_add(1)
            .saturating_sub(self.start_lba)
            .saturating_mul(self.logical_block_size)
    }
}

/// A parsed partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub kind: PartitionTableKind,
    pub uuid: String,
    pub partitions: Vec<Partition>,
}

/// Facts read from a filesystem superblock
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub fs_type: String,
    pub uuid: String,
    pub label: String,
    pub total_capacity: u64,
    pub free_capacity: u64,
    pub block_size: u64,
    pub inode_count: u64,
    pub free_inodes: u64,
}

// =============================================================================
// Helpers shared by the parsers
// =============================================================================

pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Error {
    Error::Corrupt {
        device: String::new(),
        offset,
        reason: reason.into(),
    }
}

/// Unwrap geometry arithmetic; an overflow means the field at `at` is corrupt
pub(crate) fn checked(value: Option<u64>, at: u64, what: &str) -> Result<u64> {
    value.ok_or_else(|| corrupt(at, format!("{what} overflows 64 bits")))
}

/// Name the device in a `Corrupt` error raised by a parser
fn on_device(err: Error, device: &str) -> Error {
    match err {
        Error::Corrupt { offset, reason, .. } => Error::Corrupt {
            device: device.to_string(),
            offset,
            reason,
        },
        other => other,
    }
}

pub(crate) fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

/// Read exactly `len` bytes at `offset`; a short device is "not found"
pub(crate) fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, len: usize) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::FilesystemNotFound),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Probe Entry Points
// =============================================================================

/// Detect a partition table: GPT first, then the MBR layouts
pub fn probe_partition_table<R: Read + Seek>(
    reader: &mut R,
    logical_block_size: u64,
) -> Result<PartitionTable> {
    match gpt::parse(reader, logical_block_size) {
        Err(Error::FilesystemNotFound) => mbr::parse(reader, logical_block_size),
        other => other,
    }
}

/// Detect a filesystem whose superblock starts at `offset`
pub fn probe_filesystem<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<FilesystemInfo> {
    match xfs::parse(reader, offset) {
        Err(Error::FilesystemNotFound) => {}
        other => return other,
    }
    fat32::parse(reader, offset)
}

/// Open `device` read-only and probe its partition table
pub fn probe_device_partitions(device: &Path, logical_block_size: u64) -> Result<PartitionTable> {
    let mut file = File::open(device)?;
    probe_partition_table(&mut file, logical_block_size)
        .map_err(|e| on_device(e, &device.display().to_string()))
}

/// Open `device` read-only and probe a filesystem at `offset`
pub fn probe_device_filesystem(device: &Path, offset: u64) -> Result<FilesystemInfo> {
    let mut file = File::open(device)?;
    probe_filesystem(&mut file, offset).map_err(|e| on_device(e, &device.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_blank_device_has_nothing() {
        let mut blank = Cursor::new(vec![0u8; 64 * 1024]);
        assert!(matches!(
            probe_partition_table(&mut blank, 512),
            Err(Error::FilesystemNotFound)
        ));
        assert!(matches!(
            probe_filesystem(&mut blank, 0),
            Err(Error::FilesystemNotFound)
        ));
    }

    #[test]
    fn test_short_device_is_not_found() {
        let mut tiny = Cursor::new(vec![0u8; 100]);
        assert!(matches!(
            probe_filesystem(&mut tiny, 0),
            Err(Error::FilesystemNotFound)
        ));
    }

    #[test]
    fn test_probe_device_names_device_in_corrupt_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut image = vec![0u8; 4096];
        image[0..4].copy_from_slice(b"XFSB");
        image[4..8].copy_from_slice(&1000u32.to_be_bytes());
        std::fs::write(&path, image).unwrap();

        match probe_device_filesystem(&path, 0) {
            Err(Error::Corrupt { device, offset, .. }) => {
                assert_eq!(device, path.display().to_string());
                assert_eq!(offset, 4);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_partition_geometry() {
        let p = Partition {
            number: 1,
            type_uuid: String::new(),
            part_uuid: String::new(),
            start_lba: 2048,
            end_lba: 4095,
            logical_block_size: 512,
        };
        assert_eq!(p.start_offset(), 1024 * 1024);
        assert_eq!(p.size_bytes(), 1024 * 1024);
    }
}
