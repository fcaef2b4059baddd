//! XFS superblock
//!
//! Big-endian, at byte 0 of the filesystem. Only the leading fields are
//! read: geometry, UUID, label and the inode/free-block counters.

use super::{be_u32, be_u64, checked, corrupt, read_at, FilesystemInfo};
use crate::error::{Error, Result};
use std::io::{Read, Seek};
use uuid::Uuid;

pub const MAGIC: u32 = 0x5846_5342;

/// Bytes of superblock read; covers everything up to `sb_fdblocks`
pub const SUPERBLOCK_LEN: usize = 152;

const OFF_BLOCKSIZE: usize = 4;
const OFF_DBLOCKS: usize = 8;
const OFF_UUID: usize = 32;
const OFF_FNAME: usize = 108;
const OFF_ICOUNT: usize = 128;
const OFF_IFREE: usize = 136;
const OFF_FDBLOCKS: usize = 144;

/// Decode a superblock buffer; `base` is its device offset for error reporting
pub fn decode(sb: &[u8], base: u64) -> Result<FilesystemInfo> {
    if sb.len() < SUPERBLOCK_LEN || be_u32(sb, 0) != MAGIC {
        return Err(Error::FilesystemNotFound);
    }

    let block_size = be_u32(sb, OFF_BLOCKSIZE);
    if !(512..=65536).contains(&block_size) || !block_size.is_power_of_two() {
        return Err(corrupt(
            base + OFF_BLOCKSIZE as u64,
            format!("block size {block_size}"),
        ));
    }

    let dblocks = be_u64(sb, OFF_DBLOCKS);
    if dblocks == 0 {
        return Err(corrupt(base + OFF_DBLOCKS as u64, "zero data blocks"));
    }

    let fdblocks = be_u64(sb, OFF_FDBLOCKS);
    if fdblocks > dblocks {
        return Err(corrupt(
            base + OFF_FDBLOCKS as u64,
            format!("{fdblocks} free of {dblocks} blocks"),
        ));
    }

    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&sb[OFF_UUID..OFF_UUID + 16]);

    let label: String = String::from_utf8_lossy(&sb[OFF_FNAME..OFF_FNAME + 12])
        .trim_end_matches('\0')
        .to_string();

    let block_size = u64::from(block_size);
    let total_capacity = checked(
        dblocks.checked_mul(block_size),
        base + OFF_DBLOCKS as u64,
        "filesystem size",
    )?;
    Ok(FilesystemInfo {
        fs_type: "xfs".to_string(),
        uuid: Uuid::from_bytes(uuid).to_string(),
        label,
        total_capacity,
        free_capacity: fdblocks * block_size,
        block_size,
        inode_count: be_u64(sb, OFF_ICOUNT),
        free_inodes: be_u64(sb, OFF_IFREE),
    })
}

/// Probe an XFS superblock at `offset`
pub fn parse<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<FilesystemInfo> {
    let sb = read_at(reader, offset, SUPERBLOCK_LEN)?;
    decode(&sb, offset)
}

/// Encode the probed fields of a superblock; the remaining bytes stay zero
pub fn encode(uuid: &str, block_size: u32, dblocks: u64, fdblocks: u64, label: &str) -> Result<Vec<u8>> {
    let uuid = Uuid::parse_str(uuid)
        .map_err(|e| Error::InvalidArgument(format!("invalid filesystem UUID {uuid}: {e}")))?;

    let mut sb = vec![0u8; 512];
    sb[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    sb[OFF_BLOCKSIZE..OFF_BLOCKSIZE + 4].copy_from_slice(&block_size.to_be_bytes());
    sb[OFF_DBLOCKS..OFF_DBLOCKS + 8].copy_from_slice(&dblocks.to_be_bytes());
    sb[OFF_UUID..OFF_UUID + 16].copy_from_slice(uuid.as_bytes());
    let name = label.as_bytes();
    let n = name.len().min(12);
    sb[OFF_FNAME..OFF_FNAME + n].copy_from_slice(&name[..n]);
    sb[OFF_FDBLOCKS..OFF_FDBLOCKS + 8].copy_from_slice(&fdblocks.to_be_bytes());
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const FS_UUID: &str = "0d4c1c2c-7e2b-4b69-9a5a-2b8f6f9a1e11";

    #[test]
    fn test_decode_superblock() {
        let mut sb = encode(FS_UUID, 4096, 262_144, 200_000, "DIRECTPV").unwrap();
        sb[OFF_ICOUNT..OFF_ICOUNT + 8].copy_from_slice(&64u64.to_be_bytes());
        sb[OFF_IFREE..OFF_IFREE + 8].copy_from_slice(&61u64.to_be_bytes());

        let info = decode(&sb, 0).unwrap();
        assert_eq!(info.fs_type, "xfs");
        assert_eq!(info.uuid, FS_UUID);
        assert_eq!(info.label, "DIRECTPV");
        assert_eq!(info.block_size, 4096);
        assert_eq!(info.total_capacity, 1024 * 1024 * 1024);
        assert_eq!(info.free_capacity, 200_000 * 4096);
        assert_eq!(info.inode_count, 64);
        assert_eq!(info.free_inodes, 61);
    }

    #[test]
    fn test_parse_at_partition_offset() {
        let mut image = vec![0u8; 2 * 1024 * 1024];
        let sb = encode(FS_UUID, 4096, 1000, 10, "").unwrap();
        image[1024 * 1024..1024 * 1024 + sb.len()].copy_from_slice(&sb);

        let info = parse(&mut Cursor::new(image), 1024 * 1024).unwrap();
        assert_eq!(info.uuid, FS_UUID);
        assert_eq!(info.label, "");
    }

    #[test]
    fn test_free_above_total_is_corrupt() {
        let sb = encode(FS_UUID, 4096, 10, 11, "").unwrap();
        assert!(matches!(
            decode(&sb, 4096),
            Err(Error::Corrupt { offset, .. }) if offset == 4096 + 144
        ));
    }

    #[test]
    fn test_size_beyond_addressable_range_is_corrupt() {
        let sb = encode(FS_UUID, 4096, u64::MAX / 2, 0, "").unwrap();
        assert!(matches!(
            decode(&sb, 0),
            Err(Error::Corrupt { offset, .. }) if offset == OFF_DBLOCKS as u64
        ));
    }

    #[test]
    fn test_truncated_superblock_is_not_found() {
        let sb = encode(FS_UUID, 4096, 10, 1, "").unwrap();
        assert!(matches!(decode(&sb[..100], 0), Err(Error::FilesystemNotFound)));
        assert!(matches!(
            parse(&mut Cursor::new(sb[..100].to_vec()), 0),
            Err(Error::FilesystemNotFound)
        ));
    }

    #[test]
    fn test_wrong_magic_is_not_found() {
        let mut sb = encode(FS_UUID, 4096, 10, 1, "").unwrap();
        sb[0] = b'Y';
        assert!(matches!(decode(&sb, 0), Err(Error::FilesystemNotFound)));
    }
}
