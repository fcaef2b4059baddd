//! FAT32 boot sector and FSInfo
//!
//! The volume serial is rendered `%04X-%04X` (high half first) and free
//! space comes from the FSInfo sector after its three signatures check out.

use super::{corrupt, le_u16, le_u32, read_at, FilesystemInfo};
use crate::error::{Error, Result};
use std::io::{Read, Seek};

const MAGIC: &[u8; 8] = b"FAT32   ";
const OFF_MAGIC: usize = 0x52;
const OFF_SECTOR_SIZE: usize = 11;
const OFF_CLUSTER_SIZE: usize = 13;
const OFF_TOTAL_SECTORS: usize = 32;
const OFF_FSINFO_SECTOR: usize = 48;
const OFF_SERIAL: usize = 67;
const OFF_LABEL: usize = 71;

const FSINFO_LEAD: u32 = 0x4161_5252;
const FSINFO_STRUCT: u32 = 0x6141_7272;
const FSINFO_TRAIL: u32 = 0xAA55_0000;
const FREE_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Probe a FAT32 filesystem at `offset`
pub fn parse<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<FilesystemInfo> {
    let boot = read_at(reader, offset, 512)?;
    if &boot[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
        return Err(Error::FilesystemNotFound);
    }

    let sector_size = le_u16(&boot, OFF_SECTOR_SIZE);
    if !(512..=4096).contains(&sector_size) || !sector_size.is_power_of_two() {
        return Err(corrupt(
            offset + OFF_SECTOR_SIZE as u64,
            format!("sector size {sector_size}"),
        ));
    }
    let sector_size = u64::from(sector_size);
    let cluster_sectors = boot[OFF_CLUSTER_SIZE];
    if cluster_sectors == 0 || !cluster_sectors.is_power_of_two() {
        return Err(corrupt(
            offset + OFF_CLUSTER_SIZE as u64,
            format!("{cluster_sectors} sectors per cluster"),
        ));
    }
    let cluster_sectors = u64::from(cluster_sectors);
    let total_sectors = u64::from(le_u32(&boot, OFF_TOTAL_SECTORS));
    let fsinfo_sector = u64::from(le_u16(&boot, OFF_FSINFO_SECTOR));

    let serial = le_u32(&boot, OFF_SERIAL);
    let uuid = format!("{:04X}-{:04X}", serial >> 16, serial & 0xFFFF);
    let label = String::from_utf8_lossy(&boot[OFF_LABEL..OFF_LABEL + 11])
        .trim_end()
        .to_string();

    let fsinfo_offset = offset + fsinfo_sector * sector_size;
    let fsinfo = read_at(reader, fsinfo_offset, 512).map_err(|e| match e {
        Error::FilesystemNotFound => corrupt(fsinfo_offset, "FSInfo sector beyond device end"),
        other => other,
    })?;
    for (at, expected) in [(0usize, FSINFO_LEAD), (484, FSINFO_STRUCT), (508, FSINFO_TRAIL)] {
        let got = le_u32(&fsinfo, at);
        if got != expected {
            return Err(corrupt(
                fsinfo_offset + at as u64,
                format!("FSInfo signature {got:#010x}, expected {expected:#010x}"),
            ));
        }
    }

    let free_clusters = match le_u32(&fsinfo, 488) {
        FREE_UNKNOWN => 0,
        n => u64::from(n),
    };
    let total_capacity = total_sectors * sector_size;
    let free_capacity = free_clusters * cluster_sectors * sector_size;
    if free_capacity > total_capacity {
        return Err(corrupt(
            fsinfo_offset + 488,
            format!("{free_clusters} free clusters exceed {total_sectors} sectors"),
        ));
    }

    Ok(FilesystemInfo {
        fs_type: "vfat".to_string(),
        uuid,
        label,
        total_capacity,
        free_capacity,
        block_size: cluster_sectors * sector_size,
        inode_count: 0,
        free_inodes: 0,
    })
}
