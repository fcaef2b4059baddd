//! Master Boot Record layouts
//!
//! Sector 0 ends in `55 AA`. The layouts are told apart by:
//! - MS-DOS: `0xA55A` at 380, eight entries from 382
//! - AAP: `0x5678` at 428, four entries from 446
//! - Modern standard: two zero bytes at 218, four entries from 446
//! - Classic: four entries from 446
//!
//! One level of extended partition is followed; its logical partitions are
//! numbered from 5.

use super::{corrupt, le_u16, le_u32, read_at, Partition, PartitionTable, PartitionTableKind};
use crate::error::{Error, Result};
use std::io::{Read, Seek};

const SECTOR: u64 = 512;
const ENTRY_SIZE: usize = 16;
const PROTECTIVE_GPT: u8 = 0xEE;
const EXTENDED_TYPES: [u8; 6] = [0x05, 0x0F, 0x85, 0xC5, 0xCF, 0xD5];

/// Which MBR layout a sector carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    MsDos,
    Aap,
    Modern,
    Classic,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    partition_type: u8,
    first_lba: u32,
    num_sectors: u32,
}

fn entries_at(sector: &[u8], start: usize, count: usize) -> Vec<Entry> {
    (0..count)
        .map(|i| {
            let at = start + i * ENTRY_SIZE;
            Entry {
                partition_type: sector[at + 4],
                first_lba: le_u32(sector, at + 8),
                num_sectors: le_u32(sector, at + 12),
            }
        })
        .collect()
}

/// Detect the layout of a 512-byte sector
pub fn detect(sector: &[u8]) -> Option<Layout> {
    if sector.len() < SECTOR as usize || sector[510] != 0x55 || sector[511] != 0xAA {
        return None;
    }
    if le_u16(sector, 380) == 0xA55A {
        Some(Layout::MsDos)
    } else if le_u16(sector, 428) == 0x5678 {
        Some(Layout::Aap)
    } else if le_u16(sector, 218) == 0 {
        Some(Layout::Modern)
    } else {
        Some(Layout::Classic)
    }
}

fn layout_entries(sector: &[u8], layout: Layout) -> Vec<Entry> {
    match layout {
        Layout::MsDos => entries_at(sector, 382, 8),
        Layout::Aap | Layout::Modern | Layout::Classic => entries_at(sector, 446, 4),
    }
}

/// Parse an MBR at sector 0; `FilesystemNotFound` without a boot signature
pub fn parse<R: Read + Seek>(reader: &mut R, logical_block_size: u64) -> Result<PartitionTable> {
    let sector = read_at(reader, 0, SECTOR as usize)?;
    let layout = detect(&sector).ok_or(Error::FilesystemNotFound)?;
    let entries = layout_entries(&sector, layout);

    if layout == Layout::Modern && entries[0].partition_type == PROTECTIVE_GPT {
        return Err(corrupt(
            446 + 4,
            "protective MBR present but GPT header is missing",
        ));
    }

    let disk_signature = le_u32(&sector, 440);
    let part_uuid = |number: u32| format!("{:08x}-{:02}", disk_signature, number);
    let block = if logical_block_size == 0 { SECTOR } else { logical_block_size };

    let mut partitions = Vec::new();
    let mut push = |number: u32, entry: &Entry, base_lba: u64| {
        if entry.partition_type == 0 {
            return;
        }
        let start_lba = base_lba + u64::from(entry.first_lba);
        partitions.push(Partition {
            number,
            type_uuid: format!("0x{:02x}", entry.partition_type),
            part_uuid: part_uuid(number),
            start_lba,
            end_lba: (start_lba + u64::from(entry.num_sectors)).saturating_sub(1),
            logical_block_size: block,
        });
    };

    for (i, entry) in entries.iter().enumerate() {
        let number = i as u32 + 1;
        push(number, entry, 0);

        if !EXTENDED_TYPES.contains(&entry.partition_type) {
            continue;
        }

        let ebr_offset = u64::from(entry.first_lba) * block;
        let ebr = match read_at(reader, ebr_offset, SECTOR as usize) {
            Ok(ebr) => ebr,
            Err(Error::FilesystemNotFound) => {
                return Err(corrupt(ebr_offset, "extended partition beyond device end"))
            }
            Err(e) => return Err(e),
        };
        if detect(&ebr).is_none() {
            return Err(corrupt(ebr_offset + 510, "extended boot record lacks signature"));
        }
        for (j, logical) in entries_at(&ebr, 446, 4).iter().enumerate() {
            push(j as u32 + 5, logical, u64::from(entry.first_lba));
        }
    }

    let uuid = if disk_signature == 0 {
        String::new()
    } else {
        format!("{:08x}", disk_signature)
    };

    Ok(PartitionTable {
        kind: PartitionTableKind::Msdos,
        uuid,
        partitions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_entry(sector: &mut [u8], at: usize, ptype: u8, first: u32, count: u32) {
        sector[at + 4] = ptype;
        sector[at + 8..at + 12].copy_from_slice(&first.to_le_bytes());
        sector[at + 12..at + 16].copy_from_slice(&count.to_le_bytes());
    }

    fn classic_image() -> Vec<u8> {
        let mut image = vec![0u8; 8 * 1024 * 1024];
        image[218] = 0x01; // not "modern"
        image[440..444].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        write_entry(&mut image, 446, 0x83, 2048, 2048);
        write_entry(&mut image, 462, 0x82, 4096, 1024);
        image[510] = 0x55;
        image[511] = 0xAA;
        image
    }

    #[test]
    fn test_classic_mbr_primary_entries() {
        let image = classic_image();
        assert_eq!(detect(&image[..512]), Some(Layout::Classic));

        let table = parse(&mut Cursor::new(image), 512).unwrap();
        assert_eq!(table.kind, PartitionTableKind::Msdos);
        assert_eq!(table.uuid, "deadbeef");
        assert_eq!(table.partitions.len(), 2);
        assert_eq!(table.partitions[0].type_uuid, "0x83");
        assert_eq!(table.partitions[0].part_uuid, "deadbeef-01");
        assert_eq!(table.partitions[0].start_lba, 2048);
        assert_eq!(table.partitions[0].end_lba, 4095);
        assert_eq!(table.partitions[1].number, 2);
    }

    #[test]
    fn test_layout_detection() {
        let mut sector = vec![0u8; 512];
        assert_eq!(detect(&sector), None);

        sector[510] = 0x55;
        sector[511] = 0xAA;
        assert_eq!(detect(&sector), Some(Layout::Modern));

        sector[428..430].copy_from_slice(&0x5678u16.to_le_bytes());
        assert_eq!(detect(&sector), Some(Layout::Aap));

        sector[380..382].copy_from_slice(&0xA55Au16.to_le_bytes());
        assert_eq!(detect(&sector), Some(Layout::MsDos));
    }

    #[test]
    fn test_extended_partition_logicals() {
        let mut image = classic_image();
        write_entry(&mut image, 478, 0x05, 8192, 4096);
        let ebr = 8192 * 512;
        write_entry(&mut image, ebr + 446, 0x83, 63, 1000);
        image[ebr + 510] = 0x55;
        image[ebr + 511] = 0xAA;

        let table = parse(&mut Cursor::new(image), 512).unwrap();
        let logical = table.partitions.iter().find(|p| p.number == 5).unwrap();
        assert_eq!(logical.start_lba, 8192 + 63);
        assert_eq!(logical.end_lba, 8192 + 63 + 999);
    }

    #[test]
    fn test_protective_mbr_without_gpt_is_corrupt() {
        let mut image = vec![0u8; 4096];
        write_entry(&mut image, 446, 0xEE, 1, 0xFFFF_FFFF);
        image[510] = 0x55;
        image[511] = 0xAA;
        assert!(matches!(
            parse(&mut Cursor::new(image), 512),
            Err(Error::Corrupt { offset: 450, .. })
        ));
    }
}
