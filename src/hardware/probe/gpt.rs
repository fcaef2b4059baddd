//! GUID Partition Table
//!
//! Header at LBA 1, entry array at the LBA the header names. Entry size
//! comes from the header; GUIDs are stored mixed-endian.

use super::{checked, corrupt, le_u32, le_u64, read_at, Partition, PartitionTable, PartitionTableKind};
use crate::error::{Error, Result};
use std::io::{Read, Seek, SeekFrom};
use uuid::Uuid;

const SIGNATURE: &[u8; 8] = b"EFI PART";
const MIN_HEADER_SIZE: u32 = 92;
const MIN_ENTRY_SIZE: u32 = 128;
const MAX_ENTRY_SIZE: u32 = 4096;
const MAX_ENTRIES: u32 = 16384;

/// Canonical uppercase form of a mixed-endian on-disk GUID
pub fn guid_to_string(raw: &[u8]) -> String {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw[..16]);
    format!("{:X}", Uuid::from_bytes_le(bytes).hyphenated())
}

/// On-disk bytes of a canonical GUID string
pub fn guid_to_bytes(guid: &str) -> Result<[u8; 16]> {
    let uuid = Uuid::parse_str(guid)
        .map_err(|e| Error::InvalidArgument(format!("invalid GUID {guid}: {e}")))?;
    Ok(uuid.to_bytes_le())
}

/// Well-known partition type names
pub fn type_name(type_uuid: &str) -> Option<&'static str> {
    match type_uuid {
        "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7" => Some("Basic data partition"),
        "0FC63DAF-8483-4772-8E79-3D69D8477DE4" => Some("Linux filesystem"),
        "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F" => Some("Linux swap"),
        "E6D6D379-F507-44C2-A23C-238F2A3DF928" => Some("Linux LVM"),
        "A19D880F-05FC-4D3B-A006-743F0F84911E" => Some("Linux RAID"),
        "C12A7328-F81F-11D2-BA4B-00A0C93EC93B" => Some("EFI System"),
        "21686148-6449-6E6F-744E-656564454649" => Some("BIOS boot"),
        "E3C9E316-0B5C-4DB8-817D-F92DF00215AE" => Some("Microsoft reserved"),
        _ => None,
    }
}

/// Parse a GPT; `FilesystemNotFound` when LBA 1 carries no signature
pub fn parse<R: Read + Seek>(reader: &mut R, logical_block_size: u64) -> Result<PartitionTable> {
    let base = logical_block_size;
    let header = read_at(reader, base, MIN_HEADER_SIZE as usize)?;
    if &header[0..8] != SIGNATURE {
        return Err(Error::FilesystemNotFound);
    }

    let header_size = le_u32(&header, 12);
    if header_size < MIN_HEADER_SIZE || u64::from(header_size) > logical_block_size {
        return Err(corrupt(base + 12, format!("header size {header_size}")));
    }

    let table_uuid = guid_to_string(&header[56..72]);
    let entry_lba = le_u64(&header, 72);
    let num_entries = le_u32(&header, 80);
    let entry_size = le_u32(&header, 84);

    if entry_lba < 2 {
        return Err(corrupt(base + 72, format!("entry array at LBA {entry_lba}")));
    }
    if num_entries > MAX_ENTRIES {
        return Err(corrupt(base + 80, format!("{num_entries} entries")));
    }
    if !(MIN_ENTRY_SIZE..=MAX_ENTRY_SIZE).contains(&entry_size) || entry_size % 8 != 0 {
        return Err(corrupt(base + 84, format!("entry size {entry_size}")));
    }

    let array_offset = checked(
        entry_lba.checked_mul(logical_block_size),
        base + 72,
        "entry array offset",
    )?;
    let array_end = checked(
        array_offset.checked_add(u64::from(num_entries) * u64::from(entry_size)),
        base + 72,
        "entry array end",
    )?;
    let device_len = reader.seek(SeekFrom::End(0))?;
    if array_end > device_len {
        return Err(corrupt(
            base + 72,
            format!("entry array ends at byte {array_end}, past device end {device_len}"),
        ));
    }
    let mut partitions = Vec::new();
    for i in 0..num_entries {
        let offset = array_offset + u64::from(i) * u64::from(entry_size);
        let entry = read_at(reader, offset, entry_size as usize)?;
        if entry[0..16].iter().all(|b| *b == 0) {
            break;
        }

        let start_lba = le_u64(&entry, 32);
        let end_lba = le_u64(&entry, 40);
        if end_lba < start_lba {
            return Err(corrupt(
                offset + 40,
                format!("partition {} ends at {end_lba} before start {start_lba}", i + 1),
            ));
        }
        checked(
            end_lba
                .checked_add(1)
                .and_then(|n| n.checked_mul(logical_block_size)),
            offset + 40,
            "partition end",
        )?;

        partitions.push(Partition {
            number: i + 1,
            type_uuid: guid_to_string(&entry[0..16]),
            part_uuid: guid_to_string(&entry[16..32]),
            start_lba,
            end_lba,
            logical_block_size,
        });
    }

    Ok(PartitionTable {
        kind: PartitionTableKind::Gpt,
        uuid: table_uuid,
        partitions,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) const BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";
    const DISK_GUID: &str = "5B1F0C2E-3D4A-4C5B-9E6F-7A8B9C0D1E2F";
    const PART_GUID: &str = "A1B2C3D4-E5F6-4711-8899-AABBCCDDEEFF";

    /// Disk image with a GPT holding the given `(type, guid, start, end)` entries
    pub(crate) fn gpt_image(entries: &[(&str, &str, u64, u64)]) -> Vec<u8> {
        let mut image = vec![0u8; 64 * 1024];
        let header = 512;
        image[header..header + 8].copy_from_slice(SIGNATURE);
        image[header + 8..header + 12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        image[header + 12..header + 16].copy_from_slice(&92u32.to_le_bytes());
        image[header + 56..header + 72].copy_from_slice(&guid_to_bytes(DISK_GUID).unwrap());
        image[header + 72..header + 80].copy_from_slice(&2u64.to_le_bytes());
        image[header + 80..header + 84].copy_from_slice(&128u32.to_le_bytes());
        image[header + 84..header + 88].copy_from_slice(&128u32.to_le_bytes());

        for (i, (type_guid, guid, start, end)) in entries.iter().enumerate() {
            let at = 1024 + i * 128;
            image[at..at + 16].copy_from_slice(&guid_to_bytes(type_guid).unwrap());
            image[at + 16..at + 32].copy_from_slice(&guid_to_bytes(guid).unwrap());
            image[at + 32..at + 40].copy_from_slice(&start.to_le_bytes());
            image[at + 40..at + 48].copy_from_slice(&end.to_le_bytes());
        }
        image
    }

    #[test]
    fn test_gpt_single_basic_data_partition() {
        let image = gpt_image(&[(BASIC_DATA, PART_GUID, 2048, 4095)]);
        let table = parse(&mut Cursor::new(image), 512).unwrap();

        assert_eq!(table.kind, PartitionTableKind::Gpt);
        assert_eq!(table.uuid, DISK_GUID);
        assert_eq!(table.partitions.len(), 1);

        let p = &table.partitions[0];
        assert_eq!(p.number, 1);
        assert_eq!(p.type_uuid, BASIC_DATA);
        assert_eq!(p.part_uuid, PART_GUID);
        assert_eq!(p.start_lba, 2048);
        assert_eq!(p.end_lba, 4095);
        assert_eq!(type_name(&p.type_uuid), Some("Basic data partition"));
    }

    #[test]
    fn test_guid_is_mixed_endian_on_disk() {
        let raw = guid_to_bytes(BASIC_DATA).unwrap();
        assert_eq!(&raw[0..4], &[0xA2, 0xA0, 0xD0, 0xEB]);
        assert_eq!(&raw[8..10], &[0x87, 0xC0]);
        assert_eq!(guid_to_string(&raw), BASIC_DATA);
    }

    #[test]
    fn test_gpt_entries_round_trip() {
        let entries = [
            (BASIC_DATA, PART_GUID, 2048u64, 4095u64),
            (
                "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
                "00112233-4455-6677-8899-AABBCCDDEEFF",
                4096,
                65535,
            ),
        ];
        let table = parse(&mut Cursor::new(gpt_image(&entries)), 512).unwrap();
        let parsed: Vec<_> = table
            .partitions
            .iter()
            .map(|p| (p.type_uuid.as_str(), p.part_uuid.as_str(), p.start_lba, p.end_lba))
            .collect();
        assert_eq!(parsed, entries.to_vec());
    }

    #[test]
    fn test_gpt_rejects_bad_entry_size() {
        let mut image = gpt_image(&[(BASIC_DATA, PART_GUID, 2048, 4095)]);
        image[512 + 84..512 + 88].copy_from_slice(&100u32.to_le_bytes());
        match parse(&mut Cursor::new(image), 512) {
            Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, 512 + 84),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_gpt_entry_array_beyond_addressable_range_is_corrupt() {
        let mut image = gpt_image(&[(BASIC_DATA, PART_GUID, 2048, 4095)]);
        image[512 + 72..512 + 80].copy_from_slice(&(u64::MAX / 4).to_le_bytes());
        match parse(&mut Cursor::new(image), 512) {
            Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, 512 + 72),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_gpt_partition_end_beyond_addressable_range_is_corrupt() {
        let image = gpt_image(&[(BASIC_DATA, PART_GUID, 2048, u64::MAX)]);
        match parse(&mut Cursor::new(image), 512) {
            Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, 1024 + 40),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_gpt_entry_array_past_device_end_is_corrupt() {
        let mut image = gpt_image(&[(BASIC_DATA, PART_GUID, 2048, 4095)]);
        image.truncate(1024 + 64);
        match parse(&mut Cursor::new(image), 512) {
            Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, 512 + 72),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut image = gpt_image(&[(BASIC_DATA, PART_GUID, 2048, 4095)]);
        image[512 + 72..512 + 80].copy_from_slice(&1_000_000u64.to_le_bytes());
        match parse(&mut Cursor::new(image), 512) {
            Err(Error::Corrupt { offset, .. }) => assert_eq!(offset, 512 + 72),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_no_signature_is_not_found() {
        let image = vec![0u8; 4096];
        assert!(matches!(
            parse(&mut Cursor::new(image), 512),
            Err(Error::FilesystemNotFound)
        ));
    }
}
