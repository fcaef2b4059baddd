//! udev database records
//!
//! `/run/udev/data/b<major>:<minor>` holds one property per `E:KEY=VALUE`
//! line. Other line kinds (symlinks, tags) are ignored.

use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Properties udev recorded for one block device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdevData {
    props: BTreeMap<String, String>,
}

impl UdevData {
    pub fn parse(contents: &str) -> Self {
        let props = contents
            .lines()
            .filter_map(|l| l.strip_prefix("E:"))
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { props }
    }

    /// Read the record for `major:minor`; a missing file yields an empty record
    pub fn read(data_dir: &Path, major: u32, minor: u32) -> Result<Self> {
        let path = data_dir.join(format!("b{}:{}", major, minor));
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_map(props: BTreeMap<String, String>) -> Self {
        Self { props }
    }

    /// Non-empty value of `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.props
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_or_default(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    pub fn wwid(&self) -> String {
        self.get_or_default("ID_WWN")
    }

    pub fn model(&self) -> String {
        self.get_or_default("ID_MODEL")
    }

    pub fn serial(&self) -> String {
        self.get("ID_SERIAL_SHORT")
            .or_else(|| self.get("ID_SERIAL"))
            .unwrap_or_default()
            .to_string()
    }

    pub fn vendor(&self) -> String {
        self.get_or_default("ID_VENDOR")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RECORD: &str = "\
S:disk/by-id/wwn-0x5000c500a1b2c3d4
E:ID_WWN=0x5000c500a1b2c3d4
E:ID_MODEL=ST4000NM0035
E:ID_SERIAL_SHORT=ZC1234AB
E:ID_VENDOR=ATA
E:ID_FS_TYPE=xfs
E:ID_FS_UUID=0d4c1c2c-7e2b-4b69-9a5a-2b8f6f9a1e11
E:DM_NAME=
G:systemd
";

    #[test]
    fn test_parse_record() {
        let data = UdevData::parse(RECORD);
        assert_eq!(data.wwid(), "0x5000c500a1b2c3d4");
        assert_eq!(data.model(), "ST4000NM0035");
        assert_eq!(data.serial(), "ZC1234AB");
        assert_eq!(data.get("ID_FS_TYPE"), Some("xfs"));
        assert_eq!(data.get("DM_NAME"), None);
        assert_eq!(data.get("systemd"), None);
    }

    #[test]
    fn test_missing_record_is_empty() {
        let dir = TempDir::new().unwrap();
        let data = UdevData::read(dir.path(), 8, 16).unwrap();
        assert!(data.is_empty());

        std::fs::write(dir.path().join("b8:16"), RECORD).unwrap();
        let data = UdevData::read(dir.path(), 8, 16).unwrap();
        assert_eq!(data.vendor(), "ATA");
    }
}
