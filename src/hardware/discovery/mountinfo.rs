//! Mount table parsing
//!
//! Parses `/proc/<pid>/mountinfo`. Each line has the shape
//! `id parent major:minor root mount-point options [optional...] - fstype source super-options`.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One line of a mountinfo table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_id: u32,
    pub parent_id: u32,
    pub major: u32,
    pub minor: u32,
    /// Root of the mount within its filesystem
    pub root: String,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub optional_fields: Vec<String>,
    pub fs_type: String,
    pub source: String,
    pub super_options: Vec<String>,
}

impl MountInfo {
    pub fn is_read_only(&self) -> bool {
        self.mount_options.iter().any(|o| o == "ro")
    }
}

/// Undo the octal escaping the kernel applies to space, tab, newline and backslash
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let v = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(v) = u8::try_from(v) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn split_options(options: &str) -> Vec<String> {
    options
        .split(',')
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a single mountinfo line
pub fn parse_line(line: &str) -> Result<MountInfo> {
    let invalid = |reason: &str| Error::InvalidArgument(format!("mountinfo: {reason}: {line:?}"));

    let (head, tail) = line.split_once(" - ").ok_or_else(|| invalid("missing separator"))?;

    let head: Vec<&str> = head.split_whitespace().collect();
    if head.len() < 6 {
        return Err(invalid("too few fields"));
    }
    let tail: Vec<&str> = tail.split_whitespace().collect();
    if tail.len() < 2 {
        return Err(invalid("too few fields after separator"));
    }

    let (major, minor) = head[2]
        .split_once(':')
        .ok_or_else(|| invalid("bad major:minor"))?;

    Ok(MountInfo {
        mount_id: head[0].parse().map_err(|_| invalid("bad mount id"))?,
        parent_id: head[1].parse().map_err(|_| invalid("bad parent id"))?,
        major: major.parse().map_err(|_| invalid("bad major"))?,
        minor: minor.parse().map_err(|_| invalid("bad minor"))?,
        root: unescape(head[3]),
        mount_point: unescape(head[4]),
        mount_options: split_options(head[5]),
        optional_fields: head[6..].iter().map(|s| s.to_string()).collect(),
        fs_type: tail[0].to_string(),
        source: unescape(tail[1]),
        super_options: tail.get(2).map(|s| split_options(s)).unwrap_or_default(),
    })
}

/// Parse a full mountinfo table, skipping blank lines
pub fn parse(contents: &str) -> Result<Vec<MountInfo>> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_line)
        .collect()
}

/// Read and parse a mountinfo file
pub fn read(path: &Path) -> Result<Vec<MountInfo>> {
    parse(&fs::read_to_string(path)?)
}

/// Mount entries grouped by `(major, minor)`
pub fn by_device(mounts: &[MountInfo]) -> BTreeMap<(u32, u32), Vec<MountInfo>> {
    let mut map: BTreeMap<(u32, u32), Vec<MountInfo>> = BTreeMap::new();
    for m in mounts {
        map.entry((m.major, m.minor)).or_default().push(m.clone());
    }
    map
}
