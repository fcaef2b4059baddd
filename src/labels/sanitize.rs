//! Name and Label Sanitizers
//!
//! Every orchestrator-visible resource name and label value passes through
//! these functions before being persisted.

use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Maximum length of a resource name
pub const MAX_RESOURCE_NAME_LEN: usize = 253;

/// Maximum length of a label value
pub const MAX_LABEL_VALUE_LEN: usize = 63;

// =============================================================================
// Resource Names
// =============================================================================

/// Sanitize an arbitrary string into a valid resource name.
///
/// Lowercases the input, maps every character outside `[a-z0-9-]` to `-`,
/// truncates to 253 characters, and if the result ends with `-` replaces the
/// tail with a digit derived from the original input so that names differing
/// only in trailing punctuation stay distinct.
pub fn sanitize_resource_name(name: &str) -> String {
    let mut sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            _ => '-',
        })
        .collect();

    // Byte-indexing is safe: every char is ASCII at this point.
    sanitized.truncate(MAX_RESOURCE_NAME_LEN);

    if sanitized.ends_with('-') {
        if sanitized.len() == MAX_RESOURCE_NAME_LEN {
            sanitized.pop();
        }
        sanitized.push(distinguishing_digit(name));
    }

    sanitized
}

fn distinguishing_digit(input: &str) -> char {
    let sum: u32 = input.bytes().map(u32::from).sum();
    char::from(b'0' + (sum % 10) as u8)
}

// =============================================================================
// Label Values
// =============================================================================

/// Check whether `value` is already a valid label value
pub fn is_valid_label_value(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    if value.len() > MAX_LABEL_VALUE_LEN {
        return false;
    }
    let bytes = value.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Rewrite `value` into a valid label value.
///
/// Valid values are returned unchanged. Otherwise the value is truncated to
/// 63 characters; non-conforming characters become `-`, and a non-alphanumeric
/// first or last character becomes `x`.
pub fn sanitize_label_value(value: &str) -> String {
    if is_valid_label_value(value) {
        return value.to_string();
    }

    let chars: Vec<char> = value.chars().take(MAX_LABEL_VALUE_LEN).collect();
    let last = chars.len().saturating_sub(1);
    let result: String = chars
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            if c.is_ascii_alphanumeric() {
                c
            } else if i == 0 || i == last {
                'x'
            } else if matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    debug!(original = %value, sanitized = %result, "label value rewritten");
    result
}

/// Sanitize a device path for use as a label value (`/dev/sdb` -> `sdb`)
pub fn sanitize_drive_path(path: &str) -> String {
    sanitize_label_value(path.trim_start_matches("/dev/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name_lowercases_and_replaces() {
        assert_eq!(sanitize_resource_name("Node1.example.com"), "node1-example-com");
        assert_eq!(sanitize_resource_name("abc_DEF 12"), "abc-def-12");
        assert_eq!(sanitize_resource_name("already-valid-0"), "already-valid-0");
    }

    #[test]
    fn test_resource_name_trailing_dash_gets_digit() {
        let name = sanitize_resource_name("node1.");
        assert!(name.starts_with("node1-"));
        assert!(name.chars().last().unwrap().is_ascii_digit());
        assert_eq!(name.len(), "node1-".len() + 1);

        // Deterministic for the same input
        assert_eq!(name, sanitize_resource_name("node1."));
    }

    #[test]
    fn test_resource_name_truncated() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_resource_name(&long).len(), MAX_RESOURCE_NAME_LEN);

        let mut tail_dash = "b".repeat(252);
        tail_dash.push('.');
        tail_dash.push_str("ccc");
        let name = sanitize_resource_name(&tail_dash);
        assert_eq!(name.len(), MAX_RESOURCE_NAME_LEN);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_label_value_validity() {
        assert!(is_valid_label_value(""));
        assert!(is_valid_label_value("sdb"));
        assert!(is_valid_label_value("node-1.rack_2"));
        assert!(!is_valid_label_value("-sdb"));
        assert!(!is_valid_label_value("sdb."));
        assert!(!is_valid_label_value("a/b"));
        assert!(!is_valid_label_value(&"x".repeat(64)));
    }

    #[test]
    fn test_label_value_rewrites() {
        assert_eq!(sanitize_label_value("sdb"), "sdb");
        assert_eq!(sanitize_label_value("/dev/sdb"), "xdev-sdb");
        assert_eq!(sanitize_label_value("nvme0n1p1."), "nvme0n1p1x");
        assert_eq!(sanitize_label_value("a b.c"), "a-b.c");
        assert_eq!(sanitize_label_value("_x_"), "xxx");

        let long = format!("{}!", "y".repeat(70));
        let rewritten = sanitize_label_value(&long);
        assert_eq!(rewritten.len(), MAX_LABEL_VALUE_LEN);
        assert!(is_valid_label_value(&rewritten));
    }

    #[test]
    fn test_label_value_rewrite_is_valid() {
        for input in ["..", "-", "a..b", "__init__", "host:8080", "ÄÖÜ", "x y z "] {
            let out = sanitize_label_value(input);
            assert!(is_valid_label_value(&out), "{input:?} -> {out:?}");
        }
    }

    #[test]
    fn test_sanitize_drive_path() {
        assert_eq!(sanitize_drive_path("/dev/sdb"), "sdb");
        assert_eq!(sanitize_drive_path("/dev/mapper/vg-lv"), "mapper-vg-lv");
    }
}
