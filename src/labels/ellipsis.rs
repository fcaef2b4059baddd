//! Ellipsis expansion
//!
//! Expands patterns like `sd{a...d}` or `node{1...3}-disk{0...1}` into the
//! full list of literal values. Alphabetic ranges count in bijective base 26
//! (`z` is followed by `aa`), numeric ranges in decimal.

use crate::error::{Error, Result};

/// One `{start...end}` range within a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
struct Range {
    start: u64,
    end: u64,
    alpha: bool,
    /// Byte offsets of `{` and one past `}`
    span: (usize, usize),
}

impl Range {
    fn render(&self, value: u64) -> String {
        if self.alpha {
            int_to_alpha(value)
        } else {
            value.to_string()
        }
    }
}

fn alpha_to_int(value: &str) -> u64 {
    value
        .bytes()
        .fold(0u64, |acc, b| acc.saturating_mul(26).saturating_add(u64::from(b - b'a' + 1)))
}

fn int_to_alpha(mut value: u64) -> String {
    let mut out = Vec::new();
    while value > 0 {
        let rem = (value - 1) % 26;
        out.push(b'a' + rem as u8);
        value = (value - 1) / 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_bound(pattern: &str, token: &str) -> Result<(u64, bool)> {
    if let Ok(n) = token.parse::<u64>() {
        return Ok((n, false));
    }
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_lowercase()) {
        return Ok((alpha_to_int(token), true));
    }
    Err(Error::InvalidArgument(format!(
        "{pattern}: invalid ellipsis bound '{token}'"
    )))
}

fn parse_range(pattern: &str, open: usize, close: usize) -> Result<Range> {
    let body = &pattern[open + 1..close];
    let tokens: Vec<&str> = body.split("...").collect();
    if tokens.len() != 2 {
        return Err(Error::InvalidArgument(format!(
            "{pattern}: invalid ellipsis {{{body}}} at {open}"
        )));
    }

    let (mut start, start_alpha) = parse_bound(pattern, tokens[0])?;
    let (mut end, end_alpha) = parse_bound(pattern, tokens[1])?;
    if start_alpha != end_alpha {
        return Err(Error::InvalidArgument(format!(
            "{pattern}: ellipsis {{{body}}} mixes alphabetic and numeric bounds"
        )));
    }
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }

    Ok(Range {
        start,
        end,
        alpha: start_alpha,
        span: (open, close + 1),
    })
}

fn find_ranges(pattern: &str) -> Result<Vec<Range>> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;

    for (i, c) in pattern.char_indices() {
        match c {
            '{' => {
                if open.is_some() {
                    return Err(Error::InvalidArgument(format!(
                        "{pattern}: nested ellipsis at {}",
                        i + 1
                    )));
                }
                open = Some(i);
            }
            '}' => {
                let start = open.take().ok_or_else(|| {
                    Error::InvalidArgument(format!("{pattern}: unmatched '}}' at {}", i + 1))
                })?;
                ranges.push(parse_range(pattern, start, i)?);
            }
            _ => {}
        }
    }

    if let Some(start) = open {
        return Err(Error::InvalidArgument(format!(
            "{pattern}: unterminated ellipsis at {}",
            start + 1
        )));
    }

    Ok(ranges)
}

/// Whether `pattern` contains an ellipsis range
pub fn has_ellipsis(pattern: &str) -> bool {
    pattern.contains('{') || pattern.contains('}')
}

/// Expand every ellipsis range in `pattern` as a cartesian product, left
/// range varying slowest. A pattern without ranges expands to itself.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    let ranges = find_ranges(pattern)?;
    if ranges.is_empty() {
        return Ok(vec![pattern.to_string()]);
    }

    let mut results = vec![String::new()];
    let mut cursor = 0;
    for range in &ranges {
        let literal = &pattern[cursor..range.span.0];
        let mut next = Vec::with_capacity(results.len() * (range.end - range.start + 1) as usize);
        for prefix in &results {
            for value in range.start..=range.end {
                next.push(format!("{prefix}{literal}{}", range.render(value)));
            }
        }
        results = next;
        cursor = range.span.1;
    }

    let suffix = &pattern[cursor..];
    for value in &mut results {
        value.push_str(suffix);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_expand_plain_value() {
        assert_eq!(expand("sdb").unwrap(), vec!["sdb"]);
    }

    #[test]
    fn test_expand_numeric_and_alpha() {
        assert_eq!(expand("{0...2}").unwrap(), vec!["0", "1", "2"]);
        assert_eq!(expand("sd{a...c}").unwrap(), vec!["sda", "sdb", "sdc"]);
        assert_eq!(expand("sd{c...a}").unwrap(), vec!["sda", "sdb", "sdc"]);
        assert_eq!(expand("{y...ab}").unwrap(), vec!["y", "z", "aa", "ab"]);
    }

    #[test]
    fn test_expand_cartesian_product() {
        assert_eq!(
            expand("{a...b}p{0...1}").unwrap(),
            vec!["ap0", "ap1", "bp0", "bp1"]
        );
        assert_eq!(
            expand("node{1...2}-disk").unwrap(),
            vec!["node1-disk", "node2-disk"]
        );
    }

    #[test]
    fn test_expand_invalid_patterns() {
        assert_matches!(expand("{a..c}"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("{a.c}"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("{a....c}"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("{a...3}"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("{a...{b...c}}"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("sd{a...c"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("sda}"), Err(Error::InvalidArgument(_)));
        assert_matches!(expand("{A...C}"), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_alpha_roundtrip_boundaries() {
        assert_eq!(int_to_alpha(alpha_to_int("z")), "z");
        assert_eq!(int_to_alpha(alpha_to_int("aa")), "aa");
        assert_eq!(alpha_to_int("aa"), alpha_to_int("z") + 1);
    }
}
