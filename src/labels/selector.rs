//! Label selectors and value matchers
//!
//! Two related concerns live here:
//!
//! - [`LabelSelector`]: the orchestrator's `key in (a,b),key2=c` selector
//!   syntax, used to scope list/watch calls.
//! - [`ValueMatcher`]: user-supplied match values, which may be a literal,
//!   an ellipsis pattern (`sd{a...f}`) or a glob (`nvme*`). Ellipsis values
//!   are expanded eagerly; globs are matched lazily. A value that mixes both
//!   forms is rejected.

use super::ellipsis;
use super::keys::{LabelKey, LabelValue};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// Label Selector
// =============================================================================

/// One `key in (values)` requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub values: BTreeSet<String>,
}

/// A conjunction of requirements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Add an equality requirement
    pub fn with(mut self, key: LabelKey, value: impl Into<LabelValue>) -> Self {
        let value: LabelValue = value.into();
        self.requirements.push(Requirement {
            key: key.to_string(),
            values: BTreeSet::from([value.as_str().to_string()]),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Parse `k=v`, `k==v` and `k in (a,b)` terms separated by commas
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        let mut rest = selector.trim();

        while !rest.is_empty() {
            let (term, remainder) = split_term(rest)?;
            requirements.push(parse_term(term)?);
            rest = remainder.trim_start_matches(',').trim();
        }

        Ok(Self { requirements })
    }

    /// Whether `labels` satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| {
            labels
                .get(&req.key)
                .map(|v| req.values.contains(v))
                .unwrap_or(false)
        })
    }
}

fn split_term(input: &str) -> Result<(&str, &str)> {
    // A term ends at the first comma outside parentheses.
    let mut depth = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    Error::InvalidArgument(format!("unbalanced ')' in selector {input:?}"))
                })?
            }
            ',' if depth == 0 => return Ok((&input[..i], &input[i..])),
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::InvalidArgument(format!(
            "unbalanced '(' in selector {input:?}"
        )));
    }
    Ok((input, ""))
}

fn parse_term(term: &str) -> Result<Requirement> {
    let term = term.trim();
    if let Some((key, values)) = term.split_once(" in ") {
        let values = values.trim();
        let inner = values
            .strip_prefix('(')
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| Error::InvalidArgument(format!("malformed set term {term:?}")))?;
        let values = inner
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        return Ok(Requirement {
            key: key.trim().to_string(),
            values,
        });
    }

    let (key, value) = term
        .split_once("==")
        .or_else(|| term.split_once('='))
        .ok_or_else(|| Error::InvalidArgument(format!("malformed selector term {term:?}")))?;
    Ok(Requirement {
        key: key.trim().to_string(),
        values: BTreeSet::from([value.trim().to_string()]),
    })
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|req| {
                let values: Vec<&str> = req.values.iter().map(String::as_str).collect();
                format!("{} in ({})", req.key, values.join(","))
            })
            .collect();
        f.write_str(&terms.join(","))
    }
}

/// Build a selector string of `key in (v1,v2)` terms
pub fn to_label_selector(map: &BTreeMap<LabelKey, Vec<LabelValue>>) -> String {
    let selector = LabelSelector {
        requirements: map
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, values)| Requirement {
                key: key.to_string(),
                values: values.iter().map(|v| v.as_str().to_string()).collect(),
            })
            .collect(),
    };
    selector.to_string()
}

// =============================================================================
// Value Matchers
// =============================================================================

/// A single user-supplied match value
#[derive(Debug, Clone)]
pub enum ValueMatcher {
    /// Literal values, expanded from an ellipsis pattern or taken as-is
    Literal(BTreeSet<String>),
    /// Shell-style glob
    Glob(glob::Pattern),
}

impl ValueMatcher {
    /// Parse a value according to the ellipsis/glob grammar
    pub fn parse(value: &str) -> Result<Self> {
        let is_glob = value.contains(['*', '?', '[']);
        let is_ellipsis = ellipsis::has_ellipsis(value);

        match (is_glob, is_ellipsis) {
            (true, true) => Err(Error::InvalidArgument(format!(
                "{value}: glob and ellipsis cannot be combined"
            ))),
            (true, false) => glob::Pattern::new(value)
                .map(ValueMatcher::Glob)
                .map_err(|e| Error::InvalidArgument(format!("{value}: {e}"))),
            (false, _) => Ok(ValueMatcher::Literal(
                ellipsis::expand(value)?.into_iter().collect(),
            )),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            ValueMatcher::Literal(values) => values.contains(candidate),
            ValueMatcher::Glob(pattern) => pattern.matches(candidate),
        }
    }
}

/// A list of matchers; an empty list matches everything
#[derive(Debug, Clone, Default)]
pub struct ValueFilter {
    matchers: Vec<ValueMatcher>,
}

impl ValueFilter {
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        let matchers = values
            .iter()
            .map(|v| ValueMatcher::parse(v.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { matchers })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.matchers.is_empty() || self.matchers.iter().any(|m| m.matches(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_to_label_selector() {
        let mut map = BTreeMap::new();
        map.insert(LabelKey::NODE, vec![LabelValue::new("node1"), LabelValue::new("node2")]);
        map.insert(LabelKey::DRIVE_PATH, vec![LabelValue::new("sdb")]);
        map.insert(LabelKey::ACCESS_TIER, vec![]);

        assert_eq!(
            to_label_selector(&map),
            "directpv.min.io/node in (node1,node2),directpv.min.io/drive-path in (sdb)"
        );
    }

    #[test]
    fn test_selector_parse_and_match() {
        let sel = LabelSelector::parse("directpv.min.io/node in (n1,n2), app=web").unwrap();
        assert!(sel.matches(&labels(&[("directpv.min.io/node", "n2"), ("app", "web")])));
        assert!(!sel.matches(&labels(&[("directpv.min.io/node", "n3"), ("app", "web")])));
        assert!(!sel.matches(&labels(&[("app", "web")])));

        assert!(LabelSelector::parse("").unwrap().matches(&BTreeMap::new()));
        assert_matches!(LabelSelector::parse("a in (b"), Err(Error::InvalidArgument(_)));
        assert_matches!(LabelSelector::parse("novalue"), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_selector_display_roundtrips() {
        let sel = LabelSelector::everything()
            .with(LabelKey::NODE, "node1")
            .with(LabelKey::DRIVE, "abc");
        let reparsed = LabelSelector::parse(&sel.to_string()).unwrap();
        assert_eq!(sel, reparsed);
    }

    #[test]
    fn test_value_matcher_forms() {
        let m = ValueMatcher::parse("sd{a...c}").unwrap();
        assert!(m.matches("sdb"));
        assert!(!m.matches("sdd"));

        let m = ValueMatcher::parse("nvme*").unwrap();
        assert!(m.matches("nvme0n1"));
        assert!(!m.matches("sda"));

        let m = ValueMatcher::parse("sdb").unwrap();
        assert!(m.matches("sdb"));

        assert_matches!(ValueMatcher::parse("sd{a...c}*"), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_value_filter_empty_matches_all() {
        let filter = ValueFilter::parse::<&str>(&[]).unwrap();
        assert!(filter.matches("anything"));

        let filter = ValueFilter::parse(&["loop{0...1}", "vd*"]).unwrap();
        assert!(filter.matches("loop1"));
        assert!(filter.matches("vdb"));
        assert!(!filter.matches("loop2"));
    }
}
