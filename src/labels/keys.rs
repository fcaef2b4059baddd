//! Well-known label keys
//!
//! All keys are prefixed with the API group so that they never collide with
//! labels owned by other controllers.

use super::sanitize::sanitize_label_value;
use std::collections::BTreeMap;
use std::fmt;

/// API group owning the Drive and Volume records
pub const GROUP: &str = "directpv.min.io";

/// API version of the Drive and Volume records
pub const VERSION: &str = "v1beta1";

/// Value of the `created-by` label
pub const CREATED_BY: &str = "directpv-driver";

/// A label key under the DirectPV group prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelKey(&'static str);

impl LabelKey {
    pub const POD_NAME: LabelKey = LabelKey("directpv.min.io/pod.name");
    pub const POD_NAMESPACE: LabelKey = LabelKey("directpv.min.io/pod.namespace");
    pub const NODE: LabelKey = LabelKey("directpv.min.io/node");
    pub const DRIVE: LabelKey = LabelKey("directpv.min.io/drive");
    pub const DRIVE_PATH: LabelKey = LabelKey("directpv.min.io/drive-path");
    pub const ACCESS_TIER: LabelKey = LabelKey("directpv.min.io/access-tier");
    pub const VERSION: LabelKey = LabelKey("directpv.min.io/version");
    pub const CREATED_BY: LabelKey = LabelKey("directpv.min.io/created-by");

    pub const TOPOLOGY_IDENTITY: LabelKey = LabelKey("directpv.min.io/identity");
    pub const TOPOLOGY_NODE: LabelKey = LabelKey("directpv.min.io/node");
    pub const TOPOLOGY_RACK: LabelKey = LabelKey("directpv.min.io/rack");
    pub const TOPOLOGY_ZONE: LabelKey = LabelKey("directpv.min.io/zone");
    pub const TOPOLOGY_REGION: LabelKey = LabelKey("directpv.min.io/region");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A label value that has passed through [`sanitize_label_value`]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelValue(String);

impl LabelValue {
    pub fn new(value: &str) -> Self {
        Self(sanitize_label_value(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LabelValue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for LabelValue {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set a sanitized label on a label map
pub fn set_label(labels: &mut BTreeMap<String, String>, key: LabelKey, value: impl Into<LabelValue>) {
    labels.insert(key.to_string(), value.into().0);
}

/// Read a label from a label map
pub fn get_label(labels: &BTreeMap<String, String>, key: LabelKey) -> Option<&str> {
    labels.get(key.as_str()).map(String::as_str)
}
