//! Custom Resource Definitions for DirectPV
//!
//! This module contains both persisted record types:
//! - DirectPVDrive: a block device observed or owned by a node agent
//! - DirectPVVolume: a per-pod slice of a drive

pub mod drive;
pub mod volume;

pub use drive::*;
pub use volume::*;

// `crd::condition` is the drive set; volume conditions live in `volume::condition`.
pub use drive::condition;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Conditions
// =============================================================================

/// Status of a condition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A typed condition on a Drive or Volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: String,
    /// Message
    #[serde(default)]
    pub message: String,
}

/// Upsert a condition; the transition time moves only when status flips
pub(crate) fn set_condition(
    conditions: &mut Vec<Condition>,
    r#type: &str,
    status: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let status = ConditionStatus::from(status);
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == r#type) {
        if existing.status != status {
            existing.last_transition_time = Some(now);
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
    } else {
        conditions.push(Condition {
            r#type: r#type.to_string(),
            status,
            last_transition_time: Some(now),
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    const TIB: u64 = GIB * 1024;

    if bytes >= TIB {
        format!("{:.2}TiB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.2}GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}
