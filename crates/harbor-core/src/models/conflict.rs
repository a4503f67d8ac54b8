//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ChangeOperation, Payload};
use crate::error::{Error, Result};

/// How a conflict was (or was not yet) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    Unresolved,
    UseLocal,
    UseRemote,
    Merged,
}

impl ConflictResolution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::UseLocal => "use_local",
            Self::UseRemote => "use_remote",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "use_local" => Ok(Self::UseLocal),
            "use_remote" => Ok(Self::UseRemote),
            "merged" => Ok(Self::Merged),
            other => Err(Error::InvalidInput(format!("unknown resolution '{other}'"))),
        }
    }
}

/// Divergence between a queued local change and the remote row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict row identifier
    pub id: i64,
    /// Queue row that failed to upload
    pub pending_change_id: i64,
    /// Entity table of the record
    pub table_name: String,
    /// Record involved in the conflict
    pub record_id: String,
    /// Operation the local change attempted
    pub operation: ChangeOperation,
    /// Local payload at detection time
    pub local_payload: Payload,
    /// Remote payload at detection time; `None` when the remote row is gone
    pub remote_payload: Option<Payload>,
    /// Remote `updated_at` at detection time
    pub remote_version: Option<i64>,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    /// Resolution outcome
    pub resolution: ConflictResolution,
    /// Resolution timestamp (unix ms)
    pub resolved_at: Option<i64>,
    /// Strategy name, or `manual` for explicit choices
    pub strategy: Option<String>,
}

impl Conflict {
    pub const fn is_resolved(&self) -> bool {
        !matches!(self.resolution, ConflictResolution::Unresolved)
    }
}
