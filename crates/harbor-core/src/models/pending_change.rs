//! Queued local mutations awaiting upload

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Payload;
use crate::error::{Error, Result};

/// Kind of remote write a pending change turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation '{other}'"))),
        }
    }
}

/// A queued, not-yet-acknowledged local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Queue row identifier
    pub id: i64,
    /// Entity table of the record
    pub table_name: String,
    /// Record the change applies to
    pub record_id: String,
    /// Remote write to issue
    pub operation: ChangeOperation,
    /// Latest local payload
    pub payload: Payload,
    /// Queue position timestamp (Unix ms)
    pub created_at: i64,
    /// Consecutive failed upload attempts
    pub retry_count: u32,
    /// Last upload error message
    pub last_error: Option<String>,
    /// Remote `updated_at` the local edit was based on
    pub base_version: Option<i64>,
    /// Last upload attempt (Unix ms)
    pub last_attempt_at: Option<i64>,
    /// First time the change was sent to the backend (Unix ms); survives
    /// coalescing
    pub sent_at: Option<i64>,
}

/// Values for a new queue row
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingChange<'a> {
    pub table_name: &'a str,
    pub record_id: &'a str,
    pub operation: ChangeOperation,
    pub payload: &'a Payload,
    pub created_at: i64,
    pub base_version: Option<i64>,
}
