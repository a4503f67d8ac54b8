//! Mirrored entity records

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Field set of a mirrored row, as a JSON object.
pub type Payload = serde_json::Map<String, Value>;

/// Fields that only make sense on this device and are never uploaded.
pub const LOCAL_ONLY_FIELDS: &[&str] = &["sync_status", "last_modified", "local_updated_at"];

/// Fields owned by the remote backend; stripped from write payloads.
pub const REMOTE_MANAGED_FIELDS: &[&str] = &["updated_at"];

/// Per-row synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Row matches the last acknowledged remote state
    #[default]
    Synced,
    /// Row has a queued local change
    Pending,
    /// Queued change stopped retrying and needs attention
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "error" => Ok(Self::Error),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

/// A local mirror of one remote row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Stable identifier shared with the remote row
    pub id: String,
    /// Entity table this record belongs to
    pub table: String,
    /// Field set, including `id`
    pub fields: Payload,
    /// Remote `updated_at` marker (Unix ms) of the last acknowledged state
    pub remote_updated_at: Option<i64>,
    /// Sync state
    pub sync_status: SyncStatus,
    /// Last local modification (Unix ms)
    pub last_modified: i64,
}

impl EntityRecord {
    /// Build a record for a locally created row.
    ///
    /// Uses the `id` field when present, otherwise assigns a UUID v7.
    #[must_use]
    pub fn new_local(table: impl Into<String>, mut fields: Payload, now: i64) -> Self {
        let id = fields
            .get("id")
            .and_then(value_as_id)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        fields.insert("id".to_string(), Value::String(id.clone()));

        Self {
            id,
            table: table.into(),
            fields,
            remote_updated_at: None,
            sync_status: SyncStatus::Pending,
            last_modified: now,
        }
    }

    /// Read a top-level field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Render a JSON id value (string or integer) as a string id.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Remove device-local and remote-managed fields before an upload.
///
/// Keys starting with `_` are treated as local annotations as well.
#[must_use]
pub fn strip_local_fields(payload: &Payload) -> Payload {
    payload
        .iter()
        .filter(|(key, _)| {
            !key.starts_with('_')
                && !LOCAL_ONLY_FIELDS.contains(&key.as_str())
                && !REMOTE_MANAGED_FIELDS.contains(&key.as_str())
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Shallow merge: keys of `patch` overwrite keys of `base`.
#[must_use]
pub fn merge_payload(base: &Payload, patch: &Payload) -> Payload {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Validate an entity table name before it is interpolated into SQL.
///
/// Valid names match `^[a-z][a-z0-9_]{0,62}$` and must not collide with
/// the sync metadata tables.
pub fn validate_table_name(name: &str) -> Result<()> {
    static TABLE_NAME: OnceLock<Regex> = OnceLock::new();
    let re =
        TABLE_NAME.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("Invalid regex"));

    if !re.is_match(name) {
        return Err(Error::InvalidInput(format!("invalid table name '{name}'")));
    }
    if RESERVED_TABLES.contains(&name) || name.starts_with("sqlite_") {
        return Err(Error::InvalidInput(format!("table name '{name}' is reserved")));
    }
    Ok(())
}

const RESERVED_TABLES: &[&str] = &[
    "pending_changes",
    "sync_cursors",
    "conflicts",
    "settings",
    "schema_version",
];
