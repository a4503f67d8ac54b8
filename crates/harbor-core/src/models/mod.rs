//! Data models for Harbor

mod conflict;
mod cursor;
mod pending_change;
mod record;
mod settings;

pub use conflict::{Conflict, ConflictResolution};
pub use cursor::SyncCursor;
pub use pending_change::{ChangeOperation, NewPendingChange, PendingChange};
pub use record::{
    merge_payload, strip_local_fields, validate_table_name, value_as_id, EntityRecord, Payload,
    SyncStatus, LOCAL_ONLY_FIELDS, REMOTE_MANAGED_FIELDS,
};
pub use settings::Settings;
