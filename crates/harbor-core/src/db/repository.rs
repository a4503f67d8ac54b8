//! Entity record repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{validate_table_name, EntityRecord, Payload, SyncStatus};

/// Filter for listing mirrored records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// Equality filters on top-level fields (`null` matches missing or null)
    pub equals: Vec<(String, Value)>,
    /// Restrict to a sync state
    pub sync_status: Option<SyncStatus>,
    /// Maximum number of rows (default 100)
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: usize,
}

impl RecordQuery {
    /// Add an equality filter on a top-level field.
    #[must_use]
    pub fn field_equals(mut self, field: impl Into<String>, value: Value) -> Self {
        self.equals.push((field.into(), value));
        self
    }

    /// Only return rows in the given sync state.
    #[must_use]
    pub const fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = Some(status);
        self
    }

    /// Limit the number of rows returned.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Trait for entity record storage operations
pub trait RecordRepository {
    /// Insert a new record; fails when the id already exists
    fn insert(&self, record: &EntityRecord) -> Result<()>;

    /// Overwrite fields and sync state of an existing record
    fn update(&self, record: &EntityRecord) -> Result<()>;

    /// Insert or overwrite a record
    fn upsert(&self, record: &EntityRecord) -> Result<()>;

    /// Delete a record, returning whether a row was removed
    fn delete(&self, table: &str, id: &str) -> Result<bool>;

    /// Fetch a record by id
    fn find_by_id(&self, table: &str, id: &str) -> Result<Option<EntityRecord>>;

    /// List records, most recently modified first
    fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<EntityRecord>>;

    /// Change a record's sync state
    fn set_status(&self, table: &str, id: &str, status: SyncStatus) -> Result<()>;

    /// Count records in a sync state
    fn count_by_status(&self, table: &str, status: SyncStatus) -> Result<usize>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a record from a database row
    fn parse_record(table: &str, row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        let data: String = row.get(1)?;
        let fields = serde_json::from_str::<Payload>(&data).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, error.into())
        })?;
        let status: String = row.get(3)?;
        let sync_status = status.parse().map_err(|error: Error| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                error.to_string().into(),
            )
        })?;

        Ok(EntityRecord {
            id: row.get(0)?,
            table: table.to_string(),
            fields,
            remote_updated_at: row.get(2)?,
            sync_status,
            last_modified: row.get(4)?,
        })
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn insert(&self, record: &EntityRecord) -> Result<()> {
        validate_table_name(&record.table)?;
        let result = self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, data, remote_updated_at, sync_status, last_modified)
                 VALUES (?, ?, ?, ?, ?)",
                record.table
            ),
            params![
                record.id,
                serde_json::to_string(&record.fields)?,
                record.remote_updated_at,
                record.sync_status.as_str(),
                record.last_modified,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::InvalidInput(format!(
                    "record {}/{} already exists",
                    record.table, record.id
                )))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn update(&self, record: &EntityRecord) -> Result<()> {
        validate_table_name(&record.table)?;
        let rows = self.conn.execute(
            &format!(
                "UPDATE \"{}\" SET data = ?, remote_updated_at = ?, sync_status = ?, last_modified = ?
                 WHERE id = ?",
                record.table
            ),
            params![
                serde_json::to_string(&record.fields)?,
                record.remote_updated_at,
                record.sync_status.as_str(),
                record.last_modified,
                record.id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("{}/{}", record.table, record.id)));
        }
        Ok(())
    }

    fn upsert(&self, record: &EntityRecord) -> Result<()> {
        validate_table_name(&record.table)?;
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, data, remote_updated_at, sync_status, last_modified)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    data = excluded.data,
                    remote_updated_at = excluded.remote_updated_at,
                    sync_status = excluded.sync_status,
                    last_modified = excluded.last_modified",
                record.table
            ),
            params![
                record.id,
                serde_json::to_string(&record.fields)?,
                record.remote_updated_at,
                record.sync_status.as_str(),
                record.last_modified,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<bool> {
        validate_table_name(table)?;
        let rows = self
            .conn
            .execute(&format!("DELETE FROM \"{table}\" WHERE id = ?"), params![id])?;
        Ok(rows > 0)
    }

    fn find_by_id(&self, table: &str, id: &str) -> Result<Option<EntityRecord>> {
        validate_table_name(table)?;
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, data, remote_updated_at, sync_status, last_modified
                     FROM \"{table}\" WHERE id = ?"
                ),
                params![id],
                |row| Self::parse_record(table, row),
            )
            .optional()?;
        Ok(record)
    }

    fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<EntityRecord>> {
        validate_table_name(table)?;

        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        for (field, expected) in &query.equals {
            if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::InvalidInput(format!("invalid field name '{field}'")));
            }
            let path = format!("json_extract(data, '$.{field}')");
            match json_to_sql(expected) {
                Some(value) => {
                    clauses.push(format!("{path} = ?"));
                    values.push(value);
                }
                None => clauses.push(format!("{path} IS NULL")),
            }
        }

        if let Some(status) = query.sync_status {
            clauses.push("sync_status = ?".to_string());
            values.push(SqlValue::Text(status.as_str().to_string()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        values.push(SqlValue::Integer(query.limit.unwrap_or(100) as i64));
        values.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, data, remote_updated_at, sync_status, last_modified
             FROM \"{table}\"
             {where_clause}
             ORDER BY last_modified DESC, id ASC
             LIMIT ? OFFSET ?"
        ))?;

        let records = stmt
            .query_map(params_from_iter(values), |row| Self::parse_record(table, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn set_status(&self, table: &str, id: &str, status: SyncStatus) -> Result<()> {
        validate_table_name(table)?;
        self.conn.execute(
            &format!("UPDATE \"{table}\" SET sync_status = ? WHERE id = ?"),
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    fn count_by_status(&self, table: &str, status: SyncStatus) -> Result<usize> {
        validate_table_name(table)?;
        let count = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{table}\" WHERE sync_status = ?"),
            params![status.as_str()],
            |row| row.get::<_, usize>(0),
        )?;
        Ok(count)
    }
}

/// Map a JSON filter value onto the value `json_extract` yields for it.
fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real)),
        Value::String(text) => Some(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Some(SqlValue::Text(value.to_string())),
    }
}
