use harbor_core::db::RecordQuery;
use harbor_core::{ChangeCapture, EntityRecord, SyncStatus};

use crate::cli::{RecordCommands, RecordStatus};
use crate::commands::common::{
    build_payload, format_record_lines, normalize_record_identifier, parse_field_assignment,
    Context,
};
use crate::error::CliError;

pub async fn run_record(command: RecordCommands, context: &Context) -> Result<(), CliError> {
    match command {
        RecordCommands::Add {
            table,
            fields,
            json,
        } => {
            let record = add_record(&table, json.as_deref(), &fields, context).await?;
            println!("{}", record.id);
        }
        RecordCommands::Update {
            table,
            id,
            fields,
            json,
        } => {
            let record = update_record(&table, &id, json.as_deref(), &fields, context).await?;
            println!("Updated {}/{}", record.table, record.id);
        }
        RecordCommands::Delete { table, id } => {
            delete_record(&table, &id, context).await?;
            println!("Deleted {table}/{}", id.trim());
        }
        RecordCommands::Get { table, id } => {
            let record = get_record(&table, &id, context).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        RecordCommands::List {
            table,
            limit,
            status,
            filters,
            json,
        } => {
            let records = list_records(&table, limit, status, &filters, context).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No records in {table}.");
            } else {
                for line in format_record_lines(&records) {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}

pub async fn add_record(
    table: &str,
    json: Option<&str>,
    fields: &[String],
    context: &Context,
) -> Result<EntityRecord, CliError> {
    let payload = build_payload(json, fields)?;
    let store = context.open_store()?;
    let record = ChangeCapture::new(store).insert(table, payload).await?;
    tracing::debug!("Queued insert of {table}/{}", record.id);
    Ok(record)
}

pub async fn update_record(
    table: &str,
    id: &str,
    json: Option<&str>,
    fields: &[String],
    context: &Context,
) -> Result<EntityRecord, CliError> {
    let id = normalize_record_identifier(id)?;
    let patch = build_payload(json, fields)?;
    let store = context.open_store()?;
    match ChangeCapture::new(store).update(table, &id, patch).await {
        Ok(record) => Ok(record),
        Err(harbor_core::Error::NotFound(target)) => Err(CliError::RecordNotFound(target)),
        Err(error) => Err(error.into()),
    }
}

pub async fn delete_record(table: &str, id: &str, context: &Context) -> Result<(), CliError> {
    let id = normalize_record_identifier(id)?;
    let store = context.open_store()?;
    if ChangeCapture::new(store).delete(table, &id).await? {
        Ok(())
    } else {
        Err(CliError::RecordNotFound(format!("{table}/{id}")))
    }
}

pub async fn get_record(table: &str, id: &str, context: &Context) -> Result<EntityRecord, CliError> {
    let id = normalize_record_identifier(id)?;
    let store = context.open_store()?;
    store
        .find_by_id(table, &id)
        .await?
        .ok_or_else(|| CliError::RecordNotFound(format!("{table}/{id}")))
}

pub async fn list_records(
    table: &str,
    limit: usize,
    status: Option<RecordStatus>,
    filters: &[String],
    context: &Context,
) -> Result<Vec<EntityRecord>, CliError> {
    let mut query = RecordQuery::default().with_limit(limit);
    if let Some(status) = status {
        query = query.with_status(match status {
            RecordStatus::Synced => SyncStatus::Synced,
            RecordStatus::Pending => SyncStatus::Pending,
            RecordStatus::Error => SyncStatus::Error,
        });
    }
    for raw in filters {
        let (field, value) = parse_field_assignment(raw)?;
        query = query.field_equals(field, value);
    }

    let store = context.open_store()?;
    Ok(store.query(table, &query).await?)
}
