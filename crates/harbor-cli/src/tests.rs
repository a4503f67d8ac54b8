use std::path::PathBuf;

use harbor_core::scheduler::SchedulerState;
use harbor_core::state::SyncState;
use harbor_core::sync::{SkipReason, SyncOutcome};
use harbor_core::{SyncSettings, SyncStatus};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::cli::{CompletionShell, RecordStatus, ResolutionChoice};
use crate::commands::background::set_background_sync;
use crate::commands::common::{
    build_payload, format_outcome, format_relative_time, format_timestamp,
    normalize_record_identifier, parse_field_assignment, payload_preview, resolve_db_path,
    Context,
};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{resolution_from_choice, resolve_conflict};
use crate::commands::diagnostics::collect_diagnostics;
use crate::commands::record::{add_record, delete_record, get_record, list_records, update_record};
use crate::commands::reset::run_reset;
use crate::commands::status::{current_status, format_status_lines};
use crate::commands::sync::{retry_failed_changes, run_sync};
use crate::error::CliError;

fn test_context() -> (TempDir, Context) {
    let dir = tempfile::tempdir().unwrap();
    let context = Context {
        settings: SyncSettings {
            tables: vec!["boats".to_string(), "orders".to_string()],
            ..SyncSettings::default()
        },
        db_path: dir.path().join("data").join("harbor.db"),
    };
    (dir, context)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

#[test]
fn parse_field_assignment_reads_json_values() {
    assert_eq!(
        parse_field_assignment("length=12").unwrap(),
        ("length".to_string(), json!(12))
    );
    assert_eq!(
        parse_field_assignment("active=true").unwrap(),
        ("active".to_string(), json!(true))
    );
    assert_eq!(
        parse_field_assignment("name=Sea Breeze").unwrap(),
        ("name".to_string(), json!("Sea Breeze"))
    );
    assert_eq!(
        parse_field_assignment("note=a=b").unwrap(),
        ("note".to_string(), json!("a=b"))
    );
}

#[test]
fn parse_field_assignment_rejects_missing_name() {
    assert!(matches!(
        parse_field_assignment("=5"),
        Err(CliError::InvalidField(_))
    ));
    assert!(matches!(
        parse_field_assignment("no-separator"),
        Err(CliError::InvalidField(_))
    ));
}

#[test]
fn build_payload_applies_fields_over_json() {
    let payload = build_payload(
        Some(r#"{"name": "Old", "seats": 4}"#),
        &strings(&["name=New"]),
    )
    .unwrap();
    assert_eq!(Value::Object(payload), json!({"name": "New", "seats": 4}));
}

#[test]
fn build_payload_rejects_empty_and_non_objects() {
    assert!(matches!(build_payload(None, &[]), Err(CliError::EmptyPayload)));
    assert!(matches!(
        build_payload(Some("[1, 2]"), &[]),
        Err(CliError::Config(_))
    ));
}

#[test]
fn normalize_record_identifier_rejects_empty() {
    assert_eq!(normalize_record_identifier("  b1 ").unwrap(), "b1");
    assert!(matches!(
        normalize_record_identifier("   "),
        Err(CliError::EmptyRecordId)
    ));
}

#[test]
fn format_timestamp_returns_utc_label() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn payload_preview_truncates_with_ellipsis() {
    let payload = build_payload(None, &strings(&["name=A very long boat name indeed"])).unwrap();
    let preview = payload_preview(&payload, 20);
    assert_eq!(preview.chars().count(), 20);
    assert!(preview.ends_with("..."));
}

#[test]
fn format_outcome_names_skip_reason() {
    let outcome = SyncOutcome::Skipped {
        reason: SkipReason::Offline,
    };
    assert_eq!(format_outcome(&outcome), "Sync skipped: offline");
}

#[test]
fn resolve_db_path_prefers_explicit_path() {
    let settings = SyncSettings {
        database_path: Some("/tmp/from-settings.db".to_string()),
        ..SyncSettings::default()
    };
    let resolved = resolve_db_path(Some(PathBuf::from("/tmp/explicit.db")), &settings).unwrap();
    assert_eq!(resolved, PathBuf::from("/tmp/explicit.db"));
}

#[test]
fn merged_resolution_requires_payload() {
    assert!(matches!(
        resolution_from_choice(ResolutionChoice::Merged, None),
        Err(CliError::MissingMergePayload)
    ));
    assert!(resolution_from_choice(ResolutionChoice::Merged, Some(r#"{"name": "x"}"#)).is_ok());
    assert!(resolution_from_choice(ResolutionChoice::Local, None).is_ok());
}

#[tokio::test(flavor = "current_thread")]
async fn record_commands_queue_changes() {
    let (_dir, context) = test_context();

    let record = add_record(
        "boats",
        Some(r#"{"id": "b1", "name": "Sea Breeze"}"#),
        &strings(&["seats=6"]),
        &context,
    )
    .await
    .unwrap();
    assert_eq!(record.id, "b1");
    assert_eq!(record.sync_status, SyncStatus::Pending);

    let updated = update_record("boats", "b1", None, &strings(&["seats=8"]), &context)
        .await
        .unwrap();
    assert_eq!(updated.field("seats"), Some(&json!(8)));
    assert_eq!(updated.field("name"), Some(&json!("Sea Breeze")));

    add_record("boats", None, &strings(&["id=b2", "name=Gull"]), &context)
        .await
        .unwrap();

    let pending = list_records("boats", 10, Some(RecordStatus::Pending), &[], &context)
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    let filtered = list_records("boats", 10, None, &strings(&["name=Gull"]), &context)
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, "b2");

    let status = current_status(&context).await.unwrap();
    assert_eq!(status.state, SyncState::Offline);
    assert_eq!(status.pending_changes, 2);

    delete_record("boats", "b2", &context).await.unwrap();
    assert!(matches!(
        get_record("boats", "b2", &context).await,
        Err(CliError::RecordNotFound(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn update_of_missing_record_is_not_found() {
    let (_dir, context) = test_context();

    let error = update_record("boats", "missing", None, &strings(&["seats=1"]), &context)
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::RecordNotFound(_)));
}

#[tokio::test(flavor = "current_thread")]
async fn untracked_table_is_rejected() {
    let (_dir, context) = test_context();

    let error = add_record("invoices", None, &strings(&["total=1"]), &context)
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::Core(_)));
}

#[tokio::test(flavor = "current_thread")]
async fn run_sync_requires_sync_configuration() {
    let (_dir, context) = test_context();

    let error = run_sync(false, &context).await.unwrap_err();
    assert!(matches!(error, CliError::SyncNotConfigured));
}

#[tokio::test(flavor = "current_thread")]
async fn reset_requires_confirmation() {
    let (_dir, context) = test_context();
    add_record("boats", None, &strings(&["id=b1"]), &context)
        .await
        .unwrap();

    assert!(matches!(
        run_reset(false, &context).await,
        Err(CliError::ConfirmationRequired)
    ));
    assert_eq!(current_status(&context).await.unwrap().pending_changes, 1);

    run_reset(true, &context).await.unwrap();
    assert_eq!(current_status(&context).await.unwrap().pending_changes, 0);
    assert!(list_records("boats", 10, None, &[], &context)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn retry_with_nothing_exhausted_resets_nothing() {
    let (_dir, context) = test_context();
    add_record("boats", None, &strings(&["id=b1"]), &context)
        .await
        .unwrap();

    assert_eq!(retry_failed_changes(&context).await.unwrap(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn resolve_unknown_conflict_is_not_found() {
    let (_dir, context) = test_context();

    let error = resolve_conflict(42, ResolutionChoice::Remote, None, &context)
        .await
        .unwrap_err();
    assert!(matches!(error, CliError::ConflictNotFound(42)));
}

#[tokio::test(flavor = "current_thread")]
async fn background_toggle_without_backend_persists_flag() {
    let (_dir, context) = test_context();

    let state = set_background_sync(true, &context).await.unwrap();
    assert_eq!(state, SchedulerState::ForegroundOnly);

    let diagnostics = collect_diagnostics(&context).await.unwrap();
    assert_eq!(diagnostics.background_sync, SchedulerState::ForegroundOnly);
    assert_eq!(diagnostics.tracked_tables, strings(&["boats", "orders"]));

    let state = set_background_sync(false, &context).await.unwrap();
    assert_eq!(state, SchedulerState::Disabled);
}

#[tokio::test(flavor = "current_thread")]
async fn status_lines_point_at_follow_up_commands() {
    let (_dir, context) = test_context();
    let mut status = current_status(&context).await.unwrap();
    status.needs_attention = 2;
    status.unresolved_conflicts = 1;

    let lines = format_status_lines(&status, false);
    assert!(lines.iter().any(|line| line.contains("not configured")));
    assert!(lines.iter().any(|line| line.contains("harbor retry")));
    assert!(lines.iter().any(|line| line.contains("harbor conflicts list")));
    assert!(lines.iter().any(|line| line.contains("never")));
}

#[test]
fn run_completions_writes_bash_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("harbor.bash");

    run_completions(CompletionShell::Bash, Some(&output_path)).unwrap();

    let script = std::fs::read_to_string(&output_path).unwrap();
    assert!(script.contains("_harbor()"));
    assert!(script.contains("complete -F _harbor"));
}
