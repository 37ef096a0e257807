use std::collections::HashMap;
use std::path::Path;

use clap::{CommandFactory, Parser};
use pretty_assertions::assert_eq;
use tandem_core::coordinator::CycleOutcome;
use tandem_core::models::{BackupReason, Platform};
use tandem_core::{Device, EntityType, OperationKind, Resolution, SyncSession, SyncState};

use crate::cli::{Cli, CompletionShell, Commands, ResolveStrategy, SyncCommands};
use crate::commands::common::{
    format_relative_time, parse_payload, payload_preview, session_for_profile,
};
use crate::commands::completions::run_completions;
use crate::commands::config::merge_profile;
use crate::commands::device::format_device_lines;
use crate::commands::entity::{run_delete, run_put};
use crate::commands::sync::{describe_cycle, resolution_for};
use crate::config_profiles::CliProfile;
use crate::error::CliError;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars = vars
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect::<HashMap<_, _>>();
    move |key| vars.get(key).cloned()
}

fn local_profile(account_id: &str) -> CliProfile {
    CliProfile {
        account_id: Some(account_id.to_string()),
        ..CliProfile::default()
    }
}

fn open_local(db_path: &Path, account_id: &str) -> SyncSession {
    session_for_profile(
        &local_profile(account_id),
        "cli-test-device",
        db_path,
        lookup(&[("TANDEM_RETRY_BASE_MS", "1")]),
    )
    .unwrap()
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn put_parses_entity_type_aliases() {
    let cli = Cli::try_parse_from(["tandem", "put", "bookings", "b1", r#"{"party":2}"#]).unwrap();
    match cli.command {
        Commands::Put {
            entity_type,
            id,
            payload,
        } => {
            assert_eq!(entity_type, EntityType::Booking);
            assert_eq!(id, "b1");
            assert_eq!(payload.as_deref(), Some(r#"{"party":2}"#));
        }
        _ => panic!("expected put"),
    }

    assert!(Cli::try_parse_from(["tandem", "put", "invoice", "x", "{}"]).is_err());
}

#[test]
fn bare_sync_and_global_flags_parse() {
    let cli = Cli::try_parse_from(["tandem", "sync", "--profile", "work"]).unwrap();
    assert_eq!(cli.profile.as_deref(), Some("work"));
    assert!(matches!(cli.command, Commands::Sync { command: None }));

    let cli = Cli::try_parse_from([
        "tandem",
        "sync",
        "resolve",
        "0190a5e4-0000-7000-8000-000000000000",
        "--strategy",
        "keep-remote",
    ])
    .unwrap();
    assert!(matches!(
        cli.command,
        Commands::Sync {
            command: Some(SyncCommands::Resolve {
                strategy: ResolveStrategy::KeepRemote,
                ..
            })
        }
    ));
}

#[test]
fn payload_must_be_a_json_object() {
    assert!(parse_payload(r#" {"on": true} "#).is_ok());
    assert!(matches!(
        parse_payload("[1, 2]"),
        Err(CliError::PayloadNotObject)
    ));
    assert!(matches!(
        parse_payload("{oops"),
        Err(CliError::Serialization(_))
    ));
}

#[test]
fn merged_resolution_requires_payload() {
    assert!(matches!(
        resolution_for(ResolveStrategy::Merged, None),
        Err(CliError::MissingMergedPayload)
    ));
    assert_eq!(
        resolution_for(ResolveStrategy::Merged, Some("null")).unwrap(),
        Resolution::Merged(serde_json::Value::Null)
    );
    assert_eq!(
        resolution_for(ResolveStrategy::KeepLocal, Some("ignored")).unwrap(),
        Resolution::KeepLocal
    );
}

#[test]
fn payload_preview_truncates() {
    let payload = serde_json::json!({"notes": "a very long note that keeps going"});
    let preview = payload_preview(Some(&payload), 16);
    assert_eq!(preview.chars().count(), 16);
    assert!(preview.ends_with("..."));
    assert_eq!(payload_preview(None, 16), "-");
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
}

#[test]
fn merge_profile_prefers_explicit_values_then_env() {
    let mut profile = CliProfile {
        auth_token: Some("kept".to_string()),
        ..CliProfile::default()
    };
    merge_profile(
        &mut profile,
        Some(" acct-9 ".to_string()),
        None,
        None,
        lookup(&[
            ("TANDEM_ACCOUNT_ID", "ignored"),
            ("TANDEM_REMOTE_URL", "https://sync.example.com/"),
        ]),
    )
    .unwrap();

    assert_eq!(profile.account_id.as_deref(), Some("acct-9"));
    assert_eq!(profile.remote_url.as_deref(), Some("https://sync.example.com"));
    assert_eq!(profile.auth_token.as_deref(), Some("kept"));
}

#[test]
fn merge_profile_rejects_non_http_remote() {
    let mut profile = CliProfile::default();
    let result = merge_profile(
        &mut profile,
        None,
        Some("sync.example.com".to_string()),
        None,
        lookup(&[]),
    );
    assert!(matches!(result, Err(CliError::Config(_))));
    assert_eq!(profile.remote_url, None);
}

#[test]
fn session_requires_an_account() {
    let dir = tempfile::tempdir().unwrap();
    let result = session_for_profile(
        &CliProfile::default(),
        "cli-test-device",
        &dir.path().join("tandem.db"),
        lookup(&[]),
    );
    assert!(matches!(result, Err(CliError::AccountNotConfigured)));
}

#[test]
fn env_account_overrides_profile() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_for_profile(
        &local_profile("from-profile"),
        "cli-test-device",
        &dir.path().join("tandem.db"),
        lookup(&[("TANDEM_ACCOUNT_ID", "from-env")]),
    )
    .unwrap();
    assert_eq!(session.account_id(), "from-env");
    assert_eq!(session.device_id(), "cli-test-device");
}

#[test]
fn put_creates_then_updates_and_persists_queue() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tandem.db");

    {
        let session = open_local(&db_path, "acct-1");
        run_put(&session, EntityType::Booking, "b1", Some(r#"{"party": 2}"#)).unwrap();
        run_put(&session, EntityType::Booking, "b1", Some(r#"{"party": 4}"#)).unwrap();
    }

    let session = open_local(&db_path, "acct-1");
    let record = session
        .updates()
        .entity(EntityType::Booking, "b1")
        .unwrap()
        .unwrap();
    assert_eq!(record.payload, Some(serde_json::json!({"party": 4})));

    // Both edits were made before any dispatch, so they coalesce.
    let pending = session.updates().get_pending_updates().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::Create);
}

#[test]
fn delete_of_unknown_entity_fails() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_local(&dir.path().join("tandem.db"), "acct-1");
    let result = run_delete(&session, EntityType::Favorite, "missing");
    assert!(matches!(
        result,
        Err(CliError::Core(tandem_core::Error::NotFound(_)))
    ));
}

#[tokio::test]
async fn sync_without_remote_stays_disabled_and_keeps_edits() {
    let dir = tempfile::tempdir().unwrap();
    let session = open_local(&dir.path().join("tandem.db"), "acct-1");
    run_put(&session, EntityType::Favorite, "f1", Some(r#"{"on": true}"#)).unwrap();

    let report = session.sync_now().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Disabled);
    assert_eq!(session.status().state, SyncState::Disabled);
    assert_eq!(session.status().pending_operations, 1);
    assert!(describe_cycle(&report, 1).contains("not registered"));
}

#[test]
fn backups_move_between_databases() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("exports").join("backup.json");

    let source = open_local(&dir.path().join("a.db"), "acct-1");
    let backup_id = source.backups().create_backup(BackupReason::Manual).unwrap();
    source.backups().export_backup(&backup_id, &file).unwrap();

    let target = open_local(&dir.path().join("b.db"), "acct-1");
    let summary = target.backups().import_backup(&file).unwrap();
    assert_eq!(summary.backup_id, backup_id);
    assert_eq!(summary.consumed_at, None);

    let other_account = open_local(&dir.path().join("c.db"), "acct-2");
    assert!(other_account.backups().import_backup(&file).is_err());
}

#[test]
fn device_lines_flag_current_and_primary() {
    let device = |id: &str, is_primary: bool, is_active: bool| Device {
        device_id: id.to_string(),
        account_id: "acct-1".to_string(),
        platform: Platform::Ios,
        app_version: "3.1".to_string(),
        os_version: "17".to_string(),
        is_primary,
        is_active,
        registered_at: 0,
        last_seen_at: 0,
    };
    let lines = format_device_lines(
        &[device("phone", true, true), device("old-tablet", false, false)],
        "phone",
        60_000,
    );
    assert!(lines[0].ends_with("this,primary"));
    assert!(lines[1].ends_with("inactive"));
}

#[test]
fn completions_are_written_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("completions").join("tandem.bash");
    run_completions(CompletionShell::Bash, Some(&path)).unwrap();
    let script = std::fs::read_to_string(path).unwrap();
    assert!(script.contains("tandem"));

    let cli = Cli::try_parse_from(["tandem", "completions", "powershell"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Completions {
            shell: CompletionShell::PowerShell,
            output: None
        }
    ));
}
