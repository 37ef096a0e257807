use serde_json::Value;
use tandem_core::coordinator::{CycleOutcome, CycleReport};
use tandem_core::{Conflict, ConflictId, Resolution, SyncSession, SyncState, SyncStatus};

use crate::cli::{ResolveStrategy, SyncCommands};
use crate::commands::common::{format_timestamp, parse_id, payload_preview, print_json};
use crate::error::CliError;

pub async fn run_sync(session: &SyncSession, command: Option<SyncCommands>) -> Result<(), CliError> {
    match command.unwrap_or(SyncCommands::Run) {
        SyncCommands::Run => run_sync_cycle(session).await,
        SyncCommands::Status { json } => run_sync_status(&session.status(), json),
        SyncCommands::Conflicts { history, json } => run_sync_conflicts(session, history, json),
        SyncCommands::Resolve {
            conflict_id,
            strategy,
            payload,
        } => run_sync_resolve(session, &conflict_id, strategy, payload.as_deref()),
    }
}

async fn run_sync_cycle(session: &SyncSession) -> Result<(), CliError> {
    let report = session.sync_now().await?;
    println!("{}", describe_cycle(&report, session.status().pending_operations));
    Ok(())
}

pub fn describe_cycle(report: &CycleReport, pending: usize) -> String {
    match report.outcome {
        CycleOutcome::Completed => format!(
            "Sync completed: {} pushed, {} failed, {} conflicts, {} pulled",
            report.pushed, report.failed, report.conflicts, report.pulled
        ),
        CycleOutcome::Offline => {
            format!("Remote store unreachable; {pending} change(s) stay queued")
        }
        CycleOutcome::Disabled => {
            "Device is not registered; sync stays disabled until registration succeeds".to_string()
        }
    }
}

fn run_sync_status(status: &SyncStatus, as_json: bool) -> Result<(), CliError> {
    if as_json {
        return print_json(status);
    }

    println!("state:     {}", state_label(status.state));
    println!("online:    {}", status.is_online);
    println!("pending:   {}", status.pending_operations);
    println!("conflicts: {}", status.conflicts);
    println!(
        "last sync: {}",
        status
            .last_sync_at
            .map_or_else(|| "never".to_string(), format_timestamp)
    );
    Ok(())
}

pub const fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Offline => "offline",
        SyncState::Syncing => "syncing",
        SyncState::Synced => "synced",
        SyncState::Error => "error",
        SyncState::Disabled => "disabled",
    }
}

fn run_sync_conflicts(session: &SyncSession, history: bool, as_json: bool) -> Result<(), CliError> {
    let conflicts = if history {
        session.conflicts().history()?
    } else {
        session.conflicts().active()?
    };

    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let outcome = conflict.resolution.as_ref().map_or_else(
                || "awaiting".to_string(),
                |resolution| resolution.strategy().to_string(),
            );
            format!(
                "{}  {}  {:<11}  {}  local={} remote={}",
                conflict.conflict_id,
                format_timestamp(conflict.resolved_at.unwrap_or(conflict.detected_at)),
                outcome,
                conflict.key(),
                payload_preview(conflict.local_payload.as_ref(), 32),
                payload_preview(conflict.remote_payload.as_ref(), 32),
            )
        })
        .collect()
}

fn run_sync_resolve(
    session: &SyncSession,
    conflict_id: &str,
    strategy: ResolveStrategy,
    payload: Option<&str>,
) -> Result<(), CliError> {
    let conflict_id = parse_id::<ConflictId>(conflict_id)?;
    let resolution = resolution_for(strategy, payload)?;
    let conflict = session.resolve_conflict(&conflict_id, resolution)?;
    println!("Resolved {} ({})", conflict.key(), conflict.state);
    Ok(())
}

pub fn resolution_for(
    strategy: ResolveStrategy,
    payload: Option<&str>,
) -> Result<Resolution, CliError> {
    match strategy {
        ResolveStrategy::KeepLocal => Ok(Resolution::KeepLocal),
        ResolveStrategy::KeepRemote => Ok(Resolution::KeepRemote),
        ResolveStrategy::Merged => {
            let raw = payload.ok_or(CliError::MissingMergedPayload)?;
            Ok(Resolution::Merged(serde_json::from_str::<Value>(raw.trim())?))
        }
    }
}
