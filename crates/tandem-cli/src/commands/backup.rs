use tandem_core::models::{BackupId, BackupReason, BackupSummary};
use tandem_core::SyncSession;

use crate::cli::BackupCommands;
use crate::commands::common::{format_timestamp, parse_id, print_json};
use crate::error::CliError;

pub async fn run_backup(session: &SyncSession, command: BackupCommands) -> Result<(), CliError> {
    match command {
        BackupCommands::Create => {
            let backup_id = session.backups().create_backup(BackupReason::Manual)?;
            println!("{backup_id}");
        }
        BackupCommands::List { json } => {
            let backups = session.backups().list_backups()?;
            if json {
                return print_json(&backups);
            }
            if backups.is_empty() {
                println!("No backups stored.");
            }
            for line in format_backup_lines(&backups) {
                println!("{line}");
            }
        }
        BackupCommands::Export { backup_id, path } => {
            let backup_id = parse_id::<BackupId>(&backup_id)?;
            session.backups().export_backup(&backup_id, &path)?;
            println!("{}", path.display());
        }
        BackupCommands::Import { path } => {
            let summary = session.backups().import_backup(&path)?;
            println!(
                "Imported {} ({} entities from {})",
                summary.backup_id, summary.entity_count, summary.device_id
            );
        }
        BackupCommands::Restore { backup_id } => {
            let backup_id = parse_id::<BackupId>(&backup_id)?;
            let report = session.restore_backup(&backup_id).await?;
            println!(
                "Restored {} entities from {}",
                report.entities_restored, report.backup_id
            );
            if report.operations_discarded > 0 {
                println!(
                    "Discarded {} unsynced local change(s)",
                    report.operations_discarded
                );
            }
        }
    }
    Ok(())
}

pub fn format_backup_lines(backups: &[BackupSummary]) -> Vec<String> {
    backups
        .iter()
        .map(|backup| {
            let state = backup.consumed_at.map_or_else(
                || "available".to_string(),
                |at| format!("restored {}", format_timestamp(at)),
            );
            format!(
                "{}  {}  {:<13}  {:>5} entities  {}",
                backup.backup_id,
                format_timestamp(backup.created_at),
                backup.reason.as_str(),
                backup.entity_count,
                state
            )
        })
        .collect()
}
