use tandem_core::models::OptimisticUpdate;
use tandem_core::{OpId, SyncSession};

use crate::cli::QueueCommands;
use crate::commands::common::{parse_id, print_json};
use crate::error::CliError;

pub fn run_queue(
    session: &SyncSession,
    command: Option<QueueCommands>,
    include_failed: bool,
    as_json: bool,
) -> Result<(), CliError> {
    match command {
        Some(QueueCommands::Retry { op_id }) => {
            let op_id = parse_id::<OpId>(&op_id)?;
            let update = session.updates().retry(&op_id)?;
            println!("{}", update.id);
            Ok(())
        }
        Some(QueueCommands::Dismiss { op_id }) => {
            let op_id = parse_id::<OpId>(&op_id)?;
            session.updates().dismiss(&op_id)?;
            println!("Dismissed {op_id}");
            Ok(())
        }
        None => list_updates(session, include_failed, as_json),
    }
}

fn list_updates(session: &SyncSession, include_failed: bool, as_json: bool) -> Result<(), CliError> {
    let updates = if include_failed {
        session.updates().list()?
    } else {
        session.updates().get_pending_updates()?
    };

    if as_json {
        return print_json(&updates);
    }
    if updates.is_empty() {
        println!("No unconfirmed changes.");
        return Ok(());
    }
    for line in format_update_lines(&updates) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_update_lines(updates: &[OptimisticUpdate]) -> Vec<String> {
    updates
        .iter()
        .map(|update| {
            let key = format!("{}/{}", update.entity_type, update.entity_id);
            let state = if update.conflict_id.is_some() {
                "conflict"
            } else if update.is_pending {
                "pending"
            } else {
                "failed"
            };
            let kind = update.kind.as_str();
            let mut line = format!("{}  {kind:<6}  {key:<32}  {state}", update.id);
            if let Some(error) = &update.error {
                line.push_str(&format!("  ({error})"));
            }
            line
        })
        .collect()
}
