use tandem_core::{EntityType, OperationKind, SyncSession};

use crate::commands::common::{
    entity_state, format_entity_lines, format_timestamp, normalize_identifier, print_json,
    resolve_payload,
};
use crate::error::CliError;

/// Create the entity, or update it when it already exists locally
pub fn run_put(
    session: &SyncSession,
    entity_type: EntityType,
    id: &str,
    payload: Option<&str>,
) -> Result<(), CliError> {
    let id = normalize_identifier(id)?;
    let payload = resolve_payload(payload)?;

    let kind = match session.updates().entity(entity_type, &id)? {
        Some(record) if !record.is_deleted() => OperationKind::Update,
        _ => OperationKind::Create,
    };
    let update = session
        .updates()
        .apply(entity_type, &id, kind, Some(payload))?;

    println!("{}", update.id);
    Ok(())
}

pub fn run_delete(session: &SyncSession, entity_type: EntityType, id: &str) -> Result<(), CliError> {
    let id = normalize_identifier(id)?;
    let update = session
        .updates()
        .apply(entity_type, &id, OperationKind::Delete, None)?;

    println!("{}", update.id);
    Ok(())
}

pub fn run_get(
    session: &SyncSession,
    entity_type: EntityType,
    id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let id = normalize_identifier(id)?;
    let record = session
        .updates()
        .entity(entity_type, &id)?
        .ok_or_else(|| CliError::EntityNotFound(format!("{entity_type}/{id}")))?;

    if as_json {
        return print_json(&record);
    }

    println!("{}", record.key());
    println!("  state:    {}", entity_state(&record));
    println!("  version:  {}", record.version);
    println!("  updated:  {}", format_timestamp(record.updated_at));
    match &record.payload {
        Some(payload) => println!("{}", serde_json::to_string_pretty(payload)?),
        None => println!("  (deleted)"),
    }
    Ok(())
}

pub fn run_list(
    session: &SyncSession,
    entity_type: Option<EntityType>,
    as_json: bool,
) -> Result<(), CliError> {
    let records = session.updates().entities(entity_type)?;

    if as_json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No entities cached.");
        return Ok(());
    }
    for line in format_entity_lines(&records) {
        println!("{line}");
    }
    Ok(())
}
