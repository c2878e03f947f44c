use crate::cli::ConflictCommands;
use crate::commands::common::{
    format_sync_conflict_lines, open_engine, sync_conflict_to_item, EngineContext,
    SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_conflicts(
    command: ConflictCommands,
    context: &EngineContext,
) -> Result<(), CliError> {
    let engine = open_engine(context).await?;
    match command {
        ConflictCommands::List { limit, all, json } => {
            let conflicts = if all {
                engine.conflict_history(limit).await?
            } else {
                engine.list_conflicts().into_iter().take(limit).collect()
            };

            if json {
                let items = conflicts
                    .iter()
                    .map(sync_conflict_to_item)
                    .collect::<Vec<SyncConflictItem>>();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if conflicts.is_empty() {
                println!("No sync conflicts recorded.");
            } else {
                for line in format_sync_conflict_lines(&conflicts) {
                    println!("{line}");
                }
            }
        }
        ConflictCommands::Dismiss { id } => {
            let conflict = engine.dismiss_conflict(id).await?;
            println!("Dismissed conflict #{} on {}", conflict.id, conflict.entity_id);
        }
    }
    Ok(())
}
