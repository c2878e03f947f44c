use disasterlink_core::{Location, Priority};

use crate::cli::AlertCommands;
use crate::commands::common::{
    alert_to_item, format_alert_detail, format_alert_lines, open_engine, resolve_alert_id,
    resolve_text_input, AlertListItem, Engine, EngineContext,
};
use crate::error::CliError;

pub async fn run_alert(command: AlertCommands, context: &EngineContext) -> Result<(), CliError> {
    let engine = open_engine(context).await?;
    match command {
        AlertCommands::Create {
            message,
            lat,
            lng,
            address,
            priority,
        } => {
            let mut location = Location::new(lat, lng);
            if let Some(address) = address {
                location = location.with_address(address);
            }
            create_alert(&engine, &message, location, priority.into()).await?;
        }
        AlertCommands::List { limit, json } => list_alerts(&engine, limit, json)?,
        AlertCommands::Show { id, json } => show_alert(&engine, &id, json)?,
        AlertCommands::Resolve { id } => {
            let id = resolve_alert_id(&id, &engine)?;
            let alert = engine.resolve_alert(&id).await?;
            println!("{} {}", alert.id, alert.status);
        }
        AlertCommands::Cancel { id } => {
            let id = resolve_alert_id(&id, &engine)?;
            let alert = engine.cancel_alert(&id).await?;
            println!("{} {}", alert.id, alert.status);
        }
        AlertCommands::Escalate { id, priority } => {
            let id = resolve_alert_id(&id, &engine)?;
            let alert = engine.escalate_alert(&id, priority.into()).await?;
            println!("{} {}", alert.id, alert.priority);
        }
    }
    Ok(())
}

pub async fn create_alert(
    engine: &Engine,
    message_parts: &[String],
    location: Location,
    priority: Priority,
) -> Result<(), CliError> {
    let message = resolve_text_input(message_parts)?.ok_or(CliError::EmptyMessage)?;
    let alert = engine.create_alert(message, location, priority).await?;
    println!("{}", alert.id);
    Ok(())
}

fn list_alerts(engine: &Engine, limit: usize, as_json: bool) -> Result<(), CliError> {
    let alerts = engine
        .list_alerts()
        .into_iter()
        .take(limit)
        .collect::<Vec<_>>();

    if as_json {
        let items = alerts.iter().map(alert_to_item).collect::<Vec<AlertListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if alerts.is_empty() {
        println!("No alerts raised.");
    } else {
        for line in format_alert_lines(&alerts) {
            println!("{line}");
        }
    }
    Ok(())
}

fn show_alert(engine: &Engine, query: &str, as_json: bool) -> Result<(), CliError> {
    let id = resolve_alert_id(query, engine)?;
    let alert = engine
        .get_alert(&id)
        .ok_or_else(|| CliError::AlertNotFound(query.to_string()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&alert_to_item(&alert))?);
    } else {
        for line in format_alert_detail(&alert) {
            println!("{line}");
        }
    }
    Ok(())
}
