use crate::cli::MessageCommands;
use crate::commands::common::{
    format_message_lines, message_to_item, open_engine, resolve_text_input, EngineContext,
    MessageListItem,
};
use crate::error::CliError;

pub async fn run_message(
    command: MessageCommands,
    context: &EngineContext,
) -> Result<(), CliError> {
    let engine = open_engine(context).await?;
    match command {
        MessageCommands::Queue { recipient, body } => {
            let body = resolve_text_input(&body)?.ok_or(CliError::EmptyBody)?;
            let message = engine.queue_message(recipient, body).await?;
            println!("{}", message.id);
        }
        MessageCommands::List { limit, json } => {
            let messages = engine
                .list_messages()
                .into_iter()
                .take(limit)
                .collect::<Vec<_>>();
            if json {
                let items = messages
                    .iter()
                    .map(message_to_item)
                    .collect::<Vec<MessageListItem>>();
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if messages.is_empty() {
                println!("No messages queued.");
            } else {
                for line in format_message_lines(&messages) {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}
