use crate::commands::common::{
    format_drain_summary, open_sync_engine, DrainSummary, EngineContext,
};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, context: &EngineContext) -> Result<(), CliError> {
    let engine = open_sync_engine(context).await?;
    let result = engine.drain_now().await?;
    let open_conflicts = engine.list_conflicts().len();

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&DrainSummary::from(result))?
        );
        return Ok(());
    }

    if result.is_success() {
        println!("Sync completed: {}", format_drain_summary(&result));
    } else {
        println!("Sync incomplete: {}", format_drain_summary(&result));
    }
    if open_conflicts > 0 {
        println!("{open_conflicts} conflict(s) need attention, see `dlink conflicts list`.");
    }
    Ok(())
}
