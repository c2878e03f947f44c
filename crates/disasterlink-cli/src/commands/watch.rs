use std::sync::Arc;
use std::time::Duration;

use crate::commands::common::{describe_change, open_sync_engine, EngineContext};
use crate::error::CliError;

/// Run the background driver until Ctrl-C, probing `/healthz` for connectivity.
pub async fn run_watch(interval_secs: u64, context: &EngineContext) -> Result<(), CliError> {
    let engine = open_sync_engine(context).await?;
    let remote = Arc::clone(engine.remote());

    let initially_online = remote.health().await.is_ok();
    let monitor = engine.spawn_monitor(initially_online);
    let _subscription = engine.on_state_change(|change| println!("{}", describe_change(change)));
    engine.start(&monitor)?;

    println!(
        "Watching {} ({}), Ctrl-C to stop",
        remote.base_url(),
        if initially_online { "online" } else { "offline" }
    );

    let mut probe = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = probe.tick() => {
                let reachable = remote.health().await.is_ok();
                tracing::debug!(reachable, "Connectivity probe");
                monitor.report(reachable);
            }
        }
    }

    engine.shutdown().await;
    println!("{} change(s) still pending", engine.pending_count().await?);
    Ok(())
}
