use disasterlink_core::{AlertStatus, MessageStatus, SyncState};
use serde::Serialize;

use crate::commands::common::{format_timestamp, open_engine, Engine, EngineContext};
use crate::error::CliError;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub db_path: String,
    pub remote_url: Option<String>,
    pub remote_reachable: Option<bool>,
    pub pending_changes: usize,
    pub active_alerts: usize,
    pub unsynced_alerts: usize,
    pub queued_messages: usize,
    pub failed_messages: usize,
    pub open_conflicts: usize,
    pub last_sync_at: Option<i64>,
}

pub async fn run_status(as_json: bool, context: &EngineContext) -> Result<(), CliError> {
    let engine = open_engine(context).await?;
    let remote_reachable = if context.remote_url.is_some() {
        Some(engine.remote().health().await.is_ok())
    } else {
        None
    };
    let report = build_status_report(&engine, context, remote_reachable).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_status_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn build_status_report(
    engine: &Engine,
    context: &EngineContext,
    remote_reachable: Option<bool>,
) -> Result<StatusReport, CliError> {
    let alerts = engine.list_alerts();
    let messages = engine.list_messages();
    let meta = engine.sync_meta().await?;

    Ok(StatusReport {
        db_path: context.db_path.display().to_string(),
        remote_url: context.remote_url.clone(),
        remote_reachable,
        pending_changes: engine.pending_count().await?,
        active_alerts: alerts
            .iter()
            .filter(|alert| alert.status == AlertStatus::Active)
            .count(),
        unsynced_alerts: alerts
            .iter()
            .filter(|alert| alert.sync_state != SyncState::Synced)
            .count(),
        queued_messages: messages
            .iter()
            .filter(|message| {
                matches!(message.status, MessageStatus::Queued | MessageStatus::Sending)
            })
            .count(),
        failed_messages: messages
            .iter()
            .filter(|message| message.status == MessageStatus::Failed)
            .count(),
        open_conflicts: engine.list_conflicts().len(),
        last_sync_at: meta.last_drain_at,
    })
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let connectivity = match (report.remote_url.as_deref(), report.remote_reachable) {
        (None, _) => "no remote configured".to_string(),
        (Some(url), Some(true)) => format!("online ({url})"),
        (Some(url), _) => format!("offline ({url} unreachable)"),
    };
    let last_sync = report
        .last_sync_at
        .map_or_else(|| "never".to_string(), format_timestamp);

    vec![
        format!("ledger:     {}", report.db_path),
        format!("remote:     {connectivity}"),
        format!("pending:    {} change(s)", report.pending_changes),
        format!(
            "alerts:     {} active, {} not yet synced",
            report.active_alerts, report.unsynced_alerts
        ),
        format!(
            "messages:   {} waiting, {} failed",
            report.queued_messages, report.failed_messages
        ),
        format!("conflicts:  {}", report.open_conflicts),
        format!("last sync:  {last_sync}"),
    ]
}
