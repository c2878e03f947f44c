use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use chrono::Utc;
use disasterlink_core::{
    AlertId, AlertRecord, DrainResult, EngineConfig, HttpRemote, QueuedMessage, StateChange,
    SyncConflict, SyncEngine,
};
use serde::Serialize;

use crate::config_profiles::{normalize_text_option, CliProfilesConfig};
use crate::error::CliError;

/// Where `disasterlink-api` listens by default
pub const DEFAULT_REMOTE_URL: &str = "http://127.0.0.1:8787";

pub type Engine = SyncEngine<HttpRemote>;

/// Ledger location and remote authority resolved from flags, env and profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineContext {
    pub db_path: PathBuf,
    pub remote_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AlertListItem {
    pub id: String,
    pub priority: String,
    pub status: String,
    pub sync_state: String,
    pub message: String,
    pub preview: String,
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub resolved_at: Option<i64>,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct MessageListItem {
    pub id: String,
    pub recipient: String,
    pub preview: String,
    pub status: String,
    pub sync_state: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: String,
    pub winner: String,
    pub strategy: String,
    pub reason: Option<String>,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub dismissed: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DrainSummary {
    pub pushed: usize,
    pub conflicted: usize,
    pub rejected: usize,
    pub failed: usize,
    pub pulled: usize,
    pub interrupted: bool,
}

impl From<DrainResult> for DrainSummary {
    fn from(result: DrainResult) -> Self {
        Self {
            pushed: result.pushed,
            conflicted: result.conflicted,
            rejected: result.rejected,
            failed: result.failed,
            pulled: result.pulled,
            interrupted: result.interrupted,
        }
    }
}

pub fn resolve_context(
    cli_db_path: Option<PathBuf>,
    cli_remote_url: Option<String>,
    profile: Option<&str>,
) -> Result<EngineContext, CliError> {
    let config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile);
    let profile = config.profile(&profile_name).cloned().unwrap_or_default();

    let db_path = match cli_db_path
        .or_else(|| env::var_os("DLINK_DB_PATH").map(PathBuf::from))
        .or(profile.db_path.clone())
    {
        Some(path) => path,
        None => default_db_path()?,
    };
    let remote_url = normalize_text_option(cli_remote_url)
        .or_else(|| normalize_text_option(env::var("DLINK_REMOTE_URL").ok()))
        .or_else(|| profile.remote_url());

    Ok(EngineContext {
        db_path,
        remote_url,
    })
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("disasterlink").join("ledger.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

#[derive(Clone, Copy)]
enum OpenEngineMode {
    Standard,
    RequireRemote,
}

/// Open for local work; the remote is never contacted.
pub async fn open_engine(context: &EngineContext) -> Result<Engine, CliError> {
    open_engine_with_mode(context, OpenEngineMode::Standard).await
}

pub async fn open_sync_engine(context: &EngineContext) -> Result<Engine, CliError> {
    open_engine_with_mode(context, OpenEngineMode::RequireRemote).await
}

async fn open_engine_with_mode(
    context: &EngineContext,
    mode: OpenEngineMode,
) -> Result<Engine, CliError> {
    if let Some(parent) = context.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let remote_url = match (&context.remote_url, mode) {
        (Some(url), _) => url.clone(),
        (None, OpenEngineMode::RequireRemote) => return Err(CliError::RemoteNotConfigured),
        (None, OpenEngineMode::Standard) => DEFAULT_REMOTE_URL.to_string(),
    };

    let mut config = EngineConfig::from_env()?;
    config.db_path = Some(context.db_path.clone());
    config.remote_url = Some(remote_url);
    Ok(SyncEngine::open_http(config).await?)
}

pub fn resolve_alert_id(query: &str, engine: &Engine) -> Result<AlertId, CliError> {
    let query = normalize_identifier(query)?;
    if let Ok(id) = query.parse::<AlertId>() {
        if engine.get_alert(&id).is_some() {
            return Ok(id);
        }
    }

    let matching = engine
        .list_alerts()
        .into_iter()
        .map(|alert| alert.id)
        .filter(|id| id.to_string().starts_with(&query))
        .collect::<Vec<_>>();

    match matching.as_slice() {
        [] => Err(CliError::AlertNotFound(query)),
        [id] => Ok(*id),
        _ => {
            let options = matching
                .iter()
                .take(3)
                .map(|id| short_id(&id.to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousAlertId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyAlertId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_alert_lines(alerts: &[AlertRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    alerts
        .iter()
        .map(|alert| {
            let short_id = short_id(&alert.id.to_string());
            let preview = text_preview(&alert.message, 40);
            let relative_time = format_relative_time(alert.created_at, now_ms);
            format!(
                "{short_id:<13}  {:<8}  {:<9}  {:<8}  {preview:<40}  {relative_time}",
                alert.priority.as_str(),
                alert.status.as_str(),
                alert.sync_state.as_str()
            )
        })
        .collect()
}

pub fn format_alert_detail(alert: &AlertRecord) -> Vec<String> {
    let mut lines = vec![
        format!("id:        {}", alert.id),
        format!("priority:  {}", alert.priority),
        format!("status:    {}", alert.status),
        format!("sync:      {}", alert.sync_state),
        format!("location:  {:.5}, {:.5}", alert.location.lat, alert.location.lng),
    ];
    if let Some(address) = &alert.location.address {
        lines.push(format!("address:   {address}"));
    }
    lines.push(format!("raised:    {}", format_timestamp(alert.created_at)));
    if let Some(resolved_at) = alert.resolved_at {
        lines.push(format!("resolved:  {}", format_timestamp(resolved_at)));
    }
    lines.push(String::new());
    lines.push(alert.message.clone());
    lines
}

pub fn alert_to_item(alert: &AlertRecord) -> AlertListItem {
    let now_ms = Utc::now().timestamp_millis();
    AlertListItem {
        id: alert.id.to_string(),
        priority: alert.priority.as_str().to_string(),
        status: alert.status.as_str().to_string(),
        sync_state: alert.sync_state.as_str().to_string(),
        message: alert.message.clone(),
        preview: text_preview(&alert.message, 80),
        lat: alert.location.lat,
        lng: alert.location.lng,
        address: alert.location.address.clone(),
        created_at: alert.created_at,
        updated_at: alert.updated_at,
        resolved_at: alert.resolved_at,
        relative_time: format_relative_time(alert.created_at, now_ms),
    }
}

pub fn format_message_lines(messages: &[QueuedMessage]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    messages
        .iter()
        .map(|message| {
            let short_id = short_id(&message.id.to_string());
            let recipient = text_preview(&message.recipient, 20);
            let preview = text_preview(&message.body, 40);
            let relative_time = format_relative_time(message.created_at, now_ms);
            let line = format!(
                "{short_id:<13}  {:<7}  {recipient:<20}  {preview:<40}  {relative_time}",
                message.status.as_str()
            );
            match &message.last_error {
                Some(error) if message.attempts > 0 => {
                    format!("{line}  ({} attempts, last: {error})", message.attempts)
                }
                _ => line,
            }
        })
        .collect()
}

pub fn message_to_item(message: &QueuedMessage) -> MessageListItem {
    let now_ms = Utc::now().timestamp_millis();
    MessageListItem {
        id: message.id.to_string(),
        recipient: message.recipient.clone(),
        preview: text_preview(&message.body, 80),
        status: message.status.as_str().to_string(),
        sync_state: message.sync_state.as_str().to_string(),
        attempts: message.attempts,
        last_error: message.last_error.clone(),
        created_at: message.created_at,
        sent_at: message.sent_at,
        relative_time: format_relative_time(message.created_at, now_ms),
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        entity_type: conflict.entity_type.as_str().to_string(),
        entity_id: conflict.entity_id.clone(),
        kind: conflict.kind.as_str().to_string(),
        winner: conflict.winner.as_str().to_string(),
        strategy: conflict.strategy.clone(),
        reason: conflict.reason.clone(),
        detected_at: conflict.detected_at,
        detected_at_iso: format_timestamp(conflict.detected_at),
        dismissed: conflict.dismissed,
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let mut line = format!(
                "{}  #{:<4} {:<8}  winner={:<6}  {}={}",
                format_timestamp(conflict.detected_at),
                conflict.id,
                conflict.kind.as_str(),
                conflict.winner.as_str(),
                conflict.entity_type,
                conflict.entity_id
            );
            if let Some(reason) = &conflict.reason {
                line.push_str(&format!("  {reason}"));
            }
            if conflict.dismissed {
                line.push_str("  (dismissed)");
            }
            line
        })
        .collect()
}

pub fn format_drain_summary(result: &DrainResult) -> String {
    let mut summary = format!(
        "pushed={} conflicted={} rejected={} failed={} pulled={}",
        result.pushed, result.conflicted, result.rejected, result.failed, result.pulled
    );
    if result.interrupted {
        summary.push_str(" (interrupted, pending changes kept for the next sync)");
    }
    summary
}

pub fn describe_change(change: &StateChange) -> String {
    match change {
        StateChange::Alert(alert) => format!(
            "alert {} {} {} [{}]",
            short_id(&alert.id.to_string()),
            alert.priority,
            alert.status,
            alert.sync_state
        ),
        StateChange::Message(message) => format!(
            "message {} to {} {} [{}]",
            short_id(&message.id.to_string()),
            message.recipient,
            message.status,
            message.sync_state
        ),
        StateChange::ConflictRecorded(conflict) => format!(
            "conflict #{} on {} {} ({} kept)",
            conflict.id,
            conflict.entity_type,
            short_id(&conflict.entity_id),
            conflict.winner.as_str()
        ),
        StateChange::ConflictDismissed(id) => format!("conflict #{id} dismissed"),
        StateChange::Status(status) => format!("status {}", status.label()),
    }
}

pub fn text_preview(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

/// Joined arguments, or piped stdin when there are none.
pub fn resolve_text_input(parts: &[String]) -> Result<Option<String>, CliError> {
    if let Some(text) = normalize_content(&parts.join(" ")) {
        return Ok(Some(text));
    }
    read_piped_stdin()
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}
