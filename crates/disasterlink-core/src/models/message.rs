//! Queued outbound message model

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{MessageId, SyncState};
use crate::error::{Error, Result};

/// Delivery status of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message waiting for connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: MessageId,
    /// Phone number, email or contact handle
    pub recipient: String,
    pub body: String,
    pub status: MessageStatus,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Set iff `status == Sent` (Unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
    /// Failed send attempts so far
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip)]
    pub remote_version: Option<i64>,
    #[serde(skip)]
    pub sync_state: SyncState,
}

impl QueuedMessage {
    /// Create a new queued message
    #[must_use]
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            recipient: recipient.into(),
            body: body.into(),
            status: MessageStatus::Queued,
            created_at: chrono::Utc::now().timestamp_millis(),
            sent_at: None,
            attempts: 0,
            last_error: None,
            remote_version: None,
            sync_state: SyncState::Pending,
        }
    }

    /// A send attempt has started
    pub fn mark_sending(&mut self) {
        if self.status != MessageStatus::Sent {
            self.status = MessageStatus::Sending;
        }
    }

    /// A send attempt failed; the only place `attempts` grows
    pub fn record_send_failure(&mut self, error: impl Into<String>) {
        self.status = MessageStatus::Failed;
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// The remote authority delivered the message
    pub fn mark_sent(&mut self, sent_at: i64) {
        self.status = MessageStatus::Sent;
        self.sent_at = Some(sent_at);
        self.last_error = None;
    }

    /// Check required fields and the `sent_at` invariant
    pub fn validate(&self) -> Result<()> {
        if self.recipient.trim().is_empty() {
            return Err(Error::InvalidInput(
                "message recipient cannot be empty".to_string(),
            ));
        }
        if self.body.trim().is_empty() {
            return Err(Error::InvalidInput("message body cannot be empty".to_string()));
        }
        if self.sent_at.is_some() != (self.status == MessageStatus::Sent) {
            return Err(Error::InvalidInput(format!(
                "message {} has sent_at inconsistent with status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Whether two versions carry the same outbound content
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id && self.recipient == other.recipient && self.body == other.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_queued() {
        let message = QueuedMessage::new("+44 7700 900123", "Safe at the shelter");
        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(message.attempts, 0);
        assert!(message.sent_at.is_none());
        message.validate().unwrap();
    }

    #[test]
    fn attempts_only_grow_on_failure() {
        let mut message = QueuedMessage::new("mum", "Phone dying, will call later");
        message.mark_sending();
        assert_eq!(message.attempts, 0);
        message.record_send_failure("timed out");
        assert_eq!(message.attempts, 1);
        assert_eq!(message.status, MessageStatus::Failed);
        message.mark_sending();
        message.mark_sent(42);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.sent_at, Some(42));
        assert!(message.last_error.is_none());
        message.validate().unwrap();
    }

    #[test]
    fn sent_message_stays_sent() {
        let mut message = QueuedMessage::new("dad", "ok");
        message.mark_sent(1);
        message.mark_sending();
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn validate_rejects_blank_fields() {
        assert!(QueuedMessage::new(" ", "body").validate().is_err());
        assert!(QueuedMessage::new("dad", "\n").validate().is_err());
    }
}
