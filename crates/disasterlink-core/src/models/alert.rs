//! SOS alert model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{AlertId, SyncState};
use crate::error::{Error, Result};

/// Alert urgency, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(Error::InvalidInput(format!("unknown priority: {other}"))),
        }
    }
}

/// Alert lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
    Cancelled,
}

impl AlertStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the person raising the alert is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Location {
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            address: None,
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = crate::util::normalize_text_option(Some(address.into()));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::InvalidInput(format!(
                "latitude out of range: {}",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::InvalidInput(format!(
                "longitude out of range: {}",
                self.lng
            )));
        }
        Ok(())
    }
}

/// An SOS alert as the UI sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    /// Client-generated identifier
    pub id: AlertId,
    /// What the sender needs
    pub message: String,
    /// Where the sender is
    pub location: Location,
    pub priority: Priority,
    pub status: AlertStatus,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local or remote change (Unix ms)
    pub updated_at: i64,
    /// Set iff `status == Resolved` (Unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    /// Last authoritative version seen from the remote authority
    #[serde(skip)]
    pub remote_version: Option<i64>,
    #[serde(skip)]
    pub sync_state: SyncState,
}

impl AlertRecord {
    /// Create a new active alert in `Pending` sync state
    #[must_use]
    pub fn new(message: impl Into<String>, location: Location, priority: Priority) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: AlertId::new(),
            message: message.into(),
            location,
            priority,
            status: AlertStatus::Active,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            remote_version: None,
            sync_state: SyncState::Pending,
        }
    }

    /// Mark the alert resolved. Returns `false` when it already was.
    pub fn resolve(&mut self, now: i64) -> Result<bool> {
        match self.status {
            AlertStatus::Active => {
                self.status = AlertStatus::Resolved;
                self.resolved_at = Some(now);
                self.updated_at = now;
                Ok(true)
            }
            AlertStatus::Resolved => Ok(false),
            AlertStatus::Cancelled => Err(Error::InvalidTransition(format!(
                "alert {} is cancelled and cannot be resolved",
                self.id
            ))),
        }
    }

    /// Cancel the alert. Returns `false` when it already was.
    pub fn cancel(&mut self, now: i64) -> Result<bool> {
        match self.status {
            AlertStatus::Active => {
                self.status = AlertStatus::Cancelled;
                self.updated_at = now;
                Ok(true)
            }
            AlertStatus::Cancelled => Ok(false),
            AlertStatus::Resolved => Err(Error::InvalidTransition(format!(
                "alert {} is resolved and cannot be cancelled",
                self.id
            ))),
        }
    }

    /// Change the priority of an active alert. Returns `false` when unchanged.
    pub fn set_priority(&mut self, priority: Priority, now: i64) -> Result<bool> {
        if self.status != AlertStatus::Active {
            return Err(Error::InvalidTransition(format!(
                "alert {} is {} and its priority is frozen",
                self.id, self.status
            )));
        }
        if self.priority == priority {
            return Ok(false);
        }
        self.priority = priority;
        self.updated_at = now;
        Ok(true)
    }

    /// Check field ranges and the `resolved_at` invariant
    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(Error::InvalidInput(
                "alert message cannot be empty".to_string(),
            ));
        }
        self.location.validate()?;
        if self.resolved_at.is_some() != (self.status == AlertStatus::Resolved) {
            return Err(Error::InvalidInput(format!(
                "alert {} has resolved_at inconsistent with status {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Whether two versions describe the same alert state, ignoring
    /// timestamps and sync bookkeeping.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.message == other.message
            && self.location == other.location
            && self.priority == other.priority
            && self.status == other.status
            && self.resolved_at.is_some() == other.resolved_at.is_some()
    }

    /// First line of the message, truncated to `max_len` characters
    #[must_use]
    pub fn title_preview(&self, max_len: usize) -> String {
        self.message
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take(max_len)
            .collect()
    }
}
