//! Remote authority contract and wire envelope.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{AlertRecord, QueuedMessage};

/// A record as the remote authority holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned<T> {
    pub record: T,
    /// Authoritative version, strictly increasing across the authority
    pub version: i64,
    /// When the authority last changed the record (Unix ms)
    pub updated_at: i64,
}

impl<T> Versioned<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            record: f(self.record),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Ordering hint attached to every push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalStamp {
    /// Ledger sequence of the pushed entry
    pub sequence: i64,
    /// When this push was issued (Unix ms)
    pub issued_at: i64,
}

/// Body of `PUT /alerts/{id}` and `PUT /messages/{id}`.
///
/// The record's `id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest<T> {
    pub record: T,
    /// Version the local change was based on, `None` for a first push
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    pub causal_stamp: CausalStamp,
}

/// Successful answers to a push
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome<T> {
    /// Stored (or already stored with identical content)
    Accepted(Versioned<T>),
    /// The authority holds a newer, different version
    Conflict(Versioned<T>),
}

impl<T> PushOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PushOutcome<U> {
        match self {
            Self::Accepted(stored) => PushOutcome::Accepted(stored.map(f)),
            Self::Conflict(current) => PushOutcome::Conflict(current.map(f)),
        }
    }
}

/// One page of `GET /alerts/since`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPage {
    pub records: Vec<Versioned<AlertRecord>>,
    /// Cursor for the next call; unchanged when nothing is newer
    pub cursor: Option<String>,
}

/// The server the reconciler drains against.
///
/// Transport failures and timeouts are `Error::NetworkUnavailable`; refusals
/// that retrying cannot fix are `Error::RemoteRejected`.
pub trait RemoteAuthority: Send + Sync + 'static {
    /// Idempotent upsert of an alert
    fn put_alert(
        &self,
        request: PushRequest<AlertRecord>,
    ) -> impl Future<Output = Result<PushOutcome<AlertRecord>>> + Send;

    /// Idempotent upsert of a message
    fn put_message(
        &self,
        request: PushRequest<QueuedMessage>,
    ) -> impl Future<Output = Result<PushOutcome<QueuedMessage>>> + Send;

    /// Alerts changed after `cursor`, oldest first
    fn alerts_since(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> impl Future<Output = Result<AlertPage>> + Send;
}

impl<R: RemoteAuthority> RemoteAuthority for Arc<R> {
    fn put_alert(
        &self,
        request: PushRequest<AlertRecord>,
    ) -> impl Future<Output = Result<PushOutcome<AlertRecord>>> + Send {
        (**self).put_alert(request)
    }

    fn put_message(
        &self,
        request: PushRequest<QueuedMessage>,
    ) -> impl Future<Output = Result<PushOutcome<QueuedMessage>>> + Send {
        (**self).put_message(request)
    }

    fn alerts_since(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> impl Future<Output = Result<AlertPage>> + Send {
        (**self).alerts_since(cursor, limit)
    }
}
