//! disasterlink-core - Core library for DisasterLink
//!
//! This crate contains the alert and message models, the durable local
//! ledger, and the offline-first sync engine used by every DisasterLink
//! front end (CLI, reference server, embedding apps).

pub mod backoff;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use config::EngineConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use models::{
    AlertId, AlertRecord, AlertStatus, Location, MessageId, MessageStatus, Priority,
    QueuedMessage, SyncConflict, SyncState,
};
pub use shutdown::ShutdownSignal;
pub use state::EngineStatus;
pub use store::{StateChange, Subscription};
pub use sync::{DrainResult, HttpRemote, InMemoryAuthority, RemoteAuthority};
