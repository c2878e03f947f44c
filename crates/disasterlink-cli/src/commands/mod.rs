pub mod alert;
pub mod common;
pub mod completions;
pub mod config;
pub mod conflicts;
pub mod message;
pub mod status;
pub mod sync;
pub mod watch;
