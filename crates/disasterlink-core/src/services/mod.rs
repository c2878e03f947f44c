//! Services shared across clients.

mod local_store;

pub use local_store::{Acknowledgment, LocalStore, Settled, Settlement};
