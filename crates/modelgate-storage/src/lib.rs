//! Persistence for the gateway: sea-orm entities, snapshot loading for the
//! in-memory registries, write-through mutations, and the batched
//! request-log writer.
//!
//! Runtime reads never hit the database; request tasks work from published
//! snapshots and only mutations and log rows come back here.

pub mod bus;
pub mod crypto;
pub mod entities;
pub mod store;

pub use bus::{LogBus, LogBusConfig, LogRecord};
pub use crypto::SecretCipher;
pub use store::{Storage, StorageError, StorageResult, StorageSnapshot};
