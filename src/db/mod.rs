//! Persistence: SQLite pool and the named bridge state documents.

pub mod database;
pub mod state_store;

pub use database::{Database, Pool};
pub use state_store::{LoadOutcome, StateStore, StoreError, VersionedDocument};
