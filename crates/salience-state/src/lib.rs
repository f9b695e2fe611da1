//! Salience-State: persistence for the salience engine
//!
//! This crate owns every byte the engine writes: the append-only salience and
//! impulse ledgers, the layer run audit log and the insight store.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only integrity, derived balances and query pagination.
//!
//! ## Key Components
//!
//! - `LedgerStore`: transaction log; balances are sums, never stored
//! - `LayerRunStore`: one record per layer execution, finalized once
//! - `InsightStore`: immutable conclusions with a quarantine flag
//! - `SurrealStores`: SurrealDB implementations sharing one connection
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{connect, StoreConfig};
pub use storage_traits::{
    aggregate_balances, EntryQuery, InsightQuery, InsightRecord, InsightStore, LayerRunRecord,
    LayerRunStore, LedgerEntry, LedgerStore, ModelCallRecord, NewEntry, RunQuery, RunStatus,
    StorageResult, TopicBalance, TopicFailure, TransactionType, Valence,
};
pub use surreal_store::{SurrealInsightStore, SurrealLayerRunStore, SurrealLedgerStore, SurrealStores};

/// Result type for salience-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
