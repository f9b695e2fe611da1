//! Salience Core Library
//!
//! The attention economy and its scheduler: observe → earn salience →
//! select under budget → execute a layer → spend → decay → repeat.

pub mod audit;
pub mod config;
pub mod domain;
pub mod executor;
pub mod fakes;
pub mod impulse;
pub mod layer;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod retriever;
pub mod scheduler;
pub mod selector;
pub mod services;
pub mod telemetry;

pub use audit::{AuditSurface, MaintenanceDecay};
pub use config::{
    AuditConfig, BudgetConfig, GroupShares, ImpulseConfig, LedgerConfig, ModelProfileConfig,
    ModelsConfig, ProviderConfig, RetrievalConfig, RetrievalProfile, SalienceConfig,
    SchedulerConfig,
};
pub use domain::{
    BudgetGroup, ConfigError, InsightDraft, InsightError, Relation, Result, SalienceError, Topic,
    TopicCategory, TopicError, MAX_STRENGTH_ADJUSTMENT, MIN_STRENGTH_ADJUSTMENT,
};
pub use executor::{parse_output, ExecutionContext, LayerExecutor};
pub use impulse::ImpulseEngine;
pub use layer::{Condition, DirLayerSource, Layer, LayerSource, StaticLayerSource, Step};
pub use ledger::{DecayReport, EarnOutcome, SalienceLedger, TopicSnapshot};
pub use metrics::METRICS;
pub use model::{
    HttpModelClient, ModelClient, ModelError, ModelRegistry, ModelRequest, ModelResponse,
    ResolvedProfile,
};
pub use retriever::{temporal_marker, FormattedInsight, InsightRetriever};
pub use scheduler::{
    normalize_expression, parse_schedule, JobState, JobStatus, ReflectionScheduler,
    TriggerOutcome,
};
pub use selector::{GroupSelection, ReflectionSelector};
pub use services::{Services, Stores};
pub use telemetry::init_tracing;

pub use salience_state::{
    EntryQuery, InsightQuery, InsightRecord, LayerRunRecord, LedgerEntry, RunQuery, RunStatus,
    TransactionType, Valence,
};

/// Crate version, reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
