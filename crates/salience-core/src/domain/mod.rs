//! Domain models for the salience engine.
//!
//! - `Topic`: typed topic key, parsed once at the boundary
//! - `InsightDraft`: validated construction of persisted insights
//! - error taxonomy shared by every component

pub mod error;
pub mod insight;
pub mod topic;

pub use error::{ConfigError, InsightError, Result, SalienceError, TopicError};
pub use insight::{InsightDraft, MAX_STRENGTH_ADJUSTMENT, MIN_STRENGTH_ADJUSTMENT};
pub use topic::{BudgetGroup, Relation, Topic, TopicCategory};
