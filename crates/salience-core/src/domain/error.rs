//! Domain-level error taxonomy for the salience engine.

use salience_state::StorageError;

use crate::model::ModelError;

/// Errors produced while parsing or constructing topic keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic key must not be empty")]
    Empty,

    #[error("malformed topic key: {0}")]
    Malformed(String),

    #[error("{0} identifier must not be empty")]
    EmptyIdentifier(&'static str),

    #[error("{kind} identifier {value:?} must not contain ':'")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("pair members must differ: {0}")]
    SelfPair(String),

    #[error("pair members must be sorted: {0}")]
    UnsortedPair(String),

    #[error("unknown topic category: {0}")]
    UnknownCategory(String),
}

/// Invariant violations on insight construction. Never persisted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InsightError {
    #[error("insight must carry at least one valence dimension")]
    NoValence,

    #[error("strength_adjustment {0} outside [0.1, 10.0]")]
    StrengthAdjustmentOutOfRange(f64),

    #[error("{field} {value} outside [0.0, 1.0]")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("insight content must not be empty")]
    EmptyContent,

    #[error("salience at creation must be finite and non-negative, got {0}")]
    InvalidSalience(f64),
}

/// Configuration errors. Raised at startup or registration, never defaulted.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown model profile: {0}")]
    UnknownProfile(String),

    #[error("circular model alias chain: {}", .0.join(" -> "))]
    CircularAlias(Vec<String>),

    #[error("unknown model provider {provider} for profile {profile}")]
    UnknownProvider { profile: String, provider: String },

    #[error("invalid schedule for layer {layer}: {expression:?}: {reason}")]
    InvalidSchedule {
        layer: String,
        expression: String,
        reason: String,
    },

    #[error("invalid budget share for {group}: {share}")]
    InvalidShare { group: String, share: f64 },

    #[error("invalid layer {layer}: {reason}")]
    InvalidLayer { layer: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Salience engine errors.
#[derive(Debug, thiserror::Error)]
pub enum SalienceError {
    #[error("topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("insight error: {0}")]
    Insight(#[from] InsightError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("amount must be finite and positive, got {0}")]
    InvalidAmount(f64),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    #[error("step {step} failed: {reason}")]
    Step { step: String, reason: String },

    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("maintenance operation {0} is disabled")]
    MaintenanceDisabled(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SalienceError {
    pub fn step(step: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Step {
            step: step.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for salience domain operations.
pub type Result<T> = std::result::Result<T, SalienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_alias_lists_chain() {
        let err = ConfigError::CircularAlias(vec!["fast".into(), "cheap".into(), "fast".into()]);
        assert_eq!(err.to_string(), "circular model alias chain: fast -> cheap -> fast");
    }

    #[test]
    fn topic_error_converts() {
        let err: SalienceError = TopicError::Malformed("x".into()).into();
        assert!(err.to_string().contains("malformed topic key"));
    }

    #[test]
    fn storage_error_converts() {
        let err: SalienceError = StorageError::not_found("insight", "abc").into();
        assert!(err.to_string().contains("insight not found: abc"));
    }
}
