//! Insight construction and validation.
//!
//! Every insight the engine persists goes through [`InsightDraft::build`],
//! which enforces the invariants before a record exists.

use chrono::{DateTime, Utc};
use salience_state::{InsightRecord, Valence};
use serde::{Deserialize, Serialize};

use super::error::InsightError;
use super::topic::Topic;

pub const MIN_STRENGTH_ADJUSTMENT: f64 = 0.1;
pub const MAX_STRENGTH_ADJUSTMENT: f64 = 10.0;

/// Unvalidated insight fields, as produced by a layer's parse step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightDraft {
    pub topic: Topic,
    pub category: String,
    pub content: String,
    pub layer_run_id: String,
    pub salience_spent: f64,
    pub salience_at_creation: f64,
    pub strength_adjustment: f64,
    pub confidence: f64,
    pub importance: f64,
    pub novelty: f64,
    pub valence: Valence,
    pub supersedes: Option<String>,
    pub conflicts_with: Vec<String>,
    pub synthesis_source_ids: Vec<String>,
}

impl InsightDraft {
    pub fn new(topic: Topic, category: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            topic,
            category: category.into(),
            content: content.into(),
            layer_run_id: String::new(),
            salience_spent: 0.0,
            salience_at_creation: 0.0,
            strength_adjustment: 1.0,
            confidence: 0.5,
            importance: 0.5,
            novelty: 0.5,
            valence: Valence::default(),
            supersedes: None,
            conflicts_with: Vec::new(),
            synthesis_source_ids: Vec::new(),
        }
    }

    pub fn with_valence(mut self, valence: Valence) -> Self {
        self.valence = valence;
        self
    }

    pub fn with_strength_adjustment(mut self, adjustment: f64) -> Self {
        self.strength_adjustment = adjustment;
        self
    }

    pub fn with_salience(mut self, at_creation: f64, spent: f64) -> Self {
        self.salience_at_creation = at_creation;
        self.salience_spent = spent;
        self
    }

    pub fn in_run(mut self, layer_run_id: impl Into<String>) -> Self {
        self.layer_run_id = layer_run_id.into();
        self
    }

    pub fn superseding(mut self, insight_id: impl Into<String>) -> Self {
        self.supersedes = Some(insight_id.into());
        self
    }

    /// Check every invariant without building.
    pub fn validate(&self) -> Result<(), InsightError> {
        if self.content.trim().is_empty() {
            return Err(InsightError::EmptyContent);
        }
        if self.valence.is_empty() {
            return Err(InsightError::NoValence);
        }
        for (name, value) in self.valence.present() {
            unit("valence", name, value)?;
        }
        let adj = self.strength_adjustment;
        if !(MIN_STRENGTH_ADJUSTMENT..=MAX_STRENGTH_ADJUSTMENT).contains(&adj) {
            return Err(InsightError::StrengthAdjustmentOutOfRange(adj));
        }
        unit("confidence", "confidence", self.confidence)?;
        unit("importance", "importance", self.importance)?;
        unit("novelty", "novelty", self.novelty)?;
        if !self.salience_at_creation.is_finite() || self.salience_at_creation < 0.0 {
            return Err(InsightError::InvalidSalience(self.salience_at_creation));
        }
        Ok(())
    }

    /// Validate and stamp a new insight. `strength = strength_adjustment × salience_at_creation`.
    pub fn build(self, created_at: DateTime<Utc>) -> Result<InsightRecord, InsightError> {
        self.validate()?;
        Ok(InsightRecord {
            id: uuid::Uuid::new_v4().to_string(),
            topic_key: self.topic.key(),
            category: self.category,
            content: self.content,
            created_at,
            layer_run_id: self.layer_run_id,
            salience_spent: self.salience_spent,
            salience_at_creation: self.salience_at_creation,
            strength: self.strength_adjustment * self.salience_at_creation,
            strength_adjustment: self.strength_adjustment,
            confidence: self.confidence,
            importance: self.importance,
            novelty: self.novelty,
            valence: self.valence,
            supersedes: self.supersedes,
            conflicts_with: self.conflicts_with,
            synthesis_source_ids: self.synthesis_source_ids,
            quarantined: false,
        })
    }
}

fn unit(field: &'static str, name: &'static str, value: f64) -> Result<(), InsightError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(InsightError::OutOfUnitRange {
            field: if field == "valence" { name } else { field },
            value,
        })
    }
}
