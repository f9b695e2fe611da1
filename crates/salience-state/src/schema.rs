//! Row shapes for the SurrealDB tables
//!
//! Tables:
//! - salience_ledger / impulse_ledger: append-only transaction logs
//! - layer_runs: pipeline execution audit records
//! - insights: persisted conclusions
//!
//! Rows convert to and from the `storage_traits` types at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    InsightRecord, LayerRunRecord, LedgerEntry, ModelCallRecord, TopicFailure, TransactionType,
    Valence,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
pub(crate) mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Ledger entry row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntryRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub entry_id: String,
    pub topic_key: String,
    /// One of the `TransactionType` names ("earn", "spend", ...)
    pub transaction_type: String,
    pub amount: f64,
    pub reason: Option<String>,
    pub source_topic: Option<String>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<&LedgerEntry> for LedgerEntryRow {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: None,
            entry_id: entry.id.clone(),
            topic_key: entry.topic_key.clone(),
            transaction_type: entry.transaction_type.as_str().to_string(),
            amount: entry.amount,
            reason: entry.reason.clone(),
            source_topic: entry.source_topic.clone(),
            pool: entry.pool.clone(),
            created_at: entry.created_at,
        }
    }
}

impl TryFrom<LedgerEntryRow> for LedgerEntry {
    type Error = StorageError;

    fn try_from(row: LedgerEntryRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.entry_id,
            topic_key: row.topic_key,
            transaction_type: row.transaction_type.parse::<TransactionType>()?,
            amount: row.amount,
            reason: row.reason,
            source_topic: row.source_topic,
            pool: row.pool,
            created_at: row.created_at,
        })
    }
}

/// Layer run row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRunRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub layer_name: String,
    pub layer_hash: String,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    /// "running" | "success" | "partial" | "failed" | "dry_run"
    pub status: String,
    pub dry_run: bool,
    pub targets_matched: u64,
    pub targets_processed: u64,
    pub targets_skipped: u64,
    pub insights_created: u64,
    pub errors: Vec<TopicFailure>,
    pub model_calls: Vec<ModelCallRecord>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl From<&LayerRunRecord> for LayerRunRow {
    fn from(run: &LayerRunRecord) -> Self {
        Self {
            id: None,
            run_id: run.run_id.clone(),
            layer_name: run.layer_name.clone(),
            layer_hash: run.layer_hash.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            status: run.status.as_str().to_string(),
            dry_run: run.dry_run,
            targets_matched: run.targets_matched as u64,
            targets_processed: run.targets_processed as u64,
            targets_skipped: run.targets_skipped as u64,
            insights_created: run.insights_created as u64,
            errors: run.errors.clone(),
            model_calls: run.model_calls.clone(),
            total_tokens: run.total_tokens,
            total_cost_usd: run.total_cost_usd,
            provider: run.provider.clone(),
            model: run.model.clone(),
        }
    }
}

impl TryFrom<LayerRunRow> for LayerRunRecord {
    type Error = StorageError;

    fn try_from(row: LayerRunRow) -> Result<Self, Self::Error> {
        Ok(LayerRunRecord {
            run_id: row.run_id,
            layer_name: row.layer_name,
            layer_hash: row.layer_hash,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status: row.status.parse()?,
            dry_run: row.dry_run,
            targets_matched: row.targets_matched as usize,
            targets_processed: row.targets_processed as usize,
            targets_skipped: row.targets_skipped as usize,
            insights_created: row.insights_created as usize,
            errors: row.errors,
            model_calls: row.model_calls,
            total_tokens: row.total_tokens,
            total_cost_usd: row.total_cost_usd,
            provider: row.provider,
            model: row.model,
        })
    }
}

/// Insight row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub insight_id: String,
    pub topic_key: String,
    pub category: String,
    pub content: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub layer_run_id: String,
    pub salience_spent: f64,
    pub salience_at_creation: f64,
    pub strength: f64,
    pub strength_adjustment: f64,
    pub confidence: f64,
    pub importance: f64,
    pub novelty: f64,
    pub valence: Valence,
    pub supersedes: Option<String>,
    pub conflicts_with: Vec<String>,
    pub synthesis_source_ids: Vec<String>,
    pub quarantined: bool,
}

impl From<InsightRecord> for InsightRow {
    fn from(i: InsightRecord) -> Self {
        Self {
            id: None,
            insight_id: i.id,
            topic_key: i.topic_key,
            category: i.category,
            content: i.content,
            created_at: i.created_at,
            layer_run_id: i.layer_run_id,
            salience_spent: i.salience_spent,
            salience_at_creation: i.salience_at_creation,
            strength: i.strength,
            strength_adjustment: i.strength_adjustment,
            confidence: i.confidence,
            importance: i.importance,
            novelty: i.novelty,
            valence: i.valence,
            supersedes: i.supersedes,
            conflicts_with: i.conflicts_with,
            synthesis_source_ids: i.synthesis_source_ids,
            quarantined: i.quarantined,
        }
    }
}

impl From<InsightRow> for InsightRecord {
    fn from(r: InsightRow) -> Self {
        Self {
            id: r.insight_id,
            topic_key: r.topic_key,
            category: r.category,
            content: r.content,
            created_at: r.created_at,
            layer_run_id: r.layer_run_id,
            salience_spent: r.salience_spent,
            salience_at_creation: r.salience_at_creation,
            strength: r.strength,
            strength_adjustment: r.strength_adjustment,
            confidence: r.confidence,
            importance: r.importance,
            novelty: r.novelty,
            valence: r.valence,
            supersedes: r.supersedes,
            conflicts_with: r.conflicts_with,
            synthesis_source_ids: r.synthesis_source_ids,
            quarantined: r.quarantined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::{NewEntry, RunStatus};

    #[test]
    fn ledger_row_round_trips_transaction_type() {
        let entry = NewEntry::new("user:1", TransactionType::Warm, 5.0).into_entry(Utc::now());
        let row = LedgerEntryRow::from(&entry);
        assert_eq!(row.transaction_type, "warm");
        let back = LedgerEntry::try_from(row).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn ledger_row_with_unknown_type_is_rejected() {
        let entry = NewEntry::new("user:1", TransactionType::Earn, 1.0).into_entry(Utc::now());
        let mut row = LedgerEntryRow::from(&entry);
        row.transaction_type = "mint".into();
        assert!(LedgerEntry::try_from(row).is_err());
    }

    #[test]
    fn run_row_keeps_status() {
        let mut run = LayerRunRecord::start("people", "abc", true);
        run.status = RunStatus::DryRun;
        let row = LayerRunRow::from(&run);
        assert_eq!(row.status, "dry_run");
        let back = LayerRunRecord::try_from(row).unwrap();
        assert_eq!(back.status, RunStatus::DryRun);
    }
}
