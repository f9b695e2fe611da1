//! Storage trait definitions for the salience engine
//!
//! These traits define the persistence boundary:
//! - `LedgerStore`: append-only transaction log keyed by topic
//! - `LayerRunStore`: audit records of layer (pipeline) executions
//! - `InsightStore`: conclusions produced by layer runs
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// LedgerStore: append-only transaction log
// ---------------------------------------------------------------------------

/// Kind of a ledger transaction.
///
/// The salience domain writes everything except `Flood`; the impulse domain
/// writes `Earn`, `Spend`, `Decay`, `Flood` and `Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Earn,
    Spend,
    Reset,
    Retain,
    Decay,
    Propagate,
    Spillover,
    Warm,
    Flood,
}

impl TransactionType {
    pub const ALL: [TransactionType; 9] = [
        TransactionType::Earn,
        TransactionType::Spend,
        TransactionType::Reset,
        TransactionType::Retain,
        TransactionType::Decay,
        TransactionType::Propagate,
        TransactionType::Spillover,
        TransactionType::Warm,
        TransactionType::Flood,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Spend => "spend",
            Self::Reset => "reset",
            Self::Retain => "retain",
            Self::Decay => "decay",
            Self::Propagate => "propagate",
            Self::Spillover => "spillover",
            Self::Warm => "warm",
            Self::Flood => "flood",
        }
    }

    /// Transactions that count as earning activity and restart the idle clock.
    /// Activity observed on the topic itself, as opposed to credit
    /// arriving from a relative or a warm grant.
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Earn | Self::Flood)
    }

    pub fn is_earning(&self) -> bool {
        matches!(
            self,
            Self::Earn | Self::Propagate | Self::Spillover | Self::Warm | Self::Flood
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown transaction type: {s}")))
    }
}

/// An entry about to be appended. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub topic_key: String,
    pub transaction_type: TransactionType,
    pub amount: f64,
    pub reason: Option<String>,
    /// Provenance for propagate/spillover entries.
    pub source_topic: Option<String>,
    /// Named budget pool for ledgers that keep more than one.
    #[serde(default)]
    pub pool: Option<String>,
}

impl NewEntry {
    pub fn new(topic_key: impl Into<String>, transaction_type: TransactionType, amount: f64) -> Self {
        Self {
            topic_key: topic_key.into(),
            transaction_type,
            amount,
            reason: None,
            source_topic: None,
            pool: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_source(mut self, source_topic: impl Into<String>) -> Self {
        self.source_topic = Some(source_topic.into());
        self
    }

    pub fn in_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    /// Structural checks every backend applies before writing.
    pub fn validate(&self) -> StorageResult<()> {
        if self.topic_key.is_empty() {
            return Err(StorageError::InvalidRecord("empty topic key".into()));
        }
        if !self.amount.is_finite() {
            return Err(StorageError::InvalidRecord(format!(
                "non-finite amount for {}",
                self.topic_key
            )));
        }
        let has_source = self.source_topic.is_some();
        let needs_source = matches!(
            self.transaction_type,
            TransactionType::Propagate | TransactionType::Spillover
        );
        if has_source != needs_source {
            return Err(StorageError::InvalidRecord(format!(
                "source_topic is only set on propagate/spillover entries (got {} with source={})",
                self.transaction_type, has_source
            )));
        }
        Ok(())
    }

    /// Stamp the entry with an id and timestamp.
    pub fn into_entry(self, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            topic_key: self.topic_key,
            transaction_type: self.transaction_type,
            amount: self.amount,
            reason: self.reason,
            source_topic: self.source_topic,
            pool: self.pool,
            created_at,
        }
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub topic_key: String,
    pub transaction_type: TransactionType,
    pub amount: f64,
    pub reason: Option<String>,
    pub source_topic: Option<String>,
    #[serde(default)]
    pub pool: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Derived per-topic view over the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicBalance {
    pub topic_key: String,
    /// Sum of all entry amounts for the topic.
    pub balance: f64,
    /// Most recent earning-type entry.
    pub last_earned_at: Option<DateTime<Utc>>,
    /// Most recent decay entry.
    pub last_decayed_at: Option<DateTime<Utc>>,
    /// Most recent entry of any type.
    pub last_activity_at: DateTime<Utc>,
    /// No direct earn yet; the balance came only from propagation,
    /// spillover or warm grants.
    pub provisional: bool,
}

/// Fold entries into per-topic balances, in first-seen topic order.
pub fn aggregate_balances<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Vec<TopicBalance> {
    let mut order: Vec<String> = Vec::new();
    let mut by_topic: HashMap<String, TopicBalance> = HashMap::new();

    for entry in entries {
        let slot = by_topic.entry(entry.topic_key.clone()).or_insert_with(|| {
            order.push(entry.topic_key.clone());
            TopicBalance {
                topic_key: entry.topic_key.clone(),
                balance: 0.0,
                last_earned_at: None,
                last_decayed_at: None,
                last_activity_at: entry.created_at,
                provisional: true,
            }
        });
        slot.balance += entry.amount;
        slot.last_activity_at = slot.last_activity_at.max(entry.created_at);
        if entry.transaction_type.is_direct() {
            slot.provisional = false;
        }
        if entry.transaction_type.is_earning() {
            slot.last_earned_at = Some(
                slot.last_earned_at
                    .map_or(entry.created_at, |t| t.max(entry.created_at)),
            );
        }
        if entry.transaction_type == TransactionType::Decay {
            slot.last_decayed_at = Some(
                slot.last_decayed_at
                    .map_or(entry.created_at, |t| t.max(entry.created_at)),
            );
        }
    }

    order
        .into_iter()
        .filter_map(|k| by_topic.remove(&k))
        .collect()
}

/// Filter + pagination for ledger entry reads. Results are oldest-first.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub topic_key: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub pool: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EntryQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_topic(topic_key: impl Into<String>) -> Self {
        Self {
            topic_key: Some(topic_key.into()),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub fn in_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.topic_key
            .as_ref()
            .map_or(true, |k| &entry.topic_key == k)
            && self
                .transaction_type
                .map_or(true, |t| entry.transaction_type == t)
            && self.pool.as_ref().map_or(true, |p| entry.pool.as_ref() == Some(p))
            && self.since.map_or(true, |s| entry.created_at >= s)
            && self.until.map_or(true, |u| entry.created_at < u)
    }
}

/// Append-only transaction ledger.
///
/// Guarantees:
/// - Entries are never updated or deleted.
/// - `balance(t)` equals the sum of `amount` over every entry for `t`.
/// - `append_all` is atomic: either every entry becomes visible or none does.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one entry and return it as stored.
    async fn append(&self, entry: NewEntry) -> StorageResult<LedgerEntry>;

    /// Append a batch atomically, preserving order.
    async fn append_all(&self, entries: Vec<NewEntry>) -> StorageResult<Vec<LedgerEntry>>;

    /// Read entries matching a query, oldest first.
    async fn entries(&self, query: &EntryQuery) -> StorageResult<Vec<LedgerEntry>>;

    /// Current balance of a topic (0.0 for a topic with no entries).
    async fn balance(&self, topic_key: &str) -> StorageResult<f64>;

    /// Derived view of a single topic, `None` if it has no entries.
    async fn topic_balance(&self, topic_key: &str) -> StorageResult<Option<TopicBalance>>;

    /// Derived view of every topic that has at least one entry.
    async fn balances(&self) -> StorageResult<Vec<TopicBalance>>;
}

// ---------------------------------------------------------------------------
// LayerRunStore: pipeline execution audit records
// ---------------------------------------------------------------------------

/// Status of a layer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    DryRun,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::DryRun => "dry_run",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != Self::Running
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "dry_run" => Ok(Self::DryRun),
            other => Err(StorageError::InvalidRecord(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// A per-topic failure captured during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicFailure {
    pub topic_key: String,
    pub error: String,
}

/// Telemetry for one model invocation, recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCallRecord {
    pub topic_key: String,
    pub profile: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Audit record of one layer execution.
///
/// Created at run start in `Running`, finalized once, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRunRecord {
    pub run_id: String,
    pub layer_name: String,
    /// Content fingerprint of the layer definition that ran.
    pub layer_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub dry_run: bool,
    pub targets_matched: usize,
    pub targets_processed: usize,
    pub targets_skipped: usize,
    pub insights_created: usize,
    pub errors: Vec<TopicFailure>,
    pub model_calls: Vec<ModelCallRecord>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl LayerRunRecord {
    /// Open a new run in `Running` state.
    pub fn start(layer_name: impl Into<String>, layer_hash: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            layer_name: layer_name.into(),
            layer_hash: layer_hash.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            dry_run,
            targets_matched: 0,
            targets_processed: 0,
            targets_skipped: 0,
            insights_created: 0,
            errors: Vec::new(),
            model_calls: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            provider: None,
            model: None,
        }
    }

    /// Fold one model call into the run's aggregates.
    pub fn record_model_call(&mut self, call: ModelCallRecord) {
        self.total_tokens += u64::from(call.prompt_tokens) + u64::from(call.completion_tokens);
        self.total_cost_usd += call.cost_usd;
        if self.provider.is_none() {
            self.provider = Some(call.provider.clone());
            self.model = Some(call.model.clone());
        }
        self.model_calls.push(call);
    }

    pub fn failed_model_calls(&self) -> usize {
        self.model_calls.iter().filter(|c| !c.success).count()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Filter + pagination for run reads. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub layer_name: Option<String>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RunQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_layer(layer_name: impl Into<String>) -> Self {
        Self {
            layer_name: Some(layer_name.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, run: &LayerRunRecord) -> bool {
        self.layer_name
            .as_ref()
            .map_or(true, |n| &run.layer_name == n)
            && self.status.map_or(true, |s| run.status == s)
            && self.since.map_or(true, |s| run.started_at >= s)
    }
}

/// Layer run audit log.
///
/// Guarantees:
/// - A run transitions once: Running → Success | Partial | Failed | DryRun.
/// - Finalized runs are immutable.
#[async_trait]
pub trait LayerRunStore: Send + Sync {
    /// Persist a freshly started run. Fails if the run id already exists.
    async fn create_run(&self, run: &LayerRunRecord) -> StorageResult<()>;

    /// Replace a running run with its terminal form.
    async fn finalize_run(&self, run: &LayerRunRecord) -> StorageResult<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> StorageResult<LayerRunRecord>;

    /// List runs, newest first.
    async fn list_runs(&self, query: &RunQuery) -> StorageResult<Vec<LayerRunRecord>>;

    /// Most recently completed non-dry run of a layer.
    async fn last_completed(&self, layer_name: &str) -> StorageResult<Option<LayerRunRecord>>;
}

// ---------------------------------------------------------------------------
// InsightStore: persisted conclusions
// ---------------------------------------------------------------------------

/// Affective dimensions of an insight. Each present value is in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Valence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concern: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curiosity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tension: Option<f64>,
}

impl Valence {
    /// Named dimensions that carry a value.
    pub fn present(&self) -> Vec<(&'static str, f64)> {
        [
            ("joy", self.joy),
            ("concern", self.concern),
            ("curiosity", self.curiosity),
            ("warmth", self.warmth),
            ("tension", self.tension),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name, v)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }
}

/// Persisted form of an insight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub id: String,
    pub topic_key: String,
    pub category: String,
    pub content: String,
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

/// Filter + pagination for insight reads. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct InsightQuery {
    pub topic_key: Option<String>,
    pub category: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub include_quarantined: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl InsightQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_topic(topic_key: impl Into<String>) -> Self {
        Self {
            topic_key: Some(topic_key.into()),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn including_quarantined(mut self) -> Self {
        self.include_quarantined = true;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, insight: &InsightRecord) -> bool {
        (self.include_quarantined || !insight.quarantined)
            && self
                .topic_key
                .as_ref()
                .map_or(true, |k| &insight.topic_key == k)
            && self
                .category
                .as_ref()
                .map_or(true, |c| &insight.category == c)
            && self.since.map_or(true, |s| insight.created_at >= s)
    }
}

/// Insight persistence.
///
/// Content is immutable once written; the only mutation is the quarantine flag.
#[async_trait]
pub trait InsightStore: Send + Sync {
    /// Insert a new insight. Fails if the id already exists.
    async fn insert(&self, insight: InsightRecord) -> StorageResult<()>;

    /// Fetch an insight by id.
    async fn get(&self, id: &str) -> StorageResult<InsightRecord>;

    /// Query insights, newest first.
    async fn query(&self, query: &InsightQuery) -> StorageResult<Vec<InsightRecord>>;

    /// Count insights matching a query (pagination ignored).
    async fn count(&self, query: &InsightQuery) -> StorageResult<usize>;

    /// Flip the quarantine flag.
    async fn set_quarantined(&self, id: &str, quarantined: bool) -> StorageResult<()>;
}

/// Apply offset/limit to an already-ordered result set.
pub(crate) fn paginate<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(topic: &str, tx: TransactionType, amount: f64, mins_ago: i64) -> LedgerEntry {
        let mut e = NewEntry::new(topic, tx, amount);
        if matches!(tx, TransactionType::Propagate | TransactionType::Spillover) {
            e = e.with_source("src");
        }
        e.into_entry(Utc::now() - Duration::minutes(mins_ago))
    }

    #[test]
    fn aggregate_sums_and_tracks_activity() {
        let entries = vec![
            entry("a", TransactionType::Earn, 5.0, 30),
            entry("b", TransactionType::Earn, 2.0, 20),
            entry("a", TransactionType::Decay, -1.0, 10),
            entry("a", TransactionType::Propagate, 0.5, 5),
        ];
        let balances = aggregate_balances(&entries);
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].topic_key, "a");
        assert!((balances[0].balance - 4.5).abs() < 1e-9);
        assert_eq!(balances[0].last_earned_at, Some(entries[3].created_at));
        assert_eq!(balances[0].last_decayed_at, Some(entries[2].created_at));
        assert_eq!(balances[1].last_decayed_at, None);
    }

    #[test]
    fn topics_stay_provisional_until_earned_directly() {
        let entries = vec![
            entry("warmed", TransactionType::Warm, 1.0, 40),
            entry("spilled", TransactionType::Spillover, 2.0, 30),
            entry("spilled", TransactionType::Propagate, 1.0, 25),
            entry("earned", TransactionType::Propagate, 1.0, 20),
            entry("earned", TransactionType::Earn, 3.0, 10),
            entry("flooded", TransactionType::Flood, 6.0, 5),
        ];
        let provisional: Vec<(String, bool)> = aggregate_balances(&entries)
            .into_iter()
            .map(|b| (b.topic_key, b.provisional))
            .collect();
        assert_eq!(
            provisional,
            vec![
                ("warmed".to_string(), true),
                ("spilled".to_string(), true),
                ("earned".to_string(), false),
                ("flooded".to_string(), false),
            ]
        );
    }

    #[test]
    fn new_entry_rejects_non_finite_amount() {
        let e = NewEntry::new("t", TransactionType::Earn, f64::NAN);
        assert!(e.validate().is_err());
    }

    #[test]
    fn source_topic_only_on_provenance_entries() {
        assert!(NewEntry::new("t", TransactionType::Earn, 1.0)
            .with_source("x")
            .validate()
            .is_err());
        assert!(NewEntry::new("t", TransactionType::Spillover, 1.0)
            .validate()
            .is_err());
        assert!(NewEntry::new("t", TransactionType::Propagate, 1.0)
            .with_source("x")
            .validate()
            .is_ok());
    }

    #[test]
    fn transaction_type_parses_its_own_name() {
        for t in TransactionType::ALL {
            assert_eq!(t.as_str().parse::<TransactionType>().unwrap(), t);
        }
        assert!("mint".parse::<TransactionType>().is_err());
    }

    #[test]
    fn run_record_aggregates_model_calls() {
        let mut run = LayerRunRecord::start("people", "hash", false);
        let call = |ok: bool| ModelCallRecord {
            topic_key: "t".into(),
            profile: "default".into(),
            provider: "openai".into(),
            model: "m".into(),
            prompt_tokens: 100,
            completion_tokens: 20,
            cost_usd: 0.01,
            latency_ms: 5,
            success: ok,
            error: (!ok).then(|| "boom".to_string()),
            at: Utc::now(),
        };
        run.record_model_call(call(true));
        run.record_model_call(call(false));
        assert_eq!(run.total_tokens, 240);
        assert!((run.total_cost_usd - 0.02).abs() < 1e-9);
        assert_eq!(run.failed_model_calls(), 1);
        assert_eq!(run.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn valence_presence() {
        assert!(Valence::default().is_empty());
        let v = Valence {
            warmth: Some(0.4),
            ..Valence::default()
        };
        assert_eq!(v.present(), vec![("warmth", 0.4)]);
    }
}
