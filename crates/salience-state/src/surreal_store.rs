//! SurrealDB-backed store implementations
//!
//! Uses the row types in `schema` for persistence, converting to/from
//! `storage_traits` types at the boundary.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::handle::{self, StoreConfig};
use crate::migrations::{
    IMPULSE_LEDGER_TABLE, INSIGHTS_TABLE, LAYER_RUNS_TABLE, SALIENCE_LEDGER_TABLE,
};
use crate::schema::{InsightRow, LayerRunRow, LedgerEntryRow};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// Query building
// ---------------------------------------------------------------------------

enum Bind {
    Str(String),
    Time(SurrealDatetime),
    Bool(bool),
    Num(i64),
}

/// WHERE clauses plus the parameters they reference.
#[derive(Default)]
struct Filter {
    clauses: Vec<&'static str>,
    binds: Vec<(&'static str, Bind)>,
}

impl Filter {
    fn push(&mut self, clause: &'static str, name: &'static str, value: Bind) {
        self.clauses.push(clause);
        self.binds.push((name, value));
    }

    fn bind_only(&mut self, name: &'static str, value: Bind) {
        self.binds.push((name, value));
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    /// Append `LIMIT $limit START $offset` and bind both.
    fn paging(&mut self, offset: usize, limit: Option<usize>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(" LIMIT $limit");
            self.bind_only("limit", Bind::Num(limit as i64));
        }
        if offset > 0 {
            sql.push_str(" START $offset");
            self.bind_only("offset", Bind::Num(offset as i64));
        }
        sql
    }
}

async fn select<T: DeserializeOwned>(
    db: &Surreal<Any>,
    sql: String,
    binds: Vec<(&'static str, Bind)>,
) -> StorageResult<Vec<T>> {
    let mut q = db.query(sql);
    for (name, value) in binds {
        q = match value {
            Bind::Str(s) => q.bind((name, s)),
            Bind::Time(t) => q.bind((name, t)),
            Bind::Bool(b) => q.bind((name, b)),
            Bind::Num(n) => q.bind((name, n)),
        };
    }
    let mut res = q
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?
        .check()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    res.take(0)
        .map_err(|e| StorageError::Backend(e.to_string()))
}

#[derive(Deserialize)]
struct SumRow {
    #[serde(default)]
    total: Option<f64>,
}

#[derive(Deserialize)]
struct CountRow {
    total: u64,
}

// ---------------------------------------------------------------------------
// SurrealLedgerStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`LedgerStore`].
///
/// One instance per ledger table; the salience and impulse ledgers share the
/// row shape but never share a table.
#[derive(Clone)]
pub struct SurrealLedgerStore {
    db: Surreal<Any>,
    table: &'static str,
}

impl SurrealLedgerStore {
    pub fn new(db: Surreal<Any>, table: &'static str) -> Self {
        Self { db, table }
    }

    /// The salience (thinking) ledger.
    pub fn salience(db: Surreal<Any>) -> Self {
        Self::new(db, SALIENCE_LEDGER_TABLE)
    }

    /// The impulse (speaking) ledger.
    pub fn impulse(db: Surreal<Any>) -> Self {
        Self::new(db, IMPULSE_LEDGER_TABLE)
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    async fn fetch(&self, query: &EntryQuery) -> StorageResult<Vec<LedgerEntry>> {
        let mut filter = Filter::default();
        if let Some(topic) = &query.topic_key {
            filter.push("topic_key = $topic", "topic", Bind::Str(topic.clone()));
        }
        if let Some(tx) = query.transaction_type {
            filter.push(
                "transaction_type = $tx",
                "tx",
                Bind::Str(tx.as_str().to_string()),
            );
        }
        if let Some(pool) = &query.pool {
            filter.push("pool = $pool", "pool", Bind::Str(pool.clone()));
        }
        if let Some(since) = query.since {
            filter.push("created_at >= $since", "since", Bind::Time(since.into()));
        }
        if let Some(until) = query.until {
            filter.push("created_at < $until", "until", Bind::Time(until.into()));
        }

        let mut sql = format!(
            "SELECT * FROM {}{} ORDER BY created_at ASC",
            self.table,
            filter.where_clause()
        );
        sql.push_str(&filter.paging(query.offset, query.limit));

        let rows: Vec<LedgerEntryRow> = select(&self.db, sql, filter.binds).await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

#[async_trait]
impl LedgerStore for SurrealLedgerStore {
    async fn append(&self, entry: NewEntry) -> StorageResult<LedgerEntry> {
        let mut stored = self.append_all(vec![entry]).await?;
        stored
            .pop()
            .ok_or_else(|| StorageError::Backend("insert returned no entry".into()))
    }

    async fn append_all(&self, entries: Vec<NewEntry>) -> StorageResult<Vec<LedgerEntry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        for entry in &entries {
            entry.validate()?;
        }

        // Step batch timestamps by a nanosecond so reads keep insertion order.
        let now = Utc::now();
        let stored: Vec<LedgerEntry> = entries
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.into_entry(now + Duration::nanoseconds(i as i64)))
            .collect();
        let rows: Vec<LedgerEntryRow> = stored.iter().map(LedgerEntryRow::from).collect();

        debug!(table = self.table, count = rows.len(), "appending ledger entries");

        let sql = format!(
            "BEGIN TRANSACTION; INSERT INTO {} $rows; COMMIT TRANSACTION;",
            self.table
        );
        self.db
            .query(sql)
            .bind(("rows", rows))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(stored)
    }

    async fn entries(&self, query: &EntryQuery) -> StorageResult<Vec<LedgerEntry>> {
        self.fetch(query).await
    }

    async fn balance(&self, topic_key: &str) -> StorageResult<f64> {
        let mut filter = Filter::default();
        filter.push(
            "topic_key = $topic",
            "topic",
            Bind::Str(topic_key.to_string()),
        );
        let sql = format!(
            "SELECT math::sum(amount) AS total FROM {}{} GROUP ALL",
            self.table,
            filter.where_clause()
        );
        let rows: Vec<SumRow> = select(&self.db, sql, filter.binds).await?;
        Ok(rows.into_iter().next().and_then(|r| r.total).unwrap_or(0.0))
    }

    async fn topic_balance(&self, topic_key: &str) -> StorageResult<Option<TopicBalance>> {
        let entries = self.fetch(&EntryQuery::for_topic(topic_key)).await?;
        Ok(aggregate_balances(&entries).into_iter().next())
    }

    async fn balances(&self) -> StorageResult<Vec<TopicBalance>> {
        let entries = self.fetch(&EntryQuery::all()).await?;
        Ok(aggregate_balances(&entries))
    }
}

// ---------------------------------------------------------------------------
// SurrealLayerRunStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`LayerRunStore`].
#[derive(Clone)]
pub struct SurrealLayerRunStore {
    db: Surreal<Any>,
}

impl SurrealLayerRunStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    async fn fetch_run(&self, run_id: &str) -> StorageResult<Option<LayerRunRow>> {
        let mut filter = Filter::default();
        filter.push("run_id = $rid", "rid", Bind::Str(run_id.to_string()));
        let sql = format!("SELECT * FROM {}{}", LAYER_RUNS_TABLE, filter.where_clause());
        let rows: Vec<LayerRunRow> = select(&self.db, sql, filter.binds).await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl LayerRunStore for SurrealLayerRunStore {
    async fn create_run(&self, run: &LayerRunRecord) -> StorageResult<()> {
        if self.fetch_run(&run.run_id).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: "run",
                id: run.run_id.clone(),
            });
        }

        debug!(run_id = %run.run_id, layer = %run.layer_name, "creating layer run");

        let _created: Option<LayerRunRow> = self
            .db
            .create(LAYER_RUNS_TABLE)
            .content(LayerRunRow::from(run))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn finalize_run(&self, run: &LayerRunRecord) -> StorageResult<()> {
        if !run.status.is_terminal() {
            return Err(StorageError::InvalidRecord(format!(
                "run {} finalized while still running",
                run.run_id
            )));
        }

        let current = self
            .fetch_run(&run.run_id)
            .await?
            .ok_or_else(|| StorageError::not_found("run", run.run_id.clone()))?;
        if current.status != RunStatus::Running.as_str() {
            return Err(StorageError::InvalidRunState {
                run_id: run.run_id.clone(),
                status: current.status,
                expected: RunStatus::Running.to_string(),
            });
        }

        let sql = format!("UPDATE {} CONTENT $row WHERE run_id = $rid", LAYER_RUNS_TABLE);
        self.db
            .query(sql)
            .bind(("row", LayerRunRow::from(run)))
            .bind(("rid", run.run_id.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<LayerRunRecord> {
        let row = self
            .fetch_run(run_id)
            .await?
            .ok_or_else(|| StorageError::not_found("run", run_id))?;
        LayerRunRecord::try_from(row)
    }

    async fn list_runs(&self, query: &RunQuery) -> StorageResult<Vec<LayerRunRecord>> {
        let mut filter = Filter::default();
        if let Some(name) = &query.layer_name {
            filter.push("layer_name = $layer", "layer", Bind::Str(name.clone()));
        }
        if let Some(status) = query.status {
            filter.push(
                "status = $status",
                "status",
                Bind::Str(status.as_str().to_string()),
            );
        }
        if let Some(since) = query.since {
            filter.push("started_at >= $since", "since", Bind::Time(since.into()));
        }

        let mut sql = format!(
            "SELECT * FROM {}{} ORDER BY started_at DESC",
            LAYER_RUNS_TABLE,
            filter.where_clause()
        );
        sql.push_str(&filter.paging(query.offset, query.limit));

        let rows: Vec<LayerRunRow> = select(&self.db, sql, filter.binds).await?;
        rows.into_iter().map(LayerRunRecord::try_from).collect()
    }

    async fn last_completed(&self, layer_name: &str) -> StorageResult<Option<LayerRunRecord>> {
        let mut filter = Filter::default();
        filter.push(
            "layer_name = $layer",
            "layer",
            Bind::Str(layer_name.to_string()),
        );
        filter.clauses.push("status IN ['success', 'partial', 'failed']");
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY completed_at DESC LIMIT 1",
            LAYER_RUNS_TABLE,
            filter.where_clause()
        );
        let rows: Vec<LayerRunRow> = select(&self.db, sql, filter.binds).await?;
        rows.into_iter()
            .next()
            .map(LayerRunRecord::try_from)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// SurrealInsightStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`InsightStore`].
#[derive(Clone)]
pub struct SurrealInsightStore {
    db: Surreal<Any>,
}

impl SurrealInsightStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    fn filter(query: &InsightQuery) -> Filter {
        let mut filter = Filter::default();
        if !query.include_quarantined {
            filter.push("quarantined = $quarantined", "quarantined", Bind::Bool(false));
        }
        if let Some(topic) = &query.topic_key {
            filter.push("topic_key = $topic", "topic", Bind::Str(topic.clone()));
        }
        if let Some(category) = &query.category {
            filter.push("category = $category", "category", Bind::Str(category.clone()));
        }
        if let Some(since) = query.since {
            filter.push("created_at >= $since", "since", Bind::Time(since.into()));
        }
        filter
    }

    async fn fetch(&self, id: &str) -> StorageResult<Option<InsightRow>> {
        let mut filter = Filter::default();
        filter.push("insight_id = $id", "id", Bind::Str(id.to_string()));
        let sql = format!("SELECT * FROM {}{}", INSIGHTS_TABLE, filter.where_clause());
        let rows: Vec<InsightRow> = select(&self.db, sql, filter.binds).await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl InsightStore for SurrealInsightStore {
    async fn insert(&self, insight: InsightRecord) -> StorageResult<()> {
        if self.fetch(&insight.id).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: "insight",
                id: insight.id,
            });
        }

        debug!(insight_id = %insight.id, topic = %insight.topic_key, "inserting insight");

        let _created: Option<InsightRow> = self
            .db
            .create(INSIGHTS_TABLE)
            .content(InsightRow::from(insight))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<InsightRecord> {
        self.fetch(id)
            .await?
            .map(InsightRecord::from)
            .ok_or_else(|| StorageError::not_found("insight", id))
    }

    async fn query(&self, query: &InsightQuery) -> StorageResult<Vec<InsightRecord>> {
        let mut filter = Self::filter(query);
        let mut sql = format!(
            "SELECT * FROM {}{} ORDER BY created_at DESC",
            INSIGHTS_TABLE,
            filter.where_clause()
        );
        sql.push_str(&filter.paging(query.offset, query.limit));

        let rows: Vec<InsightRow> = select(&self.db, sql, filter.binds).await?;
        Ok(rows.into_iter().map(InsightRecord::from).collect())
    }

    async fn count(&self, query: &InsightQuery) -> StorageResult<usize> {
        let filter = Self::filter(query);
        let sql = format!(
            "SELECT count() AS total FROM {}{} GROUP ALL",
            INSIGHTS_TABLE,
            filter.where_clause()
        );
        let rows: Vec<CountRow> = select(&self.db, sql, filter.binds).await?;
        Ok(rows.into_iter().next().map_or(0, |r| r.total as usize))
    }

    async fn set_quarantined(&self, id: &str, quarantined: bool) -> StorageResult<()> {
        let mut filter = Filter::default();
        filter.push("insight_id = $id", "id", Bind::Str(id.to_string()));
        filter.bind_only("q", Bind::Bool(quarantined));
        let sql = format!(
            "UPDATE {} SET quarantined = $q{}",
            INSIGHTS_TABLE,
            filter.where_clause()
        );
        let updated: Vec<InsightRow> = select(&self.db, sql, filter.binds).await?;
        if updated.is_empty() {
            return Err(StorageError::not_found("insight", id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SurrealStores
// ---------------------------------------------------------------------------

/// Every store the engine needs, sharing one connection.
#[derive(Clone)]
pub struct SurrealStores {
    pub salience: SurrealLedgerStore,
    pub impulse: SurrealLedgerStore,
    pub runs: SurrealLayerRunStore,
    pub insights: SurrealInsightStore,
}

impl SurrealStores {
    pub fn from_db(db: Surreal<Any>) -> Self {
        Self {
            salience: SurrealLedgerStore::salience(db.clone()),
            impulse: SurrealLedgerStore::impulse(db.clone()),
            runs: SurrealLayerRunStore::new(db.clone()),
            insights: SurrealInsightStore::new(db),
        }
    }

    /// Connect with `config`, run migrations and build the stores.
    pub async fn connect(config: &StoreConfig) -> crate::Result<Self> {
        let db = handle::connect(config).await?;
        info!(endpoint = %config.endpoint, "salience stores ready");
        Ok(Self::from_db(db))
    }

    /// Fresh in-memory database (tests, dry runs).
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }
}
