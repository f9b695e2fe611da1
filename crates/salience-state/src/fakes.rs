//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryLedgerStore`, `MemoryLayerRunStore`, and `MemoryInsightStore`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryLedgerStore
// ---------------------------------------------------------------------------

/// In-memory append-only ledger backed by a `Vec<LedgerEntry>`.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry with an explicit timestamp (lets tests simulate idle time).
    pub fn append_at(
        &self,
        entry: NewEntry,
        created_at: chrono::DateTime<Utc>,
    ) -> StorageResult<LedgerEntry> {
        entry.validate()?;
        let stored = entry.into_entry(created_at);
        self.entries.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entry: NewEntry) -> StorageResult<LedgerEntry> {
        self.append_at(entry, Utc::now())
    }

    async fn append_all(&self, entries: Vec<NewEntry>) -> StorageResult<Vec<LedgerEntry>> {
        // Validate the whole batch before touching the log.
        for entry in &entries {
            entry.validate()?;
        }
        let now = Utc::now();
        let stored: Vec<LedgerEntry> = entries.into_iter().map(|e| e.into_entry(now)).collect();
        self.entries.lock().unwrap().extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn entries(&self, query: &EntryQuery) -> StorageResult<Vec<LedgerEntry>> {
        let entries = self.entries.lock().unwrap();
        let matching: Vec<LedgerEntry> = entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        Ok(paginate(matching, query.offset, query.limit))
    }

    async fn balance(&self, topic_key: &str) -> StorageResult<f64> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|e| e.topic_key == topic_key)
            .map(|e| e.amount)
            .sum())
    }

    async fn topic_balance(&self, topic_key: &str) -> StorageResult<Option<TopicBalance>> {
        let entries = self.entries.lock().unwrap();
        Ok(aggregate_balances(entries.iter().filter(|e| e.topic_key == topic_key))
            .into_iter()
            .next())
    }

    async fn balances(&self) -> StorageResult<Vec<TopicBalance>> {
        let entries = self.entries.lock().unwrap();
        Ok(aggregate_balances(entries.iter()))
    }
}

// ---------------------------------------------------------------------------
// MemoryLayerRunStore
// ---------------------------------------------------------------------------

/// In-memory layer run store backed by a `HashMap<run_id, LayerRunRecord>`.
#[derive(Debug, Default)]
pub struct MemoryLayerRunStore {
    runs: Mutex<HashMap<String, LayerRunRecord>>,
}

impl MemoryLayerRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LayerRunStore for MemoryLayerRunStore {
    async fn create_run(&self, run: &LayerRunRecord) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.run_id) {
            return Err(StorageError::AlreadyExists {
                kind: "run",
                id: run.run_id.clone(),
            });
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn finalize_run(&self, run: &LayerRunRecord) -> StorageResult<()> {
        if !run.status.is_terminal() {
            return Err(StorageError::InvalidRecord(format!(
                "run {} finalized while still running",
                run.run_id
            )));
        }
        let mut runs = self.runs.lock().unwrap();
        let current = runs
            .get_mut(&run.run_id)
            .ok_or_else(|| StorageError::not_found("run", run.run_id.clone()))?;
        if current.status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run.run_id.clone(),
                status: current.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        *current = run.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StorageResult<LayerRunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("run", run_id))
    }

    async fn list_runs(&self, query: &RunQuery) -> StorageResult<Vec<LayerRunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut matching: Vec<LayerRunRecord> =
            runs.values().filter(|r| query.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(paginate(matching, query.offset, query.limit))
    }

    async fn last_completed(&self, layer_name: &str) -> StorageResult<Option<LayerRunRecord>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .values()
            .filter(|r| {
                r.layer_name == layer_name
                    && r.status.is_terminal()
                    && r.status != RunStatus::DryRun
            })
            .max_by_key(|r| r.completed_at.unwrap_or(r.started_at))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryInsightStore
// ---------------------------------------------------------------------------

/// In-memory insight store backed by a `HashMap<id, InsightRecord>`.
#[derive(Debug, Default)]
pub struct MemoryInsightStore {
    insights: Mutex<HashMap<String, InsightRecord>>,
}

impl MemoryInsightStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching(&self, query: &InsightQuery) -> Vec<InsightRecord> {
        let insights = self.insights.lock().unwrap();
        let mut matching: Vec<InsightRecord> = insights
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
    }
}

#[async_trait]
impl InsightStore for MemoryInsightStore {
    async fn insert(&self, insight: InsightRecord) -> StorageResult<()> {
        let mut insights = self.insights.lock().unwrap();
        if insights.contains_key(&insight.id) {
            return Err(StorageError::AlreadyExists {
                kind: "insight",
                id: insight.id,
            });
        }
        insights.insert(insight.id.clone(), insight);
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<InsightRecord> {
        let insights = self.insights.lock().unwrap();
        insights
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("insight", id))
    }

    async fn query(&self, query: &InsightQuery) -> StorageResult<Vec<InsightRecord>> {
        Ok(paginate(self.matching(query), query.offset, query.limit))
    }

    async fn count(&self, query: &InsightQuery) -> StorageResult<usize> {
        Ok(self.matching(query).len())
    }

    async fn set_quarantined(&self, id: &str, quarantined: bool) -> StorageResult<()> {
        let mut insights = self.insights.lock().unwrap();
        let insight = insights
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found("insight", id))?;
        insight.quarantined = quarantined;
        Ok(())
    }
}
