//! Impulse engine: the speaking-side ledger.
//!
//! Structurally a second ledger over its own store. A topic's impulse
//! accumulates from activity and insights; once it reaches the threshold
//! the driving loop may speak, then resets the topic to zero. The reset is
//! the rate limit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use salience_state::{LedgerEntry, LedgerStore, NewEntry, TransactionType};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ImpulseConfig;
use crate::domain::{Result, Topic};
use crate::ledger::{check_amount, decay_entries, DecayReport};
use crate::metrics::METRICS;
use crate::obs;

pub struct ImpulseEngine {
    store: Arc<dyn LedgerStore>,
    config: ImpulseConfig,
    write_lock: Mutex<()>,
}

impl ImpulseEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: ImpulseConfig) -> Self {
        Self {
            store,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ImpulseConfig {
        &self.config
    }

    fn entry(&self, topic: &Topic, kind: TransactionType, amount: f64, trigger: &str) -> NewEntry {
        NewEntry::new(topic.key(), kind, amount)
            .with_reason(trigger)
            .in_pool(&self.config.pool)
    }

    pub async fn earn(&self, topic: &Topic, amount: f64, trigger: &str) -> Result<LedgerEntry> {
        check_amount(amount)?;
        let entry = self
            .store
            .append(self.entry(topic, TransactionType::Earn, amount, trigger))
            .await?;
        debug!(topic = %topic, amount, trigger, "impulse earned");
        Ok(entry)
    }

    /// Burst earn, recorded distinctly from ordinary earning.
    pub async fn flood(&self, topic: &Topic, amount: f64, trigger: &str) -> Result<LedgerEntry> {
        check_amount(amount)?;
        Ok(self
            .store
            .append(self.entry(topic, TransactionType::Flood, amount, trigger))
            .await?)
    }

    pub async fn spend(&self, topic: &Topic, amount: f64, trigger: &str) -> Result<LedgerEntry> {
        check_amount(amount)?;
        Ok(self
            .store
            .append(self.entry(topic, TransactionType::Spend, -amount, trigger))
            .await?)
    }

    pub async fn get_balance(&self, topic: &Topic) -> Result<f64> {
        Ok(self.store.balance(&topic.key()).await?)
    }

    /// Zero the topic's impulse after speaking. `None` if already zero.
    pub async fn reset(&self, topic: &Topic, trigger: &str) -> Result<Option<LedgerEntry>> {
        let _guard = self.write_lock.lock().await;
        let balance = self.get_balance(topic).await?;
        if balance == 0.0 {
            return Ok(None);
        }
        let entry = self
            .store
            .append(self.entry(topic, TransactionType::Reset, -balance, trigger))
            .await?;
        debug!(topic = %topic, cleared = balance, trigger, "impulse reset");
        Ok(Some(entry))
    }

    /// Topics whose impulse is at or above the threshold, highest first.
    pub async fn get_topics_above_threshold(&self) -> Result<Vec<(Topic, f64)>> {
        let threshold = self.config.threshold;
        let mut above: Vec<(Topic, f64)> = self
            .store
            .balances()
            .await?
            .into_iter()
            .filter(|b| b.balance >= threshold)
            .filter_map(|b| Topic::parse(&b.topic_key).ok().map(|t| (t, b.balance)))
            .collect();
        above.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(above)
    }

    /// Thinking→speaking coupling: `per_insight × insights`.
    pub async fn earn_for_insights(&self, topic: &Topic, insights: usize) -> Result<Option<LedgerEntry>> {
        if insights == 0 || self.config.per_insight <= 0.0 {
            return Ok(None);
        }
        let amount = self.config.per_insight * insights as f64;
        self.earn(topic, amount, &format!("insights:{insights}"))
            .await
            .map(Some)
    }

    pub async fn apply_decay(&self) -> Result<DecayReport> {
        self.apply_decay_at(Utc::now()).await
    }

    pub async fn apply_decay_at(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let _guard = self.write_lock.lock().await;
        let balances = self.store.balances().await?;
        let entries: Vec<NewEntry> = decay_entries(
            &balances,
            now,
            self.config.decay_rate,
            self.config.idle_hours,
            self.config.epsilon,
        )
        .into_iter()
        .map(|e| e.in_pool(&self.config.pool))
        .collect();
        let report = DecayReport {
            topics_decayed: entries.len(),
            total_decayed: entries.iter().map(|e| -e.amount).sum(),
        };
        if !entries.is_empty() {
            self.store.append_all(entries).await?;
        }
        METRICS.add_decay_entries(report.topics_decayed as u64);
        obs::emit_decay_applied("impulse", report.topics_decayed, report.total_decayed);
        Ok(report)
    }
}
