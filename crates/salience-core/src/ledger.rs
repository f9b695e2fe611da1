//! Salience ledger
//!
//! Earning, decay, propagation, spillover and warm-state queries over an
//! append-only [`LedgerStore`]. Balances are always derived from entries.
//!
//! Propagation is one hop: an earn reaches the warm relatives of the earning
//! topic and nothing further. Cap clamping is the only truncation point.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use salience_state::{EntryQuery, LedgerEntry, LedgerStore, NewEntry, TopicBalance, TransactionType};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::domain::{Relation, Result, SalienceError, Topic};
use crate::metrics::METRICS;
use crate::obs;

/// Derived view of one topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSnapshot {
    pub topic: Topic,
    pub balance: f64,
    pub last_earned_at: Option<DateTime<Utc>>,
    pub last_decayed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    /// Known only through relatives or warm grants so far.
    pub provisional: bool,
}

impl TopicSnapshot {
    fn from_balance(b: TopicBalance) -> Option<Self> {
        match Topic::parse(&b.topic_key) {
            Ok(topic) => Some(Self {
                topic,
                balance: b.balance,
                last_earned_at: b.last_earned_at,
                last_decayed_at: b.last_decayed_at,
                last_activity_at: b.last_activity_at,
                provisional: b.provisional,
            }),
            Err(e) => {
                warn!(topic = %b.topic_key, error = %e, "skipping ledger topic with malformed key");
                None
            }
        }
    }
}

/// What one earn did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EarnOutcome {
    /// Amount actually credited to the earning topic.
    pub credited: f64,
    /// Portion of the request cut off by the cap.
    pub overflow: f64,
    /// (relative, amount) propagation credits.
    pub propagated: Vec<(String, f64)>,
    /// (relative, amount) spillover credits.
    pub spilled: Vec<(String, f64)>,
}

/// Result of one decay pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecayReport {
    pub topics_decayed: usize,
    pub total_decayed: f64,
}

/// Idle decay shared by the salience ledger and the impulse engine.
///
/// For every positive balance whose last earning activity is older than
/// `idle_hours`, subtract `balance × rate × hours_idle` (never below zero),
/// where idle hours count from the later of the last earn and the last decay.
pub(crate) fn decay_entries(
    balances: &[TopicBalance],
    now: DateTime<Utc>,
    rate: f64,
    idle_hours: f64,
    epsilon: f64,
) -> Vec<NewEntry> {
    balances
        .iter()
        .filter(|b| b.balance > 0.0)
        .filter_map(|b| {
            let earned = b.last_earned_at.unwrap_or(b.last_activity_at);
            if hours_between(earned, now) < idle_hours {
                return None;
            }
            let anchor = b.last_decayed_at.map_or(earned, |d| d.max(earned));
            let hours_idle = hours_between(anchor, now);
            let delta = (b.balance * rate * hours_idle).min(b.balance);
            if delta < epsilon {
                return None;
            }
            Some(
                NewEntry::new(b.topic_key.clone(), TransactionType::Decay, -delta)
                    .with_reason(format!("idle {hours_idle:.1}h")),
            )
        })
        .collect()
}

pub(crate) fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / 3_600_000.0
}

pub(crate) fn check_amount(amount: f64) -> Result<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(SalienceError::InvalidAmount(amount))
    }
}

/// The salience (thinking) ledger.
pub struct SalienceLedger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    /// Serializes read-then-write windows (clamping, propagation, warm grants).
    write_lock: Mutex<()>,
}

impl SalienceLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn cap(&self, topic: &Topic) -> f64 {
        self.config.cap_for(topic.category())
    }

    fn clamp(&self, topic: &Topic, balance: f64, amount: f64) -> f64 {
        amount.min((self.cap(topic) - balance).max(0.0))
    }

    // -- reads -------------------------------------------------------------

    pub async fn get_balance(&self, topic: &Topic) -> Result<f64> {
        Ok(self.store.balance(&topic.key()).await?)
    }

    pub async fn is_warm(&self, topic: &Topic) -> Result<bool> {
        Ok(self.get_balance(topic).await? >= self.config.warm_threshold)
    }

    pub async fn entries(&self, topic: &Topic) -> Result<Vec<LedgerEntry>> {
        Ok(self.store.entries(&EntryQuery::for_topic(topic.key())).await?)
    }

    pub async fn snapshot(&self, topic: &Topic) -> Result<Option<TopicSnapshot>> {
        Ok(self
            .store
            .topic_balance(&topic.key())
            .await?
            .and_then(TopicSnapshot::from_balance))
    }

    /// Every topic that has at least one entry.
    pub async fn known_topics(&self) -> Result<Vec<TopicSnapshot>> {
        Ok(self
            .store
            .balances()
            .await?
            .into_iter()
            .filter_map(TopicSnapshot::from_balance)
            .collect())
    }

    /// Every community id that appears in a known topic, sorted.
    pub async fn known_scopes(&self) -> Result<Vec<String>> {
        let scopes: BTreeSet<String> = self
            .known_topics()
            .await?
            .iter()
            .filter_map(|s| s.topic.scope().map(str::to_string))
            .collect();
        Ok(scopes.into_iter().collect())
    }

    pub async fn warm_topics(&self) -> Result<Vec<TopicSnapshot>> {
        let threshold = self.config.warm_threshold;
        Ok(self
            .known_topics()
            .await?
            .into_iter()
            .filter(|s| s.balance >= threshold)
            .collect())
    }

    /// Known one-hop relatives of `topic`, with how they relate.
    pub async fn related_topics(&self, topic: &Topic) -> Result<Vec<(TopicSnapshot, Relation)>> {
        let known = self.known_topics().await?;
        Ok(relatives_of(topic, known))
    }

    // -- writes ------------------------------------------------------------

    /// Earn on a topic, clamped to its category cap. No propagation.
    pub async fn earn(&self, topic: &Topic, amount: f64, reason: &str) -> Result<()> {
        self.earn_with_propagation(topic, amount, reason, false)
            .await
            .map(|_| ())
    }

    /// Earn with one-hop propagation and spillover to warm relatives.
    ///
    /// Every resulting entry is appended in a single batch.
    pub async fn earn_with_propagation(
        &self,
        topic: &Topic,
        amount: f64,
        reason: &str,
        propagate: bool,
    ) -> Result<EarnOutcome> {
        check_amount(amount)?;
        let key = topic.key();
        let _guard = self.write_lock.lock().await;

        let known = self.known_topics().await?;
        let current = known
            .iter()
            .find(|s| &s.topic == topic)
            .map_or(0.0, |s| s.balance);

        let credited = self.clamp(topic, current, amount);
        let overflow = amount - credited;
        let mut outcome = EarnOutcome {
            credited,
            overflow,
            ..EarnOutcome::default()
        };

        let mut batch = Vec::new();
        if credited > 0.0 {
            batch.push(NewEntry::new(key.clone(), TransactionType::Earn, credited).with_reason(reason));
        }

        if propagate {
            let threshold = self.config.warm_threshold;
            let epsilon = self.config.epsilon;
            for (relative, relation) in relatives_of(topic, known) {
                if relative.balance < threshold {
                    continue;
                }
                let factor = match relation {
                    Relation::SameScope => self.config.propagation_factor,
                    Relation::CrossScope => self.config.global_propagation_factor,
                };
                let rel_key = relative.topic.key();
                let mut balance = relative.balance;

                let p = self.clamp(&relative.topic, balance, amount * factor);
                if p >= epsilon {
                    batch.push(
                        NewEntry::new(rel_key.clone(), TransactionType::Propagate, p)
                            .with_reason(reason)
                            .with_source(key.clone()),
                    );
                    outcome.propagated.push((rel_key.clone(), p));
                    balance += p;
                }

                if overflow > 0.0 {
                    let s = self.clamp(
                        &relative.topic,
                        balance,
                        overflow * self.config.spillover_factor,
                    );
                    if s >= epsilon {
                        batch.push(
                            NewEntry::new(rel_key.clone(), TransactionType::Spillover, s)
                                .with_reason(reason)
                                .with_source(key.clone()),
                        );
                        outcome.spilled.push((rel_key, s));
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.store.append_all(batch).await?;
        }

        METRICS.add_earns(1);
        METRICS.add_propagations(outcome.propagated.len() as u64);
        METRICS.add_spillovers(outcome.spilled.len() as u64);
        debug!(
            topic = %key,
            credited,
            overflow,
            propagated = outcome.propagated.len(),
            spilled = outcome.spilled.len(),
            "earned"
        );
        Ok(outcome)
    }

    /// Spend salience. Never clipped; a balance may go negative.
    pub async fn spend(&self, topic: &Topic, amount: f64, reason: &str) -> Result<LedgerEntry> {
        check_amount(amount)?;
        Ok(self
            .store
            .append(NewEntry::new(topic.key(), TransactionType::Spend, -amount).with_reason(reason))
            .await?)
    }

    /// Zero a topic's balance. `None` if it was already zero.
    pub async fn reset(&self, topic: &Topic, reason: &str) -> Result<Option<LedgerEntry>> {
        let _guard = self.write_lock.lock().await;
        let balance = self.get_balance(topic).await?;
        if balance == 0.0 {
            return Ok(None);
        }
        let entry = self
            .store
            .append(NewEntry::new(topic.key(), TransactionType::Reset, -balance).with_reason(reason))
            .await?;
        Ok(Some(entry))
    }

    /// Keep `fraction` of a positive balance, writing off the rest.
    pub async fn retain(
        &self,
        topic: &Topic,
        fraction: f64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err(SalienceError::InvalidAmount(fraction));
        }
        let _guard = self.write_lock.lock().await;
        let balance = self.get_balance(topic).await?;
        let delta = balance * (1.0 - fraction);
        if balance <= 0.0 || delta < self.config.epsilon {
            return Ok(None);
        }
        let entry = self
            .store
            .append(NewEntry::new(topic.key(), TransactionType::Retain, -delta).with_reason(reason))
            .await?;
        Ok(Some(entry))
    }

    /// Decay every idle topic as of now.
    pub async fn decay(&self) -> Result<DecayReport> {
        self.decay_at(Utc::now()).await
    }

    /// Decay every idle topic as of `now`.
    pub async fn decay_at(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let _guard = self.write_lock.lock().await;
        let balances = self.store.balances().await?;
        let entries = decay_entries(
            &balances,
            now,
            self.config.decay_rate,
            self.config.idle_hours,
            self.config.epsilon,
        );
        let report = DecayReport {
            topics_decayed: entries.len(),
            total_decayed: entries.iter().map(|e| -e.amount).sum(),
        };
        if !entries.is_empty() {
            self.store.append_all(entries).await?;
        }
        METRICS.add_decay_entries(report.topics_decayed as u64);
        obs::emit_decay_applied("salience", report.topics_decayed, report.total_decayed);
        Ok(report)
    }

    // -- warm grants -------------------------------------------------------

    /// Bring a cold topic up to `global_warm_initial`. No-op when already warm.
    async fn warm_if_cold(&self, topic: &Topic, reason: &str) -> Result<bool> {
        let balance = self.get_balance(topic).await?;
        if balance >= self.config.warm_threshold {
            return Ok(false);
        }
        let target = self.config.global_warm_initial.min(self.cap(topic));
        let amount = target - balance;
        if amount <= 0.0 {
            return Ok(false);
        }
        self.store
            .append(NewEntry::new(topic.key(), TransactionType::Warm, amount).with_reason(reason))
            .await?;
        debug!(topic = %topic, amount, reason, "warmed");
        Ok(true)
    }

    /// Direct-message activity warms the user's global topic.
    pub async fn warm_from_dm(&self, user: &str) -> Result<bool> {
        let global = Topic::person(None, user)?;
        let _guard = self.write_lock.lock().await;
        self.warm_if_cold(&global, "dm").await
    }

    /// Warm the user's global topic once they have been seen in two scopes.
    pub async fn check_and_warm_global(&self, user: &str, scope: &str) -> Result<bool> {
        let global = Topic::person(None, user)?;
        let _guard = self.write_lock.lock().await;

        let mut scopes: BTreeSet<String> = self
            .known_topics()
            .await?
            .into_iter()
            .filter_map(|s| match s.topic {
                Topic::Person {
                    server: Some(server),
                    user: u,
                } if u == user => Some(server),
                _ => None,
            })
            .collect();
        scopes.insert(scope.to_string());

        if scopes.len() < 2 {
            return Ok(false);
        }
        self.warm_if_cold(&global, "multi_scope").await
    }

    /// Warm the global pair topic, but only if both global persons are warm.
    pub async fn check_and_warm_global_dyad(&self, a: &str, b: &str) -> Result<bool> {
        let pair = Topic::pair(None, a, b)?;
        let person_a = Topic::person(None, a)?;
        let person_b = Topic::person(None, b)?;
        let _guard = self.write_lock.lock().await;

        if !(self.is_warm(&person_a).await? && self.is_warm(&person_b).await?) {
            return Ok(false);
        }
        self.warm_if_cold(&pair, "dyad_members_warm").await
    }
}

fn relatives_of(topic: &Topic, known: Vec<TopicSnapshot>) -> Vec<(TopicSnapshot, Relation)> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    known
        .into_iter()
        .filter_map(|s| topic.relation_to(&s.topic).map(|r| (s, r)))
        .filter(|(s, _)| seen.insert(s.topic.key(), ()).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use salience_state::fakes::MemoryLedgerStore;

    fn topic(key: &str) -> Topic {
        Topic::parse(key).unwrap()
    }

    fn ledger_with(store: Arc<MemoryLedgerStore>) -> SalienceLedger {
        SalienceLedger::new(store, LedgerConfig::default())
    }

    #[tokio::test]
    async fn earn_is_clamped_to_cap() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let u = topic("server:g1:user:u1");
        ledger.earn(&u, 70.0, "msg").await.unwrap();
        ledger.earn(&u, 70.0, "msg").await.unwrap();
        assert_eq!(ledger.get_balance(&u).await.unwrap(), 100.0);
    }

    #[tokio::test]
    async fn invalid_amounts_are_rejected() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let u = topic("server:g1:user:u1");
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ledger.earn(&u, bad, "x").await,
                Err(SalienceError::InvalidAmount(_))
            ));
        }
    }

    #[tokio::test]
    async fn cold_relatives_receive_nothing() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let u = topic("server:g1:user:u1");
        let d = topic("server:g1:dyad:u1:u2");
        ledger.earn(&d, 0.5, "seed").await.unwrap();

        let out = ledger.earn_with_propagation(&u, 10.0, "msg", true).await.unwrap();
        assert!(out.propagated.is_empty());
        assert_eq!(ledger.get_balance(&d).await.unwrap(), 0.5);
    }

    #[tokio::test]
    async fn cross_scope_uses_global_factor() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let scoped = topic("server:g1:user:u1");
        let global = topic("user:u1");
        ledger.earn(&global, 5.0, "seed").await.unwrap();

        ledger
            .earn_with_propagation(&scoped, 10.0, "msg", true)
            .await
            .unwrap();
        let g = ledger.get_balance(&global).await.unwrap();
        assert!((g - 6.0).abs() < 1e-9, "got {g}");
    }

    #[tokio::test]
    async fn spend_can_go_negative_and_reset_zeroes() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let c = topic("server:g1:channel:c1");
        ledger.earn(&c, 2.0, "msg").await.unwrap();
        ledger.spend(&c, 5.0, "reflection").await.unwrap();
        assert_eq!(ledger.get_balance(&c).await.unwrap(), -3.0);
        assert!(!ledger.is_warm(&c).await.unwrap());

        ledger.reset(&c, "manual").await.unwrap();
        assert_eq!(ledger.get_balance(&c).await.unwrap(), 0.0);
        assert!(ledger.reset(&c, "again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retain_keeps_fraction() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        let s = topic("server:g1:subject:rust");
        ledger.earn(&s, 40.0, "msg").await.unwrap();
        ledger.retain(&s, 0.25, "reflected").await.unwrap();
        assert!((ledger.get_balance(&s).await.unwrap() - 10.0).abs() < 1e-9);
        assert!(ledger.retain(&s, 1.5, "bad").await.is_err());
    }

    #[tokio::test]
    async fn decay_skips_recently_active_topics() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = ledger_with(store.clone());
        let now = Utc::now();
        store
            .append_at(
                NewEntry::new("server:g1:user:idle", TransactionType::Earn, 50.0),
                now - Duration::hours(10),
            )
            .unwrap();
        store
            .append_at(
                NewEntry::new("server:g1:user:busy", TransactionType::Earn, 50.0),
                now - Duration::hours(1),
            )
            .unwrap();

        let report = ledger.decay_at(now).await.unwrap();
        assert_eq!(report.topics_decayed, 1);
        // 50 × 0.01 × 10h = 5
        let idle = ledger.get_balance(&topic("server:g1:user:idle")).await.unwrap();
        assert!((idle - 45.0).abs() < 1e-6, "got {idle}");
        let busy = ledger.get_balance(&topic("server:g1:user:busy")).await.unwrap();
        assert_eq!(busy, 50.0);
    }

    #[tokio::test]
    async fn decay_never_goes_below_zero() {
        let store = Arc::new(MemoryLedgerStore::new());
        let config = LedgerConfig {
            decay_rate: 1.0,
            ..LedgerConfig::default()
        };
        let ledger = SalienceLedger::new(store.clone(), config);
        let now = Utc::now();
        store
            .append_at(
                NewEntry::new("server:g1:user:u1", TransactionType::Earn, 3.0),
                now - Duration::hours(48),
            )
            .unwrap();
        ledger.decay_at(now).await.unwrap();
        assert_eq!(ledger.get_balance(&topic("server:g1:user:u1")).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn dm_warms_global_once() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        assert!(ledger.warm_from_dm("u1").await.unwrap());
        assert!(!ledger.warm_from_dm("u1").await.unwrap());
        assert_eq!(ledger.get_balance(&topic("user:u1")).await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn global_warms_on_second_scope() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        ledger.earn(&topic("server:g1:user:u1"), 1.0, "msg").await.unwrap();
        assert!(!ledger.check_and_warm_global("u1", "g1").await.unwrap());
        assert!(ledger.check_and_warm_global("u1", "g2").await.unwrap());
        assert!(!ledger.check_and_warm_global("u1", "g3").await.unwrap());
    }

    #[tokio::test]
    async fn global_dyad_needs_both_members_warm() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        ledger.warm_from_dm("u1").await.unwrap();
        assert!(!ledger.check_and_warm_global_dyad("u1", "u2").await.unwrap());
        ledger.warm_from_dm("u2").await.unwrap();
        assert!(ledger.check_and_warm_global_dyad("u2", "u1").await.unwrap());
        assert!(ledger.is_warm(&topic("dyad:u1:u2")).await.unwrap());
    }

    #[tokio::test]
    async fn known_scopes_are_sorted_and_unique() {
        let ledger = ledger_with(Arc::new(MemoryLedgerStore::new()));
        for key in ["server:g2:user:u1", "server:g1:channel:c1", "server:g2:user:u2", "user:u9"] {
            ledger.earn(&topic(key), 1.0, "msg").await.unwrap();
        }
        assert_eq!(ledger.known_scopes().await.unwrap(), vec!["g1", "g2"]);
    }
}
