//! Insight recall with recency/strength weighting.
//!
//! Effective strength fades with age (half-life) and with the loss of the
//! topic's salience since the insight was formed. Quarantined and
//! superseded insights are never returned.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use salience_state::{InsightQuery, InsightRecord, InsightStore, Valence};
use serde::Serialize;

use crate::config::{RetrievalConfig, RetrievalProfile};
use crate::domain::{ConfigError, Result, Topic};
use crate::ledger::SalienceLedger;

/// An insight ready to be placed in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedInsight {
    pub id: String,
    pub topic_key: String,
    pub category: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Human-readable age, e.g. "3 days ago".
    pub age: String,
    pub effective_strength: f64,
    pub score: f64,
    pub valence: Valence,
}

impl FormattedInsight {
    /// One prompt line: `[3 days ago] content`.
    pub fn line(&self) -> String {
        format!("[{}] {}", self.age, self.content)
    }

    fn approx_tokens(&self) -> usize {
        self.line().len().div_ceil(4)
    }
}

/// Relative age marker for `created_at` as seen at `now`.
pub fn temporal_marker(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - created_at;
    let days = elapsed.num_days();
    let hours = elapsed.num_hours();
    match (days, hours) {
        (d, _) if d >= 2 => format!("{d} days ago"),
        (1, _) => "1 day ago".to_string(),
        (_, h) if h >= 2 => format!("{h} hours ago"),
        (_, 1) => "1 hour ago".to_string(),
        _ => "just now".to_string(),
    }
}

pub struct InsightRetriever {
    insights: Arc<dyn InsightStore>,
    ledger: Arc<SalienceLedger>,
    config: RetrievalConfig,
}

impl InsightRetriever {
    pub fn new(
        insights: Arc<dyn InsightStore>,
        ledger: Arc<SalienceLedger>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            insights,
            ledger,
            config,
        }
    }

    fn time_factor(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_days = ((now - created_at).num_seconds().max(0) as f64) / 86_400.0;
        0.5_f64.powf(age_days / self.config.half_life_days)
    }

    /// Stored strength, faded by age and by lost topic salience.
    pub fn effective_strength(
        &self,
        insight: &InsightRecord,
        current_salience: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let relevance = if insight.salience_at_creation > 0.0 {
            (current_salience / insight.salience_at_creation).clamp(self.config.relevance_floor, 1.0)
        } else {
            1.0
        };
        insight.strength * self.time_factor(insight.created_at, now) * relevance
    }

    fn resolve_profile(&self, name: &str) -> Result<RetrievalProfile> {
        self.config
            .profile(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown retrieval profile: {name}")).into())
    }

    pub async fn retrieve(&self, topic: &Topic, profile: &str) -> Result<Vec<FormattedInsight>> {
        self.retrieve_at(topic, profile, Utc::now()).await
    }

    pub async fn retrieve_at(
        &self,
        topic: &Topic,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<FormattedInsight>> {
        let profile = self.resolve_profile(profile)?;
        let records = self
            .insights
            .query(&InsightQuery::for_topic(topic.key()))
            .await?;
        let superseded: HashSet<&str> = records
            .iter()
            .filter_map(|r| r.supersedes.as_deref())
            .collect();
        let current = self.ledger.get_balance(topic).await?;

        let live: Vec<&InsightRecord> = records
            .iter()
            .filter(|r| !r.quarantined && !superseded.contains(r.id.as_str()))
            .collect();
        let strengths: Vec<f64> = live
            .iter()
            .map(|r| self.effective_strength(r, current, now))
            .collect();
        let max_strength = strengths.iter().copied().fold(0.0_f64, f64::max);

        let mut scored: Vec<FormattedInsight> = live
            .into_iter()
            .zip(strengths)
            .map(|(r, strength)| {
                let normalized = if max_strength > 0.0 {
                    strength / max_strength
                } else {
                    0.0
                };
                let score = profile.recency_weight * self.time_factor(r.created_at, now)
                    + profile.strength_weight * normalized;
                FormattedInsight {
                    id: r.id.clone(),
                    topic_key: r.topic_key.clone(),
                    category: r.category.clone(),
                    content: r.content.clone(),
                    created_at: r.created_at,
                    age: temporal_marker(r.created_at, now),
                    effective_strength: strength,
                    score,
                    valence: r.valence.clone(),
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let mut tokens = 0;
        let mut out = Vec::new();
        for insight in scored.into_iter().take(profile.max_results) {
            let cost = insight.approx_tokens();
            if tokens + cost > profile.token_budget {
                break;
            }
            tokens += cost;
            out.push(insight);
        }
        Ok(out)
    }

    /// Most recent live insight for the topic, if any.
    pub async fn retrieve_latest(&self, topic: &Topic) -> Result<Option<FormattedInsight>> {
        let now = Utc::now();
        let records = self
            .insights
            .query(&InsightQuery::for_topic(topic.key()))
            .await?;
        let superseded: HashSet<&str> = records
            .iter()
            .filter_map(|r| r.supersedes.as_deref())
            .collect();
        let Some(latest) = records
            .iter()
            .filter(|r| !r.quarantined && !superseded.contains(r.id.as_str()))
            .max_by_key(|r| r.created_at)
        else {
            return Ok(None);
        };
        let current = self.ledger.get_balance(topic).await?;
        let strength = self.effective_strength(latest, current, now);
        Ok(Some(FormattedInsight {
            id: latest.id.clone(),
            topic_key: latest.topic_key.clone(),
            category: latest.category.clone(),
            content: latest.content.clone(),
            created_at: latest.created_at,
            age: temporal_marker(latest.created_at, now),
            effective_strength: strength,
            score: strength,
            valence: latest.valence.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::domain::InsightDraft;
    use chrono::Duration;
    use salience_state::fakes::{MemoryInsightStore, MemoryLedgerStore};

    fn valence() -> Valence {
        Valence {
            curiosity: Some(0.7),
            ..Valence::default()
        }
    }

    struct Fixture {
        store: Arc<MemoryInsightStore>,
        ledger: Arc<SalienceLedger>,
        retriever: InsightRetriever,
        topic: Topic,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryInsightStore::new());
        let ledger = Arc::new(SalienceLedger::new(
            Arc::new(MemoryLedgerStore::new()),
            LedgerConfig::default(),
        ));
        let retriever = InsightRetriever::new(store.clone(), ledger.clone(), RetrievalConfig::default());
        Fixture {
            store,
            ledger,
            retriever,
            topic: Topic::person(Some("g1"), "u1").unwrap(),
        }
    }

    async fn insert(f: &Fixture, content: &str, salience: f64, age: Duration) -> InsightRecord {
        let record = InsightDraft::new(f.topic.clone(), "person", content)
            .with_valence(valence())
            .with_salience(salience, 1.0)
            .build(Utc::now() - age)
            .unwrap();
        f.store.insert(record.clone()).await.unwrap();
        record
    }

    #[test]
    fn markers_read_naturally() {
        let now = Utc::now();
        assert_eq!(temporal_marker(now - Duration::minutes(5), now), "just now");
        assert_eq!(temporal_marker(now - Duration::minutes(90), now), "1 hour ago");
        assert_eq!(temporal_marker(now - Duration::hours(5), now), "5 hours ago");
        assert_eq!(temporal_marker(now - Duration::hours(30), now), "1 day ago");
        assert_eq!(temporal_marker(now - Duration::days(3), now), "3 days ago");
    }

    #[tokio::test]
    async fn cold_topic_weakens_old_evidence() {
        let f = fixture();
        let record = insert(&f, "likes rust", 20.0, Duration::zero()).await;
        let now = Utc::now();
        let hot = f.retriever.effective_strength(&record, 20.0, now);
        let cold = f.retriever.effective_strength(&record, 5.0, now);
        assert!(cold < hot);
        assert!((cold / hot - 0.25).abs() < 1e-3);
        let frozen = f.retriever.effective_strength(&record, 0.0, now);
        assert!((frozen / hot - 0.1).abs() < 1e-3);
    }

    #[tokio::test]
    async fn quarantined_and_superseded_are_excluded() {
        let f = fixture();
        f.ledger.earn(&f.topic, 10.0, "msg").await.unwrap();
        let old = insert(&f, "old view", 10.0, Duration::days(2)).await;
        let bad = insert(&f, "bad view", 10.0, Duration::days(1)).await;
        f.store.set_quarantined(&bad.id, true).await.unwrap();

        let newer = InsightDraft::new(f.topic.clone(), "person", "revised view")
            .with_valence(valence())
            .with_salience(10.0, 1.0)
            .superseding(old.id.clone())
            .build(Utc::now())
            .unwrap();
        f.store.insert(newer).await.unwrap();

        let got = f.retriever.retrieve(&f.topic, "deep").await.unwrap();
        let contents: Vec<&str> = got.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["revised view"]);
    }

    #[tokio::test]
    async fn recent_profile_prefers_new_and_deep_prefers_strong() {
        let f = fixture();
        f.ledger.earn(&f.topic, 90.0, "msg").await.unwrap();
        insert(&f, "strong but old", 90.0, Duration::days(10)).await;
        insert(&f, "weak but new", 5.0, Duration::hours(1)).await;

        let recent = f.retriever.retrieve(&f.topic, "recent").await.unwrap();
        assert_eq!(recent[0].content, "weak but new");
        let deep = f.retriever.retrieve(&f.topic, "deep").await.unwrap();
        assert_eq!(deep[0].content, "strong but old");
        assert_eq!(deep[0].age, "10 days ago");
    }

    #[tokio::test]
    async fn unknown_profile_is_a_config_error() {
        let f = fixture();
        assert!(f.retriever.retrieve(&f.topic, "nope").await.is_err());
    }

    #[tokio::test]
    async fn latest_miss_is_none() {
        let f = fixture();
        assert!(f.retriever.retrieve_latest(&f.topic).await.unwrap().is_none());
        insert(&f, "first", 1.0, Duration::days(1)).await;
        insert(&f, "second", 1.0, Duration::hours(1)).await;
        let latest = f.retriever.retrieve_latest(&f.topic).await.unwrap().unwrap();
        assert_eq!(latest.content, "second");
    }
}
