//! Audit / introspection surface.
//!
//! Read-only, paginated queries over entries, runs and insights, plus the
//! maintenance operations (manual decay, quarantine flips). Maintenance is
//! refused unless `[audit].allow_maintenance` is set.

use std::sync::Arc;

use salience_state::{
    EntryQuery, InsightQuery, InsightRecord, LayerRunRecord, LedgerEntry, RunQuery,
};
use serde::Serialize;
use tracing::info;

use crate::domain::{Result, SalienceError, TopicCategory};
use crate::ledger::{DecayReport, TopicSnapshot};
use crate::services::Services;

/// Decay applied by a manual maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceDecay {
    pub salience_topics: usize,
    pub salience_total: f64,
    pub impulse_topics: usize,
    pub impulse_total: f64,
}

impl MaintenanceDecay {
    fn from_reports(salience: DecayReport, impulse: DecayReport) -> Self {
        Self {
            salience_topics: salience.topics_decayed,
            salience_total: salience.total_decayed,
            impulse_topics: impulse.topics_decayed,
            impulse_total: impulse.total_decayed,
        }
    }
}

pub struct AuditSurface {
    services: Arc<Services>,
}

impl AuditSurface {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn page_limit(&self, requested: Option<usize>) -> usize {
        let max = self.services.config.audit.max_page_size;
        requested.map_or(max, |l| l.min(max))
    }

    fn gate(&self, operation: &str) -> Result<()> {
        if self.services.config.audit.allow_maintenance {
            Ok(())
        } else {
            Err(SalienceError::MaintenanceDisabled(operation.to_string()))
        }
    }

    pub async fn entries(&self, query: EntryQuery) -> Result<Vec<LedgerEntry>> {
        let (offset, limit) = (query.offset, self.page_limit(query.limit));
        let query = query.page(offset, limit);
        Ok(self.services.stores.salience.entries(&query).await?)
    }

    pub async fn impulse_entries(&self, query: EntryQuery) -> Result<Vec<LedgerEntry>> {
        let (offset, limit) = (query.offset, self.page_limit(query.limit));
        let query = query.page(offset, limit);
        Ok(self.services.stores.impulse.entries(&query).await?)
    }

    pub async fn runs(&self, query: RunQuery) -> Result<Vec<LayerRunRecord>> {
        let (offset, limit) = (query.offset, self.page_limit(query.limit));
        let query = query.page(offset, limit);
        Ok(self.services.stores.runs.list_runs(&query).await?)
    }

    pub async fn run(&self, run_id: &str) -> Result<LayerRunRecord> {
        Ok(self.services.stores.runs.get_run(run_id).await?)
    }

    pub async fn insights(&self, query: InsightQuery) -> Result<Vec<InsightRecord>> {
        let (offset, limit) = (query.offset, self.page_limit(query.limit));
        let query = query.page(offset, limit);
        Ok(self.services.stores.insights.query(&query).await?)
    }

    pub async fn insight(&self, id: &str) -> Result<InsightRecord> {
        Ok(self.services.stores.insights.get(id).await?)
    }

    /// Known topics, highest balance first.
    pub async fn topics(
        &self,
        category: Option<TopicCategory>,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<TopicSnapshot>> {
        let mut topics: Vec<TopicSnapshot> = self
            .services
            .ledger
            .known_topics()
            .await?
            .into_iter()
            .filter(|s| category.map_or(true, |c| s.topic.category() == c))
            .collect();
        topics.sort_by(|a, b| b.balance.total_cmp(&a.balance));
        Ok(topics
            .into_iter()
            .skip(offset)
            .take(self.page_limit(limit))
            .collect())
    }

    // -- maintenance -------------------------------------------------------

    /// Decay both ledgers now.
    pub async fn run_decay(&self) -> Result<MaintenanceDecay> {
        self.gate("run_decay")?;
        let salience = self.services.ledger.decay().await?;
        let impulse = self.services.impulse.apply_decay().await?;
        info!(
            salience_topics = salience.topics_decayed,
            impulse_topics = impulse.topics_decayed,
            "manual decay"
        );
        Ok(MaintenanceDecay::from_reports(salience, impulse))
    }

    pub async fn quarantine_insight(&self, id: &str) -> Result<()> {
        self.gate("quarantine_insight")?;
        self.services.stores.insights.set_quarantined(id, true).await?;
        info!(insight = id, "insight quarantined");
        Ok(())
    }

    pub async fn unquarantine_insight(&self, id: &str) -> Result<()> {
        self.gate("unquarantine_insight")?;
        self.services.stores.insights.set_quarantined(id, false).await?;
        info!(insight = id, "insight released from quarantine");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SalienceConfig;
    use crate::domain::{InsightDraft, Topic};
    use chrono::Utc;
    use salience_state::Valence;

    fn surface(allow_maintenance: bool, max_page_size: usize) -> AuditSurface {
        let mut config = SalienceConfig::default();
        config.audit.allow_maintenance = allow_maintenance;
        config.audit.max_page_size = max_page_size;
        AuditSurface::new(Arc::new(Services::in_memory(config).unwrap()))
    }

    #[tokio::test]
    async fn page_size_is_capped() {
        let audit = surface(false, 3);
        let topic = Topic::channel("g1", "c1").unwrap();
        for _ in 0..5 {
            audit.services.ledger.earn(&topic, 1.0, "msg").await.unwrap();
        }
        assert_eq!(audit.entries(EntryQuery::all()).await.unwrap().len(), 3);
        let second = audit.entries(EntryQuery::all().page(3, 100)).await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn maintenance_is_gated() {
        let audit = surface(false, 10);
        assert!(matches!(
            audit.run_decay().await,
            Err(SalienceError::MaintenanceDisabled(_))
        ));
        assert!(matches!(
            audit.quarantine_insight("x").await,
            Err(SalienceError::MaintenanceDisabled(_))
        ));
    }

    #[tokio::test]
    async fn quarantine_round_trip_hides_insight() {
        let audit = surface(true, 10);
        let record = InsightDraft::new(Topic::person(None, "u1").unwrap(), "person", "kind")
            .with_valence(Valence {
                warmth: Some(0.8),
                ..Valence::default()
            })
            .build(Utc::now())
            .unwrap();
        let id = record.id.clone();
        audit.services.stores.insights.insert(record).await.unwrap();

        audit.quarantine_insight(&id).await.unwrap();
        assert!(audit.insights(InsightQuery::all()).await.unwrap().is_empty());
        assert!(audit.insight(&id).await.unwrap().quarantined);

        audit.unquarantine_insight(&id).await.unwrap();
        assert_eq!(audit.insights(InsightQuery::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn topics_sorted_by_balance() {
        let audit = surface(false, 10);
        let ledger = &audit.services.ledger;
        ledger.earn(&Topic::channel("g1", "quiet").unwrap(), 1.0, "m").await.unwrap();
        ledger.earn(&Topic::channel("g1", "busy").unwrap(), 9.0, "m").await.unwrap();
        ledger.earn(&Topic::person(Some("g1"), "u").unwrap(), 5.0, "m").await.unwrap();

        let all = audit.topics(None, 0, None).await.unwrap();
        assert_eq!(all[0].topic.key(), "server:g1:channel:busy");
        let channels = audit.topics(Some(TopicCategory::Channel), 1, Some(5)).await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].topic.key(), "server:g1:channel:quiet");
    }

    #[tokio::test]
    async fn topics_report_provisional_state() {
        let audit = surface(false, 10);
        let ledger = &audit.services.ledger;
        assert!(ledger.warm_from_dm("u9").await.unwrap());
        ledger.earn(&Topic::channel("g1", "busy").unwrap(), 9.0, "m").await.unwrap();

        let flags: Vec<(String, bool)> = audit
            .topics(None, 0, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.topic.key(), s.provisional))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("server:g1:channel:busy".to_string(), false),
                ("user:u9".to_string(), true),
            ]
        );

        ledger.earn(&Topic::person(None, "u9").unwrap(), 1.0, "dm").await.unwrap();
        let snapshot = ledger.snapshot(&Topic::person(None, "u9").unwrap()).await.unwrap().unwrap();
        assert!(!snapshot.provisional);
    }
}
