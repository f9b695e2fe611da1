//! Reflection selector / budget allocator.
//!
//! Turns numeric budgets into ranked, capped topic lists. Each scoped
//! group gets its share of a per-scope budget; global and self topics draw
//! from their own pools. Unspent budget expires at the end of the cycle.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::BudgetConfig;
use crate::domain::{BudgetGroup, Result, Topic, TopicCategory};
use crate::ledger::{SalienceLedger, TopicSnapshot};

/// Selected topic keys per budget group.
pub type GroupSelection = BTreeMap<BudgetGroup, Vec<String>>;

pub struct ReflectionSelector {
    ledger: Arc<SalienceLedger>,
    budget: BudgetConfig,
}

impl ReflectionSelector {
    pub fn new(ledger: Arc<SalienceLedger>, budget: BudgetConfig) -> Self {
        Self { ledger, budget }
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    fn share(&self, group: BudgetGroup) -> f64 {
        match group {
            BudgetGroup::Social => self.budget.shares.social,
            BudgetGroup::Spaces => self.budget.shares.spaces,
            BudgetGroup::Semantic => self.budget.shares.semantic,
            BudgetGroup::Global | BudgetGroup::SelfFacet => 1.0,
        }
    }

    /// Warm topics matching `filter`.
    async fn candidates(&self, filter: impl Fn(&Topic) -> bool) -> Result<Vec<TopicSnapshot>> {
        Ok(self
            .ledger
            .warm_topics()
            .await?
            .into_iter()
            .filter(|s| filter(&s.topic))
            .collect())
    }

    /// Split `total_budget` across groups and pick topics for each.
    ///
    /// With `global_only` the whole budget goes to global topics. Otherwise
    /// the scoped groups share it, restricted to `scope` when given, and
    /// the map also carries [`BudgetGroup::SelfFacet`] filled from the self
    /// pool, independent of `total_budget`.
    pub async fn select_for_reflection(
        &self,
        total_budget: f64,
        scope: Option<&str>,
        global_only: bool,
    ) -> Result<GroupSelection> {
        let warm = self
            .candidates(|t| {
                if global_only {
                    t.is_global()
                } else {
                    !t.is_global() && !t.is_self() && scope.map_or(true, |s| t.scope() == Some(s))
                }
            })
            .await?;

        let groups: &[BudgetGroup] = if global_only {
            &[BudgetGroup::Global]
        } else {
            &BudgetGroup::SCOPED
        };

        let mut selection = GroupSelection::new();
        for &group in groups {
            let budget = total_budget * self.share(group);
            let members: Vec<TopicSnapshot> = warm
                .iter()
                .filter(|s| s.topic.budget_group() == group)
                .cloned()
                .collect();
            selection.insert(group, self.fill(members, budget));
        }
        if !global_only {
            let own = self.select_self(self.budget.self_budget).await?;
            selection.insert(BudgetGroup::SelfFacet, own);
        }
        debug!(?scope, global_only, total_budget, "selected for reflection");
        Ok(selection)
    }

    /// Pick self topics against the self pool.
    pub async fn select_self(&self, budget: f64) -> Result<Vec<String>> {
        let warm = self.candidates(Topic::is_self).await?;
        Ok(self.fill(warm, budget))
    }

    /// Full cycle for one layer: every scope with its own budget, then the
    /// global pass, then the self pool. Restricted to `category` when given,
    /// in which case the full per-scope budget goes to that category.
    ///
    /// A global topic is dropped when its scoped form was also selected.
    pub async fn select_cycle(&self, category: Option<TopicCategory>) -> Result<Vec<Topic>> {
        let warm = self
            .candidates(|t| category.map_or(true, |c| t.category() == c))
            .await?;

        let mut by_scope: BTreeMap<&str, Vec<TopicSnapshot>> = BTreeMap::new();
        let mut global = Vec::new();
        let mut own = Vec::new();
        for s in &warm {
            match s.topic.scope() {
                Some(scope) => by_scope.entry(scope).or_default().push(s.clone()),
                None if s.topic.is_self() => own.push(s.clone()),
                None => global.push(s.clone()),
            }
        }

        let mut picked: Vec<String> = Vec::new();
        for (scope, members) in by_scope {
            if category.is_some() {
                picked.extend(self.fill(members, self.budget.scope_budget));
                continue;
            }
            for group in BudgetGroup::SCOPED {
                let budget = self.budget.scope_budget * self.share(group);
                let in_group: Vec<TopicSnapshot> = members
                    .iter()
                    .filter(|s| s.topic.budget_group() == group)
                    .cloned()
                    .collect();
                picked.extend(self.fill(in_group, budget));
            }
            debug!(scope, "scope selected");
        }

        let scoped: Vec<Topic> = picked
            .iter()
            .filter_map(|k| Topic::parse(k).ok())
            .collect();
        let globals = self.fill(global, self.budget.global_budget);
        let selves = self.fill(own, self.budget.self_budget);

        let mut out = scoped.clone();
        for key in globals {
            let Ok(topic) = Topic::parse(&key) else { continue };
            let shadowed = scoped
                .iter()
                .any(|s| s.global_counterpart().as_ref() == Some(&topic));
            if shadowed {
                debug!(topic = %topic, "global duplicate dropped");
                continue;
            }
            out.push(topic);
        }
        out.extend(selves.iter().filter_map(|k| Topic::parse(k).ok()));
        Ok(out)
    }

    /// Rank by balance (then most recent activity) and accept greedily while
    /// each topic's cost fits in what is left. Topics that do not fit are
    /// passed over in favour of cheaper ones further down.
    fn fill(&self, mut members: Vec<TopicSnapshot>, budget: f64) -> Vec<String> {
        members.sort_by(rank);
        let mut remaining = budget;
        let mut accepted = Vec::new();
        for s in members {
            let cost = self.budget.cost_for(s.topic.category());
            if cost <= remaining {
                remaining -= cost;
                accepted.push(s.topic.key());
            }
        }
        accepted
    }
}

fn rank(a: &TopicSnapshot, b: &TopicSnapshot) -> Ordering {
    b.balance
        .total_cmp(&a.balance)
        .then_with(|| b.last_activity_at.cmp(&a.last_activity_at))
        .then_with(|| a.topic.key().cmp(&b.topic.key()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use salience_state::fakes::MemoryLedgerStore;

    async fn setup(seed: &[(&str, f64)]) -> ReflectionSelector {
        let ledger = Arc::new(SalienceLedger::new(
            Arc::new(MemoryLedgerStore::new()),
            LedgerConfig::default(),
        ));
        for (key, amount) in seed {
            ledger
                .earn(&Topic::parse(key).unwrap(), *amount, "seed")
                .await
                .unwrap();
        }
        ReflectionSelector::new(ledger, BudgetConfig::default())
    }

    #[tokio::test]
    async fn groups_respect_their_share() {
        let selector = setup(&[
            ("server:g1:user:a", 10.0),
            ("server:g1:user:b", 9.0),
            ("server:g1:user:c", 8.0),
            ("server:g1:channel:x", 7.0),
            ("server:g1:channel:y", 6.0),
            ("server:g1:subject:rust", 5.0),
        ])
        .await;

        // budget 4: social 2, spaces 1.2, semantic 0.8
        let picked = selector.select_for_reflection(4.0, Some("g1"), false).await.unwrap();
        assert_eq!(
            picked[&BudgetGroup::Social],
            vec!["server:g1:user:a", "server:g1:user:b"]
        );
        assert_eq!(picked[&BudgetGroup::Spaces], vec!["server:g1:channel:x"]);
        assert!(picked[&BudgetGroup::Semantic].is_empty());
    }

    #[tokio::test]
    async fn cold_topics_are_never_selected() {
        let selector = setup(&[("server:g1:user:a", 0.5), ("server:g1:user:b", 2.0)]).await;
        let picked = selector.select_for_reflection(10.0, Some("g1"), false).await.unwrap();
        assert_eq!(picked[&BudgetGroup::Social], vec!["server:g1:user:b"]);
    }

    #[tokio::test]
    async fn self_topics_use_their_own_pool() {
        let selector = setup(&[
            ("server:g1:user:a", 10.0),
            ("self:mood", 3.0),
            ("self:voice", 2.5),
            ("self:pace", 2.0),
        ])
        .await;

        let picked = selector.select_for_reflection(0.0, Some("g1"), false).await.unwrap();
        assert!(picked[&BudgetGroup::Social].is_empty());
        assert_eq!(picked[&BudgetGroup::SelfFacet], vec!["self:mood", "self:voice"]);

        let global = selector.select_for_reflection(5.0, None, true).await.unwrap();
        assert!(!global.contains_key(&BudgetGroup::SelfFacet));
    }

    #[tokio::test]
    async fn global_pool_is_separate() {
        let selector = setup(&[("server:g1:user:a", 10.0), ("user:z", 3.0)]).await;
        let picked = selector.select_for_reflection(1.0, None, true).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[&BudgetGroup::Global], vec!["user:z"]);
    }

    #[tokio::test]
    async fn cycle_drops_global_duplicate_of_scoped_pick() {
        let selector = setup(&[
            ("server:g1:user:a", 10.0),
            ("user:a", 10.0),
            ("user:b", 4.0),
            ("self:mood", 3.0),
        ])
        .await;
        let keys: Vec<String> = selector
            .select_cycle(None)
            .await
            .unwrap()
            .iter()
            .map(Topic::key)
            .collect();
        assert_eq!(keys, vec!["server:g1:user:a", "user:b", "self:mood"]);
    }

    #[tokio::test]
    async fn category_cycle_gives_each_scope_its_own_budget() {
        let mut seed = Vec::new();
        let noisy: Vec<String> = (0..20).map(|i| format!("server:big:user:u{i}")).collect();
        for key in &noisy {
            seed.push((key.as_str(), 50.0));
        }
        seed.push(("server:small:user:q", 2.0));
        let selector = setup(&seed).await;

        let picked = selector.select_cycle(Some(TopicCategory::Person)).await.unwrap();
        let big = picked.iter().filter(|t| t.scope() == Some("big")).count();
        assert_eq!(big, 10);
        assert!(picked.iter().any(|t| t.key() == "server:small:user:q"));
    }
}
