//! Ledger invariants and the propagation/spillover scenarios.

use std::sync::Arc;

use chrono::{Duration, Utc};
use salience_core::config::LedgerConfig;
use salience_core::{EntryQuery, SalienceLedger, Topic, TopicCategory, TransactionType};
use salience_state::fakes::MemoryLedgerStore;
use salience_state::NewEntry;

fn t(key: &str) -> Topic {
    Topic::parse(key).unwrap()
}

fn ledger() -> (Arc<MemoryLedgerStore>, SalienceLedger) {
    let store = Arc::new(MemoryLedgerStore::new());
    let ledger = SalienceLedger::new(store.clone(), LedgerConfig::default());
    (store, ledger)
}

#[tokio::test]
async fn warm_relative_receives_propagation() {
    let (_, ledger) = ledger();
    let u = t("server:g1:user:u1");
    let d = t("server:g1:dyad:u1:u2");
    ledger.earn(&d, 5.0, "seed").await.unwrap();

    ledger.earn_with_propagation(&u, 10.0, "message", true).await.unwrap();

    let balance = ledger.get_balance(&d).await.unwrap();
    assert!((balance - 8.0).abs() < 1e-9, "dyad balance {balance}");
    assert_eq!(ledger.get_balance(&u).await.unwrap(), 10.0);
}

#[tokio::test]
async fn overflow_spills_to_warm_relative() {
    let (_, ledger) = ledger();
    let u = t("server:g1:user:u1");
    let d = t("server:g1:dyad:u1:u2");
    ledger.earn(&u, 95.0, "seed").await.unwrap();
    ledger.earn(&d, 5.0, "seed").await.unwrap();

    let outcome = ledger
        .earn_with_propagation(&u, 15.0, "message", true)
        .await
        .unwrap();

    assert_eq!(outcome.credited, 5.0);
    assert_eq!(outcome.overflow, 10.0);
    assert_eq!(ledger.get_balance(&u).await.unwrap(), 100.0);
    let balance = ledger.get_balance(&d).await.unwrap();
    assert!((balance - 14.5).abs() < 1e-9, "dyad balance {balance}");

    let spill = ledger
        .store()
        .entries(&EntryQuery::for_topic(d.key()).with_type(TransactionType::Spillover))
        .await
        .unwrap();
    assert_eq!(spill.len(), 1);
    assert_eq!(spill[0].source_topic.as_deref(), Some("server:g1:user:u1"));
}

#[tokio::test]
async fn propagation_is_one_hop_only() {
    let (_, ledger) = ledger();
    let u = t("server:g1:user:u1");
    let d = t("server:g1:dyad:u1:u2");
    let d_in_c = t("server:g1:dyad:u1:u2:channel:c1");
    let u2 = t("server:g1:user:u2");
    for topic in [&d, &d_in_c, &u2] {
        ledger.earn(topic, 20.0, "seed").await.unwrap();
    }

    ledger.earn_with_propagation(&u, 30.0, "message", true).await.unwrap();

    assert!(ledger.get_balance(&d).await.unwrap() > 20.0);
    assert_eq!(ledger.get_balance(&d_in_c).await.unwrap(), 20.0);
    assert_eq!(ledger.get_balance(&u2).await.unwrap(), 20.0);
}

#[tokio::test]
async fn balances_never_exceed_caps() {
    let (_, ledger) = ledger();
    let keys = [
        "server:g1:user:u1",
        "server:g1:user:u2",
        "server:g1:dyad:u1:u2",
        "server:g1:channel:c1",
        "server:g1:user:u1:channel:c1",
        "server:g1:dyad:u1:u2:channel:c1",
        "user:u1",
    ];
    for round in 0..12 {
        for (i, key) in keys.iter().enumerate() {
            let amount = 7.0 + (round * 3 + i) as f64;
            ledger
                .earn_with_propagation(&t(key), amount, "burst", true)
                .await
                .unwrap();
        }
    }
    for snapshot in ledger.known_topics().await.unwrap() {
        let cap = ledger.config().cap_for(snapshot.topic.category());
        assert!(
            snapshot.balance <= cap + 1e-9,
            "{} at {} exceeds cap {}",
            snapshot.topic,
            snapshot.balance,
            cap
        );
    }
    let pair_cap = ledger.config().cap_for(TopicCategory::PairInChannel);
    let pair = ledger
        .get_balance(&t("server:g1:dyad:u1:u2:channel:c1"))
        .await
        .unwrap();
    assert!((pair - pair_cap).abs() < 1e-9, "pair-in-channel at {pair}");
}

#[tokio::test]
async fn balance_equals_sum_of_entries() {
    let (_, ledger) = ledger();
    let u = t("server:g1:user:u1");
    let c = t("server:g1:channel:c1");
    let uc = t("server:g1:user:u1:channel:c1");
    ledger.earn(&c, 4.0, "seed").await.unwrap();
    ledger.earn(&uc, 3.0, "seed").await.unwrap();
    ledger.earn_with_propagation(&u, 12.0, "message", true).await.unwrap();
    ledger.spend(&c, 2.5, "reflection").await.unwrap();
    ledger.retain(&uc, 0.5, "reflected").await.unwrap();
    ledger.decay_at(Utc::now() + Duration::hours(12)).await.unwrap();

    for topic in [&u, &c, &uc] {
        let sum: f64 = ledger
            .entries(topic)
            .await
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum();
        let balance = ledger.get_balance(topic).await.unwrap();
        assert!((balance - sum).abs() < 1e-9, "{topic}: {balance} != {sum}");
    }
}

#[tokio::test]
async fn repeated_decay_only_decreases() {
    let (store, ledger) = ledger();
    let now = Utc::now();
    store
        .append_at(
            NewEntry::new("server:g1:subject:rust", TransactionType::Earn, 40.0),
            now - Duration::hours(8),
        )
        .unwrap();
    let topic = t("server:g1:subject:rust");

    let mut previous = ledger.get_balance(&topic).await.unwrap();
    for hour in 0..6 {
        ledger.decay_at(now + Duration::hours(hour * 10)).await.unwrap();
        let balance = ledger.get_balance(&topic).await.unwrap();
        assert!(balance <= previous, "decay raised {previous} to {balance}");
        assert!(balance >= 0.0);
        previous = balance;
    }
    assert!(previous < 40.0);
}

#[tokio::test]
async fn negligible_decay_is_skipped() {
    let (store, ledger) = ledger();
    let now = Utc::now();
    store
        .append_at(
            NewEntry::new("server:g1:emoji:wave", TransactionType::Earn, 0.1),
            now - Duration::hours(7),
        )
        .unwrap();
    // 0.1 × 0.01 × 7 = 0.007 < epsilon
    let report = ledger.decay_at(now).await.unwrap();
    assert_eq!(report.topics_decayed, 0);
    assert_eq!(store.len(), 1);
}
