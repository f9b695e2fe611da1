//! Scheduler behaviour: single flight, catch-up, self triggers, pause.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use salience_core::config::{ModelProfileConfig, ProviderConfig};
use salience_core::fakes::ScriptedModelClient;
use salience_core::{
    ConfigError, InsightDraft, JobState, Layer, LayerExecutor, LayerRunRecord, ReflectionScheduler,
    RunQuery, RunStatus, SalienceConfig, SalienceError, Services, StaticLayerSource, Step, Topic,
    TopicCategory, TriggerOutcome, Valence,
};

fn config() -> SalienceConfig {
    let mut config = SalienceConfig::default();
    config
        .models
        .providers
        .insert("local".to_string(), ProviderConfig::default());
    config.models.profiles.insert(
        "reflect".to_string(),
        ModelProfileConfig {
            provider: "local".to_string(),
            model: "tiny".to_string(),
            temperature: None,
            max_tokens: None,
        },
    );
    config
}

fn layer(name: &str, category: TopicCategory, schedule: Option<&str>) -> Layer {
    Layer {
        name: name.to_string(),
        description: None,
        target_category: category,
        max_targets: 5,
        schedule: schedule.map(str::to_string),
        self_trigger_threshold: None,
        insight_category: None,
        steps: vec![
            Step::InvokeModel {
                profile: "reflect".to_string(),
                system: None,
                prompt: "{topic}".to_string(),
            },
            Step::ParseOutput,
            Step::PersistInsight,
        ],
    }
}

struct Harness {
    services: Arc<Services>,
    client: Arc<ScriptedModelClient>,
    scheduler: ReflectionScheduler,
}

fn harness(client: ScriptedModelClient, layers: Vec<Layer>) -> Harness {
    let client = Arc::new(client);
    let services = Arc::new(
        Services::in_memory(config())
            .unwrap()
            .with_model_client(client.clone()),
    );
    let executor = Arc::new(LayerExecutor::new(services.clone()));
    let source = Arc::new(StaticLayerSource::new(layers));
    let scheduler = ReflectionScheduler::new(services.clone(), executor, source);
    Harness {
        services,
        client,
        scheduler,
    }
}

async fn completed_run(services: &Services, layer: &str, hours_ago: i64) {
    let mut run = LayerRunRecord::start(layer, "", false);
    run.started_at = Utc::now() - chrono::Duration::hours(hours_ago);
    run.completed_at = Some(run.started_at + chrono::Duration::minutes(1));
    run.status = RunStatus::Success;
    services.stores.runs.create_run(&run).await.unwrap();
}

#[tokio::test]
async fn concurrent_triggers_run_once() {
    let h = harness(
        ScriptedModelClient::new().with_delay(Duration::from_millis(300)),
        vec![layer("people", TopicCategory::Person, None)],
    );
    let u1 = Topic::person(Some("g1"), "u1").unwrap();
    h.services.ledger.earn(&u1, 20.0, "message").await.unwrap();
    h.scheduler.register_all(Utc::now()).await.unwrap();

    let (a, b) = tokio::join!(
        h.scheduler.trigger_now("people"),
        h.scheduler.trigger_now("people")
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::Completed(_)))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::AlreadyRunning))
        .count();
    assert_eq!((completed, skipped), (1, 1));
    assert_eq!(h.client.call_count(), 1);

    // The flight mark is cleared once the run ends.
    let again = h.scheduler.trigger_now("people").await.unwrap();
    assert!(again.run().is_some());
}

#[tokio::test]
async fn missed_firing_runs_once_on_startup() {
    let h = harness(
        ScriptedModelClient::new(),
        vec![layer("hourly", TopicCategory::Channel, Some("0 * * * *"))],
    );
    completed_run(&h.services, "hourly", 3).await;

    let now = Utc::now();
    h.scheduler.register_all(now).await.unwrap();
    let states = h.scheduler.job_states();
    let status = &states[0];
    assert!(status.catch_up_pending);
    assert!(status.next_fire.is_some_and(|t| t > now));

    let first = h.scheduler.tick(now).await;
    assert_eq!(first.len(), 1);
    assert!(first[0].1.as_ref().unwrap().run().is_some());

    let second = h.scheduler.tick(now).await;
    assert!(second.is_empty());

    let runs = h
        .services
        .stores
        .runs
        .list_runs(&RunQuery::for_layer("hourly"))
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn recent_run_needs_no_catch_up() {
    let h = harness(
        ScriptedModelClient::new(),
        vec![layer("daily", TopicCategory::Channel, Some("0 3 * * *"))],
    );
    let now = Utc::now();
    completed_run(&h.services, "daily", 0).await;
    h.scheduler.register_all(now).await.unwrap();
    assert!(!h.scheduler.job_states()[0].catch_up_pending);
}

#[tokio::test]
async fn self_insights_trigger_self_layer() {
    let mut own = layer("self-review", TopicCategory::SelfFacet, None);
    own.self_trigger_threshold = Some(2);
    let h = harness(ScriptedModelClient::new(), vec![own]);
    h.scheduler.register_all(Utc::now()).await.unwrap();

    assert!(h.scheduler.tick(Utc::now()).await.is_empty());

    for content in ["I hedge too much", "I enjoy code review threads"] {
        let record = InsightDraft::new(Topic::self_facet("voice").unwrap(), "self", content)
            .with_valence(Valence {
                curiosity: Some(0.4),
                ..Valence::default()
            })
            .build(Utc::now())
            .unwrap();
        h.services.stores.insights.insert(record).await.unwrap();
    }

    let fired = h.scheduler.tick(Utc::now()).await;
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, "self-review");

    // Counting restarts from the completed run.
    assert!(h.scheduler.tick(Utc::now()).await.is_empty());
}

#[tokio::test]
async fn paused_job_skips_ticks_but_not_manual_triggers() {
    let h = harness(
        ScriptedModelClient::new(),
        vec![layer("hourly", TopicCategory::Channel, Some("0 * * * *"))],
    );
    let now = Utc::now();
    h.scheduler.register_all(now).await.unwrap();
    h.scheduler.pause("hourly").unwrap();
    assert_eq!(h.scheduler.job_states()[0].state, JobState::Paused);

    let later = now + chrono::Duration::hours(3);
    assert!(h.scheduler.tick(later).await.is_empty());

    let manual = h.scheduler.trigger_now("hourly").await.unwrap();
    assert!(manual.run().is_some());

    h.scheduler.resume("hourly", later).unwrap();
    let states = h.scheduler.job_states();
    let status = &states[0];
    assert_eq!(status.state, JobState::Scheduled);
    assert!(status.next_fire.is_some_and(|t| t > later));
}

#[tokio::test]
async fn pausing_an_unknown_layer_fails() {
    let h = harness(ScriptedModelClient::new(), vec![]);
    assert!(matches!(
        h.scheduler.pause("nope"),
        Err(SalienceError::LayerNotFound(_))
    ));
}

#[tokio::test]
async fn registration_rejects_unknown_profiles() {
    let mut bad = layer("people", TopicCategory::Person, None);
    bad.steps[0] = Step::InvokeModel {
        profile: "missing".to_string(),
        system: None,
        prompt: "{topic}".to_string(),
    };
    let h = harness(ScriptedModelClient::new(), vec![bad]);

    let err = h.scheduler.register_all(Utc::now()).await.unwrap_err();
    assert!(matches!(
        err,
        SalienceError::Config(ConfigError::UnknownProfile(ref p)) if p == "missing"
    ));
}

#[tokio::test]
async fn registration_rejects_bad_cron() {
    let h = harness(
        ScriptedModelClient::new(),
        vec![layer("broken", TopicCategory::Channel, Some("every tuesday"))],
    );
    let err = h.scheduler.register_all(Utc::now()).await.unwrap_err();
    assert!(matches!(
        err,
        SalienceError::Config(ConfigError::InvalidSchedule { .. })
    ));
}

#[tokio::test]
async fn targets_respect_category_and_cap() {
    let mut people = layer("people", TopicCategory::Person, None);
    people.max_targets = 2;
    let h = harness(ScriptedModelClient::new(), vec![people.clone()]);
    for (user, amount) in [("u1", 30.0), ("u2", 20.0), ("u3", 10.0)] {
        let topic = Topic::person(Some("g1"), user).unwrap();
        h.services.ledger.earn(&topic, amount, "message").await.unwrap();
    }
    let channel = Topic::channel("g1", "general").unwrap();
    h.services.ledger.earn(&channel, 50.0, "message").await.unwrap();

    let targets = h.scheduler.select_targets(&people).await.unwrap();
    let keys: Vec<String> = targets.iter().map(Topic::key).collect();
    assert_eq!(keys, vec!["server:g1:user:u1", "server:g1:user:u2"]);
}

#[tokio::test]
async fn registration_rejects_non_positive_spend() {
    let mut bad = layer("people", TopicCategory::Person, None);
    bad.steps.push(Step::SpendBudget { amount: Some(0.0) });
    let h = harness(ScriptedModelClient::new(), vec![bad]);

    let err = h.scheduler.register_all(Utc::now()).await.unwrap_err();
    assert!(matches!(
        err,
        SalienceError::Config(ConfigError::InvalidLayer { ref layer, .. }) if layer == "people"
    ));
    assert!(h.scheduler.job_states().is_empty());
}
