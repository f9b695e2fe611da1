//! Reflection scheduler.
//!
//! Per-layer job state machine: scheduled → running → scheduled, with
//! paused reachable from scheduled. Jobs are rebuilt from the current layer
//! definitions at registration, never restored from storage. A layer runs
//! at most once at a time; a trigger that finds it running is a no-op.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use salience_state::{InsightQuery, LayerRunRecord};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::{ConfigError, Result, SalienceError, Topic, TopicCategory};
use crate::executor::LayerExecutor;
use crate::layer::{Layer, LayerSource};
use crate::metrics::METRICS;
use crate::obs;
use crate::services::Services;

/// Accept 5-field cron by prepending a seconds field.
pub fn normalize_expression(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub fn parse_schedule(layer: &str, expr: &str) -> std::result::Result<Schedule, ConfigError> {
    Schedule::from_str(&normalize_expression(expr)).map_err(|e| ConfigError::InvalidSchedule {
        layer: layer.to_string(),
        expression: expr.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Paused,
}

/// Snapshot of one registered job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub layer: String,
    pub state: JobState,
    pub schedule: Option<String>,
    pub next_fire: Option<DateTime<Utc>>,
    pub catch_up_pending: bool,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// What a trigger did.
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(LayerRunRecord),
    AlreadyRunning,
}

impl TriggerOutcome {
    pub fn run(&self) -> Option<&LayerRunRecord> {
        match self {
            Self::Completed(run) => Some(run),
            Self::AlreadyRunning => None,
        }
    }
}

struct Job {
    layer: Layer,
    schedule: Option<Schedule>,
    paused: bool,
    next_fire: Option<DateTime<Utc>>,
    catch_up: bool,
    last_run_at: Option<DateTime<Utc>>,
}

/// Clears the in-flight mark when the run ends, however it ends.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    layer: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.layer);
        }
    }
}

pub struct ReflectionScheduler {
    services: Arc<Services>,
    executor: Arc<LayerExecutor>,
    source: Arc<dyn LayerSource>,
    jobs: Mutex<BTreeMap<String, Job>>,
    in_flight: Mutex<HashSet<String>>,
}

impl ReflectionScheduler {
    pub fn new(
        services: Arc<Services>,
        executor: Arc<LayerExecutor>,
        source: Arc<dyn LayerSource>,
    ) -> Self {
        Self {
            services,
            executor,
            source,
            jobs: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rebuild every job from the current layer definitions.
    ///
    /// Fails on the first invalid schedule or unresolvable model profile.
    /// Layers that missed a firing since their last completed run get one
    /// catch-up run on the next tick.
    pub async fn register_all(&self, now: DateTime<Utc>) -> Result<usize> {
        self.source.reload().await?;
        let layers = self.source.layers().await?;

        let mut fresh = BTreeMap::new();
        for layer in layers {
            layer.validate()?;
            for profile in layer.model_profiles() {
                self.services.models.resolve(profile)?;
            }
            let schedule = match &layer.schedule {
                Some(expr) => Some(parse_schedule(&layer.name, expr)?),
                None => None,
            };
            let last = self
                .services
                .stores
                .runs
                .last_completed(&layer.name)
                .await?
                .and_then(|r| r.completed_at);
            let catch_up = self.services.config.scheduler.catch_up
                && match (&schedule, last) {
                    (Some(s), Some(last)) => s.after(&last).next().is_some_and(|t| t <= now),
                    _ => false,
                };
            let next_fire = schedule.as_ref().and_then(|s| s.after(&now).next());
            debug!(layer = %layer.name, ?next_fire, catch_up, "job registered");
            fresh.insert(
                layer.name.clone(),
                Job {
                    layer,
                    schedule,
                    paused: false,
                    next_fire,
                    catch_up,
                    last_run_at: last,
                },
            );
        }
        let count = fresh.len();
        *self.jobs() = fresh;
        info!(jobs = count, "scheduler registered layers");
        Ok(count)
    }

    pub fn pause(&self, layer: &str) -> Result<()> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(layer)
            .ok_or_else(|| SalienceError::LayerNotFound(layer.to_string()))?;
        job.paused = true;
        info!(layer, "job paused");
        Ok(())
    }

    /// Resume from `now`; firings missed while paused are not replayed.
    pub fn resume(&self, layer: &str, now: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs();
        let job = jobs
            .get_mut(layer)
            .ok_or_else(|| SalienceError::LayerNotFound(layer.to_string()))?;
        job.paused = false;
        job.next_fire = job.schedule.as_ref().and_then(|s| s.after(&now).next());
        info!(layer, "job resumed");
        Ok(())
    }

    pub fn job_states(&self) -> Vec<JobStatus> {
        let running = self
            .in_flight
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        self.jobs()
            .iter()
            .map(|(name, job)| JobStatus {
                layer: name.clone(),
                state: if running.contains(name) {
                    JobState::Running
                } else if job.paused {
                    JobState::Paused
                } else {
                    JobState::Scheduled
                },
                schedule: job.layer.schedule.clone(),
                next_fire: job.next_fire,
                catch_up_pending: job.catch_up,
                last_run_at: job.last_run_at,
            })
            .collect()
    }

    /// Run every due job. Distinct layers run concurrently.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<(String, Result<TriggerOutcome>)> {
        let candidates: Vec<(String, bool, Option<usize>)> = {
            let mut jobs = self.jobs();
            jobs.iter_mut()
                .filter(|(_, job)| !job.paused)
                .map(|(name, job)| {
                    let fired = job.next_fire.is_some_and(|t| t <= now);
                    let due = fired || job.catch_up;
                    if due {
                        job.catch_up = false;
                        job.next_fire = job.schedule.as_ref().and_then(|s| s.after(&now).next());
                    }
                    (name.clone(), due, job.layer.self_trigger_threshold)
                })
                .collect()
        };

        let mut due = Vec::new();
        for (name, scheduled, threshold) in candidates {
            if scheduled {
                due.push(name);
                continue;
            }
            if let Some(threshold) = threshold {
                match self.self_insights_since_last_run(&name).await {
                    Ok(count) if count >= threshold => {
                        info!(layer = %name, count, threshold, "self-reflection threshold reached");
                        due.push(name);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(layer = %name, error = %e, "self-trigger check failed"),
                }
            }
        }

        let results = futures::future::join_all(due.into_iter().map(|name| async move {
            let outcome = self.trigger(&name, false).await;
            (name, outcome)
        }))
        .await;
        METRICS.flush();
        results
    }

    /// Count self insights created since the layer's last completed run.
    async fn self_insights_since_last_run(&self, layer: &str) -> Result<usize> {
        let last = self
            .services
            .stores
            .runs
            .last_completed(layer)
            .await?
            .and_then(|r| r.completed_at);
        let mut query = InsightQuery::all().with_category(TopicCategory::SelfFacet.as_str());
        if let Some(since) = last {
            query = query.since(since);
        }
        Ok(self.services.stores.insights.count(&query).await?)
    }

    /// Run `layer` now, ignoring its schedule and pause state.
    pub async fn trigger_now(&self, layer: &str) -> Result<TriggerOutcome> {
        self.trigger(layer, false).await
    }

    /// Select topics and run `layer` unless it is already running.
    pub async fn trigger(&self, layer_name: &str, dry_run: bool) -> Result<TriggerOutcome> {
        let _guard = {
            let mut set = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !set.insert(layer_name.to_string()) {
                obs::emit_trigger_skipped(layer_name, "already running");
                return Ok(TriggerOutcome::AlreadyRunning);
            }
            FlightGuard {
                in_flight: &self.in_flight,
                layer: layer_name.to_string(),
            }
        };

        let layer = self
            .executor
            .resolve_layer(self.source.as_ref(), layer_name, dry_run)
            .await?;
        let topics = self.select_targets(&layer).await?;
        let run = self.executor.execute_layer(&layer, &topics, dry_run).await;

        if let Some(job) = self.jobs().get_mut(layer_name) {
            job.last_run_at = run.completed_at;
        }
        Ok(TriggerOutcome::Completed(run))
    }

    /// Per-scope, global and self selection for the layer's category,
    /// capped at the layer's `max_targets`.
    pub async fn select_targets(&self, layer: &Layer) -> Result<Vec<Topic>> {
        let mut topics = self
            .services
            .selector
            .select_cycle(Some(layer.target_category))
            .await?;
        topics.truncate(layer.max_targets);
        Ok(topics)
    }

    /// Tick every `scheduler.tick_secs` until `shutdown` flips to `true`.
    ///
    /// A tick in progress always completes; the executor stops starting
    /// new topics once shutdown is signalled.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.services.config.scheduler.tick_secs.max(1));
        loop {
            if *shutdown.borrow() {
                break;
            }
            for (layer, outcome) in self.tick(Utc::now()).await {
                if let Err(e) = outcome {
                    warn!(layer = %layer, error = %e, "scheduled run failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(normalize_expression("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_expression("0 0 3 * * *"), "0 0 3 * * *");
    }

    #[test]
    fn parse_rejects_nonsense() {
        assert!(parse_schedule("l", "0 */6 * * *").is_ok());
        let err = parse_schedule("l", "sometimes").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSchedule { .. }));
    }
}
