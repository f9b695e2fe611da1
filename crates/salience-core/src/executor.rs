//! Layer executor.
//!
//! Runs a layer's steps against each target topic in order. A failing
//! topic is recorded in the run's error list and the batch moves on
//! (fail-forward). Every run leaves a [`LayerRunRecord`]; failing to write
//! that record is logged and never hides the run's result.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use salience_state::{LayerRunRecord, ModelCallRecord, RunStatus, TopicFailure, Valence};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

use crate::domain::{InsightDraft, Result, SalienceError, Topic, TopicCategory};
use crate::layer::{Condition, Layer, LayerSource, Step};
use crate::metrics::METRICS;
use crate::model::ModelRequest;
use crate::obs;
use crate::retriever::FormattedInsight;
use crate::services::Services;

/// Mutable state shared by the steps of one topic's pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub topic: Topic,
    pub run_id: String,
    pub dry_run: bool,
    /// Topic salience when the pipeline started.
    pub salience: f64,
    pub context: Vec<FormattedInsight>,
    pub output: Option<String>,
    pub drafts: Vec<InsightDraft>,
    /// Ids of stored insights.
    pub persisted: Vec<String>,
    /// Salience spent so far in this pipeline.
    pub spent: f64,
}

impl ExecutionContext {
    fn new(topic: Topic, run_id: &str, dry_run: bool, salience: f64) -> Self {
        Self {
            topic,
            run_id: run_id.to_string(),
            dry_run,
            salience,
            context: Vec::new(),
            output: None,
            drafts: Vec::new(),
            persisted: Vec::new(),
            spent: 0.0,
        }
    }

    fn render(&self, template: &str) -> String {
        let context = if self.context.is_empty() {
            "(none)".to_string()
        } else {
            self.context
                .iter()
                .map(FormattedInsight::line)
                .collect::<Vec<_>>()
                .join("\n")
        };
        template
            .replace("{topic}", &self.topic.key())
            .replace("{salience}", &format!("{:.2}", self.salience))
            .replace("{context}", &context)
    }

    fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::MinSalience(min) => self.salience >= *min,
            Condition::HasContext => !self.context.is_empty(),
            Condition::HasDrafts => !self.drafts.is_empty(),
        }
    }
}

/// One insight as a model is asked to emit it.
#[derive(Debug, Deserialize)]
struct RawInsight {
    content: String,
    #[serde(default)]
    valence: Valence,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    novelty: Option<f64>,
    #[serde(default)]
    strength_adjustment: Option<f64>,
    #[serde(default)]
    supersedes: Option<String>,
    #[serde(default)]
    conflicts_with: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutput {
    Wrapped { insights: Vec<RawInsight> },
    List(Vec<RawInsight>),
    Single(RawInsight),
}

/// Strip a surrounding markdown code fence, if any.
fn unfence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse model output into validated drafts.
pub fn parse_output(text: &str, ctx: &ExecutionContext, category: &str) -> Result<Vec<InsightDraft>> {
    let raw: RawOutput = serde_json::from_str(unfence(text))
        .map_err(|e| SalienceError::MalformedOutput(e.to_string()))?;
    let items = match raw {
        RawOutput::Wrapped { insights } => insights,
        RawOutput::List(items) => items,
        RawOutput::Single(item) => vec![item],
    };
    items
        .into_iter()
        .map(|raw| -> Result<InsightDraft> {
            let mut draft = InsightDraft::new(ctx.topic.clone(), category, raw.content)
                .with_valence(raw.valence)
                .with_salience(ctx.salience, 0.0)
                .in_run(ctx.run_id.clone());
            if let Some(adj) = raw.strength_adjustment {
                draft = draft.with_strength_adjustment(adj);
            }
            draft.confidence = raw.confidence.unwrap_or(draft.confidence);
            draft.importance = raw.importance.unwrap_or(draft.importance);
            draft.novelty = raw.novelty.unwrap_or(draft.novelty);
            draft.supersedes = raw.supersedes;
            draft.conflicts_with = raw.conflicts_with;
            draft.validate()?;
            Ok(draft)
        })
        .collect()
}

pub struct LayerExecutor {
    services: Arc<Services>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl LayerExecutor {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            shutdown: None,
        }
    }

    /// Stop starting new topics once `shutdown` flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve `name` through `source`, reloading once on a miss.
    ///
    /// A layer that is still missing after the reload is recorded as a
    /// failed run and returned as [`SalienceError::LayerNotFound`].
    pub async fn resolve_layer(
        &self,
        source: &dyn LayerSource,
        name: &str,
        dry_run: bool,
    ) -> Result<Layer> {
        if let Some(layer) = source.get_layer(name).await? {
            return Ok(layer);
        }
        debug!(layer = name, "layer not found, reloading");
        source.reload().await?;
        if let Some(layer) = source.get_layer(name).await? {
            return Ok(layer);
        }

        let mut run = LayerRunRecord::start(name, "", dry_run);
        self.record_create(&run).await;
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());
        run.errors.push(TopicFailure {
            topic_key: String::new(),
            error: format!("layer not found: {name}"),
        });
        self.record_finalize(&run).await;
        Err(SalienceError::LayerNotFound(name.to_string()))
    }

    /// [`resolve_layer`](Self::resolve_layer) then [`execute_layer`](Self::execute_layer).
    pub async fn execute_by_name(
        &self,
        source: &dyn LayerSource,
        name: &str,
        topics: &[Topic],
        dry_run: bool,
    ) -> Result<LayerRunRecord> {
        let layer = self.resolve_layer(source, name, dry_run).await?;
        Ok(self.execute_layer(&layer, topics, dry_run).await)
    }

    /// Run `layer` over `topics`. Never fails as a whole; see the run's status.
    pub async fn execute_layer(&self, layer: &Layer, topics: &[Topic], dry_run: bool) -> LayerRunRecord {
        let mut run = LayerRunRecord::start(&layer.name, layer.content_hash(), dry_run);
        let span = obs::run_span(&run.run_id, &layer.name);
        async {
            run.targets_matched = topics.len();
            obs::emit_run_started(&run.run_id, &layer.name, topics.len(), dry_run);
            self.record_create(&run).await;

            let started = Instant::now();
            let mut remaining = topics.iter();
            for topic in remaining.by_ref() {
                if self.shutting_down() {
                    run.targets_skipped += 1;
                    run.errors.push(TopicFailure {
                        topic_key: topic.key(),
                        error: "shutdown".to_string(),
                    });
                    break;
                }
                let (created, outcome) = self.run_topic(layer, topic, &mut run).await;
                run.insights_created += created;
                match outcome {
                    Ok(()) => run.targets_processed += 1,
                    Err(e) => {
                        run.targets_skipped += 1;
                        METRICS.add_topics_failed(1);
                        obs::emit_topic_failed(&run.run_id, &topic.key(), &e);
                        run.errors.push(TopicFailure {
                            topic_key: topic.key(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            for topic in remaining {
                run.targets_skipped += 1;
                run.errors.push(TopicFailure {
                    topic_key: topic.key(),
                    error: "shutdown".to_string(),
                });
            }

            run.status = if dry_run {
                RunStatus::DryRun
            } else if run.errors.is_empty() {
                RunStatus::Success
            } else if run.targets_processed == 0 {
                RunStatus::Failed
            } else {
                RunStatus::Partial
            };
            run.completed_at = Some(Utc::now());
            METRICS.add_runs_executed(1);
            obs::emit_run_finished(
                &run.run_id,
                run.status.as_str(),
                run.targets_processed,
                run.targets_skipped,
                run.insights_created,
                started.elapsed().as_millis() as u64,
            );
            self.record_finalize(&run).await;
        }
        .instrument(span)
        .await;
        run
    }

    async fn record_create(&self, run: &LayerRunRecord) {
        if let Err(e) = self.services.stores.runs.create_run(run).await {
            obs::emit_run_finalize_error(&run.run_id, &e);
        }
    }

    async fn record_finalize(&self, run: &LayerRunRecord) {
        if let Err(e) = self.services.stores.runs.finalize_run(run).await {
            obs::emit_run_finalize_error(&run.run_id, &e);
        }
    }

    /// One topic's pipeline.
    ///
    /// The count of stored insights is returned even when a later step
    /// fails, so the run record matches what was written.
    async fn run_topic(
        &self,
        layer: &Layer,
        topic: &Topic,
        run: &mut LayerRunRecord,
    ) -> (usize, Result<()>) {
        let salience = match self.services.ledger.get_balance(topic).await {
            Ok(salience) => salience,
            Err(e) => return (0, Err(e)),
        };
        let mut ctx = ExecutionContext::new(topic.clone(), &run.run_id, run.dry_run, salience);
        let outcome = self.run_steps(layer, &mut ctx, run).await;

        let created = ctx.persisted.len();
        if created > 0 && layer.target_category == TopicCategory::Subject {
            if let Err(e) = self.services.impulse.earn_for_insights(topic, created).await {
                warn!(topic = %topic, error = %e, "impulse coupling failed");
            }
        }
        (created, outcome)
    }

    async fn run_steps(
        &self,
        layer: &Layer,
        ctx: &mut ExecutionContext,
        run: &mut LayerRunRecord,
    ) -> Result<()> {
        for step in &layer.steps {
            match step {
                Step::Conditional {
                    condition,
                    then,
                    otherwise,
                } => {
                    let branch = if ctx.holds(condition) { then } else { otherwise };
                    for inner in branch {
                        self.run_step(layer, inner, ctx, run).await?;
                    }
                }
                other => self.run_step(layer, other, ctx, run).await?,
            }
        }
        Ok(())
    }

    async fn run_step(
        &self,
        layer: &Layer,
        step: &Step,
        ctx: &mut ExecutionContext,
        run: &mut LayerRunRecord,
    ) -> Result<()> {
        debug!(topic = %ctx.topic, step = step.kind(), "step");
        match step {
            Step::FetchContext { profile } => {
                ctx.context = self.services.retriever.retrieve(&ctx.topic, profile).await?;
            }
            Step::InvokeModel {
                profile,
                system,
                prompt,
            } => {
                let request = ModelRequest {
                    system: system.as_deref().map(|s| ctx.render(s)),
                    prompt: ctx.render(prompt),
                };
                ctx.output = Some(self.invoke(profile, &request, ctx, run).await?);
            }
            Step::ParseOutput => {
                let text = ctx
                    .output
                    .as_deref()
                    .ok_or_else(|| SalienceError::step("parse_output", "no model output to parse"))?;
                ctx.drafts = parse_output(text, ctx, layer.insight_category())?;
            }
            Step::PersistInsight => {
                let drafts = std::mem::take(&mut ctx.drafts);
                for mut draft in drafts {
                    draft.salience_spent = ctx.spent;
                    let record = draft.build(Utc::now())?;
                    if ctx.dry_run {
                        debug!(topic = %ctx.topic, content = %record.content, "dry run: insight not stored");
                        continue;
                    }
                    let id = record.id.clone();
                    self.services.stores.insights.insert(record).await?;
                    ctx.persisted.push(id);
                }
            }
            Step::SpendBudget { amount } => {
                let amount = amount.unwrap_or_else(|| {
                    self.services.config.budget.cost_for(ctx.topic.category())
                });
                if !ctx.dry_run {
                    self.services
                        .ledger
                        .spend(&ctx.topic, amount, &format!("layer:{}", layer.name))
                        .await?;
                }
                ctx.spent += amount;
            }
            Step::Conditional { .. } => {
                return Err(SalienceError::step("conditional", "conditional steps cannot nest"));
            }
        }
        Ok(())
    }

    /// Call the model and record telemetry whatever the outcome.
    async fn invoke(
        &self,
        profile: &str,
        request: &ModelRequest,
        ctx: &ExecutionContext,
        run: &mut LayerRunRecord,
    ) -> Result<String> {
        let resolved = self.services.models.resolve(profile)?;
        let client = self.services.model_client().await?;

        let started = Instant::now();
        let outcome = client.complete(&resolved, request).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (prompt_tokens, completion_tokens) = match &outcome {
            Ok(r) => (r.prompt_tokens, r.completion_tokens),
            Err(_) => (0, 0),
        };
        let success = outcome.is_ok();
        run.record_model_call(ModelCallRecord {
            topic_key: ctx.topic.key(),
            profile: resolved.requested.clone(),
            provider: resolved.provider_name.clone(),
            model: resolved.model.clone(),
            prompt_tokens,
            completion_tokens,
            cost_usd: resolved.cost(prompt_tokens, completion_tokens),
            latency_ms,
            success,
            error: outcome.as_ref().err().map(|e| e.to_string()),
            at: Utc::now(),
        });
        METRICS.add_model_calls(1);
        if !success {
            METRICS.add_model_failures(1);
        }
        obs::emit_model_call(
            &resolved.requested,
            &resolved.model,
            u64::from(prompt_tokens) + u64::from(completion_tokens),
            latency_ms,
            success,
        );
        Ok(outcome?.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Topic::person(Some("g1"), "u1").unwrap(), "run-1", false, 12.0)
    }

    #[test]
    fn parses_wrapped_list_and_single() {
        let c = ctx();
        let wrapped = r#"{"insights":[{"content":"a","valence":{"joy":0.4}},{"content":"b","valence":{"tension":0.2}}]}"#;
        assert_eq!(parse_output(wrapped, &c, "person").unwrap().len(), 2);

        let list = r#"[{"content":"a","valence":{"joy":0.4}}]"#;
        assert_eq!(parse_output(list, &c, "person").unwrap().len(), 1);

        let fenced = "```json\n{\"content\":\"a\",\"valence\":{\"warmth\":0.9},\"novelty\":0.8}\n```";
        let drafts = parse_output(fenced, &c, "person").unwrap();
        assert_eq!(drafts[0].novelty, 0.8);
        assert_eq!(drafts[0].salience_at_creation, 12.0);
        assert_eq!(drafts[0].layer_run_id, "run-1");
    }

    #[test]
    fn rejects_garbage_and_valenceless_output() {
        let c = ctx();
        assert!(matches!(
            parse_output("I think they like cats", &c, "person"),
            Err(SalienceError::MalformedOutput(_))
        ));
        assert!(matches!(
            parse_output(r#"{"content":"flat"}"#, &c, "person"),
            Err(SalienceError::Insight(_))
        ));
        assert!(matches!(
            parse_output(
                r#"{"content":"x","valence":{"joy":0.1},"strength_adjustment":50.0}"#,
                &c,
                "person"
            ),
            Err(SalienceError::Insight(_))
        ));
    }

    #[test]
    fn render_substitutes_context_values() {
        let c = ctx();
        let out = c.render("{topic} @ {salience}: {context}");
        assert_eq!(out, "server:g1:user:u1 @ 12.00: (none)");
    }

    #[test]
    fn conditions_read_the_context() {
        let mut c = ctx();
        assert!(c.holds(&Condition::MinSalience(10.0)));
        assert!(!c.holds(&Condition::MinSalience(20.0)));
        assert!(!c.holds(&Condition::HasDrafts));
        c.drafts = parse_output(r#"{"content":"a","valence":{"joy":0.4}}"#, &c, "person").unwrap();
        assert!(c.holds(&Condition::HasDrafts));
    }
}
