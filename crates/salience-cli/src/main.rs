//! Salience CLI
//!
//! The `salience` command inspects and nudges the attention economy.
//!
//! ## Commands
//!
//! - `balance`: show one topic, or the warmest topics
//! - `entries`: page through ledger entries
//! - `earn` / `decay`: write to the ledger by hand
//! - `select`: preview what the selector would pick this cycle
//! - `runs` / `insights`: the audit trail
//! - `trigger`: run a layer now
//! - `impulse`: the speaking ledger
//! - `layers`: list layer definitions and check them against the model config

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use salience_core::{
    AuditSurface, DirLayerSource, EntryQuery, InsightQuery, LayerExecutor, LayerRunRecord,
    LayerSource, ReflectionScheduler, RunQuery, RunStatus, SalienceConfig, Services, Topic,
    TopicCategory, TransactionType,
};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "salience")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Attention economy and reflection scheduler", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (missing file means defaults)
    #[arg(
        short,
        long,
        global = true,
        env = "SALIENCE_CONFIG",
        default_value = "salience.toml"
    )]
    config: PathBuf,

    /// Use throwaway in-memory stores instead of the configured database
    #[arg(long, global = true)]
    in_memory: bool,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a topic's balance, or the warmest topics when no topic is given
    Balance {
        /// Topic key, e.g. server:g1:user:u1
        topic: Option<String>,

        /// Restrict the listing to one category
        #[arg(long)]
        category: Option<String>,

        /// Maximum number of topics to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List ledger entries, oldest first
    Entries {
        /// Only entries for this topic
        #[arg(long)]
        topic: Option<String>,

        /// Only entries of this transaction type (earn, spend, decay, ...)
        #[arg(long = "type")]
        kind: Option<String>,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Read the impulse ledger instead of the salience ledger
        #[arg(long)]
        impulse: bool,
    },

    /// Earn salience on a topic
    Earn {
        topic: String,

        amount: f64,

        #[arg(short, long, default_value = "manual")]
        reason: String,

        /// Skip propagation and spillover to warm relatives
        #[arg(long)]
        no_propagate: bool,
    },

    /// Apply idle decay to both ledgers now
    Decay,

    /// Preview the topics a reflection cycle would select
    Select {
        /// Restrict to one category (full per-scope budget goes to it)
        #[arg(long)]
        category: Option<String>,

        /// Only this scope, split across budget groups
        #[arg(long, conflicts_with = "category")]
        scope: Option<String>,

        /// Only global topics
        #[arg(long, conflicts_with_all = ["category", "scope"])]
        global: bool,

        /// Override the budget for --scope / --global previews
        #[arg(long)]
        budget: Option<f64>,
    },

    /// Layer run audit records
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Stored insights
    Insights {
        #[command(subcommand)]
        action: InsightsAction,
    },

    /// Select targets and run a layer now, ignoring its schedule
    Trigger {
        /// Layer name
        layer: String,

        /// Call models but store no insights and spend nothing
        #[arg(long)]
        dry_run: bool,

        /// Directory of layer definitions (default: [scheduler].layers_dir)
        #[arg(long)]
        layers_dir: Option<PathBuf>,
    },

    /// The impulse (speaking) ledger
    Impulse {
        #[command(subcommand)]
        action: ImpulseAction,
    },

    /// Layer definitions
    Layers {
        #[command(subcommand)]
        action: LayersAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, newest first
    List {
        #[arg(long)]
        layer: Option<String>,

        /// Filter by status (running, success, partial, failed, dry_run)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one run with its errors and model calls
    Show { run_id: String },
}

#[derive(Subcommand)]
enum InsightsAction {
    /// List insights, newest first
    List {
        #[arg(long)]
        topic: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Include quarantined insights
        #[arg(long)]
        all: bool,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one insight
    Show { id: String },

    /// Ranked recall for a topic, as a layer's context would see it
    Recall {
        topic: String,

        /// Retrieval profile (recent, balanced, deep or a configured one)
        #[arg(short, long, default_value = "balanced")]
        profile: String,
    },

    /// The most recent live insight for a topic
    Latest { topic: String },

    /// Hide an insight from retrieval (needs [audit].allow_maintenance)
    Quarantine { id: String },

    /// Return a quarantined insight to retrieval
    Release { id: String },
}

#[derive(Subcommand)]
enum ImpulseAction {
    /// Show a topic's impulse balance
    Balance { topic: String },

    /// Topics at or above the speaking threshold
    Above,

    /// Earn impulse on a topic
    Earn {
        topic: String,

        amount: f64,

        #[arg(short, long, default_value = "manual")]
        trigger: String,

        /// Record the earn as a flood (burst)
        #[arg(long)]
        flood: bool,
    },

    /// Spend impulse after speaking
    Spend {
        topic: String,

        amount: f64,

        #[arg(short, long, default_value = "manual")]
        trigger: String,
    },

    /// Zero a topic's impulse
    Reset {
        topic: String,

        #[arg(short, long, default_value = "manual")]
        trigger: String,
    },
}

#[derive(Subcommand)]
enum LayersAction {
    /// List layer definitions
    List {
        #[arg(long)]
        layers_dir: Option<PathBuf>,
    },

    /// Validate schedules and model profiles the way the daemon does at startup
    Check {
        #[arg(long)]
        layers_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    salience_core::init_tracing(cli.json, level);

    let config = SalienceConfig::load(&cli.config)
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;
    let services = if cli.in_memory {
        Services::in_memory(config)?
    } else {
        Services::connect(config)
            .await
            .context("Failed to connect to the salience store")?
    };
    let services = Arc::new(services);
    let out = Output(cli.format);

    match cli.command {
        Commands::Balance {
            topic,
            category,
            limit,
        } => match topic {
            Some(topic) => cmd_balance(&services, out, &topic).await,
            None => cmd_topics(&services, out, category.as_deref(), limit).await,
        },
        Commands::Entries {
            topic,
            kind,
            offset,
            limit,
            impulse,
        } => {
            cmd_entries(
                &services,
                out,
                topic.as_deref(),
                kind.as_deref(),
                offset,
                limit,
                impulse,
            )
            .await
        }
        Commands::Earn {
            topic,
            amount,
            reason,
            no_propagate,
        } => cmd_earn(&services, out, &topic, amount, &reason, !no_propagate).await,
        Commands::Decay => cmd_decay(&services, out).await,
        Commands::Select {
            category,
            scope,
            global,
            budget,
        } => cmd_select(&services, out, category.as_deref(), scope.as_deref(), global, budget).await,
        Commands::Runs { action } => match action {
            RunsAction::List {
                layer,
                status,
                offset,
                limit,
            } => cmd_runs_list(&services, out, layer, status.as_deref(), offset, limit).await,
            RunsAction::Show { run_id } => cmd_runs_show(&services, out, &run_id).await,
        },
        Commands::Insights { action } => cmd_insights(&services, out, action).await,
        Commands::Trigger {
            layer,
            dry_run,
            layers_dir,
        } => cmd_trigger(&services, out, &layer, dry_run, layers_dir).await,
        Commands::Impulse { action } => cmd_impulse(&services, out, action).await,
        Commands::Layers { action } => match action {
            LayersAction::List { layers_dir } => cmd_layers_list(&services, out, layers_dir).await,
            LayersAction::Check { layers_dir } => cmd_layers_check(&services, out, layers_dir).await,
        },
    }
}

/// Result printer: pretty JSON or a caller-supplied text rendering.
#[derive(Debug, Clone, Copy)]
struct Output(Format);

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T)) -> Result<()> {
        match self.0 {
            Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Format::Text => text(value),
        }
        Ok(())
    }
}

fn parse_topic(key: &str) -> Result<Topic> {
    Topic::parse(key).with_context(|| format!("Invalid topic key: {key}"))
}

fn parse_category(name: &str) -> Result<TopicCategory> {
    name.parse()
        .with_context(|| format!("Unknown topic category: {name}"))
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Show one topic's salience and impulse.
async fn cmd_balance(services: &Services, out: Output, key: &str) -> Result<()> {
    let topic = parse_topic(key)?;
    let snapshot = services.ledger.snapshot(&topic).await?;
    let warm = services.ledger.is_warm(&topic).await?;
    let impulse = services.impulse.get_balance(&topic).await?;

    #[derive(Serialize)]
    struct View {
        topic: String,
        balance: f64,
        warm: bool,
        provisional: bool,
        cap: f64,
        impulse: f64,
        last_earned_at: Option<chrono::DateTime<Utc>>,
        last_activity_at: Option<chrono::DateTime<Utc>>,
    }
    let view = View {
        topic: topic.key(),
        balance: snapshot.as_ref().map_or(0.0, |s| s.balance),
        warm,
        provisional: snapshot.as_ref().is_some_and(|s| s.provisional),
        cap: services.config.ledger.cap_for(topic.category()),
        impulse,
        last_earned_at: snapshot.as_ref().and_then(|s| s.last_earned_at),
        last_activity_at: snapshot.as_ref().map(|s| s.last_activity_at),
    };
    out.emit(&view, |v| {
        println!("{}", v.topic);
        println!("  salience: {:.2} / {:.0}{}", v.balance, v.cap, if v.warm { " (warm)" } else { "" });
        println!("  impulse:  {:.2}", v.impulse);
        if v.provisional {
            println!("  provisional (no direct activity yet)");
        }
        match v.last_activity_at {
            Some(at) => println!("  active:   {}", at.to_rfc3339()),
            None => println!("  no ledger entries"),
        }
    })
}

/// List known topics, highest balance first.
async fn cmd_topics(
    services: &Arc<Services>,
    out: Output,
    category: Option<&str>,
    limit: usize,
) -> Result<()> {
    let category = category.map(parse_category).transpose()?;
    let audit = AuditSurface::new(services.clone());
    let topics = audit.topics(category, 0, Some(limit)).await?;
    let threshold = services.config.ledger.warm_threshold;
    out.emit(&topics, |topics| {
        if topics.is_empty() {
            println!("No topics yet.");
        }
        for s in topics {
            let mark = if s.balance >= threshold { '*' } else { ' ' };
            let note = if s.provisional { "  (provisional)" } else { "" };
            println!("{mark} {:>8.2}  {}{note}", s.balance, s.topic);
        }
    })
}

async fn cmd_entries(
    services: &Arc<Services>,
    out: Output,
    topic: Option<&str>,
    kind: Option<&str>,
    offset: usize,
    limit: usize,
    impulse: bool,
) -> Result<()> {
    let mut query = match topic {
        Some(key) => EntryQuery::for_topic(parse_topic(key)?.key()),
        None => EntryQuery::all(),
    };
    if let Some(kind) = kind {
        let kind: TransactionType = kind
            .parse()
            .with_context(|| format!("Unknown transaction type: {kind}"))?;
        query = query.with_type(kind);
    }
    let query = query.page(offset, limit);
    let audit = AuditSurface::new(services.clone());
    let entries = if impulse {
        audit.impulse_entries(query).await?
    } else {
        audit.entries(query).await?
    };
    out.emit(&entries, |entries| {
        for e in entries {
            println!(
                "{}  {:<9} {:>+9.3}  {}{}{}{}",
                e.created_at.format("%Y-%m-%d %H:%M:%S"),
                e.transaction_type,
                e.amount,
                e.topic_key,
                e.reason
                    .as_deref()
                    .map(|r| format!("  ({r})"))
                    .unwrap_or_default(),
                e.source_topic
                    .as_deref()
                    .map(|s| format!("  <- {s}"))
                    .unwrap_or_default(),
                e.pool
                    .as_deref()
                    .map(|p| format!("  [{p}]"))
                    .unwrap_or_default(),
            );
        }
    })
}

async fn cmd_earn(
    services: &Services,
    out: Output,
    key: &str,
    amount: f64,
    reason: &str,
    propagate: bool,
) -> Result<()> {
    let topic = parse_topic(key)?;
    let outcome = services
        .ledger
        .earn_with_propagation(&topic, amount, reason, propagate)
        .await?;
    info!(topic = %topic, amount, credited = outcome.credited, "manual earn");
    out.emit(&outcome, |o| {
        println!("Credited {:.2} to {}", o.credited, topic);
        if o.overflow > 0.0 {
            println!("  capped: {:.2} over", o.overflow);
        }
        for (relative, amount) in &o.propagated {
            println!("  propagated {amount:.2} -> {relative}");
        }
        for (relative, amount) in &o.spilled {
            println!("  spilled    {amount:.2} -> {relative}");
        }
    })
}

async fn cmd_decay(services: &Services, out: Output) -> Result<()> {
    let salience = services.ledger.decay().await?;
    let impulse = services.impulse.apply_decay().await?;
    let report = serde_json::json!({ "salience": salience, "impulse": impulse });
    out.emit(&report, |_| {
        println!(
            "Salience: {} topics decayed, {:.3} total",
            salience.topics_decayed, salience.total_decayed
        );
        println!(
            "Impulse:  {} topics decayed, {:.3} total",
            impulse.topics_decayed, impulse.total_decayed
        );
    })
}

async fn cmd_select(
    services: &Services,
    out: Output,
    category: Option<&str>,
    scope: Option<&str>,
    global: bool,
    budget: Option<f64>,
) -> Result<()> {
    if scope.is_none() && !global {
        let category = category.map(parse_category).transpose()?;
        let topics = services.selector.select_cycle(category).await?;
        let keys: Vec<String> = topics.iter().map(Topic::key).collect();
        return out.emit(&keys, |keys| {
            if keys.is_empty() {
                println!("Nothing warm enough to reflect on.");
            }
            for key in keys {
                println!("{key}");
            }
        });
    }

    let budget_config = &services.config.budget;
    let total = budget.unwrap_or(if global {
        budget_config.global_budget
    } else {
        budget_config.scope_budget
    });
    let selection = services
        .selector
        .select_for_reflection(total, scope, global)
        .await?;
    out.emit(&selection, |selection| {
        for (group, keys) in selection {
            println!("{group}:");
            for key in keys {
                println!("  {key}");
            }
        }
    })
}

fn print_run_line(run: &LayerRunRecord) {
    println!(
        "{}  {:<20} {:<8} {}/{} topics  {} insights  {}",
        short(&run.run_id),
        run.layer_name,
        run.status,
        run.targets_processed,
        run.targets_matched,
        run.insights_created,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
    );
}

async fn cmd_runs_list(
    services: &Arc<Services>,
    out: Output,
    layer: Option<String>,
    status: Option<&str>,
    offset: usize,
    limit: usize,
) -> Result<()> {
    let mut query = match layer {
        Some(layer) => RunQuery::for_layer(layer),
        None => RunQuery::all(),
    };
    if let Some(status) = status {
        let status: RunStatus = status
            .parse()
            .with_context(|| format!("Unknown run status: {status}"))?;
        query = query.with_status(status);
    }
    let runs = AuditSurface::new(services.clone())
        .runs(query.page(offset, limit))
        .await?;
    out.emit(&runs, |runs| {
        if runs.is_empty() {
            println!("No runs recorded.");
        }
        runs.iter().for_each(print_run_line);
    })
}

async fn cmd_runs_show(services: &Arc<Services>, out: Output, run_id: &str) -> Result<()> {
    let run = AuditSurface::new(services.clone()).run(run_id).await?;
    out.emit(&run, print_run_detail)
}

fn print_run_detail(run: &LayerRunRecord) {
    println!("Run {}", run.run_id);
    println!("  layer:     {} ({})", run.layer_name, short(&run.layer_hash));
    println!("  status:    {}{}", run.status, if run.dry_run { " (dry run)" } else { "" });
    println!(
        "  topics:    {} matched, {} processed, {} skipped",
        run.targets_matched, run.targets_processed, run.targets_skipped
    );
    println!("  insights:  {}", run.insights_created);
    println!(
        "  model:     {} calls ({} failed), {} tokens, ${:.4}",
        run.model_calls.len(),
        run.failed_model_calls(),
        run.total_tokens,
        run.total_cost_usd
    );
    if let Some(ms) = run.duration_ms() {
        println!("  duration:  {ms} ms");
    }
    for failure in &run.errors {
        println!("  error: {}: {}", failure.topic_key, failure.error);
    }
}

async fn cmd_insights(services: &Arc<Services>, out: Output, action: InsightsAction) -> Result<()> {
    let audit = AuditSurface::new(services.clone());
    match action {
        InsightsAction::List {
            topic,
            category,
            all,
            offset,
            limit,
        } => {
            let mut query = match topic {
                Some(key) => InsightQuery::for_topic(parse_topic(&key)?.key()),
                None => InsightQuery::all(),
            };
            if let Some(category) = category {
                query = query.with_category(category);
            }
            if all {
                query = query.including_quarantined();
            }
            let insights = audit.insights(query.page(offset, limit)).await?;
            out.emit(&insights, |insights| {
                for i in insights {
                    println!(
                        "{}  {:<30} {:>6.2}{}  {}",
                        short(&i.id),
                        i.topic_key,
                        i.strength,
                        if i.quarantined { " [q]" } else { "" },
                        i.content
                    );
                }
            })
        }
        InsightsAction::Show { id } => {
            let insight = audit.insight(&id).await?;
            out.emit(&insight, |i| {
                println!("Insight {}", i.id);
                println!("  topic:    {} ({})", i.topic_key, i.category);
                println!("  created:  {}", i.created_at.to_rfc3339());
                println!("  run:      {}", i.layer_run_id);
                println!("  strength: {:.2} (x{:.2})", i.strength, i.strength_adjustment);
                let valence: Vec<String> = i
                    .valence
                    .present()
                    .into_iter()
                    .map(|(name, v)| format!("{name}={v:.2}"))
                    .collect();
                println!("  valence:  {}", valence.join(" "));
                if let Some(old) = &i.supersedes {
                    println!("  supersedes {old}");
                }
                if i.quarantined {
                    println!("  QUARANTINED");
                }
                println!();
                println!("{}", i.content);
            })
        }
        InsightsAction::Recall { topic, profile } => {
            let topic = parse_topic(&topic)?;
            let recalled = services.retriever.retrieve(&topic, &profile).await?;
            out.emit(&recalled, |recalled| {
                if recalled.is_empty() {
                    println!("Nothing to recall for {topic}.");
                }
                for r in recalled {
                    println!("{:.3}  {}", r.score, r.line());
                }
            })
        }
        InsightsAction::Latest { topic } => {
            let topic = parse_topic(&topic)?;
            let latest = services.retriever.retrieve_latest(&topic).await?;
            out.emit(&latest, |latest| match latest {
                Some(r) => println!("{}", r.line()),
                None => println!("No insights for {topic}."),
            })
        }
        InsightsAction::Quarantine { id } => {
            audit.quarantine_insight(&id).await?;
            out.emit(&serde_json::json!({ "id": id, "quarantined": true }), |_| {
                println!("Quarantined {id}")
            })
        }
        InsightsAction::Release { id } => {
            audit.unquarantine_insight(&id).await?;
            out.emit(&serde_json::json!({ "id": id, "quarantined": false }), |_| {
                println!("Released {id}")
            })
        }
    }
}

async fn layer_source(services: &Services, dir: Option<PathBuf>) -> Result<Arc<dyn LayerSource>> {
    let dir = dir
        .or_else(|| services.config.scheduler.layers_dir.clone())
        .context("No layers directory: pass --layers-dir or set [scheduler].layers_dir")?;
    let source = DirLayerSource::open(dir.clone())
        .await
        .with_context(|| format!("Failed to load layers from {}", dir.display()))?;
    Ok(Arc::new(source))
}

fn scheduler(services: &Arc<Services>, source: Arc<dyn LayerSource>) -> ReflectionScheduler {
    let executor = Arc::new(LayerExecutor::new(services.clone()));
    ReflectionScheduler::new(services.clone(), executor, source)
}

async fn cmd_trigger(
    services: &Arc<Services>,
    out: Output,
    layer: &str,
    dry_run: bool,
    layers_dir: Option<PathBuf>,
) -> Result<()> {
    let source = layer_source(services, layers_dir).await?;
    let outcome = scheduler(services, source).trigger(layer, dry_run).await?;
    match outcome.run() {
        Some(run) => out.emit(run, print_run_detail),
        None => {
            println!("Layer {layer} is already running.");
            Ok(())
        }
    }
}

async fn cmd_impulse(services: &Services, out: Output, action: ImpulseAction) -> Result<()> {
    let impulse = &services.impulse;
    match action {
        ImpulseAction::Balance { topic } => {
            let topic = parse_topic(&topic)?;
            let balance = impulse.get_balance(&topic).await?;
            let threshold = impulse.config().threshold;
            out.emit(
                &serde_json::json!({ "topic": topic.key(), "balance": balance, "threshold": threshold }),
                |_| println!("{topic}: {balance:.2} (speaks at {threshold:.2})"),
            )
        }
        ImpulseAction::Above => {
            let above = impulse.get_topics_above_threshold().await?;
            let rows: Vec<(String, f64)> = above.iter().map(|(t, b)| (t.key(), *b)).collect();
            out.emit(&rows, |rows| {
                if rows.is_empty() {
                    println!("Nothing wants saying.");
                }
                for (key, balance) in rows {
                    println!("{balance:>8.2}  {key}");
                }
            })
        }
        ImpulseAction::Earn {
            topic,
            amount,
            trigger,
            flood,
        } => {
            let topic = parse_topic(&topic)?;
            let entry = if flood {
                impulse.flood(&topic, amount, &trigger).await?
            } else {
                impulse.earn(&topic, amount, &trigger).await?
            };
            out.emit(&entry, |e| {
                println!("{} {:+.2} on {}", e.transaction_type, e.amount, e.topic_key)
            })
        }
        ImpulseAction::Spend {
            topic,
            amount,
            trigger,
        } => {
            let topic = parse_topic(&topic)?;
            let entry = impulse.spend(&topic, amount, &trigger).await?;
            out.emit(&entry, |e| println!("spent {:.2} on {}", -e.amount, e.topic_key))
        }
        ImpulseAction::Reset { topic, trigger } => {
            let topic = parse_topic(&topic)?;
            let entry = impulse.reset(&topic, &trigger).await?;
            out.emit(&entry, |e| match e {
                Some(e) => println!("reset {} ({:+.2})", e.topic_key, e.amount),
                None => println!("{topic} had nothing to reset"),
            })
        }
    }
}

async fn cmd_layers_list(
    services: &Services,
    out: Output,
    layers_dir: Option<PathBuf>,
) -> Result<()> {
    let source = layer_source(services, layers_dir).await?;
    let layers = source.layers().await?;
    out.emit(&layers, |layers| {
        for layer in layers {
            println!(
                "{:<24} {:<18} {:<16} {}",
                layer.name,
                layer.target_category,
                layer.schedule.as_deref().unwrap_or("-"),
                short(&layer.content_hash())
            );
        }
    })
}

async fn cmd_layers_check(
    services: &Arc<Services>,
    out: Output,
    layers_dir: Option<PathBuf>,
) -> Result<()> {
    let source = layer_source(services, layers_dir).await?;
    let scheduler = scheduler(services, source);
    let count = scheduler
        .register_all(Utc::now())
        .await
        .context("Layer registration failed")?;
    let states = scheduler.job_states();
    out.emit(&states, |states| {
        println!("{count} layers OK");
        for s in states {
            let next = s
                .next_fire
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "manual".to_string());
            println!(
                "  {:<24} next: {}{}",
                s.layer,
                next,
                if s.catch_up_pending { " (catch-up pending)" } else { "" }
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn in_memory() -> Arc<Services> {
        Arc::new(Services::in_memory(SalienceConfig::default()).unwrap())
    }

    const QUIET: Output = Output(Format::Json);

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "salience",
            "earn",
            "server:g1:user:u1",
            "2.5",
            "--in-memory",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(cli.in_memory);
        assert_eq!(cli.format, Format::Json);
        match cli.command {
            Commands::Earn { topic, amount, .. } => {
                assert_eq!(topic, "server:g1:user:u1");
                assert_eq!(amount, 2.5);
            }
            _ => panic!("expected earn"),
        }
    }

    #[test]
    fn select_scope_and_global_conflict() {
        assert!(Cli::try_parse_from(["salience", "select", "--scope", "g1", "--global"]).is_err());
    }

    #[test]
    fn bad_topic_keys_are_reported() {
        let err = parse_topic("server::user:u1").unwrap_err();
        assert!(err.to_string().contains("server::user:u1"));
        assert!(parse_category("planet").is_err());
    }

    #[tokio::test]
    async fn earn_then_select_in_memory() {
        let services = in_memory();
        cmd_earn(&services, QUIET, "server:g1:user:u1", 12.0, "test", true)
            .await
            .unwrap();
        cmd_earn(&services, QUIET, "server:g1:channel:c1", 3.0, "test", true)
            .await
            .unwrap();

        let u1 = Topic::parse("server:g1:user:u1").unwrap();
        assert_eq!(services.ledger.get_balance(&u1).await.unwrap(), 12.0);

        let picked = services
            .selector
            .select_cycle(Some(TopicCategory::Person))
            .await
            .unwrap();
        assert_eq!(picked, vec![u1]);
        cmd_select(&services, QUIET, Some("person"), None, false, None)
            .await
            .unwrap();
        cmd_topics(&services, QUIET, None, 10).await.unwrap();
    }

    #[tokio::test]
    async fn quarantine_requires_maintenance() {
        let services = in_memory();
        let err = cmd_insights(&services, QUIET, InsightsAction::Quarantine { id: "x".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn trigger_without_layers_dir_fails() {
        let services = in_memory();
        let err = cmd_trigger(&services, QUIET, "people", false, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("layers directory"));
    }

    #[tokio::test]
    async fn layers_check_reads_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("channels.toml"),
            r#"
name = "channels"
target_category = "channel"
schedule = "0 */6 * * *"

[[steps]]
type = "fetch_context"

[[steps]]
type = "spend_budget"
"#,
        )
        .unwrap();
        let services = in_memory();
        cmd_layers_check(&services, QUIET, Some(dir.path().to_path_buf()))
            .await
            .unwrap();
        cmd_layers_list(&services, QUIET, Some(dir.path().to_path_buf()))
            .await
            .unwrap();
    }
}
