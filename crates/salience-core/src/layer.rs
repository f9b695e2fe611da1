//! Layer definitions and the layer source contract.
//!
//! A layer is a named, flat pipeline of typed steps run once per target
//! topic. Definitions come from a [`LayerSource`]; the engine treats them as
//! read-only values identified by a content hash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::{ConfigError, Result, TopicCategory};
use crate::scheduler::parse_schedule;

fn default_max_targets() -> usize {
    10
}

fn default_retrieval_profile() -> String {
    "balanced".to_string()
}

/// A named pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_category: TopicCategory,
    /// Per-run cap on processed topics.
    #[serde(default = "default_max_targets")]
    pub max_targets: usize,
    /// Cron expression (5 or 6 fields).
    #[serde(default)]
    pub schedule: Option<String>,
    /// Trigger when this many self insights accumulate since the last run.
    #[serde(default)]
    pub self_trigger_threshold: Option<usize>,
    /// Category stamped on produced insights; defaults to the target category.
    #[serde(default)]
    pub insight_category: Option<String>,
    pub steps: Vec<Step>,
}

impl Layer {
    /// SHA-256 over the canonical JSON form of the definition.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_value(self)
            .and_then(|v| serde_json::to_vec(&v))
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    pub fn insight_category(&self) -> &str {
        self.insight_category
            .as_deref()
            .unwrap_or_else(|| self.target_category.as_str())
    }

    /// Model profiles referenced by any step, in order.
    pub fn model_profiles(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for step in &self.steps {
            match step {
                Step::InvokeModel { profile, .. } => out.push(profile.as_str()),
                Step::Conditional { then, otherwise, .. } => {
                    for inner in then.iter().chain(otherwise) {
                        if let Step::InvokeModel { profile, .. } = inner {
                            out.push(profile.as_str());
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Structural checks. Semantic validation belongs to the definition author.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidLayer {
            layer: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(invalid("at least one step is required"));
        }
        if self.max_targets == 0 {
            return Err(invalid("max_targets must be positive"));
        }
        for step in &self.steps {
            if let Step::Conditional { then, otherwise, .. } = step {
                if then.iter().chain(otherwise).any(|s| matches!(s, Step::Conditional { .. })) {
                    return Err(invalid("conditional steps cannot nest"));
                }
            }
        }
        let branches = self.steps.iter().flat_map(|step| match step {
            Step::Conditional { then, otherwise, .. } => then.iter().chain(otherwise).collect(),
            other => vec![other],
        });
        for step in branches {
            if let Step::SpendBudget { amount: Some(amount) } = step {
                if !(amount.is_finite() && *amount > 0.0) {
                    return Err(invalid("spend_budget amount must be finite and positive"));
                }
            }
        }
        if let Some(expr) = &self.schedule {
            parse_schedule(&self.name, expr)?;
        }
        Ok(())
    }
}

/// One pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Load prior insights for the topic into the context.
    FetchContext {
        #[serde(default = "default_retrieval_profile")]
        profile: String,
    },
    /// Call a model profile. `{topic}`, `{salience}` and `{context}` in the
    /// prompt are replaced with context values.
    InvokeModel {
        profile: String,
        #[serde(default)]
        system: Option<String>,
        prompt: String,
    },
    /// Parse the model output into insight drafts.
    ParseOutput,
    /// Validate and store the parsed drafts.
    PersistInsight,
    /// Spend salience on the topic; defaults to the category's topic cost.
    SpendBudget {
        #[serde(default)]
        amount: Option<f64>,
    },
    /// Branch on the context. Branches hold plain steps only.
    Conditional {
        condition: Condition,
        #[serde(default)]
        then: Vec<Step>,
        #[serde(default)]
        otherwise: Vec<Step>,
    },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchContext { .. } => "fetch_context",
            Self::InvokeModel { .. } => "invoke_model",
            Self::ParseOutput => "parse_output",
            Self::PersistInsight => "persist_insight",
            Self::SpendBudget { .. } => "spend_budget",
            Self::Conditional { .. } => "conditional",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Topic salience at run start is at least this much.
    MinSalience(f64),
    /// Prior insights were fetched.
    HasContext,
    /// The last parse produced at least one draft.
    HasDrafts,
}

/// Supplies layer definitions to the engine.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// `None` when no layer of that name is known.
    async fn get_layer(&self, name: &str) -> Result<Option<Layer>>;

    async fn layers(&self) -> Result<Vec<Layer>>;

    /// Re-read definitions from the backing source.
    async fn reload(&self) -> Result<()>;
}

/// Layers held in memory.
#[derive(Debug, Default)]
pub struct StaticLayerSource {
    layers: RwLock<BTreeMap<String, Layer>>,
}

impl StaticLayerSource {
    pub fn new(layers: impl IntoIterator<Item = Layer>) -> Self {
        Self {
            layers: RwLock::new(layers.into_iter().map(|l| (l.name.clone(), l)).collect()),
        }
    }

    pub async fn insert(&self, layer: Layer) {
        self.layers.write().await.insert(layer.name.clone(), layer);
    }
}

#[async_trait]
impl LayerSource for StaticLayerSource {
    async fn get_layer(&self, name: &str) -> Result<Option<Layer>> {
        Ok(self.layers.read().await.get(name).cloned())
    }

    async fn layers(&self) -> Result<Vec<Layer>> {
        Ok(self.layers.read().await.values().cloned().collect())
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }
}

/// Layers read from `*.toml` files in a directory.
pub struct DirLayerSource {
    dir: PathBuf,
    layers: RwLock<BTreeMap<String, Layer>>,
}

impl DirLayerSource {
    /// Open and load the directory. Any invalid file fails the whole load.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let source = Self {
            dir: dir.into(),
            layers: RwLock::new(BTreeMap::new()),
        };
        source.reload().await?;
        Ok(source)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Layer>> {
        let io_err = |source| ConfigError::Io {
            path: self.dir.display().to_string(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut layers = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let layer = load_layer_file(&path).await?;
            if layers.contains_key(&layer.name) {
                return Err(ConfigError::InvalidLayer {
                    layer: layer.name,
                    reason: format!("defined twice (again in {})", path.display()),
                }
                .into());
            }
            debug!(layer = %layer.name, path = %path.display(), "layer loaded");
            layers.insert(layer.name.clone(), layer);
        }
        Ok(layers)
    }
}

async fn load_layer_file(path: &Path) -> Result<Layer> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
    let layer: Layer = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    layer.validate()?;
    Ok(layer)
}

#[async_trait]
impl LayerSource for DirLayerSource {
    async fn get_layer(&self, name: &str) -> Result<Option<Layer>> {
        Ok(self.layers.read().await.get(name).cloned())
    }

    async fn layers(&self) -> Result<Vec<Layer>> {
        Ok(self.layers.read().await.values().cloned().collect())
    }

    async fn reload(&self) -> Result<()> {
        let fresh = self.read_all().await?;
        info!(dir = %self.dir.display(), count = fresh.len(), "layers reloaded");
        *self.layers.write().await = fresh;
        Ok(())
    }
}
