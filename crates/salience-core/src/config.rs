//! Engine configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup; a
//! missing file means defaults, a file that fails to parse or validate is a
//! hard error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use salience_state::StoreConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{ConfigError, TopicCategory};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SalienceConfig {
    pub ledger: LedgerConfig,
    pub impulse: ImpulseConfig,
    pub budget: BudgetConfig,
    pub retrieval: RetrievalConfig,
    pub models: ModelsConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Balance at or above which a topic is warm (eligible for reflection and propagation).
    pub warm_threshold: f64,
    /// Fraction of an earn passed to warm same-scope relatives.
    pub propagation_factor: f64,
    /// Fraction of an earn passed to warm cross-scope counterparts.
    pub global_propagation_factor: f64,
    /// Fraction of capped overflow passed to warm relatives.
    pub spillover_factor: f64,
    /// Per-hour decay rate applied to idle topics.
    pub decay_rate: f64,
    /// Hours without earning activity before decay applies.
    pub idle_hours: f64,
    /// Decay and propagation deltas smaller than this are skipped.
    pub epsilon: f64,
    /// Seconds between periodic decay passes (daemon).
    pub decay_interval_secs: u64,
    /// Balance granted to a global counterpart on its first warm-up.
    pub global_warm_initial: f64,
    /// Cap applied to categories missing from `caps`.
    pub default_cap: f64,
    /// Per-category caps keyed by category name ("person", "pair", ...).
    pub caps: BTreeMap<String, f64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let caps = [
            (TopicCategory::Person, 100.0),
            (TopicCategory::Channel, 150.0),
            (TopicCategory::Thread, 50.0),
            (TopicCategory::Role, 50.0),
            (TopicCategory::Pair, 80.0),
            (TopicCategory::PersonInChannel, 60.0),
            (TopicCategory::PairInChannel, 40.0),
            (TopicCategory::Subject, 80.0),
            (TopicCategory::ReactionSymbol, 30.0),
            (TopicCategory::SelfFacet, 100.0),
        ]
        .into_iter()
        .map(|(c, v)| (c.as_str().to_string(), v))
        .collect();

        Self {
            warm_threshold: 1.0,
            propagation_factor: 0.3,
            global_propagation_factor: 0.1,
            spillover_factor: 0.5,
            decay_rate: 0.01,
            idle_hours: 6.0,
            epsilon: 0.01,
            decay_interval_secs: 3600,
            global_warm_initial: 5.0,
            default_cap: 100.0,
            caps,
        }
    }
}

impl LedgerConfig {
    pub fn cap_for(&self, category: TopicCategory) -> f64 {
        self.caps
            .get(category.as_str())
            .copied()
            .unwrap_or(self.default_cap)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpulseConfig {
    /// Pool name recorded on every impulse entry.
    pub pool: String,
    /// Balance at or above which the agent may speak on a topic.
    pub threshold: f64,
    pub decay_rate: f64,
    pub idle_hours: f64,
    pub epsilon: f64,
    /// Impulse earned per insight created by a subject layer.
    pub per_insight: f64,
}

impl Default for ImpulseConfig {
    fn default() -> Self {
        Self {
            pool: "speech".to_string(),
            threshold: 10.0,
            decay_rate: 0.05,
            idle_hours: 1.0,
            epsilon: 0.01,
            per_insight: 2.0,
        }
    }
}

/// Fractional share of a per-scope budget for each scoped group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupShares {
    pub social: f64,
    pub spaces: f64,
    pub semantic: f64,
}

impl Default for GroupShares {
    fn default() -> Self {
        Self {
            social: 0.5,
            spaces: 0.3,
            semantic: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Budget units available to each scope per cycle.
    pub scope_budget: f64,
    /// Budget units for the global pass per cycle.
    pub global_budget: f64,
    /// Budget units for self topics per cycle.
    pub self_budget: f64,
    pub shares: GroupShares,
    /// Per-category processing cost; categories not listed cost one unit.
    pub topic_costs: BTreeMap<String, f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            scope_budget: 10.0,
            global_budget: 5.0,
            self_budget: 2.0,
            shares: GroupShares::default(),
            topic_costs: BTreeMap::new(),
        }
    }
}

impl BudgetConfig {
    pub fn cost_for(&self, category: TopicCategory) -> f64 {
        self.topic_costs
            .get(category.as_str())
            .copied()
            .unwrap_or(1.0)
    }
}

/// Weighting of recency versus strength for one retrieval profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalProfile {
    pub recency_weight: f64,
    pub strength_weight: f64,
    pub max_results: usize,
    /// Approximate token budget for formatted results (4 chars per token).
    pub token_budget: usize,
}

impl Default for RetrievalProfile {
    fn default() -> Self {
        Self::balanced()
    }
}

impl RetrievalProfile {
    pub fn recent() -> Self {
        Self {
            recency_weight: 0.8,
            strength_weight: 0.2,
            max_results: 5,
            token_budget: 800,
        }
    }

    pub fn balanced() -> Self {
        Self {
            recency_weight: 0.5,
            strength_weight: 0.5,
            max_results: 8,
            token_budget: 1500,
        }
    }

    pub fn deep() -> Self {
        Self {
            recency_weight: 0.1,
            strength_weight: 0.9,
            max_results: 15,
            token_budget: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Days for an insight's time factor to halve.
    pub half_life_days: f64,
    /// Lower bound on the relevance factor (current vs creation salience).
    pub relevance_floor: f64,
    /// Profiles added to (or overriding) `recent`, `balanced` and `deep`.
    pub profiles: BTreeMap<String, RetrievalProfile>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            half_life_days: 14.0,
            relevance_floor: 0.1,
            profiles: BTreeMap::new(),
        }
    }
}

impl RetrievalConfig {
    pub fn profile(&self, name: &str) -> Option<RetrievalProfile> {
        if let Some(p) = self.profiles.get(name) {
            return Some(p.clone());
        }
        match name {
            "recent" => Some(RetrievalProfile::recent()),
            "balanced" => Some(RetrievalProfile::balanced()),
            "deep" => Some(RetrievalProfile::deep()),
            _ => None,
        }
    }
}

/// An OpenAI-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// USD per 1k prompt tokens.
    pub prompt_cost_per_1k: f64,
    /// USD per 1k completion tokens.
    pub completion_cost_per_1k: f64,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key_env: None,
            prompt_cost_per_1k: 0.0,
            completion_cost_per_1k: 0.0,
            timeout_secs: 60,
        }
    }
}

/// A named (provider, model) pairing with generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfileConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub providers: BTreeMap<String, ProviderConfig>,
    pub profiles: BTreeMap<String, ModelProfileConfig>,
    /// Alias name -> profile or alias name.
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks (daemon).
    pub tick_secs: u64,
    /// Directory of `*.toml` layer definitions.
    pub layers_dir: Option<PathBuf>,
    /// Run one catch-up execution for layers that missed firings while down.
    pub catch_up: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            layers_dir: None,
            catch_up: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Allow maintenance operations (manual decay, quarantine) from the audit surface.
    pub allow_maintenance: bool,
    /// Upper bound on any page size requested through the audit surface.
    pub max_page_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            allow_maintenance: false,
            max_page_size: 500,
        }
    }
}

impl SalienceConfig {
    /// Load from a TOML file. Missing file → defaults; unreadable or invalid → error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Structural validation. Group shares are checked loosely: each share
    /// must be a finite fraction, their sum only draws a warning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.ledger;
        for (name, value) in [
            ("ledger.propagation_factor", l.propagation_factor),
            ("ledger.global_propagation_factor", l.global_propagation_factor),
            ("ledger.spillover_factor", l.spillover_factor),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("ledger.warm_threshold", l.warm_threshold),
            ("ledger.decay_rate", l.decay_rate),
            ("ledger.idle_hours", l.idle_hours),
            ("ledger.epsilon", l.epsilon),
            ("ledger.global_warm_initial", l.global_warm_initial),
            ("impulse.threshold", self.impulse.threshold),
            ("impulse.decay_rate", self.impulse.decay_rate),
            ("impulse.idle_hours", self.impulse.idle_hours),
            ("impulse.per_insight", self.impulse.per_insight),
            ("budget.scope_budget", self.budget.scope_budget),
            ("budget.global_budget", self.budget.global_budget),
            ("budget.self_budget", self.budget.self_budget),
            ("retrieval.relevance_floor", self.retrieval.relevance_floor),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !(self.retrieval.half_life_days.is_finite() && self.retrieval.half_life_days > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.half_life_days must be positive, got {}",
                self.retrieval.half_life_days
            )));
        }

        for (key, cap) in &l.caps {
            key.parse::<TopicCategory>()
                .map_err(|e| ConfigError::Invalid(format!("ledger.caps: {e}")))?;
            if !cap.is_finite() || *cap <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "ledger.caps.{key} must be positive, got {cap}"
                )));
            }
        }
        for (key, cost) in &self.budget.topic_costs {
            key.parse::<TopicCategory>()
                .map_err(|e| ConfigError::Invalid(format!("budget.topic_costs: {e}")))?;
            if !cost.is_finite() || *cost <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "budget.topic_costs.{key} must be positive, got {cost}"
                )));
            }
        }

        let s = &self.budget.shares;
        for (group, share) in [
            ("social", s.social),
            ("spaces", s.spaces),
            ("semantic", s.semantic),
        ] {
            if !share.is_finite() || !(0.0..=1.0).contains(&share) {
                return Err(ConfigError::InvalidShare {
                    group: group.to_string(),
                    share,
                });
            }
        }
        let total = s.social + s.spaces + s.semantic;
        if (total - 1.0).abs() > 0.05 {
            warn!(total, "budget shares do not sum to 1.0");
        }

        for (name, p) in &self.retrieval.profiles {
            if p.recency_weight < 0.0 || p.strength_weight < 0.0 || p.max_results == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retrieval profile {name} needs non-negative weights and max_results > 0"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SalienceConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ledger.warm_threshold, 1.0);
        assert_eq!(config.store.endpoint, "mem://");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[ledger]
propagation_factor = 0.25

[ledger.caps]
person = 42.0

[audit]
allow_maintenance = true
"#
        )
        .unwrap();
        let config = SalienceConfig::load(file.path()).unwrap();
        assert_eq!(config.ledger.propagation_factor, 0.25);
        assert_eq!(config.ledger.spillover_factor, 0.5);
        assert_eq!(config.ledger.cap_for(TopicCategory::Person), 42.0);
        assert_eq!(config.ledger.cap_for(TopicCategory::Pair), 100.0);
        assert!(config.audit.allow_maintenance);
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ledger\nwarm_threshold = ").unwrap();
        let err = SalienceConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn negative_share_is_rejected() {
        let err = SalienceConfig::from_toml_str("[budget.shares]\nsocial = -0.2\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidShare { .. }));
    }

    #[test]
    fn shares_not_summing_to_one_are_tolerated() {
        let config =
            SalienceConfig::from_toml_str("[budget.shares]\nsocial = 0.9\nspaces = 0.9\n").unwrap();
        assert_eq!(config.budget.shares.spaces, 0.9);
    }

    #[test]
    fn unknown_cap_category_is_rejected() {
        let err = SalienceConfig::from_toml_str("[ledger.caps]\nplanet = 5.0\n").unwrap_err();
        assert!(err.to_string().contains("planet"));
    }

    #[test]
    fn builtin_retrieval_profiles() {
        let config = RetrievalConfig::default();
        assert!(config.profile("recent").unwrap().recency_weight > 0.5);
        assert!(config.profile("deep").unwrap().strength_weight > 0.5);
        assert!(config.profile("nope").is_none());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = SalienceConfig::default().to_toml().unwrap();
        let back = SalienceConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.budget.scope_budget, 10.0);
    }
}
