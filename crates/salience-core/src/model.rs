//! Model profiles and the language-model client contract.
//!
//! Layers ask for a named profile. [`ModelRegistry`] resolves the name
//! through alias chains to a (provider, model) pair; a [`ModelClient`]
//! performs the call. [`HttpModelClient`] speaks the OpenAI-compatible
//! chat completions protocol.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ModelProfileConfig, ModelsConfig, ProviderConfig};
use crate::domain::ConfigError;

/// Failures raised by a model client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("model request timed out")]
    Timeout,

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("API key variable {0} is not set")]
    MissingApiKey(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(err.to_string())
        }
    }
}

/// A profile after alias resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    /// Name the caller asked for (may be an alias).
    pub requested: String,
    /// Concrete profile name.
    pub name: String,
    pub provider_name: String,
    pub provider: ProviderConfig,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ResolvedProfile {
    /// USD cost for the given token counts.
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        f64::from(prompt_tokens) / 1000.0 * self.provider.prompt_cost_per_1k
            + f64::from(completion_tokens) / 1000.0 * self.provider.completion_cost_per_1k
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        profile: &ResolvedProfile,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ModelError>;
}

/// Resolves profile names and aliases. Construction validates every alias
/// chain and provider reference, so a bad configuration fails at startup.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    providers: BTreeMap<String, ProviderConfig>,
    profiles: BTreeMap<String, ModelProfileConfig>,
    aliases: BTreeMap<String, String>,
}

impl ModelRegistry {
    pub fn new(config: &ModelsConfig) -> Result<Self, ConfigError> {
        let registry = Self {
            providers: config.providers.clone(),
            profiles: config.profiles.clone(),
            aliases: config.aliases.clone(),
        };
        for (name, profile) in &registry.profiles {
            if !registry.providers.contains_key(&profile.provider) {
                return Err(ConfigError::UnknownProvider {
                    profile: name.clone(),
                    provider: profile.provider.clone(),
                });
            }
        }
        for alias in registry.aliases.keys() {
            registry.resolve(alias)?;
        }
        Ok(registry)
    }

    /// Follow aliases until a concrete profile is reached.
    pub fn resolve(&self, name: &str) -> Result<ResolvedProfile, ConfigError> {
        let mut chain = vec![name.to_string()];
        let mut current = name;
        let profile = loop {
            if let Some(profile) = self.profiles.get(current) {
                break profile;
            }
            let Some(next) = self.aliases.get(current) else {
                return Err(ConfigError::UnknownProfile(name.to_string()));
            };
            if chain.iter().any(|seen| seen == next) {
                chain.push(next.clone());
                return Err(ConfigError::CircularAlias(chain));
            }
            chain.push(next.clone());
            current = next.as_str();
        };
        let provider = self
            .providers
            .get(&profile.provider)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider {
                profile: current.to_string(),
                provider: profile.provider.clone(),
            })?;
        Ok(ResolvedProfile {
            requested: name.to_string(),
            name: current.to_string(),
            provider_name: profile.provider.clone(),
            provider,
            model: profile.model.clone(),
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
        })
    }

    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles
            .keys()
            .chain(self.aliases.keys())
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// OpenAI-compatible chat completions client.
pub struct HttpModelClient {
    http_client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new() -> Result<Self, ModelError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("salience/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(
        &self,
        profile: &ResolvedProfile,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        let url = format!(
            "{}/chat/completions",
            profile.provider.base_url.trim_end_matches('/')
        );
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });
        let body = ChatRequest {
            model: &profile.model,
            messages,
            temperature: profile.temperature,
            max_tokens: profile.max_tokens,
        };

        let mut builder = self
            .http_client
            .post(&url)
            .timeout(Duration::from_secs(profile.provider.timeout_secs))
            .json(&body);
        if let Some(var) = &profile.provider.api_key_env {
            let key = std::env::var(var).map_err(|_| ModelError::MissingApiKey(var.clone()))?;
            builder = builder.bearer_auth(key);
        }

        debug!(url = %url, model = %profile.model, "model request");
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ModelError::MalformedResponse("no choices in response".into()))?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(ModelResponse {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelsConfig {
        let mut config = ModelsConfig::default();
        config.providers.insert(
            "local".into(),
            ProviderConfig {
                prompt_cost_per_1k: 0.5,
                completion_cost_per_1k: 1.5,
                ..ProviderConfig::default()
            },
        );
        config.profiles.insert(
            "reflect".into(),
            ModelProfileConfig {
                provider: "local".into(),
                model: "llama3".into(),
                temperature: Some(0.2),
                max_tokens: None,
            },
        );
        config.aliases.insert("default".into(), "thinking".into());
        config.aliases.insert("thinking".into(), "reflect".into());
        config
    }

    #[test]
    fn alias_chain_resolves() {
        let registry = ModelRegistry::new(&config()).unwrap();
        let resolved = registry.resolve("default").unwrap();
        assert_eq!(resolved.name, "reflect");
        assert_eq!(resolved.requested, "default");
        assert_eq!(resolved.model, "llama3");
        assert!((resolved.cost(1000, 2000) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn circular_alias_fails_at_construction() {
        let mut config = config();
        config.aliases.insert("a".into(), "b".into());
        config.aliases.insert("b".into(), "a".into());
        let err = ModelRegistry::new(&config).unwrap_err();
        match err {
            ConfigError::CircularAlias(chain) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn unknown_profile_and_provider() {
        let registry = ModelRegistry::new(&config()).unwrap();
        assert!(matches!(
            registry.resolve("missing"),
            Err(ConfigError::UnknownProfile(_))
        ));

        let mut bad = config();
        bad.profiles.get_mut("reflect").unwrap().provider = "nowhere".into();
        assert!(matches!(
            ModelRegistry::new(&bad),
            Err(ConfigError::UnknownProvider { .. })
        ));
    }
}
