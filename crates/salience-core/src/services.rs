//! Dependency container.
//!
//! Built once at process start and shared by reference. Components that
//! need a collaborator get it from here; nothing is a module global. The
//! model client is constructed on first use and memoized.

use std::sync::Arc;

use salience_state::fakes::{MemoryInsightStore, MemoryLayerRunStore, MemoryLedgerStore};
use salience_state::{InsightStore, LayerRunStore, LedgerStore, StorageError, SurrealStores};
use tokio::sync::OnceCell;

use crate::config::SalienceConfig;
use crate::domain::Result;
use crate::impulse::ImpulseEngine;
use crate::ledger::SalienceLedger;
use crate::model::{HttpModelClient, ModelClient, ModelRegistry};
use crate::retriever::InsightRetriever;
use crate::selector::ReflectionSelector;

/// The four stores the engine writes to.
#[derive(Clone)]
pub struct Stores {
    pub salience: Arc<dyn LedgerStore>,
    pub impulse: Arc<dyn LedgerStore>,
    pub runs: Arc<dyn LayerRunStore>,
    pub insights: Arc<dyn InsightStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            salience: Arc::new(MemoryLedgerStore::new()),
            impulse: Arc::new(MemoryLedgerStore::new()),
            runs: Arc::new(MemoryLayerRunStore::new()),
            insights: Arc::new(MemoryInsightStore::new()),
        }
    }
}

impl From<SurrealStores> for Stores {
    fn from(s: SurrealStores) -> Self {
        Self {
            salience: Arc::new(s.salience),
            impulse: Arc::new(s.impulse),
            runs: Arc::new(s.runs),
            insights: Arc::new(s.insights),
        }
    }
}

pub struct Services {
    pub config: SalienceConfig,
    pub stores: Stores,
    pub ledger: Arc<SalienceLedger>,
    pub impulse: Arc<ImpulseEngine>,
    pub selector: Arc<ReflectionSelector>,
    pub retriever: Arc<InsightRetriever>,
    pub models: Arc<ModelRegistry>,
    model_client: OnceCell<Arc<dyn ModelClient>>,
}

impl Services {
    /// Wire every component over `stores`. Fails on invalid model configuration.
    pub fn new(config: SalienceConfig, stores: Stores) -> Result<Self> {
        let models = Arc::new(ModelRegistry::new(&config.models)?);
        let ledger = Arc::new(SalienceLedger::new(
            stores.salience.clone(),
            config.ledger.clone(),
        ));
        let impulse = Arc::new(ImpulseEngine::new(
            stores.impulse.clone(),
            config.impulse.clone(),
        ));
        let selector = Arc::new(ReflectionSelector::new(ledger.clone(), config.budget.clone()));
        let retriever = Arc::new(InsightRetriever::new(
            stores.insights.clone(),
            ledger.clone(),
            config.retrieval.clone(),
        ));
        Ok(Self {
            config,
            stores,
            ledger,
            impulse,
            selector,
            retriever,
            models,
            model_client: OnceCell::new(),
        })
    }

    /// In-memory stores (tests, `--in-memory`).
    pub fn in_memory(config: SalienceConfig) -> Result<Self> {
        Self::new(config, Stores::in_memory())
    }

    /// Connect to the configured SurrealDB store (env overrides applied).
    pub async fn connect(config: SalienceConfig) -> Result<Self> {
        let store_config = config.store.clone().with_env_overrides();
        let stores = SurrealStores::connect(&store_config)
            .await
            .map_err(StorageError::from)?;
        Self::new(config, stores.into())
    }

    /// Use `client` instead of constructing the HTTP client.
    pub fn with_model_client(self, client: Arc<dyn ModelClient>) -> Self {
        let cell = OnceCell::new();
        // A fresh cell is always empty.
        let _ = cell.set(client);
        Self {
            model_client: cell,
            ..self
        }
    }

    /// The model client, constructed on first use.
    pub async fn model_client(&self) -> Result<Arc<dyn ModelClient>> {
        let client = self
            .model_client
            .get_or_try_init(|| async {
                let client: Arc<dyn ModelClient> = Arc::new(HttpModelClient::new()?);
                Ok::<_, crate::model::ModelError>(client)
            })
            .await?;
        Ok(client.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedModelClient;

    #[tokio::test]
    async fn injected_client_is_returned() {
        let scripted = Arc::new(ScriptedModelClient::new());
        let services = Services::in_memory(SalienceConfig::default())
            .unwrap()
            .with_model_client(scripted.clone());
        let client = services.model_client().await.unwrap();
        let again = services.model_client().await.unwrap();
        assert!(Arc::ptr_eq(&client, &again));
    }

    #[tokio::test]
    async fn http_client_is_memoized() {
        let services = Services::in_memory(SalienceConfig::default()).unwrap();
        let a = services.model_client().await.unwrap();
        let b = services.model_client().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
