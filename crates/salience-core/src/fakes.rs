//! Deterministic collaborators for tests.
//!
//! `ScriptedModelClient` answers model calls from a script instead of the
//! network: queued replies first, then a default reply, with optional
//! per-prompt failures and an artificial delay.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{ModelClient, ModelError, ModelRequest, ModelResponse, ResolvedProfile};

/// Reply used when nothing else is scripted: one valid insight.
pub const DEFAULT_REPLY: &str =
    r#"{"insights":[{"content":"noted a recurring theme","valence":{"curiosity":0.6},"confidence":0.7}]}"#;

pub struct ScriptedModelClient {
    default: Mutex<ModelResponse>,
    queue: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    failures: Mutex<Vec<(String, ModelError)>>,
    calls: Mutex<Vec<(String, ModelRequest)>>,
    delay: Mutex<Option<Duration>>,
}

impl Default for ScriptedModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self {
            default: Mutex::new(reply(DEFAULT_REPLY)),
            queue: Mutex::new(VecDeque::new()),
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// Replace the default reply text.
    pub fn with_default_reply(self, text: &str) -> Self {
        *self.default.lock().unwrap() = reply(text);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Answer the next call with `result`.
    pub fn push(&self, result: Result<ModelResponse, ModelError>) {
        self.queue.lock().unwrap().push_back(result);
    }

    /// Fail every call whose prompt contains `needle`.
    pub fn fail_when_prompt_contains(&self, needle: &str, error: ModelError) {
        self.failures
            .lock()
            .unwrap()
            .push((needle.to_string(), error));
    }

    /// (profile, request) for every call so far.
    pub fn calls(&self) -> Vec<(String, ModelRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

/// Wrap `text` as a response with fixed token counts.
pub fn reply(text: &str) -> ModelResponse {
    ModelResponse {
        text: text.to_string(),
        prompt_tokens: 100,
        completion_tokens: 20,
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(
        &self,
        profile: &ResolvedProfile,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        self.calls
            .lock()
            .unwrap()
            .push((profile.requested.clone(), request.clone()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle.as_str()))
            .map(|(_, e)| e.clone());
        if let Some(error) = failure {
            return Err(error);
        }
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        Ok(self.default.lock().unwrap().clone())
    }
}
