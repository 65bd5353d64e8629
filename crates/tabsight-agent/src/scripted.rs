//! Offline model that replays canned responses
//!
//! Used by tests and dry runs. Responses are queued per [`Purpose`]; every
//! request is recorded so callers can assert on prompts.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::llm::{LanguageModel, LlmError, LlmRequest, Purpose};

#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<HashMap<Purpose, VecDeque<Result<String, LlmError>>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next request of `purpose`
    pub fn respond(self, purpose: Purpose, reply: impl Into<String>) -> Self {
        self.push(purpose, Ok(reply.into()));
        self
    }

    /// Queue a failure for the next request of `purpose`
    pub fn fail(self, purpose: Purpose, error: LlmError) -> Self {
        self.push(purpose, Err(error));
        self
    }

    pub fn push(&self, purpose: Purpose, reply: Result<String, LlmError>) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(purpose)
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn requests_for(&self, purpose: Purpose) -> Vec<LlmRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.purpose == purpose)
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(LlmError::Permanent(format!(
                    "no scripted response for {}",
                    request.purpose
                )))
            })
    }
}
