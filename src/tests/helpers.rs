//! Deterministic stand-ins for the two external backends: the LLM provider
//! and the vector store.

use crate::llm::{Completion, CompletionRequest, LlmProvider};
use crate::models::SourceFragment;
use crate::retrieval::VectorStore;
use crate::{ChorusError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

enum Script {
    /// Replay responses in order; exhaustion is a hard failure.
    Queue(VecDeque<Result<String>>),
    /// Answer every prompt with the same content.
    Constant(String),
}

/// LLM provider that replays a scripted sequence of responses and records
/// every prompt it was shown.
pub struct ScriptedProvider {
    script: Mutex<Script>,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script::Queue(responses.into())),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn always(content: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Script::Constant(content.to_string())),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, response: Result<String>) {
        if let Script::Queue(queue) = &mut *self.script.lock().expect("script lock") {
            queue.push_back(response);
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        let next = match &mut *self.script.lock().expect("script lock") {
            Script::Constant(content) => Some(Ok(content.clone())),
            Script::Queue(queue) => queue.pop_front(),
        };
        match next {
            Some(Ok(content)) => Ok(Completion {
                content,
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            Some(Err(e)) => Err(e),
            None => Err(ChorusError::Llm {
                message: "scripted provider exhausted".to_string(),
                transient: false,
            }),
        }
    }
}

/// Vector store returning a fixed fragment list, optionally failing its
/// first `fail_times` searches with a store error.
pub struct StubStore {
    fragments: Vec<SourceFragment>,
    fail_times: AtomicU32,
    pub searches: AtomicU32,
}

impl StubStore {
    pub fn new(fragments: Vec<(&str, f64)>) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments
                .into_iter()
                .map(|(id, score)| SourceFragment {
                    store: String::new(),
                    document_id: id.to_string(),
                    score,
                    text: format!("content of {id}"),
                    metadata: Default::default(),
                })
                .collect(),
            fail_times: AtomicU32::new(0),
            searches: AtomicU32::new(0),
        })
    }

    pub fn failing_first(self: Arc<Self>, times: u32) -> Arc<Self> {
        self.fail_times.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl VectorStore for StubStore {
    async fn similarity_search(&self, _query: &str, k: usize) -> Result<Vec<SourceFragment>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_times.load(Ordering::SeqCst) > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err(ChorusError::Store {
                store: "stub".to_string(),
                message: "simulated outage".to_string(),
            });
        }
        Ok(self.fragments.iter().take(k).cloned().collect())
    }

    async fn document_count(&self) -> u64 {
        self.fragments.len() as u64
    }
}
