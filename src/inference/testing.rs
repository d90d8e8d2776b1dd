//! Scripted in-process engine for exercising the session lifecycle without a model.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::engine::{ChatSession, ExecutionContext, InferenceEngine, LoadedModel, SamplingParams};
use crate::error::EngineError;

/// One recorded call to [`ChatSession::prompt`].
#[derive(Clone, Debug, PartialEq)]
pub struct PromptRecord {
    pub session: usize,
    pub system_prompt: String,
    pub text: String,
    /// Turns already in the session history when the prompt arrived.
    pub history_len: usize,
    pub params: SamplingParams,
}

#[derive(Default)]
struct Script {
    loads: AtomicUsize,
    contexts: AtomicUsize,
    sessions: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_load: AtomicBool,
    fail_prompt: AtomicBool,
    fail_session: AtomicBool,
    delay_ms: AtomicUsize,
    load_delay_ms: AtomicUsize,
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<PromptRecord>>,
    loaded_paths: Mutex<Vec<PathBuf>>,
}

#[derive(Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Script>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<dyn InferenceEngine> {
        Arc::new(self.clone())
    }

    /// Queue a reply. When the queue is empty the session echoes the input.
    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.script.replies).push_back(reply.into());
    }

    pub fn fail_loads(&self, fail: bool) {
        self.script.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_prompts(&self, fail: bool) {
        self.script.fail_prompt.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.script.fail_session.store(fail, Ordering::SeqCst);
    }

    pub fn set_prompt_delay(&self, delay: Duration) {
        self.script
            .delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        self.script
            .load_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.script.loads.load(Ordering::SeqCst)
    }

    pub fn context_count(&self) -> usize {
        self.script.contexts.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.script.sessions.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_prompts(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<PromptRecord> {
        lock(&self.script.prompts).clone()
    }

    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        lock(&self.script.loaded_paths).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn load_model(&self, path: &Path) -> Result<Box<dyn LoadedModel>, EngineError> {
        self.script.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.script.fail_load.load(Ordering::SeqCst) {
            return Err(EngineError("scripted load failure".to_string()));
        }
        lock(&self.script.loaded_paths).push(path.to_path_buf());
        Ok(Box::new(ScriptedModel {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedModel {
    script: Arc<Script>,
}

#[async_trait]
impl LoadedModel for ScriptedModel {
    async fn create_context(&self) -> Result<Box<dyn ExecutionContext>, EngineError> {
        self.script.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedContext {
    script: Arc<Script>,
}

impl ExecutionContext for ScriptedContext {
    fn create_session(&self) -> Result<Box<dyn ChatSession>, EngineError> {
        if self.script.fail_session.load(Ordering::SeqCst) {
            return Err(EngineError("no sequences left".to_string()));
        }
        let id = self.script.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedSession {
            id,
            script: self.script.clone(),
            history: Vec::new(),
        }))
    }
}

struct ScriptedSession {
    id: usize,
    script: Arc<Script>,
    history: Vec<(String, String)>,
}

#[async_trait]
impl ChatSession for ScriptedSession {
    async fn prompt(
        &mut self,
        system_prompt: &str,
        text: &str,
        params: &SamplingParams,
    ) -> Result<String, EngineError> {
        let now = self.script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_in_flight.fetch_max(now, Ordering::SeqCst);

        lock(&self.script.prompts).push(PromptRecord {
            session: self.id,
            system_prompt: system_prompt.to_string(),
            text: text.to_string(),
            history_len: self.history.len(),
            params: *params,
        });

        let delay = self.script.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let result = if self.script.fail_prompt.load(Ordering::SeqCst) {
            Err(EngineError("scripted generation failure".to_string()))
        } else {
            let reply = lock(&self.script.replies)
                .pop_front()
                .unwrap_or_else(|| text.to_string());
            self.history.push((text.to_string(), reply.clone()));
            Ok(reply)
        };

        self.script.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
