//! Lifecycle owner of the model / context / chat-session object graph.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::engine::{
    ChatSession, EngineProvider, ExecutionContext, LoadedModel, SamplingParams,
};
use crate::error::{ChatError, InitError, InitStage, ResetError};
use crate::models::ModelStore;

const TEARDOWN_WAIT: Duration = Duration::from_secs(5);

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Empty,
    Loading,
    Ready,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub artifact_present: bool,
    pub artifact_label: String,
    pub session_ready: bool,
}

// Field order is drop order: session, then context, then model.
struct LiveSession {
    chat: Option<Box<dyn ChatSession>>,
    context: Box<dyn ExecutionContext>,
    _model: Box<dyn LoadedModel>,
}

pub struct InferenceSessionManager {
    store: Arc<ModelStore>,
    artifact_label: String,
    provider: EngineProvider,
    phase: Mutex<SessionPhase>,
    live: tokio::sync::Mutex<Option<LiveSession>>,
}

impl InferenceSessionManager {
    pub fn new(
        store: Arc<ModelStore>,
        artifact_label: impl Into<String>,
        provider: EngineProvider,
    ) -> Self {
        Self {
            store,
            artifact_label: artifact_label.into(),
            provider,
            phase: Mutex::new(SessionPhase::Empty),
            live: tokio::sync::Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            artifact_present: self.store.artifact_exists(),
            artifact_label: self.artifact_label.clone(),
            session_ready: self.phase() == SessionPhase::Ready,
        }
    }

    /// Load model, context and chat session. A no-op when already ready.
    ///
    /// Concurrent callers are serialised: the second waits for the first and
    /// then observes the finished session instead of loading again.
    pub async fn initialize(&self) -> Result<(), InitError> {
        if self.phase() == SessionPhase::Ready {
            return Ok(());
        }

        let mut live = self.live.lock().await;
        if self.phase() == SessionPhase::Ready {
            return Ok(());
        }

        self.set_phase(SessionPhase::Loading);
        match self.load(&mut live).await {
            Ok(()) => {
                self.set_phase(SessionPhase::Ready);
                info!("LLM initialized");
                Ok(())
            }
            Err(e) => {
                self.set_phase(SessionPhase::Empty);
                warn!("LLM initialization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn load(&self, live: &mut Option<LiveSession>) -> Result<(), InitError> {
        // A context that survived a failed reset only needs a new session.
        if let Some(existing) = live.as_mut() {
            let chat = existing
                .context
                .create_session()
                .map_err(|e| InitError::new(InitStage::Session, e.0))?;
            existing.chat = Some(chat);
            return Ok(());
        }

        let path = self
            .store
            .locate()
            .ok_or_else(|| InitError::artifact_missing(&self.store.artifact_path()))?;

        let engine = self
            .provider
            .get()
            .await
            .map_err(|e| InitError::new(InitStage::Engine, e.0))?;

        info!("Loading model from {:?}", path);
        let model = engine
            .load_model(&path)
            .await
            .map_err(|e| InitError::new(InitStage::Model, e.0))?;

        debug!("Creating execution context");
        let context = model
            .create_context()
            .await
            .map_err(|e| InitError::new(InitStage::Context, e.0))?;

        debug!("Creating chat session");
        let chat = context
            .create_session()
            .map_err(|e| InitError::new(InitStage::Session, e.0))?;

        *live = Some(LiveSession {
            chat: Some(chat),
            context,
            _model: model,
        });
        Ok(())
    }

    /// Send one user turn to the live session.
    pub async fn chat(&self, user_text: &str, system_prompt: &str) -> Result<String, ChatError> {
        if self.phase() != SessionPhase::Ready {
            return Err(ChatError::NotInitialized);
        }

        let mut live = self.live.lock().await;
        let session = live
            .as_mut()
            .and_then(|l| l.chat.as_mut())
            .ok_or(ChatError::NotInitialized)?;

        session
            .prompt(system_prompt, user_text, &SamplingParams::default())
            .await
            .map_err(|e| ChatError::Generation { message: e.0 })
    }

    /// Drop the conversation history and open a new session on the existing context.
    pub async fn reset(&self) -> Result<(), ResetError> {
        let mut live = self.live.lock().await;
        let Some(existing) = live.as_mut() else {
            return Err(ResetError::NotReady);
        };

        existing.chat = None;
        match existing.context.create_session() {
            Ok(chat) => {
                existing.chat = Some(chat);
                self.set_phase(SessionPhase::Ready);
                debug!("Chat session reset");
                Ok(())
            }
            Err(e) => {
                self.set_phase(SessionPhase::Empty);
                warn!("Failed to recreate chat session: {}", e);
                Err(ResetError::Session(e.0))
            }
        }
    }

    /// Release session, context and model. Safe to call repeatedly.
    pub async fn teardown(&self) {
        match tokio::time::timeout(TEARDOWN_WAIT, self.live.lock()).await {
            Ok(mut live) => {
                if let Some(session) = live.take() {
                    drop(session);
                    info!("Inference session released");
                }
                self.set_phase(SessionPhase::Empty);
            }
            Err(_) => {
                warn!("Teardown timed out behind an in-flight call; resources are left to process exit");
                self.set_phase(SessionPhase::Empty);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::ScriptedEngine;
    use tempfile::TempDir;

    fn manager(engine: &ScriptedEngine, with_artifact: bool) -> (TempDir, InferenceSessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path(), "model.gguf"));
        if with_artifact {
            std::fs::write(store.artifact_path(), b"weights").unwrap();
        }
        let manager =
            InferenceSessionManager::new(store, "test-model", EngineProvider::ready(engine.handle()));
        (dir, manager)
    }

    #[tokio::test]
    async fn status_reports_missing_artifact() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, false);

        let status = manager.status();
        assert!(!status.artifact_present);
        assert!(!status.session_ready);
        assert_eq!(status.artifact_label, "test-model");
    }

    #[tokio::test]
    async fn initialize_without_artifact() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, false);

        let err = manager.initialize().await.unwrap_err();
        assert!(err.is_artifact_missing());
        assert_eq!(engine.load_count(), 0);
        assert_eq!(manager.phase(), SessionPhase::Empty);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);

        manager.initialize().await.unwrap();
        manager.initialize().await.unwrap();

        assert_eq!(engine.load_count(), 1);
        assert_eq!(engine.session_count(), 1);
        assert!(manager.status().session_ready);
    }

    #[tokio::test]
    async fn concurrent_initialize_loads_once() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);

        let (a, b) = tokio::join!(manager.initialize(), manager.initialize());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(engine.load_count(), 1);
    }

    #[tokio::test]
    async fn failed_load_installs_nothing() {
        let engine = ScriptedEngine::new();
        engine.fail_loads(true);
        let (_dir, manager) = manager(&engine, true);

        let err = manager.initialize().await.unwrap_err();
        assert_eq!(err.stage, InitStage::Model);
        assert!(!manager.status().session_ready);
        assert!(matches!(
            manager.chat("hi", "").await,
            Err(ChatError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn failed_session_creation_reports_stage() {
        let engine = ScriptedEngine::new();
        engine.fail_sessions(true);
        let (_dir, manager) = manager(&engine, true);

        let err = manager.initialize().await.unwrap_err();
        assert_eq!(err.stage, InitStage::Session);
        assert_eq!(manager.phase(), SessionPhase::Empty);
        // The loaded model and context were discarded with the failure.
        assert!(matches!(manager.reset().await, Err(ResetError::NotReady)));
    }

    #[tokio::test]
    async fn chat_before_initialize_never_reaches_engine() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);

        let result = manager.chat("hello", "sys").await;
        assert!(matches!(result, Err(ChatError::NotInitialized)));
        assert!(engine.prompts().is_empty());
    }

    #[tokio::test]
    async fn chat_uses_fixed_sampling_and_keeps_history() {
        let engine = ScriptedEngine::new();
        engine.push_reply("one");
        engine.push_reply("two");
        let (_dir, manager) = manager(&engine, true);
        manager.initialize().await.unwrap();

        assert_eq!(manager.chat("a", "sys").await.unwrap(), "one");
        assert_eq!(manager.chat("b", "sys").await.unwrap(), "two");

        let prompts = engine.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].history_len, 0);
        assert_eq!(prompts[1].history_len, 1);
        assert_eq!(prompts[1].params, SamplingParams::default());
        assert_eq!(prompts[0].system_prompt, "sys");
    }

    #[tokio::test]
    async fn generation_failure_is_reported() {
        let engine = ScriptedEngine::new();
        engine.fail_prompts(true);
        let (_dir, manager) = manager(&engine, true);
        manager.initialize().await.unwrap();

        let result = manager.chat("a", "sys").await;
        assert!(matches!(result, Err(ChatError::Generation { .. })));
        assert!(manager.status().session_ready);
    }

    #[tokio::test]
    async fn reset_clears_history_but_keeps_model() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);
        manager.initialize().await.unwrap();
        manager.chat("a", "").await.unwrap();

        manager.reset().await.unwrap();
        manager.chat("b", "").await.unwrap();

        let prompts = engine.prompts();
        assert_eq!(prompts[1].history_len, 0);
        assert_eq!(prompts[1].session, 2);
        assert_eq!(engine.load_count(), 1);
        assert_eq!(engine.context_count(), 1);
    }

    #[tokio::test]
    async fn reset_without_context_is_not_ready() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);
        assert!(matches!(manager.reset().await, Err(ResetError::NotReady)));
    }

    #[tokio::test]
    async fn failed_reset_recovers_on_initialize() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);
        manager.initialize().await.unwrap();

        engine.fail_sessions(true);
        assert!(matches!(manager.reset().await, Err(ResetError::Session(_))));
        assert!(!manager.status().session_ready);

        engine.fail_sessions(false);
        manager.initialize().await.unwrap();
        assert!(manager.status().session_ready);
        assert_eq!(engine.load_count(), 1);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let engine = ScriptedEngine::new();
        let (_dir, manager) = manager(&engine, true);
        manager.initialize().await.unwrap();

        manager.teardown().await;
        manager.teardown().await;

        assert_eq!(manager.phase(), SessionPhase::Empty);
        assert!(matches!(manager.reset().await, Err(ResetError::NotReady)));
        assert!(matches!(
            manager.chat("a", "").await,
            Err(ChatError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_gives_up_on_a_stuck_turn() {
        let engine = ScriptedEngine::new();
        engine.set_prompt_delay(Duration::from_secs(60));
        let (_dir, manager) = manager(&engine, true);
        let manager = Arc::new(manager);
        manager.initialize().await.unwrap();

        let busy = manager.clone();
        let turn = tokio::spawn(async move { busy.chat("slow", "").await });
        while engine.prompts().is_empty() {
            tokio::task::yield_now().await;
        }

        let started = tokio::time::Instant::now();
        manager.teardown().await;
        let waited = started.elapsed();

        assert!(waited >= TEARDOWN_WAIT);
        assert!(waited < Duration::from_secs(60));
        assert_eq!(manager.phase(), SessionPhase::Empty);
        let _ = turn.await;
    }
}
