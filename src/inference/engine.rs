//! Capability surface of the inference engine.
//!
//! The engine is an opaque service: load a model, derive an execution
//! context from it, open a chat session on that context, and prompt the
//! session. Sessions keep their own multi-turn history.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::EngineError;

pub const MAX_TOKENS: u32 = 512;
pub const TEMPERATURE: f32 = 0.7;
pub const TOP_P: f32 = 0.9;

/// Sampling policy for chat replies. Not caller-configurable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            top_p: TOP_P,
        }
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn load_model(&self, path: &Path) -> Result<Box<dyn LoadedModel>, EngineError>;
}

#[async_trait]
pub trait LoadedModel: Send + Sync {
    async fn create_context(&self) -> Result<Box<dyn ExecutionContext>, EngineError>;
}

pub trait ExecutionContext: Send + Sync {
    /// Open a fresh chat session on a sequence of this context.
    fn create_session(&self) -> Result<Box<dyn ChatSession>, EngineError>;
}

#[async_trait]
pub trait ChatSession: Send {
    /// Generate a reply to `text`, appending the exchange to the session history.
    async fn prompt(
        &mut self,
        system_prompt: &str,
        text: &str,
        params: &SamplingParams,
    ) -> Result<String, EngineError>;
}

type EngineFactory = Box<dyn Fn() -> Result<Arc<dyn InferenceEngine>, EngineError> + Send + Sync>;

/// Builds the engine on first use and hands out the same instance afterwards.
pub struct EngineProvider {
    factory: EngineFactory,
    engine: OnceCell<Arc<dyn InferenceEngine>>,
}

impl EngineProvider {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn InferenceEngine>, EngineError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            engine: OnceCell::new(),
        }
    }

    /// Provider around an engine that already exists.
    pub fn ready(engine: Arc<dyn InferenceEngine>) -> Self {
        Self {
            factory: Box::new(|| Err(EngineError("engine factory unused".to_string()))),
            engine: OnceCell::new_with(Some(engine)),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        self.engine
            .get_or_try_init(|| async { (self.factory)() })
            .await
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.initialized()
    }
}
