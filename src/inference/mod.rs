pub mod engine;
pub mod llama_cli;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use engine::{
    ChatSession, EngineProvider, ExecutionContext, InferenceEngine, LoadedModel, SamplingParams,
};
pub use llama_cli::LlamaCliEngine;
pub use session::{InferenceSessionManager, SessionPhase, SessionStatus};
