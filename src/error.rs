//! Error taxonomy for the companion core.

use serde::Serialize;
use std::fmt;

use crate::app::AppStatus;

/// Failure while fetching or storing the model artifact.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP error: {status}")]
    Http { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Filesystem(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Network(err.to_string())
    }
}

/// Which step of session initialisation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitStage {
    Artifact,
    Engine,
    Model,
    Context,
    Session,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitStage::Artifact => "artifact",
            InitStage::Engine => "engine",
            InitStage::Model => "model",
            InitStage::Context => "context",
            InitStage::Session => "session",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("initialization failed at {stage}: {message}")]
pub struct InitError {
    pub stage: InitStage,
    pub message: String,
}

impl InitError {
    pub fn new(stage: InitStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    pub fn artifact_missing(path: &std::path::Path) -> Self {
        Self::new(
            InitStage::Artifact,
            format!("model artifact not found at {}", path.display()),
        )
    }

    pub fn is_artifact_missing(&self) -> bool {
        self.stage == InitStage::Artifact
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("LLM is not initialized")]
    NotInitialized,

    #[error("generation failed: {message}")]
    Generation { message: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResetError {
    /// No execution context is loaded yet; nothing to reset.
    #[error("no execution context loaded")]
    NotReady,

    #[error("failed to create chat session: {0}")]
    Session(String),
}

/// Error raised by an inference engine backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError(format!("{:#}", err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersonalityError {
    #[error("unknown personality: {0}")]
    UnknownPersonality(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Contract violations reported by the application state machine.
///
/// Setup and chat failures are not errors at this level: they surface as
/// `AppStatus::Error` or as an in-conversation fallback message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: AppStatus,
        action: &'static str,
    },

    #[error("a message is already being processed")]
    Busy,

    #[error("the companion is not ready")]
    NotReady,

    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Personality(#[from] PersonalityError),
}
