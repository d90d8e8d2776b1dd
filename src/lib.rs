pub mod app;
pub mod config;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod logging;
pub mod models;
pub mod mood;
pub mod personality;
pub mod profile;

pub use app::{AppEvent, AppStateMachine, AppStatus, ChatState, Message, Role, FALLBACK_REPLY};
pub use config::CompanionConfig;
pub use error::{AppError, ChatError, DownloadError, InitError, InitStage, ResetError};
pub use mood::Mood;
pub use personality::{Personality, PersonalityRegistry, PersonalityType};
