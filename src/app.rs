//! Application state machine: setup flow, chat turns, persona switching.
//!
//! Status moves `checking -> need-download | initializing -> downloading ->
//! initializing -> ready`, with `error` reachable from any step. Only `ready`
//! accepts chat, and only one chat turn may be outstanding at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CompanionConfig;
use crate::error::AppError;
use crate::inference::{EngineProvider, InferenceSessionManager, SessionStatus};
use crate::models::{ArtifactSpec, DownloadCoordinator, DownloadEvent, DownloadProgress, ModelStore};
use crate::mood::{self, Mood};
use crate::personality::{Personality, PersonalityRegistry, PersonalityType};
use crate::profile::{PersistedProfile, ProfileStore};

/// Shown in place of a reply when generation fails.
pub const FALLBACK_REPLY: &str = "ごめんね、エラーが起きちゃった...もう一度話しかけてみて！";

const EVENT_CAPACITY: usize = 256;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AppStatus {
    Checking,
    NeedDownload,
    Downloading,
    Initializing,
    Ready,
    Error,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppStatus::Checking => "checking",
            AppStatus::NeedDownload => "need-download",
            AppStatus::Downloading => "downloading",
            AppStatus::Initializing => "initializing",
            AppStatus::Ready => "ready",
            AppStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Everything the UI renders from.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub mood: Mood,
    pub personality_type: PersonalityType,
    pub companion_name: String,
    pub user_name: String,
    pub app_status: AppStatus,
    pub download_progress: u8,
    pub error_message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AppEvent {
    Status {
        status: AppStatus,
        error_message: Option<String>,
    },
    DownloadProgress(DownloadProgress),
    MessageAppended(Message),
    MoodChanged(Mood),
    MessagesCleared,
    PersonalityChanged {
        personality_type: PersonalityType,
        companion_name: String,
    },
}

impl AppEvent {
    /// Event channel name on the UI side.
    pub fn channel(&self) -> &'static str {
        match self {
            AppEvent::Status { .. } => "app:status",
            AppEvent::DownloadProgress(_) => "llm:download-progress",
            AppEvent::MessageAppended(_) => "chat:message",
            AppEvent::MoodChanged(_) => "chat:mood",
            AppEvent::MessagesCleared => "chat:cleared",
            AppEvent::PersonalityChanged { .. } => "chat:personality",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            AppEvent::Status {
                status,
                error_message,
            } => serde_json::json!({ "status": status, "errorMessage": error_message }),
            AppEvent::DownloadProgress(progress) => serde_json::json!(progress),
            AppEvent::MessageAppended(message) => serde_json::json!(message),
            AppEvent::MoodChanged(mood) => serde_json::json!({ "mood": mood }),
            AppEvent::MessagesCleared => serde_json::Value::Null,
            AppEvent::PersonalityChanged {
                personality_type,
                companion_name,
            } => serde_json::json!({
                "personalityType": personality_type,
                "companionName": companion_name,
            }),
        }
    }
}

pub struct AppStateMachine {
    artifact: ArtifactSpec,
    sessions: Arc<InferenceSessionManager>,
    downloader: DownloadCoordinator,
    personalities: PersonalityRegistry,
    profile: ProfileStore,
    state: Mutex<ChatState>,
    /// Set under the state lock; the next chat turn resets the session first.
    reset_pending: AtomicBool,
    events: broadcast::Sender<AppEvent>,
}

impl AppStateMachine {
    pub fn new(config: &CompanionConfig, provider: EngineProvider) -> Self {
        let store = Arc::new(ModelStore::new(
            &config.models_dir,
            config.artifact.filename.clone(),
        ));
        let sessions = Arc::new(InferenceSessionManager::new(
            store,
            config.artifact.name.clone(),
            provider,
        ));
        let downloader = DownloadCoordinator::new(sessions.clone());

        Self::from_parts(
            config.artifact.clone(),
            sessions,
            downloader,
            ProfileStore::new(&config.profile_path),
        )
    }

    pub fn from_parts(
        artifact: ArtifactSpec,
        sessions: Arc<InferenceSessionManager>,
        downloader: DownloadCoordinator,
        profile: ProfileStore,
    ) -> Self {
        let personalities = PersonalityRegistry::new();
        let stored = profile.load();
        let companion_name = personalities
            .personality(stored.personality_type)
            .name
            .clone();

        let state = ChatState {
            messages: Vec::new(),
            is_loading: false,
            mood: Mood::Happy,
            personality_type: stored.personality_type,
            companion_name,
            user_name: stored.user_name,
            app_status: AppStatus::Checking,
            download_progress: 0,
            error_message: String::new(),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            artifact,
            sessions,
            downloader,
            personalities,
            profile,
            state: Mutex::new(state),
            reset_pending: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> &Arc<InferenceSessionManager> {
        &self.sessions
    }

    pub fn snapshot(&self) -> ChatState {
        self.lock().clone()
    }

    pub fn status(&self) -> AppStatus {
        self.lock().app_status
    }

    pub fn session_status(&self) -> SessionStatus {
        self.sessions.status()
    }

    pub fn personalities(&self) -> Vec<&Personality> {
        self.personalities.list()
    }

    pub fn active_personality(&self) -> &Personality {
        let id = self.lock().personality_type;
        self.personalities.personality(id)
    }

    /// Opening line for an empty conversation.
    pub fn greeting(&self) -> &str {
        &self.active_personality().greeting
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: AppEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: AppStatus) {
        {
            let mut state = self.lock();
            state.app_status = status;
            if status != AppStatus::Error {
                state.error_message.clear();
            }
        }
        info!("App status -> {}", status);
        self.emit(AppEvent::Status {
            status,
            error_message: None,
        });
    }

    fn fail(&self, message: String) {
        {
            let mut state = self.lock();
            state.app_status = AppStatus::Error;
            state.error_message = message.clone();
        }
        warn!("App status -> error: {}", message);
        self.emit(AppEvent::Status {
            status: AppStatus::Error,
            error_message: Some(message),
        });
    }

    /// Move to `to` only if the current status is one of `from`.
    fn transition(
        &self,
        from: &[AppStatus],
        to: AppStatus,
        action: &'static str,
    ) -> Result<(), AppError> {
        {
            let mut state = self.lock();
            if !from.contains(&state.app_status) {
                return Err(AppError::InvalidTransition {
                    from: state.app_status,
                    action,
                });
            }
            state.app_status = to;
            state.error_message.clear();
            if to == AppStatus::Downloading {
                state.download_progress = 0;
            }
        }
        info!("App status -> {}", to);
        self.emit(AppEvent::Status {
            status: to,
            error_message: None,
        });
        Ok(())
    }

    /// Decide the first screen from what is on disk and in memory.
    pub async fn start(&self) -> AppStatus {
        let current = self.status();
        if current != AppStatus::Checking {
            debug!("start() ignored while {}", current);
            return current;
        }

        let status = self.sessions.status();
        let next = if status.session_ready {
            AppStatus::Ready
        } else if status.artifact_present {
            AppStatus::Initializing
        } else {
            AppStatus::NeedDownload
        };

        if self.transition(&[AppStatus::Checking], next, "start").is_err() {
            return self.status();
        }
        if next == AppStatus::Initializing {
            self.run_initialize().await;
        }
        self.status()
    }

    /// Load the model from disk. Valid while checking, after an error, or from
    /// `need-download` once the artifact has appeared on disk.
    pub async fn initialize(&self) -> Result<AppStatus, AppError> {
        let from: &[AppStatus] = if self.sessions.status().artifact_present {
            &[AppStatus::Checking, AppStatus::NeedDownload, AppStatus::Error]
        } else {
            &[AppStatus::Checking, AppStatus::Error]
        };
        self.transition(from, AppStatus::Initializing, "initialize")?;
        self.run_initialize().await;
        Ok(self.status())
    }

    async fn run_initialize(&self) {
        match self.sessions.initialize().await {
            Ok(()) => self.set_status(AppStatus::Ready),
            Err(e) => self.fail(format!("初期化失敗: {}", e)),
        }
    }

    /// Fetch the artifact, then initialise from it.
    pub async fn request_download(&self) -> Result<AppStatus, AppError> {
        self.transition(
            &[AppStatus::NeedDownload, AppStatus::Error],
            AppStatus::Downloading,
            "download",
        )?;

        let mut relay = |event: DownloadEvent| match event {
            DownloadEvent::Progress(progress) => {
                self.lock().download_progress = progress.percent_complete;
                self.emit(AppEvent::DownloadProgress(progress));
            }
            DownloadEvent::Completed { .. } => self.set_status(AppStatus::Initializing),
            DownloadEvent::Failed { .. } => {}
        };

        match self
            .downloader
            .download_and_initialize(&self.artifact, &mut relay)
            .await
        {
            Ok(outcome) => match outcome.initialized {
                Ok(()) => self.set_status(AppStatus::Ready),
                Err(e) => self.fail(format!("初期化失敗: {}", e)),
            },
            Err(e) => self.fail(format!("ダウンロード失敗: {}", e)),
        }
        Ok(self.status())
    }

    /// The setup screen's retry: initialise if the artifact is on disk, else download.
    pub async fn retry(&self) -> Result<AppStatus, AppError> {
        if self.sessions.status().artifact_present {
            self.initialize().await
        } else {
            self.request_download().await
        }
    }

    fn system_prompt(&self, personality_type: PersonalityType, user_name: &str) -> String {
        let mut prompt = self
            .personalities
            .personality(personality_type)
            .system_prompt
            .clone();
        if !user_name.is_empty() {
            prompt.push_str(&format!("\nユーザーの名前は「{}」です。", user_name));
        }
        prompt
    }

    /// Run one chat turn and return the assistant message that was appended.
    ///
    /// Generation failures do not surface as errors: they append
    /// [`FALLBACK_REPLY`] and set the mood to sad.
    pub async fn send_message(&self, text: &str) -> Result<Message, AppError> {
        if text.trim().is_empty() {
            return Err(AppError::EmptyMessage);
        }

        let user_message = Message::new(Role::User, text);
        let (system_prompt, reset_first) = {
            let mut state = self.lock();
            if state.app_status != AppStatus::Ready {
                return Err(AppError::NotReady);
            }
            if state.is_loading {
                return Err(AppError::Busy);
            }
            state.is_loading = true;
            state.mood = Mood::Thinking;
            state.messages.push(user_message.clone());
            (
                self.system_prompt(state.personality_type, &state.user_name),
                self.reset_pending.swap(false, Ordering::SeqCst),
            )
        };
        self.emit(AppEvent::MessageAppended(user_message));
        self.emit(AppEvent::MoodChanged(Mood::Thinking));

        if reset_first {
            if let Err(e) = self.sessions.reset().await {
                debug!("Chat reset skipped: {}", e);
            }
        }

        let (reply, mood) = match self.sessions.chat(text, &system_prompt).await {
            Ok(reply) if !reply.trim().is_empty() => {
                let mood = mood::classify(&reply);
                (Message::new(Role::Assistant, reply), mood)
            }
            Ok(_) => {
                warn!("Chat error: empty reply");
                (Message::new(Role::Assistant, FALLBACK_REPLY), Mood::Sad)
            }
            Err(e) => {
                warn!("Chat error: {}", e);
                (Message::new(Role::Assistant, FALLBACK_REPLY), Mood::Sad)
            }
        };

        {
            let mut state = self.lock();
            state.messages.push(reply.clone());
            state.mood = mood;
            state.is_loading = false;
        }
        self.emit(AppEvent::MessageAppended(reply.clone()));
        self.emit(AppEvent::MoodChanged(mood));
        Ok(reply)
    }

    /// Switch persona, clear the conversation and reset the engine session.
    pub async fn set_personality(&self, identifier: &str) -> Result<(), AppError> {
        let personality = self.personalities.get(identifier)?;

        {
            let mut state = self.lock();
            state.personality_type = personality.id;
            state.companion_name = personality.name.clone();
            state.messages.clear();
            self.reset_pending.store(true, Ordering::SeqCst);
        }
        info!("Personality -> {}", personality.id);
        self.emit(AppEvent::PersonalityChanged {
            personality_type: personality.id,
            companion_name: personality.name.clone(),
        });
        self.emit(AppEvent::MessagesCleared);

        self.persist().await;
        Ok(())
    }

    pub async fn set_user_name(&self, name: &str) {
        self.lock().user_name = name.trim().to_string();
        self.persist().await;
    }

    /// Drop the conversation. The engine session is reset before the next turn.
    pub fn clear_messages(&self) {
        {
            let mut state = self.lock();
            state.messages.clear();
            self.reset_pending.store(true, Ordering::SeqCst);
        }
        self.emit(AppEvent::MessagesCleared);
    }

    /// Release the inference session. Called once on exit.
    pub async fn shutdown(&self) {
        self.sessions.teardown().await;
    }

    fn persisted(&self) -> PersistedProfile {
        let state = self.lock();
        PersistedProfile {
            personality_type: state.personality_type,
            companion_name: state.companion_name.clone(),
            user_name: state.user_name.clone(),
        }
    }

    async fn persist(&self) {
        let profile = self.persisted();
        if let Err(e) = self.profile.save(&profile).await {
            warn!("Failed to save profile: {}", e);
        }
    }
}
