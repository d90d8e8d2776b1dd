use anyhow::Result;
use directories::ProjectDirs;
use std::path::PathBuf;

use crate::models::ArtifactSpec;

pub const MODELS_DIR_ENV: &str = "COMPANION_MODELS_DIR";
pub const LLAMA_CLI_ENV: &str = "COMPANION_LLAMA_CLI";

const PROFILE_FILENAME: &str = "chat-companion-storage.json";

#[derive(Clone, Debug)]
pub struct CompanionConfig {
    pub artifact: ArtifactSpec,
    pub models_dir: PathBuf,
    pub profile_path: PathBuf,
    /// Explicit llama-cli location; searched next to the executable when unset.
    pub llama_cli: Option<PathBuf>,
}

impl CompanionConfig {
    /// Resolve paths from the platform directories, honouring env overrides.
    pub fn from_env() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "chatcompanion", "ChatCompanion")
            .ok_or_else(|| anyhow::anyhow!("Failed to get project directories"))?;

        let models_dir = std::env::var_os(MODELS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| project_dirs.data_dir().join("models"));

        Ok(Self {
            artifact: ArtifactSpec::default(),
            models_dir,
            profile_path: project_dirs.config_dir().join(PROFILE_FILENAME),
            llama_cli: std::env::var_os(LLAMA_CLI_ENV).map(PathBuf::from),
        })
    }

    /// Everything rooted under `dir`. Used by tests and portable installs.
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            artifact: ArtifactSpec::default(),
            models_dir: dir.join("models"),
            profile_path: dir.join(PROFILE_FILENAME),
            llama_cli: None,
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactSpec) -> Self {
        self.artifact = artifact;
        self
    }
}
