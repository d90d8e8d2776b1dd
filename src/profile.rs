//! The persisted slice of application state.
//!
//! Only the persona choice and the names survive a restart. Chat history and
//! download state are intentionally kept out of this record.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::ProfileError;
use crate::personality::PersonalityType;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedProfile {
    #[serde(default)]
    pub personality_type: PersonalityType,
    #[serde(default)]
    pub companion_name: String,
    #[serde(default)]
    pub user_name: String,
}

pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the stored profile. A missing or unreadable file yields the default.
    pub fn load(&self) -> PersistedProfile {
        if !self.path.exists() {
            return PersistedProfile::default();
        }

        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt profile at {:?}: {}", self.path, e);
                PersistedProfile::default()
            }),
            Err(e) => {
                warn!("Failed to read profile at {:?}: {}", self.path, e);
                PersistedProfile::default()
            }
        }
    }

    pub async fn save(&self, profile: &PersistedProfile) -> Result<(), ProfileError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(profile)?;
        tokio::fs::write(&self.path, json).await?;
        debug!("Saved profile to {:?}", self.path);
        Ok(())
    }
}
