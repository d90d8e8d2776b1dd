//! Payloads exchanged with the webview.

use serde::Serialize;
use std::fmt::Display;

use crate::inference::SessionStatus;

/// Answer to the `get_status` command.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LlmStatus {
    pub model_exists: bool,
    pub model_name: String,
    pub is_ready: bool,
}

impl From<SessionStatus> for LlmStatus {
    fn from(status: SessionStatus) -> Self {
        Self {
            model_exists: status.artifact_present,
            model_name: status.artifact_label,
            is_ready: status.session_ready,
        }
    }
}

/// `{ success, ...payload }` on success, `{ success: false, error }` on failure.
#[derive(Serialize, Debug, PartialEq)]
pub struct InvokeResult<T> {
    pub success: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> InvokeResult<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(error: impl Display) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.to_string()),
        }
    }

    pub fn from_result<E: Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(e) => Self::err(e),
        }
    }
}

impl InvokeResult<()> {
    /// Success without a payload.
    pub fn done() -> Self {
        Self {
            success: true,
            payload: None,
            error: None,
        }
    }
}
