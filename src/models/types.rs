use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The single model artifact the companion runs on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArtifactSpec {
    pub name: String,
    pub download_url: String,
    pub filename: String,
    pub checksum: Option<String>, // SHA-256, hex
    pub size_mb: u32,
}

impl ArtifactSpec {
    pub fn new(
        name: impl Into<String>,
        download_url: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            download_url: download_url.into(),
            filename: filename.into(),
            checksum: None,
            size_mb: 0,
        }
    }
}

impl Default for ArtifactSpec {
    fn default() -> Self {
        Self {
            name: "gemma-2-2b-jpn-it".to_string(),
            download_url: "https://huggingface.co/mmnga/gemma-2-2b-jpn-it-gguf/resolve/main/gemma-2-2b-jpn-it-Q4_K_M.gguf".to_string(),
            filename: "gemma-2-2b-jpn-it-Q4_K_M.gguf".to_string(),
            checksum: None,
            size_mb: 1500,
        }
    }
}

/// Snapshot of a running download, serialised as the `{downloaded, total, progress}` triple.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    #[serde(rename = "downloaded")]
    pub bytes_downloaded: u64,
    /// 0 when the server did not announce a size.
    #[serde(rename = "total")]
    pub bytes_total: u64,
    #[serde(rename = "progress")]
    pub percent_complete: u8,
}

impl DownloadProgress {
    pub fn new(bytes_downloaded: u64, bytes_total: u64) -> Self {
        let percent_complete = if bytes_total > 0 {
            (bytes_downloaded.saturating_mul(100) / bytes_total).min(100) as u8
        } else {
            0
        };
        Self {
            bytes_downloaded,
            bytes_total,
            percent_complete,
        }
    }
}

/// Emitted by the download loop: zero or more `Progress`, then exactly one terminal event.
#[derive(Clone, Debug, PartialEq)]
pub enum DownloadEvent {
    Progress(DownloadProgress),
    Completed { path: PathBuf },
    Failed { message: String },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress(_))
    }
}
