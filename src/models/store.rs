use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Local storage for the model artifact: one well-known file under a base directory.
pub struct ModelStore {
    base_path: PathBuf,
    filename: String,
}

impl ModelStore {
    pub fn new(base_path: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            filename: filename.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.base_path.join(&self.filename)
    }

    pub fn artifact_exists(&self) -> bool {
        self.artifact_path().is_file()
    }

    /// Path of the artifact if it is present on disk.
    pub fn locate(&self) -> Option<PathBuf> {
        let path = self.artifact_path();
        if path.is_file() {
            Some(path)
        } else {
            None
        }
    }
}

/// Write `bytes` to `dest` so that `dest` either holds the complete content or is untouched.
///
/// The data goes to a sibling `.part` file first and is renamed into place.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let part_path = dest.with_extension("part");
    let result = async {
        let mut file = tokio::fs::File::create(&part_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part_path, dest).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&part_path).await;
    }
    result
}
