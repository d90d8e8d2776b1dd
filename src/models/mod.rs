pub mod downloader;
pub mod store;
pub mod types;

pub use downloader::{DownloadCoordinator, DownloadOutcome};
pub use store::ModelStore;
pub use types::{ArtifactSpec, DownloadEvent, DownloadProgress};
