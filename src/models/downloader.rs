use futures_util::{Stream, StreamExt};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::store::{write_atomic, ModelStore};
use super::types::{ArtifactSpec, DownloadEvent, DownloadProgress};
use crate::error::{DownloadError, InitError};
use crate::inference::InferenceSessionManager;

/// Upper bound on the buffer reserved from a `Content-Length` header.
const PREALLOC_LIMIT: u64 = 64 * 1024 * 1024;

/// Result of a download that went on to initialise the session.
#[derive(Debug)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub initialized: Result<(), InitError>,
}

/// Fetches the model artifact and hands it to the session manager.
///
/// Callers must not run two downloads at once; the state machine guards this.
pub struct DownloadCoordinator {
    client: Client,
    store: Arc<ModelStore>,
    sessions: Arc<InferenceSessionManager>,
}

impl DownloadCoordinator {
    pub fn new(sessions: Arc<InferenceSessionManager>) -> Self {
        Self::with_client(Client::new(), sessions)
    }

    pub fn with_client(client: Client, sessions: Arc<InferenceSessionManager>) -> Self {
        Self {
            client,
            store: sessions.store().clone(),
            sessions,
        }
    }

    /// Download `artifact` into the model store, then initialise the session from it.
    pub async fn download_and_initialize(
        &self,
        artifact: &ArtifactSpec,
        on_event: &mut (dyn FnMut(DownloadEvent) + Send),
    ) -> Result<DownloadOutcome, DownloadError> {
        let dest = self.store.artifact_path();
        let path = self
            .download(
                &artifact.download_url,
                &dest,
                artifact.checksum.as_deref(),
                on_event,
            )
            .await?;

        let initialized = self.sessions.initialize().await;
        Ok(DownloadOutcome { path, initialized })
    }

    /// Stream `url` into memory and write it to `dest` in one step.
    ///
    /// `on_event` sees one `Progress` per chunk, then exactly one terminal event.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        checksum: Option<&str>,
        on_event: &mut (dyn FnMut(DownloadEvent) + Send),
    ) -> Result<PathBuf, DownloadError> {
        info!("Model download started: {}", url);

        let result = self.fetch(url, dest, checksum, on_event).await;
        match &result {
            Ok(path) => {
                info!("Model download complete: {:?}", path);
                on_event(DownloadEvent::Completed { path: path.clone() });
            }
            Err(e) => {
                warn!("Model download failed: {}", e);
                on_event(DownloadEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        checksum: Option<&str>,
        on_event: &mut (dyn FnMut(DownloadEvent) + Send),
    ) -> Result<PathBuf, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Http {
                status: status.as_u16(),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        receive(response.bytes_stream(), total_size, dest, checksum, on_event).await
    }
}

/// Drain `stream`, reporting progress, and write the artifact only if every chunk arrived.
pub async fn receive<S, B, E>(
    stream: S,
    total_size: u64,
    dest: &Path,
    checksum: Option<&str>,
    on_event: &mut (dyn FnMut(DownloadEvent) + Send),
) -> Result<PathBuf, DownloadError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    futures_util::pin_mut!(stream);

    // The server's length is only a hint; never reserve more than this up front.
    let initial = usize::try_from(total_size.min(PREALLOC_LIMIT)).unwrap_or(0);
    let mut buffer: Vec<u8> = Vec::with_capacity(initial);
    let mut downloaded: u64 = 0;
    let mut last_percent = 0u8;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::Network(e.to_string()))?;
        let chunk = chunk.as_ref();
        buffer
            .try_reserve(chunk.len())
            .map_err(|e| DownloadError::Filesystem(format!("cannot buffer download: {}", e)))?;
        buffer.extend_from_slice(chunk);
        downloaded += chunk.len() as u64;

        let mut progress = DownloadProgress::new(downloaded, total_size);
        progress.percent_complete = progress.percent_complete.max(last_percent);
        last_percent = progress.percent_complete;
        on_event(DownloadEvent::Progress(progress));
    }

    if total_size > 0 && downloaded != total_size {
        return Err(DownloadError::Network(format!(
            "incomplete download: received {} of {} bytes",
            downloaded, total_size
        )));
    }

    // Size was unknown up to now; report the finished size once.
    if total_size == 0 && downloaded > 0 {
        on_event(DownloadEvent::Progress(DownloadProgress::new(
            downloaded, downloaded,
        )));
    }

    if let Some(expected) = checksum.filter(|c| !c.is_empty()) {
        let actual = format!("{:x}", Sha256::digest(&buffer));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(DownloadError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        debug!("Checksum verified: {}", actual);
    }

    write_atomic(dest, &buffer).await?;
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::ScriptedEngine;
    use crate::inference::EngineProvider;
    use futures_util::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn percents(events: &[DownloadEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                DownloadEvent::Progress(p) => Some(p.percent_complete),
                _ => None,
            })
            .collect()
    }

    fn coordinator(dir: &Path, engine: &ScriptedEngine) -> DownloadCoordinator {
        let store = Arc::new(ModelStore::new(dir, "model.gguf"));
        let sessions = Arc::new(InferenceSessionManager::new(
            store,
            "test-model",
            EngineProvider::ready(engine.handle()),
        ));
        DownloadCoordinator::new(sessions)
    }

    #[tokio::test]
    async fn two_chunks_with_known_total() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Ok(vec![1; 500]), Ok(vec![2; 500])];

        let mut events = Vec::new();
        let path = receive(stream::iter(chunks), 1000, &dest, None, &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(percents(&events), vec![50, 100]);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn unknown_total_stays_at_zero_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> =
            vec![Ok(vec![0; 10]), Ok(vec![0; 10]), Ok(vec![0; 5])];

        let mut events = Vec::new();
        receive(stream::iter(chunks), 0, &dest, None, &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(percents(&events), vec![0, 0, 0, 100]);
    }

    #[tokio::test]
    async fn progress_never_decreases() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> =
            (0..7).map(|i| Ok(vec![0; 13 + i * 7])).collect();
        let total: u64 = (0..7).map(|i| 13 + i * 7).sum::<usize>() as u64;

        let mut events = Vec::new();
        receive(stream::iter(chunks), total, &dest, None, &mut |e| events.push(e))
            .await
            .unwrap();

        let seen = percents(&events);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn mid_stream_failure_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> =
            vec![Ok(vec![0; 500]), Err("connection reset".to_string())];

        let mut events = Vec::new();
        let err = receive(stream::iter(chunks), 1000, &dest, None, &mut |e| events.push(e))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Network(_)));
        assert!(!dest.exists());
        assert!(!dest.with_extension("part").exists());
        assert_eq!(percents(&events), vec![50]);
    }

    #[tokio::test]
    async fn truncated_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Ok(vec![0; 500])];

        let err = receive(stream::iter(chunks), 1000, &dest, None, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Network(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn oversized_content_length_fails_without_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Ok(vec![0; 10])];
        let mut events = Vec::new();

        let err = receive(
            stream::iter(chunks),
            u64::MAX / 2,
            &dest,
            None,
            &mut |e| events.push(e),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::Network(_)));
        assert!(!dest.exists());
        assert_eq!(percents(&events), vec![0]);
    }

    #[tokio::test]
    async fn checksum_mismatch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Ok(b"weights".to_vec())];

        let err = receive(stream::iter(chunks), 7, &dest, Some("deadbeef"), &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn checksum_match_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let expected = format!("{:x}", Sha256::digest(b"weights"));
        let chunks: Vec<Result<Vec<u8>, String>> = vec![Ok(b"weights".to_vec())];

        receive(stream::iter(chunks), 7, &dest, Some(&expected), &mut |_| {})
            .await
            .unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.gguf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new();
        let coordinator = coordinator(dir.path(), &engine);
        let dest = dir.path().join("model.gguf");

        let mut events = Vec::new();
        let err = coordinator
            .download(
                &format!("{}/model.gguf", server.uri()),
                &dest,
                None,
                &mut |e| events.push(e),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Http { status: 404 }));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DownloadEvent::Failed { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn download_then_initialize() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.gguf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1000]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new();
        let coordinator = coordinator(dir.path(), &engine);
        let artifact = ArtifactSpec::new(
            "test-model",
            format!("{}/model.gguf", server.uri()),
            "model.gguf",
        );

        let mut events = Vec::new();
        let outcome = coordinator
            .download_and_initialize(&artifact, &mut |e| events.push(e))
            .await
            .unwrap();

        assert_eq!(outcome.path, dir.path().join("model.gguf"));
        assert!(outcome.initialized.is_ok());
        assert_eq!(engine.load_count(), 1);
        assert_eq!(engine.loaded_paths(), vec![outcome.path.clone()]);

        // Terminal event comes last and exactly once.
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(DownloadEvent::Completed { .. })));
        assert_eq!(percents(&events).last(), Some(&100));
    }
}
