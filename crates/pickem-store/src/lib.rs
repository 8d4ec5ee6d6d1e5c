//! Path-keyed JSON document store, image byte store, and HTTP fetch
//! utilities for the pick'em backend.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pickem-store";

/// Builder for the hierarchical document paths the store is keyed by:
/// `artifacts/{appId}/public/data/{events|users|images}/{id}`.
#[derive(Debug, Clone)]
pub struct CollectionPaths {
    app_id: String,
}

impl CollectionPaths {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self { app_id: app_id.into() }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn events(&self) -> String {
        format!("artifacts/{}/public/data/events", self.app_id)
    }

    pub fn users(&self) -> String {
        format!("artifacts/{}/public/data/users", self.app_id)
    }

    pub fn images(&self) -> String {
        format!("artifacts/{}/public/data/images", self.app_id)
    }

    pub fn event(&self, event_id: &str) -> String {
        format!("{}/{}", self.events(), event_id)
    }

    pub fn user(&self, user_id: &str) -> String {
        format!("{}/{}", self.users(), user_id)
    }

    pub fn image(&self, image_id: &str) -> String {
        format!("{}/{}", self.images(), image_id)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document at {path}: {source}")]
    InvalidDocument {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// One JSON file per document under a data root. Writes go through a
/// temp file and an atomic rename; upserts are shallow object merges.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_file(&self, doc_path: &str) -> PathBuf {
        let mut file = self.root.clone();
        for segment in doc_path.split('/').filter(|s| !s.is_empty()) {
            file.push(segment);
        }
        file.set_extension("json");
        file
    }

    fn collection_dir(&self, collection_path: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for segment in collection_path.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir
    }

    pub async fn get(&self, doc_path: &str) -> Result<Option<Value>, StoreError> {
        let file = self.doc_file(doc_path);
        let bytes = match fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(doc_path, err)),
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::InvalidDocument { path: doc_path.to_string(), source })?;
        Ok(Some(value))
    }

    /// Replace the document wholesale.
    pub async fn put(&self, doc_path: &str, value: &Value) -> Result<(), StoreError> {
        let file = self.doc_file(doc_path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::io(doc_path, err))?;
        }

        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|source| StoreError::InvalidDocument { path: doc_path.to_string(), source })?;

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = file
            .parent()
            .map(|p| p.join(&temp_name))
            .unwrap_or_else(|| PathBuf::from(&temp_name));

        let mut out = fs::File::create(&temp_path)
            .await
            .map_err(|err| StoreError::io(doc_path, err))?;
        out.write_all(&bytes)
            .await
            .map_err(|err| StoreError::io(doc_path, err))?;
        out.flush()
            .await
            .map_err(|err| StoreError::io(doc_path, err))?;
        drop(out);

        if let Err(err) = fs::rename(&temp_path, &file).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(doc_path, err));
        }
        Ok(())
    }

    /// Merge-upsert: overlay object keys onto the existing document, or
    /// create it when absent. Non-object payloads replace wholesale.
    pub async fn merge(&self, doc_path: &str, value: &Value) -> Result<(), StoreError> {
        let merged = match (self.get(doc_path).await?, value) {
            (Some(Value::Object(mut existing)), Value::Object(incoming)) => {
                for (key, val) in incoming {
                    existing.insert(key.clone(), val.clone());
                }
                Value::Object(existing)
            }
            _ => value.clone(),
        };
        self.put(doc_path, &merged).await
    }

    /// Returns whether a document was actually removed.
    pub async fn delete(&self, doc_path: &str) -> Result<bool, StoreError> {
        let file = self.doc_file(doc_path);
        match fs::remove_file(&file).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::io(doc_path, err)),
        }
    }

    /// All documents in a collection, ordered by document id.
    pub async fn list(&self, collection_path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let dir = self.collection_dir(collection_path);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(collection_path, err)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StoreError::io(collection_path, err))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            let doc_path = format!("{}/{}", collection_path.trim_end_matches('/'), id);
            if let Some(value) = self.get(&doc_path).await? {
                out.push((id, value));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed image bytes, separate from the JSON documents that
/// describe them. Re-uploading identical bytes is a no-op.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn store_bytes(&self, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredImage> {
        let content_hash = Self::sha256_hex(bytes);
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let relative_path = PathBuf::from(format!("{content_hash}.{ext}"));
        let absolute_path = self.root.join(&relative_path);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating image directory {}", self.root.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            return Ok(StoredImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredImage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredImage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp image {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

// 5xx and 429 are the statuses worth another attempt; everything else
// reflects the request itself.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_request_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Base delay doubled per prior attempt, clamped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let mut delay = self.base_delay;
        for _ in 0..attempt_index {
            delay = delay.saturating_mul(2);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Fixed pause between successive fetches. A courtesy to the source
    /// site, not a correctness requirement.
    pub courtesy_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            courtesy_delay: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential HTTP GET client: one request at a time, fixed courtesy
/// delay between requests, capped exponential backoff on retryable
/// failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    courtesy_delay: Duration,
    last_request: Mutex<Option<Instant>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            courtesy_delay: config.courtesy_delay,
            last_request: Mutex::new(None),
            backoff: config.backoff,
        })
    }

    async fn pause_between_requests(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.courtesy_delay {
                tokio::time::sleep(self.courtesy_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, FetchError> {
        self.pause_between_requests().await;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage { status, final_url, body });
                    }

                    if retryable_status(status) && attempt < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if retryable_request_error(&err) && attempt < self.backoff.max_retries {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
