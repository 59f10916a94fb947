//! Remote blob capability used to sync and publish the database file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::http::{classify_reqwest_error, classify_status, BackoffPolicy};

/// Well-known remote path of a database file: `latest/<stem>.db`.
pub fn database_blob_path(database_file: &Path) -> String {
    let stem = database_file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "database".to_string());
    format!("latest/{stem}.db")
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bytes stored at `path`, or `None` when nothing is there.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError>;

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;
}

/// Remote object-store settings, read once by the caller and passed in.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub bucket: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            token: None,
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn object_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket.trim_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Directory-backed blob store (a mounted bucket, a shared drive, tests).
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let target = self.resolve(path);
        match fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(BlobError::Io(
                anyhow::Error::new(err).context(format!("reading blob {}", target.display())),
            )),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        write_atomically(&self.resolve(path), bytes).await?;
        Ok(())
    }
}

/// Write `bytes` to `target` through a temp file in the same directory and a rename.
pub async fn write_atomically(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}

/// Object store reached over plain HTTP: `GET`/`PUT {endpoint}/{bucket}/{path}`
/// with an optional bearer token.
#[derive(Debug)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl HttpBlobStore {
    pub fn new(config: RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building blob store client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<Option<reqwest::Response>, BlobError> {
        let mut attempt = 0;
        loop {
            let mut request = self.request(method.clone(), url);
            if let Some(body) = body {
                request = request.body(body.to_vec());
            }

            let (disposition, err) = match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(Some(resp)),
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp) => (
                    classify_status(resp.status()),
                    BlobError::HttpStatus {
                        status: resp.status().as_u16(),
                        url: url.to_string(),
                    },
                ),
                Err(err) => (classify_reqwest_error(&err), BlobError::Transport(err)),
            };
            let Some(delay) = self.config.backoff.retry_after(disposition, attempt) else {
                return Err(err);
            };
            warn!(%url, error = %err, attempt, "retrying blob request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let url = self.config.object_url(path);
        let span = info_span!("blob_get", %url);
        async {
            let Some(resp) = self.send_with_retry(reqwest::Method::GET, &url, None).await? else {
                debug!("blob absent");
                return Ok(None);
            };
            let bytes = resp.bytes().await?.to_vec();
            debug!(bytes = bytes.len(), "blob fetched");
            Ok::<_, BlobError>(Some(bytes))
        }
        .instrument(span)
        .await
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let url = self.config.object_url(path);
        let checksum = hex::encode(Sha256::digest(bytes));
        let span = info_span!("blob_put", %url, bytes = bytes.len(), sha256 = %checksum);
        async {
            match self.send_with_retry(reqwest::Method::PUT, &url, Some(bytes)).await? {
                Some(_) => Ok::<_, BlobError>(()),
                None => Err(BlobError::HttpStatus {
                    status: StatusCode::NOT_FOUND.as_u16(),
                    url: url.clone(),
                }),
            }
        }
        .instrument(span)
        .await
    }
}
