//! A per-user, URL-keyed download cache.
//!
//! Every URL maps to `<cache>/<sha256-of-url>/<basename>`. Derived artifacts (currently decompressed copies) live as
//! siblings of the original download. Concurrent callers asking for the same key share a single fetch.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_once_cell::OnceCell;
use tokio::io::AsyncReadExt;

use crate::{
    error::{Classify, ErrorKind},
    registry::{Compression, decompress, sha256_hex},
};

/// Performs the network part of an [ArtifactCache] fetch: stream the resource at `url` into `destination`.
pub trait Downloader: Send + Sync + 'static {
    fn download(&self, url: &str, destination: &Path) -> impl Future<Output = Result<u64, CacheError>> + Send;
}

#[derive(Debug)]
pub enum CacheError {
    InvalidUrl(String),
    DownloadFailed { url: String, reason: String },
    ChecksumMismatch { url: String, expected: String, actual: String },
    DecompressFailed { path: PathBuf, error: std::io::Error },
    TaskFailed(tokio::task::JoinError),
    IoError(std::io::Error),
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::DecompressFailed { error, .. } => Some(error),
            CacheError::TaskFailed(err) => Some(err),
            CacheError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::InvalidUrl(url) => write!(f, "The URL \"{url}\" has no file name to cache under"),
            CacheError::DownloadFailed { url, reason } => write!(f, "Downloading \"{url}\" failed: {reason}"),
            CacheError::ChecksumMismatch { url, expected, actual } => write!(
                f,
                "The artifact downloaded from \"{url}\" hashes to {actual}, but {expected} was expected"
            ),
            CacheError::DecompressFailed { path, .. } => {
                write!(f, "Decompressing the cached artifact at {} failed", path.display())
            }
            CacheError::TaskFailed(err) => write!(f, "A blocking cache task panicked: {err}"),
            CacheError::IoError(err) => write!(f, "A filesystem operation within the cache failed: {err}"),
        }
    }
}

impl Classify for CacheError {
    fn kind(&self) -> ErrorKind {
        match self {
            CacheError::InvalidUrl(_) => ErrorKind::ConfigInvalid,
            CacheError::DownloadFailed { .. } | CacheError::IoError(_) => ErrorKind::ImageFetchFailed,
            CacheError::ChecksumMismatch { .. } | CacheError::DecompressFailed { .. } | CacheError::TaskFailed(_) => {
                ErrorKind::CacheCorrupt
            }
        }
    }
}

/// The directory name a URL is cached under.
pub fn cache_key(url: &str) -> String {
    sha256_hex(url.as_bytes())
}

fn file_name_of(url: &str) -> Result<String, CacheError> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => Ok(name.to_owned()),
        _ => Err(CacheError::InvalidUrl(url.to_owned())),
    }
}

#[derive(Debug)]
pub struct ArtifactCache<D: Downloader> {
    root: PathBuf,
    downloader: D,
    inflight: Mutex<HashMap<PathBuf, Arc<OnceCell<PathBuf>>>>,
}

impl<D: Downloader> ArtifactCache<D> {
    pub fn new(root: impl Into<PathBuf>, downloader: D) -> Self {
        Self {
            root: root.into(),
            downloader,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloader(&self) -> &D {
        &self.downloader
    }

    /// Where `url` is (or will be) cached.
    pub fn path_for(&self, url: &str) -> Result<PathBuf, CacheError> {
        Ok(self.root.join(cache_key(url)).join(file_name_of(url)?))
    }

    /// Return the cached copy of `url`, downloading it first if it is not cached yet. When a checksum is given, a
    /// fresh download is verified against it and removed on mismatch.
    pub async fn fetch(&self, url: &str, checksum: Option<&str>) -> Result<PathBuf, CacheError> {
        let target = self.path_for(url)?;
        let cell = self.cell_for(&target);

        let path = cell
            .get_or_try_init(async {
                if tokio::fs::try_exists(&target).await.map_err(CacheError::IoError)? {
                    tracing::debug!(url, path = %target.display(), "artifact cache hit");
                    return Ok(target.clone());
                }

                let directory = target.parent().unwrap_or(&self.root);
                tokio::fs::create_dir_all(directory)
                    .await
                    .map_err(CacheError::IoError)?;
                let partial = partial_path(&target);

                tracing::info!(url, path = %target.display(), "downloading artifact");
                let result = self.downloader.download(url, &partial).await;
                let size = match result {
                    Ok(size) => size,
                    Err(err) => {
                        let _ = tokio::fs::remove_file(&partial).await;
                        return Err(err);
                    }
                };

                if let Some(expected) = checksum {
                    let actual = hash_file(&partial).await?;
                    if !actual.eq_ignore_ascii_case(expected) {
                        let _ = tokio::fs::remove_file(&partial).await;
                        return Err(CacheError::ChecksumMismatch {
                            url: url.to_owned(),
                            expected: expected.to_owned(),
                            actual,
                        });
                    }
                }

                tokio::fs::rename(&partial, &target)
                    .await
                    .map_err(CacheError::IoError)?;
                tracing::debug!(url, size, "artifact cached");
                Ok(target.clone())
            })
            .await?;

        Ok(path.clone())
    }

    /// Fetch `url` and return a decompressed copy stored next to it, producing that copy at most once.
    pub async fn fetch_decompressed(&self, url: &str, compression: Compression) -> Result<PathBuf, CacheError> {
        let original = self.fetch(url, None).await?;
        if compression == Compression::None {
            return Ok(original);
        }

        let target = derived_path(&original, compression);
        let cell = self.cell_for(&target);
        let path = cell
            .get_or_try_init(async {
                if tokio::fs::try_exists(&target).await.map_err(CacheError::IoError)? {
                    return Ok(target.clone());
                }

                let partial = partial_path(&target);
                let source = original.clone();
                let destination = partial.clone();
                tokio::task::spawn_blocking(move || {
                    let data = std::fs::read(&source).map_err(CacheError::IoError)?;
                    let decompressed = decompress(compression, &data).map_err(|error| CacheError::DecompressFailed {
                        path: source.clone(),
                        error,
                    })?;
                    std::fs::write(&destination, decompressed).map_err(CacheError::IoError)
                })
                .await
                .map_err(CacheError::TaskFailed)??;

                tokio::fs::rename(&partial, &target)
                    .await
                    .map_err(CacheError::IoError)?;
                Ok(target.clone())
            })
            .await?;

        Ok(path.clone())
    }

    fn cell_for(&self, target: &Path) -> Arc<OnceCell<PathBuf>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(target.to_owned())
            .or_default()
            .clone()
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", xid::new()));
    target.with_file_name(name)
}

fn derived_path(original: &Path, compression: Compression) -> PathBuf {
    let name = original.file_name().unwrap_or_default().to_string_lossy();
    let stripped = compression
        .extension()
        .and_then(|extension| name.strip_suffix(extension))
        .filter(|stripped| !stripped.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{name}.decompressed"));
    original.with_file_name(stripped)
}

async fn hash_file(path: &Path) -> Result<String, CacheError> {
    use sha2::{Digest, Sha256};

    let mut file = tokio::fs::File::open(path).await.map_err(CacheError::IoError)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await.map_err(CacheError::IoError)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A [Downloader] fetching over HTTP(S) with [reqwest].
#[cfg(feature = "http-downloader")]
#[cfg_attr(docsrs, doc(cfg(feature = "http-downloader")))]
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

#[cfg(feature = "http-downloader")]
impl HttpDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http-downloader")]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, destination: &Path) -> Result<u64, CacheError> {
        use tokio::io::AsyncWriteExt;

        let failed = |reason: String| CacheError::DownloadFailed {
            url: url.to_owned(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| failed(err.to_string()))?;

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(CacheError::IoError)?;
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|err| failed(err.to_string()))? {
            file.write_all(&chunk).await.map_err(CacheError::IoError)?;
            size += chunk.len() as u64;
        }
        file.sync_all().await.map_err(CacheError::IoError)?;
        Ok(size)
    }
}
