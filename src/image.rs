use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_once_cell::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{
    cache::{ArtifactCache, CacheError, Downloader},
    error::{Classify, ErrorKind},
    platform::{OperatingSystem, Platform},
};

/// The directory inside a VM workdir that is shared with the guest under the `ec1` tag.
pub const RUNTIME_FS_DIRECTORY: &str = "harpoon-runtime-fs-device";
/// The manifest file the guest init reads from the runtime filesystem.
pub const MANIFEST_FILE_NAME: &str = "container-manifest.json";
/// The name under which a VM's rootfs is linked into its workdir.
pub const ROOTFS_LINK_NAME: &str = "rootfs";

/// The runtime-relevant part of an OCI image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRuntimeConfig {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

/// The result of fetching an OCI image and flattening its layers into a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedImage {
    pub rootfs_path: PathBuf,
    pub config: ImageRuntimeConfig,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRootfs {
    pub diff_ids: Vec<String>,
}

/// The manifest written into the runtime filesystem for the guest init to consume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestManifest {
    pub rootfs: ManifestRootfs,
    pub config: ImageRuntimeConfig,
}

impl GuestManifest {
    pub fn from_converted(image: &ConvertedImage) -> Self {
        Self {
            rootfs: ManifestRootfs {
                diff_ids: image.diff_ids.clone(),
            },
            config: image.config.clone(),
        }
    }

    /// Read a manifest back from a VM workdir.
    pub async fn read_from(workdir: &Path) -> Result<Self, ImageError> {
        let bytes = tokio::fs::read(workdir.join(RUNTIME_FS_DIRECTORY).join(MANIFEST_FILE_NAME))
            .await
            .map_err(ImageError::IoError)?;
        serde_json::from_slice(&bytes).map_err(ImageError::SerdeError)
    }
}

/// Fetches an OCI image for a platform and converts it into a rootfs directory. Registry clients and layer
/// extraction live behind this capability; blob downloads go through the shared [ArtifactCache] so VMs pulling the
/// same layers download them once.
pub trait ImageFetchConverter: Send + Sync + 'static {
    type Downloader: Downloader;

    /// Resolve `image_ref`, pull its blobs through `artifacts` and flatten them into a rootfs under `cache_dir`.
    fn fetch_and_convert(
        &self,
        image_ref: &str,
        platform: Platform,
        artifacts: &ArtifactCache<Self::Downloader>,
        cache_dir: &Path,
    ) -> impl Future<Output = Result<ConvertedImage, ImageError>> + Send;
}

#[derive(Debug)]
pub enum ImageError {
    ImageNotFound(String),
    PlatformUnsupported(Platform),
    FetchFailed { image_ref: String, reason: String },
    ConversionFailed { image_ref: String, reason: String },
    CacheError(CacheError),
    SerdeError(serde_json::Error),
    IoError(std::io::Error),
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::CacheError(err) => Some(err),
            ImageError::SerdeError(err) => Some(err),
            ImageError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::ImageNotFound(image_ref) => write!(f, "The image \"{image_ref}\" could not be found"),
            ImageError::PlatformUnsupported(platform) => {
                write!(f, "Images cannot be assembled for the {platform} platform")
            }
            ImageError::FetchFailed { image_ref, reason } => {
                write!(f, "Fetching the image \"{image_ref}\" failed: {reason}")
            }
            ImageError::ConversionFailed { image_ref, reason } => {
                write!(f, "Converting the image \"{image_ref}\" into a rootfs failed: {reason}")
            }
            ImageError::CacheError(err) => write!(f, "Pulling an image blob failed: {err}"),
            ImageError::SerdeError(err) => write!(f, "Serializing the guest manifest failed: {err}"),
            ImageError::IoError(err) => write!(f, "A filesystem operation failed while assembling: {err}"),
        }
    }
}

impl Classify for ImageError {
    fn kind(&self) -> ErrorKind {
        match self {
            ImageError::ImageNotFound(_) | ImageError::FetchFailed { .. } => ErrorKind::ImageFetchFailed,
            ImageError::PlatformUnsupported(_) => ErrorKind::ConfigInvalid,
            ImageError::CacheError(err) => err.kind(),
            ImageError::ConversionFailed { .. } | ImageError::SerdeError(_) | ImageError::IoError(_) => {
                ErrorKind::ImageConvertFailed
            }
        }
    }
}

/// What [ImageAssembler::assemble] produced inside a VM workdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledImage {
    /// The converted rootfs directory, shared with the guest under the `rootfs` tag.
    pub rootfs_path: PathBuf,
    /// The runtime filesystem directory holding the manifest, shared under the `ec1` tag.
    pub runtime_fs_path: PathBuf,
    pub manifest: GuestManifest,
}

/// Turns an image reference into a rootfs and a [GuestManifest] inside a VM workdir. Conversions are shared
/// between VMs: for each (image, platform) pair the fetcher runs at most once, and later callers reuse its result.
pub struct ImageAssembler<F: ImageFetchConverter> {
    fetcher: F,
    artifacts: Arc<ArtifactCache<F::Downloader>>,
    cache_dir: PathBuf,
    conversions: Mutex<HashMap<(String, Platform), Arc<OnceCell<ConvertedImage>>>>,
}

impl<F: ImageFetchConverter> std::fmt::Debug for ImageAssembler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAssembler")
            .field("artifacts", &self.artifacts.root())
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl<F: ImageFetchConverter> ImageAssembler<F> {
    pub fn new(fetcher: F, artifacts: Arc<ArtifactCache<F::Downloader>>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            artifacts,
            cache_dir: cache_dir.into(),
            conversions: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn artifacts(&self) -> &Arc<ArtifactCache<F::Downloader>> {
        &self.artifacts
    }

    pub async fn assemble(
        &self,
        image_ref: &str,
        platform: Platform,
        workdir: &Path,
    ) -> Result<AssembledImage, ImageError> {
        if platform.os != OperatingSystem::Linux {
            return Err(ImageError::PlatformUnsupported(platform));
        }

        let converted = self.convert(image_ref, platform).await?;
        let manifest = GuestManifest::from_converted(&converted);

        let runtime_fs_path = workdir.join(RUNTIME_FS_DIRECTORY);
        tokio::fs::create_dir_all(&runtime_fs_path)
            .await
            .map_err(ImageError::IoError)?;
        let manifest_bytes = serde_json::to_vec(&manifest).map_err(ImageError::SerdeError)?;
        tokio::fs::write(runtime_fs_path.join(MANIFEST_FILE_NAME), manifest_bytes)
            .await
            .map_err(ImageError::IoError)?;

        let link = workdir.join(ROOTFS_LINK_NAME);
        if tokio::fs::symlink_metadata(&link).await.is_err() {
            tokio::fs::symlink(&converted.rootfs_path, &link)
                .await
                .map_err(ImageError::IoError)?;
        }

        tracing::debug!(
            image_ref,
            %platform,
            rootfs = %converted.rootfs_path.display(),
            layers = converted.diff_ids.len(),
            "assembled image"
        );

        Ok(AssembledImage {
            rootfs_path: converted.rootfs_path,
            runtime_fs_path,
            manifest,
        })
    }

    async fn convert(&self, image_ref: &str, platform: Platform) -> Result<ConvertedImage, ImageError> {
        let cell = self
            .conversions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry((image_ref.to_owned(), platform))
            .or_default()
            .clone();

        let converted = cell
            .get_or_try_init(async {
                tracing::info!(image_ref, %platform, "fetching and converting image");
                let converted = self
                    .fetcher
                    .fetch_and_convert(image_ref, platform, &self.artifacts, &self.cache_dir)
                    .await?;
                if !tokio::fs::try_exists(&converted.rootfs_path)
                    .await
                    .map_err(ImageError::IoError)?
                {
                    return Err(ImageError::ConversionFailed {
                        image_ref: image_ref.to_owned(),
                        reason: format!("the rootfs {} does not exist", converted.rootfs_path.display()),
                    });
                }
                Ok(converted)
            })
            .await?;

        Ok(converted.clone())
    }
}
