//! A content-addressed store of the compressed binaries shipped with the orchestrator (guest kernels, initramfs
//! images and the guest init), decompressed lazily on first use.
//!
//! There is no global registry: the binary's entry point builds one [BinaryRegistry], registers its blobs once
//! through [BinaryRegistry::register_for], and hands an [Arc] of it to whatever needs it. Tests do the same with
//! in-memory blobs.

use std::{
    collections::HashMap,
    io::Read,
    sync::{Arc, Mutex, RwLock},
};

use async_once_cell::OnceCell;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::{
    error::{Classify, ErrorKind},
    platform::Platform,
};

/// The offset of the ARM64 Linux image magic inside the kernel header.
const ARM64_KERNEL_MAGIC_OFFSET: usize = 56;
const ARM64_KERNEL_MAGIC: &[u8; 4] = b"ARM\x64";
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const BZIMAGE_MAGIC_OFFSET: usize = 0x202;
const BZIMAGE_MAGIC: &[u8; 4] = b"HdrS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Xz,
    Gzip,
    Zstd,
    None,
}

impl Compression {
    /// Guess the compression from a file name's extension, defaulting to [Compression::None].
    pub fn from_file_name(name: &str) -> Compression {
        if name.ends_with(".xz") {
            Compression::Xz
        } else if name.ends_with(".gz") || name.ends_with(".tgz") {
            Compression::Gzip
        } else if name.ends_with(".zst") || name.ends_with(".zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// The extension this compression appends to a file name, if any.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::Xz => Some(".xz"),
            Compression::Gzip => Some(".gz"),
            Compression::Zstd => Some(".zst"),
            Compression::None => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Xz => write!(f, "xz"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
            Compression::None => write!(f, "none"),
        }
    }
}

/// Decompress a whole buffer with the given [Compression]. This is blocking, CPU-bound work.
pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut output = Vec::with_capacity(data.len() * 2);
    match compression {
        Compression::Xz => {
            xz2::read::XzDecoder::new(data).read_to_end(&mut output)?;
        }
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut output)?;
        }
        Compression::Zstd => {
            output = zstd::stream::decode_all(data)?;
        }
        Compression::None => output.extend_from_slice(data),
    }
    Ok(output)
}

/// Lowercase hex SHA-256 of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// What the decompressed bytes of a blob are expected to be. Formats with a known magic are checked on
/// decompression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobFormat {
    Arm64Kernel,
    /// An x86-64 kernel, either an ELF `vmlinux` or a bzImage.
    Kernel,
    Initramfs,
    GuestInit,
    Opaque,
}

/// The purpose a blob serves when building a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobRole {
    Kernel,
    Initramfs,
    GuestInit,
}

impl std::fmt::Display for BlobRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobRole::Kernel => write!(f, "kernel"),
            BlobRole::Initramfs => write!(f, "initramfs"),
            BlobRole::GuestInit => write!(f, "guest init"),
        }
    }
}

/// An immutable compressed binary identified by the SHA-256 of its compressed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedBlob {
    checksum: String,
    compressed: Bytes,
    compression: Compression,
    format: BlobFormat,
}

impl EmbeddedBlob {
    /// Create a blob whose checksum is computed from the given compressed bytes.
    pub fn new(compressed: impl Into<Bytes>, compression: Compression, format: BlobFormat) -> Self {
        let compressed = compressed.into();
        Self {
            checksum: sha256_hex(&compressed),
            compressed,
            compression,
            format,
        }
    }

    /// Create a blob with an advertised checksum, which is verified upon registration.
    pub fn with_checksum(
        checksum: impl Into<String>,
        compressed: impl Into<Bytes>,
        compression: Compression,
        format: BlobFormat,
    ) -> Self {
        Self {
            checksum: checksum.into().to_ascii_lowercase(),
            compressed: compressed.into(),
            compression,
            format,
        }
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn compressed(&self) -> &Bytes {
        &self.compressed
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn format(&self) -> BlobFormat {
        self.format
    }
}

#[derive(Debug)]
pub enum RegistryError {
    UnknownChecksum(String),
    ChecksumMismatch { advertised: String, actual: String },
    ConflictingRegistration(String),
    NoBlobForRole { role: BlobRole, platform: Platform },
    DecompressFailed { checksum: String, error: std::io::Error },
    DecompressTaskFailed(tokio::task::JoinError),
    InvalidKernel(String),
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::DecompressFailed { error, .. } => Some(error),
            RegistryError::DecompressTaskFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UnknownChecksum(checksum) => write!(f, "No blob is registered under checksum {checksum}"),
            RegistryError::ChecksumMismatch { advertised, actual } => write!(
                f,
                "The blob advertised checksum {advertised}, but its bytes hash to {actual}"
            ),
            RegistryError::ConflictingRegistration(checksum) => {
                write!(f, "A different blob was already registered under checksum {checksum}")
            }
            RegistryError::NoBlobForRole { role, platform } => {
                write!(f, "No {role} blob is registered for the {platform} platform")
            }
            RegistryError::DecompressFailed { checksum, .. } => {
                write!(f, "Decompressing the blob with checksum {checksum} failed")
            }
            RegistryError::DecompressTaskFailed(err) => write!(f, "The decompression task panicked: {err}"),
            RegistryError::InvalidKernel(checksum) => write!(
                f,
                "The blob with checksum {checksum} does not carry the ARM64 kernel magic at offset 56"
            ),
        }
    }
}

impl Classify for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::UnknownChecksum(_) | RegistryError::NoBlobForRole { .. } => ErrorKind::ConfigInvalid,
            _ => ErrorKind::CacheCorrupt,
        }
    }
}

/// The registry itself: blobs by checksum, decompressed bytes by checksum, and a role index by platform.
#[derive(Debug, Default)]
pub struct BinaryRegistry {
    blobs: RwLock<HashMap<String, Arc<EmbeddedBlob>>>,
    roles: RwLock<HashMap<(BlobRole, Platform), String>>,
    decompressed: Mutex<HashMap<String, Arc<OnceCell<Bytes>>>>,
}

impl BinaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blob. Registering the same bytes twice is a no-op, whereas a checksum that does not match the
    /// bytes, or different bytes under an already-registered checksum, are rejected.
    pub fn register(&self, blob: EmbeddedBlob) -> Result<(), RegistryError> {
        let actual = sha256_hex(&blob.compressed);
        if actual != blob.checksum {
            return Err(RegistryError::ChecksumMismatch {
                advertised: blob.checksum,
                actual,
            });
        }

        let mut blobs = self.blobs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = blobs.get(&blob.checksum) {
            if existing.compressed != blob.compressed || existing.compression != blob.compression {
                return Err(RegistryError::ConflictingRegistration(blob.checksum));
            }
            return Ok(());
        }

        tracing::debug!(
            checksum = %blob.checksum,
            compression = %blob.compression,
            size = blob.compressed.len(),
            "registered embedded blob"
        );
        blobs.insert(blob.checksum.clone(), Arc::new(blob));
        Ok(())
    }

    /// Register a blob and make it the one used for the given role on the given platform.
    pub fn register_for(&self, role: BlobRole, platform: Platform, blob: EmbeddedBlob) -> Result<(), RegistryError> {
        let checksum = blob.checksum.clone();
        self.register(blob)?;
        self.assign(role, platform, checksum)
    }

    /// Point a role on a platform at an already-registered checksum.
    pub fn assign(&self, role: BlobRole, platform: Platform, checksum: impl Into<String>) -> Result<(), RegistryError> {
        let checksum = checksum.into();
        self.get_raw(&checksum)?;
        self.roles
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((role, platform), checksum);
        Ok(())
    }

    /// Find the blob serving the given role on the given platform.
    pub fn lookup(&self, role: BlobRole, platform: Platform) -> Result<Arc<EmbeddedBlob>, RegistryError> {
        let checksum = self
            .roles
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(role, platform))
            .cloned()
            .ok_or(RegistryError::NoBlobForRole { role, platform })?;
        self.get_raw(&checksum)
    }

    /// Get the registered blob itself, with its compressed bytes.
    pub fn get_raw(&self, checksum: &str) -> Result<Arc<EmbeddedBlob>, RegistryError> {
        self.blobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(checksum)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownChecksum(checksum.to_owned()))
    }

    /// Get the decompressed bytes of a blob. The first call decompresses on a blocking thread and validates the
    /// format magic; every later (or concurrent) call shares that result.
    pub async fn get_decompressed(&self, checksum: &str) -> Result<Bytes, RegistryError> {
        let blob = self.get_raw(checksum)?;
        let cell = self
            .decompressed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(blob.checksum.clone())
            .or_default()
            .clone();

        let bytes = cell
            .get_or_try_init(async {
                let compression = blob.compression;
                let compressed = blob.compressed.clone();
                let decompressed = tokio::task::spawn_blocking(move || decompress(compression, &compressed))
                    .await
                    .map_err(RegistryError::DecompressTaskFailed)?
                    .map_err(|error| RegistryError::DecompressFailed {
                        checksum: blob.checksum.clone(),
                        error,
                    })?;

                validate_magic(&blob, &decompressed)?;
                tracing::debug!(
                    checksum = %blob.checksum,
                    size = decompressed.len(),
                    "decompressed embedded blob"
                );
                Ok::<_, RegistryError>(Bytes::from(decompressed))
            })
            .await?;

        Ok(bytes.clone())
    }
}

fn has_magic(bytes: &[u8], offset: usize, magic: &[u8]) -> bool {
    bytes.get(offset..offset + magic.len()) == Some(magic)
}

fn validate_magic(blob: &EmbeddedBlob, decompressed: &[u8]) -> Result<(), RegistryError> {
    let valid = match blob.format {
        BlobFormat::Arm64Kernel => has_magic(decompressed, ARM64_KERNEL_MAGIC_OFFSET, ARM64_KERNEL_MAGIC),
        BlobFormat::Kernel => {
            has_magic(decompressed, 0, ELF_MAGIC) || has_magic(decompressed, BZIMAGE_MAGIC_OFFSET, BZIMAGE_MAGIC)
        }
        BlobFormat::Initramfs | BlobFormat::GuestInit | BlobFormat::Opaque => true,
    };
    if !valid {
        return Err(RegistryError::InvalidKernel(blob.checksum.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::{BinaryRegistry, BlobFormat, BlobRole, Compression, EmbeddedBlob, RegistryError, sha256_hex};
    use crate::platform::Platform;

    fn arm64_kernel() -> Vec<u8> {
        let mut kernel = vec![0u8; 128];
        kernel[56..60].copy_from_slice(b"ARM\x64");
        kernel
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn decompresses_every_supported_compression() {
        let registry = BinaryRegistry::new();
        let payload = b"guest init binary".repeat(64);

        for (compression, compressed) in [
            (Compression::Gzip, gzip(&payload)),
            (Compression::Xz, xz(&payload)),
            (Compression::Zstd, zstd::stream::encode_all(payload.as_slice(), 3).unwrap()),
            (Compression::None, payload.clone()),
        ] {
            let blob = EmbeddedBlob::new(compressed, compression, BlobFormat::GuestInit);
            let checksum = blob.checksum().to_owned();
            registry.register(blob).unwrap();
            assert_eq!(registry.get_decompressed(&checksum).await.unwrap().as_ref(), payload.as_slice());
        }
    }

    #[tokio::test]
    async fn memoizes_decompressed_bytes() {
        let registry = BinaryRegistry::new();
        let blob = EmbeddedBlob::new(gzip(&arm64_kernel()), Compression::Gzip, BlobFormat::Arm64Kernel);
        let checksum = blob.checksum().to_owned();
        registry.register(blob).unwrap();

        let first = registry.get_decompressed(&checksum).await.unwrap();
        let second = registry.get_decompressed(&checksum).await.unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[tokio::test]
    async fn rejects_kernel_without_magic() {
        let registry = BinaryRegistry::new();
        let blob = EmbeddedBlob::new(gzip(&[0u8; 128]), Compression::Gzip, BlobFormat::Arm64Kernel);
        let checksum = blob.checksum().to_owned();
        registry.register(blob).unwrap();
        assert_matches!(
            registry.get_decompressed(&checksum).await,
            Err(RegistryError::InvalidKernel(_))
        );
    }

    #[tokio::test]
    async fn x86_kernels_are_elf_or_bzimage() {
        let registry = BinaryRegistry::new();
        let mut bzimage = vec![0u8; 0x300];
        bzimage[0x202..0x206].copy_from_slice(b"HdrS");
        let mut elf = b"\x7fELF".to_vec();
        elf.resize(64, 0);

        for (kernel, valid) in [(bzimage, true), (elf, true), (arm64_kernel(), false)] {
            let blob = EmbeddedBlob::new(gzip(&kernel), Compression::Gzip, BlobFormat::Kernel);
            let checksum = blob.checksum().to_owned();
            registry.register(blob).unwrap();
            let result = registry.get_decompressed(&checksum).await;
            if valid {
                assert_eq!(result.unwrap().as_ref(), kernel.as_slice());
            } else {
                assert_matches!(result, Err(RegistryError::InvalidKernel(_)));
            }
        }
    }

    #[tokio::test]
    async fn reports_unknown_checksum_and_broken_streams() {
        let registry = BinaryRegistry::new();
        assert_matches!(
            registry.get_decompressed("deadbeef").await,
            Err(RegistryError::UnknownChecksum(_))
        );

        let blob = EmbeddedBlob::new(b"definitely not xz".to_vec(), Compression::Xz, BlobFormat::Opaque);
        let checksum = blob.checksum().to_owned();
        registry.register(blob).unwrap();
        assert_matches!(
            registry.get_decompressed(&checksum).await,
            Err(RegistryError::DecompressFailed { .. })
        );
    }

    #[test]
    fn registration_is_idempotent_and_verified() {
        let registry = BinaryRegistry::new();
        let blob = EmbeddedBlob::new(b"abc".to_vec(), Compression::None, BlobFormat::Opaque);
        registry.register(blob.clone()).unwrap();
        registry.register(blob).unwrap();

        let forged = EmbeddedBlob::with_checksum(sha256_hex(b"abc"), b"xyz".to_vec(), Compression::None, BlobFormat::Opaque);
        assert_matches!(registry.register(forged), Err(RegistryError::ChecksumMismatch { .. }));
    }

    #[test]
    fn lookup_by_role() {
        let registry = BinaryRegistry::new();
        assert_matches!(
            registry.lookup(BlobRole::Kernel, Platform::LINUX_ARM64),
            Err(RegistryError::NoBlobForRole { .. })
        );

        let blob = EmbeddedBlob::new(gzip(&arm64_kernel()), Compression::Gzip, BlobFormat::Arm64Kernel);
        let checksum = blob.checksum().to_owned();
        registry
            .register_for(BlobRole::Kernel, Platform::LINUX_ARM64, blob)
            .unwrap();
        assert_eq!(
            registry.lookup(BlobRole::Kernel, Platform::LINUX_ARM64).unwrap().checksum(),
            checksum
        );
        assert!(registry.lookup(BlobRole::Kernel, Platform::LINUX_AMD64).is_err());
    }

    #[test]
    fn compression_from_file_name() {
        assert_eq!(Compression::from_file_name("vmlinux.xz"), Compression::Xz);
        assert_eq!(Compression::from_file_name("initramfs.cpio.gz"), Compression::Gzip);
        assert_eq!(Compression::from_file_name("rootfs.tar.zst"), Compression::Zstd);
        assert_eq!(Compression::from_file_name("Image"), Compression::None);
    }
}
