use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Classify, ErrorKind},
    platform::{Architecture, OperatingSystem, Platform},
    registry::{BinaryRegistry, BlobRole, RegistryError},
};

pub const KERNEL_FILE_NAME: &str = "vmlinux";
pub const INITRAMFS_FILE_NAME: &str = "initramfs.cpio.gz";
pub const EFI_VARIABLE_STORE_FILE_NAME: &str = "efi-variable-store";
pub const MACHINE_IDENTIFIER_FILE_NAME: &str = "MachineIdentifier";
pub const HARDWARE_MODEL_FILE_NAME: &str = "HardwareModel";
pub const AUXILIARY_STORAGE_FILE_NAME: &str = "AuxiliaryStorage";

const BASE_KERNEL_ARGUMENT: &str = "console=hvc0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How the hypervisor boots the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bootloader {
    Linux {
        kernel_path: PathBuf,
        initrd_path: Option<PathBuf>,
        cmdline: String,
    },
    Efi {
        variable_store_path: PathBuf,
        create_variable_store: bool,
    },
    MacOs {
        machine_identifier_path: PathBuf,
        hardware_model_path: PathBuf,
        auxiliary_storage_path: PathBuf,
    },
}

/// Assemble a kernel command line: `console=hvc0`, then the extra kernel arguments, then (if any) ` -- ` followed by
/// the arguments handed to the guest init.
pub fn kernel_cmdline(kernel_args: &[String], init_args: &[String]) -> String {
    let mut cmdline = String::from(BASE_KERNEL_ARGUMENT);
    for arg in kernel_args.iter().map(|arg| arg.trim()).filter(|arg| !arg.is_empty()) {
        cmdline.push(' ');
        cmdline.push_str(arg);
    }

    let init_args = init_args
        .iter()
        .map(|arg| arg.trim())
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>();
    if !init_args.is_empty() {
        cmdline.push_str(" --");
        for arg in init_args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
    }

    cmdline
}

#[derive(Debug)]
pub enum BootloaderError {
    PlatformUnsupported(Platform),
    MissingFile(PathBuf),
    RegistryError(RegistryError),
    CompressionFailed(std::io::Error),
    TaskFailed(tokio::task::JoinError),
    IoError(std::io::Error),
}

impl std::error::Error for BootloaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootloaderError::RegistryError(err) => Some(err),
            BootloaderError::CompressionFailed(err) => Some(err),
            BootloaderError::TaskFailed(err) => Some(err),
            BootloaderError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for BootloaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootloaderError::PlatformUnsupported(platform) => {
                write!(f, "This bootloader cannot boot the {platform} platform")
            }
            BootloaderError::MissingFile(path) => {
                write!(f, "The bootloader file {} does not exist", path.display())
            }
            BootloaderError::RegistryError(err) => write!(f, "Reading a boot blob failed: {err}"),
            BootloaderError::CompressionFailed(err) => write!(f, "Compressing the initramfs failed: {err}"),
            BootloaderError::TaskFailed(err) => write!(f, "A blocking bootloader task panicked: {err}"),
            BootloaderError::IoError(err) => write!(f, "Writing a boot file failed: {err}"),
        }
    }
}

impl Classify for BootloaderError {
    fn kind(&self) -> ErrorKind {
        match self {
            BootloaderError::RegistryError(err) => err.kind(),
            BootloaderError::CompressionFailed(_) | BootloaderError::TaskFailed(_) => ErrorKind::CacheCorrupt,
            _ => ErrorKind::ConfigInvalid,
        }
    }
}

/// Produces [Bootloader] descriptors, materializing the embedded kernel and initramfs into a VM workdir for Linux
/// guests.
#[derive(Debug, Clone)]
pub struct BootloaderBuilder {
    registry: Arc<BinaryRegistry>,
}

impl BootloaderBuilder {
    pub fn new(registry: Arc<BinaryRegistry>) -> Self {
        Self { registry }
    }

    /// Write `vmlinux` and `initramfs.cpio.gz` for the platform into the workdir and describe a Linux boot.
    pub async fn build_linux(
        &self,
        platform: Platform,
        workdir: &Path,
        kernel_args: &[String],
        init_args: &[String],
    ) -> Result<Bootloader, BootloaderError> {
        if platform.os != OperatingSystem::Linux {
            return Err(BootloaderError::PlatformUnsupported(platform));
        }

        let kernel_blob = self
            .registry
            .lookup(BlobRole::Kernel, platform)
            .map_err(BootloaderError::RegistryError)?;
        let initramfs_blob = self
            .registry
            .lookup(BlobRole::Initramfs, platform)
            .map_err(BootloaderError::RegistryError)?;

        let (kernel, initramfs) = tokio::try_join!(
            self.registry.get_decompressed(kernel_blob.checksum()),
            self.registry.get_decompressed(initramfs_blob.checksum()),
        )
        .map_err(BootloaderError::RegistryError)?;
        let initramfs = ensure_gzip(initramfs).await?;

        let kernel_path = workdir.join(KERNEL_FILE_NAME);
        let initrd_path = workdir.join(INITRAMFS_FILE_NAME);
        tokio::try_join!(
            tokio::fs::write(&kernel_path, &kernel),
            tokio::fs::write(&initrd_path, &initramfs),
        )
        .map_err(BootloaderError::IoError)?;

        let cmdline = kernel_cmdline(kernel_args, init_args);
        tracing::debug!(%platform, cmdline, "linux bootloader ready");

        Ok(Bootloader::Linux {
            kernel_path,
            initrd_path: Some(initrd_path),
            cmdline,
        })
    }

    /// Describe a macOS boot from the three platform files already present in the workdir. Only arm64 hosts can
    /// boot macOS guests.
    pub async fn build_macos(&self, platform: Platform, workdir: &Path) -> Result<Bootloader, BootloaderError> {
        if platform.arch != Architecture::Arm64 {
            return Err(BootloaderError::PlatformUnsupported(platform));
        }

        let machine_identifier_path = workdir.join(MACHINE_IDENTIFIER_FILE_NAME);
        let hardware_model_path = workdir.join(HARDWARE_MODEL_FILE_NAME);
        let auxiliary_storage_path = workdir.join(AUXILIARY_STORAGE_FILE_NAME);

        for path in [&machine_identifier_path, &hardware_model_path, &auxiliary_storage_path] {
            if !tokio::fs::try_exists(path).await.map_err(BootloaderError::IoError)? {
                return Err(BootloaderError::MissingFile(path.clone()));
            }
        }

        Ok(Bootloader::MacOs {
            machine_identifier_path,
            hardware_model_path,
            auxiliary_storage_path,
        })
    }

    /// Describe an EFI boot with its variable store in the workdir. When `create` is false, the store must exist.
    pub async fn build_efi(&self, workdir: &Path, create: bool) -> Result<Bootloader, BootloaderError> {
        let variable_store_path = workdir.join(EFI_VARIABLE_STORE_FILE_NAME);
        if !create && !tokio::fs::try_exists(&variable_store_path).await.map_err(BootloaderError::IoError)? {
            return Err(BootloaderError::MissingFile(variable_store_path));
        }

        Ok(Bootloader::Efi {
            variable_store_path,
            create_variable_store: create,
        })
    }
}

async fn ensure_gzip(data: Bytes) -> Result<Bytes, BootloaderError> {
    if data.starts_with(&GZIP_MAGIC) {
        return Ok(data);
    }

    tokio::task::spawn_blocking(move || {
        let mut encoder = flate2::write::GzEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::fast());
        encoder.write_all(&data)?;
        encoder.finish().map(Bytes::from)
    })
    .await
    .map_err(BootloaderError::TaskFailed)?
    .map_err(BootloaderError::CompressionFailed)
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use assert_matches::assert_matches;

    use super::{Bootloader, BootloaderBuilder, BootloaderError, kernel_cmdline};
    use crate::{
        platform::{Architecture, OperatingSystem, Platform},
        registry::{BinaryRegistry, BlobFormat, BlobRole, Compression, EmbeddedBlob},
    };

    fn tmp_dir() -> PathBuf {
        let path = std::env::temp_dir().join(format!("harpoon-boot-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn registry() -> Arc<BinaryRegistry> {
        let registry = BinaryRegistry::new();
        let mut kernel = vec![7u8; 256];
        kernel[56..60].copy_from_slice(b"ARM\x64");
        registry
            .register_for(
                BlobRole::Kernel,
                Platform::LINUX_ARM64,
                EmbeddedBlob::new(zstd::stream::encode_all(kernel.as_slice(), 1).unwrap(), Compression::Zstd, BlobFormat::Arm64Kernel),
            )
            .unwrap();
        registry
            .register_for(
                BlobRole::Initramfs,
                Platform::LINUX_ARM64,
                EmbeddedBlob::new(b"070701 cpio archive".to_vec(), Compression::None, BlobFormat::Initramfs),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn cmdline_composition() {
        assert_eq!(kernel_cmdline(&[], &[]), "console=hvc0");
        assert_eq!(
            kernel_cmdline(&["quiet".into(), " ".into()], &["--debug".into()]),
            "console=hvc0 quiet -- --debug"
        );
    }

    #[tokio::test]
    async fn linux_bootloader_writes_files() {
        let workdir = tmp_dir();
        let bootloader = BootloaderBuilder::new(registry())
            .build_linux(Platform::LINUX_ARM64, &workdir, &["quiet".into()], &[])
            .await
            .unwrap();

        assert_matches!(&bootloader, Bootloader::Linux { cmdline, .. } if cmdline == "console=hvc0 quiet");
        let kernel = std::fs::read(workdir.join("vmlinux")).unwrap();
        assert_eq!(&kernel[56..60], b"ARM\x64");
        let initramfs = std::fs::read(workdir.join("initramfs.cpio.gz")).unwrap();
        assert_eq!(&initramfs[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn linux_bootloader_requires_registered_blobs() {
        assert_matches!(
            BootloaderBuilder::new(registry())
                .build_linux(Platform::LINUX_AMD64, &tmp_dir(), &[], &[])
                .await,
            Err(BootloaderError::RegistryError(_))
        );
    }

    #[tokio::test]
    async fn macos_bootloader_is_arm64_only() {
        let builder = BootloaderBuilder::new(registry());
        let workdir = tmp_dir();
        let amd64 = Platform::new(OperatingSystem::Darwin, Architecture::Amd64);
        assert_matches!(
            builder.build_macos(amd64, &workdir).await,
            Err(BootloaderError::PlatformUnsupported(_))
        );

        let arm64 = Platform::new(OperatingSystem::Darwin, Architecture::Arm64);
        assert_matches!(
            builder.build_macos(arm64, &workdir).await,
            Err(BootloaderError::MissingFile(_))
        );

        for name in ["MachineIdentifier", "HardwareModel", "AuxiliaryStorage"] {
            std::fs::write(workdir.join(name), b"").unwrap();
        }
        assert_matches!(builder.build_macos(arm64, &workdir).await, Ok(Bootloader::MacOs { .. }));
    }

    #[tokio::test]
    async fn efi_bootloader_checks_existing_store() {
        let builder = BootloaderBuilder::new(registry());
        let workdir = tmp_dir();
        assert_matches!(builder.build_efi(&workdir, false).await, Err(BootloaderError::MissingFile(_)));
        assert_matches!(
            builder.build_efi(&workdir, true).await,
            Ok(Bootloader::Efi { create_variable_store: true, .. })
        );
    }
}
