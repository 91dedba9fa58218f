use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use harpoon::{
    cache::{ArtifactCache, HttpDownloader},
    config::{ImageConfig, RuntimeConfig},
    hypervisor::vfkit::VfkitHypervisor,
    image::{ConvertedImage, ImageError, ImageFetchConverter, ImageRuntimeConfig},
    network::NetworkConfig,
    platform::{Architecture, Platform},
    process_spawner::DirectProcessSpawner,
    registry::{BinaryRegistry, BlobFormat, BlobRole, Compression, EmbeddedBlob},
    vm::{StopMode, Vm, VmEnvironment, VmState},
};
use test_framework::{MIB, get_tmp_path, init_tracing};
use tokio_util::sync::CancellationToken;


fn get_test_path(path: &str) -> PathBuf {
    let testdata_path = match std::env::var("HARPOON_TESTDATA_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => PathBuf::from("/opt/testdata"),
    };
    testdata_path.join(path)
}

/// Serves images that were converted ahead of time into `<testdata>/images/<name>`.
struct PreconvertedFetcher;

impl ImageFetchConverter for PreconvertedFetcher {
    type Downloader = HttpDownloader;

    async fn fetch_and_convert(
        &self,
        image_ref: &str,
        _platform: Platform,
        _artifacts: &ArtifactCache<HttpDownloader>,
        _cache_dir: &Path,
    ) -> Result<ConvertedImage, ImageError> {
        let name = image_ref.rsplit('/').next().unwrap_or(image_ref).replace(':', "_");
        let rootfs_path = get_test_path("images").join(name);
        if !rootfs_path.exists() {
            return Err(ImageError::ImageNotFound(image_ref.to_owned()));
        }
        Ok(ConvertedImage {
            rootfs_path,
            config: ImageRuntimeConfig::default(),
            diff_ids: Vec::new(),
        })
    }
}

fn get_real_registry(platform: Platform) -> Arc<BinaryRegistry> {
    let kernel_format = match platform.arch {
        Architecture::Arm64 => BlobFormat::Arm64Kernel,
        Architecture::Amd64 => BlobFormat::Kernel,
    };
    let registry = BinaryRegistry::new();
    for (role, file_name, format) in [
        (BlobRole::Kernel, "vmlinux.xz", kernel_format),
        (BlobRole::Initramfs, "initramfs.cpio.gz", BlobFormat::Initramfs),
    ] {
        let bytes = std::fs::read(get_test_path(file_name)).unwrap();
        registry
            .register_for(
                role,
                platform,
                EmbeddedBlob::new(bytes, Compression::from_file_name(file_name), format),
            )
            .unwrap();
    }
    Arc::new(registry)
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "needs vfkit, a guest kernel and pre-converted images in the test data directory"]
async fn vfkit_vm_runs_bun() {
    init_tracing();
    let platform = Platform::host_linux();
    let root = get_tmp_path();
    let env = VmEnvironment::new(
        VfkitHypervisor::new(get_test_path("vfkit"), DirectProcessSpawner),
        PreconvertedFetcher,
        HttpDownloader::default(),
        get_real_registry(platform),
        RuntimeConfig::new(root.join("cache")).vm_root_dir(root.join("vms")),
    )
    .network_config(NetworkConfig::new());

    let vm = Vm::create(
        &env,
        ImageConfig::new("docker.io/oven/bun:latest", platform, 1024 * MIB, 2).no_forwards(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    vm.start(Duration::from_secs(30), &CancellationToken::new()).await.unwrap();
    vm.wait_ready_to_exec(Duration::from_secs(30), &CancellationToken::new()).await.unwrap();

    let output = vm.exec("bun --version", &CancellationToken::new()).await.unwrap();
    assert!(output.success(), "{}", output.stderr_lossy());
    assert!(!output.stdout.is_empty());

    vm.stop(StopMode::Graceful, &CancellationToken::new()).await.unwrap();
    assert_eq!(vm.state(), VmState::Stopped);
    assert!(VmState::is_legal_path(&vm.history()));
    vm.cleanup().await.unwrap();
}
