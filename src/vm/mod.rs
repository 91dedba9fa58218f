use std::{
    os::fd::OwnedFd,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::FutureExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bootloader::{BootloaderBuilder, BootloaderError},
    cache::ArtifactCache,
    config::{ImageConfig, RuntimeConfig},
    device::{Device, DeviceError, MachineConfigurationBuilder, NetBacking, SerialSink, VsockDirection},
    error::{Classify, ErrorKind},
    exec::{ExecChannel, ExecError, ExecOutput, GuestExecClient},
    hypervisor::{Hypervisor, HypervisorError, IntoOwnedFd, VirtualMachine},
    id::VmId,
    image::{ImageAssembler, ImageError, ImageFetchConverter},
    network::{GUEST_MAC, NetworkConfig, NetworkError, VirtualNetwork},
    registry::BinaryRegistry,
    vsock::{BridgeState, VsockBridge, VsockError},
};

mod relay;
pub mod state;

pub use relay::VmFault;
pub use state::VmState;

/// The file in the workdir that receives the serial console unless the caller routes it elsewhere.
pub const CONSOLE_LOG_FILE_NAME: &str = "console.log";
/// The virtio-fs tag of the converted rootfs.
pub const ROOTFS_SHARE_TAG: &str = "rootfs";
/// The virtio-fs tag of the runtime filesystem holding the guest manifest.
pub const RUNTIME_FS_SHARE_TAG: &str = "ec1";

/// The vsock stream type produced by a hypervisor's machines.
pub type VsockStreamOf<H> = <<H as Hypervisor>::Machine as VirtualMachine>::VsockStream;

#[derive(Debug)]
pub enum VmError {
    ConfigInvalid(String),
    ExpectedState { operation: &'static str, actual: VmState },
    IoError(std::io::Error),
    ImageError(ImageError),
    BootloaderError(BootloaderError),
    NetworkError(NetworkError),
    DeviceError(DeviceError),
    HypervisorError(HypervisorError),
    HypervisorRejected,
    StartTimeout(Duration),
    EnteredErrorState,
    StateWaitTimeout { expected: VmState, waited: Duration },
    StateRelayGone,
    VsockError(VsockError),
    ExecError(ExecError),
    Canceled,
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::IoError(err) => Some(err),
            VmError::ImageError(err) => Some(err),
            VmError::BootloaderError(err) => Some(err),
            VmError::NetworkError(err) => Some(err),
            VmError::DeviceError(err) => Some(err),
            VmError::HypervisorError(err) => Some(err),
            VmError::VsockError(err) => Some(err),
            VmError::ExecError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::ConfigInvalid(reason) => write!(f, "The VM configuration is invalid: {reason}"),
            VmError::ExpectedState { operation, actual } => {
                write!(f, "The \"{operation}\" operation is not allowed while the VM is {actual}")
            }
            VmError::IoError(err) => write!(f, "A VM workdir operation failed: {err}"),
            VmError::ImageError(err) => write!(f, "Assembling the image failed: {err}"),
            VmError::BootloaderError(err) => write!(f, "Building the bootloader failed: {err}"),
            VmError::NetworkError(err) => write!(f, "Setting up the virtual network failed: {err}"),
            VmError::DeviceError(err) => write!(f, "Building the device graph failed: {err}"),
            VmError::HypervisorError(err) => write!(f, "A hypervisor operation failed: {err}"),
            VmError::HypervisorRejected => write!(f, "The hypervisor rejected the VM configuration"),
            VmError::StartTimeout(waited) => write!(f, "The VM did not reach the running state within {waited:?}"),
            VmError::EnteredErrorState => write!(f, "The hypervisor put the VM into the error state"),
            VmError::StateWaitTimeout { expected, waited } => {
                write!(f, "The VM did not reach the {expected} state within {waited:?}")
            }
            VmError::StateRelayGone => write!(f, "The VM's state notifications ended unexpectedly"),
            VmError::VsockError(err) => write!(f, "The exec vsock bridge failed: {err}"),
            VmError::ExecError(err) => write!(f, "Executing a guest command failed: {err}"),
            VmError::Canceled => write!(f, "The operation was canceled"),
        }
    }
}

impl Classify for VmError {
    fn kind(&self) -> ErrorKind {
        match self {
            VmError::ConfigInvalid(_) | VmError::ExpectedState { .. } | VmError::IoError(_) => ErrorKind::ConfigInvalid,
            VmError::ImageError(err) => err.kind(),
            VmError::BootloaderError(err) => err.kind(),
            VmError::NetworkError(err) => err.kind(),
            VmError::DeviceError(err) => err.kind(),
            VmError::HypervisorError(err) => err.kind(),
            VmError::HypervisorRejected => ErrorKind::HypervisorRejected,
            VmError::StartTimeout(_) => ErrorKind::StartTimeout,
            VmError::EnteredErrorState | VmError::StateWaitTimeout { .. } | VmError::StateRelayGone => {
                ErrorKind::HypervisorError
            }
            VmError::VsockError(err) => err.kind(),
            VmError::ExecError(err) => err.kind(),
            VmError::Canceled => ErrorKind::Canceled,
        }
    }
}

/// How [Vm::stop] brings the VM down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopMode {
    /// Ask the guest to shut down, falling back to [StopMode::Hard] after the stop timeout.
    Graceful,
    Hard,
}

/// Everything VMs share: the hypervisor, the image assembler (and thereby its conversion and artifact caches), the
/// boot blobs and the runtime configuration.
#[derive(Debug)]
pub struct VmEnvironment<H: Hypervisor, F: ImageFetchConverter> {
    hypervisor: Arc<H>,
    assembler: Arc<ImageAssembler<F>>,
    bootloader: BootloaderBuilder,
    network: Option<NetworkConfig>,
    config: RuntimeConfig,
}

impl<H: Hypervisor, F: ImageFetchConverter> Clone for VmEnvironment<H, F> {
    fn clone(&self) -> Self {
        Self {
            hypervisor: self.hypervisor.clone(),
            assembler: self.assembler.clone(),
            bootloader: self.bootloader.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H: Hypervisor, F: ImageFetchConverter> VmEnvironment<H, F> {
    /// Blobs are cached under `<cache>/artifacts` and converted rootfs trees under `<cache>/images`.
    pub fn new(
        hypervisor: H,
        fetcher: F,
        downloader: F::Downloader,
        registry: Arc<BinaryRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let artifacts = Arc::new(ArtifactCache::new(config.get_cache_dir().join("artifacts"), downloader));
        let assembler = ImageAssembler::new(fetcher, artifacts, config.get_cache_dir().join("images"));
        Self::new_arced(Arc::new(hypervisor), Arc::new(assembler), registry, config)
    }

    pub fn new_arced(
        hypervisor: Arc<H>,
        assembler: Arc<ImageAssembler<F>>,
        registry: Arc<BinaryRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            hypervisor,
            assembler,
            bootloader: BootloaderBuilder::new(registry),
            network: None,
            config,
        }
    }

    /// Use this network template instead of one derived from the host resolver configuration. Forwards from the
    /// [ImageConfig] are added to it.
    pub fn network_config(mut self, network: NetworkConfig) -> Self {
        self.network = Some(network);
        self
    }

    pub fn hypervisor(&self) -> &Arc<H> {
        &self.hypervisor
    }

    pub fn assembler(&self) -> &Arc<ImageAssembler<F>> {
        &self.assembler
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

/// A VM driven through its whole lifecycle: boot pipeline, start, exec, pause and resume, stop and cleanup.
///
/// Every operation takes `&self`, so a [Vm] can be shared behind an [Arc]; lifecycle operations are serialized
/// while exec requests queue on the bridge.
pub struct Vm<H: Hypervisor> {
    id: VmId,
    workdir: PathBuf,
    retain_workdir: bool,
    runtime: RuntimeConfig,
    machine: Arc<H::Machine>,
    network: VirtualNetwork,
    bridge: Arc<VsockBridge<ExecChannel<VsockStreamOf<H>>>>,
    exec: GuestExecClient<VsockStreamOf<H>>,
    state: watch::Receiver<VmState>,
    history: Arc<Mutex<Vec<VmState>>>,
    overruns: Arc<AtomicU64>,
    faults: Mutex<Option<mpsc::UnboundedReceiver<VmFault>>>,
    relay_cancel: CancellationToken,
    dial_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<H: Hypervisor> std::fmt::Debug for Vm<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("workdir", &self.workdir)
            .field("state", &self.state())
            .field("bridge", &self.bridge.state())
            .finish_non_exhaustive()
    }
}

impl<H: Hypervisor> Vm<H> {
    /// Run the boot pipeline for a new VM with a freshly minted [VmId]. The VM is left in the `unknown` state.
    pub async fn create<F: ImageFetchConverter>(
        env: &VmEnvironment<H, F>,
        config: ImageConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, VmError> {
        Self::create_with_id(env, VmId::generate(), config, cancel).await
    }

    /// [Vm::create] with a caller-chosen [VmId]. Canceling drops the boot pipeline; the workdir is left behind.
    pub async fn create_with_id<F: ImageFetchConverter>(
        env: &VmEnvironment<H, F>,
        id: VmId,
        config: ImageConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, VmError> {
        if config.memory_bytes == 0 {
            return Err(VmError::ConfigInvalid("the memory size must be non-zero".into()));
        }
        if config.vcpus == 0 {
            return Err(VmError::ConfigInvalid("the vCPU count must be non-zero".into()));
        }

        let workdir = env.config.get_vm_root_dir().join(id.as_ref());
        tokio::fs::create_dir_all(&workdir).await.map_err(VmError::IoError)?;
        tracing::info!(vm_id = %id, image_ref = %config.image_ref, workdir = %workdir.display(), "creating vm");

        let boot = async {
            tokio::try_join!(
                async {
                    env.assembler
                        .assemble(&config.image_ref, config.platform, &workdir)
                        .await
                        .map_err(VmError::ImageError)
                },
                async {
                    env.bootloader
                        .build_linux(config.platform, &workdir, &config.kernel_args, &config.init_args)
                        .await
                        .map_err(VmError::BootloaderError)
                },
                async {
                    let template = match env.network {
                        Some(ref network) => network.clone(),
                        None => NetworkConfig::from_host().await,
                    };
                    VirtualNetwork::start(template.forwards(config.forwards.iter().cloned()))
                        .await
                        .map_err(VmError::NetworkError)
                },
            )
        };
        let (image, bootloader, network) = tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Canceled),
            result = boot => result?,
        };

        let serial_sink = config
            .serial_sink
            .clone()
            .unwrap_or_else(|| SerialSink::File(workdir.join(CONSOLE_LOG_FILE_NAME)));
        let guest_endpoint = network.take_guest_endpoint().map_err(VmError::NetworkError)?;
        let exec_port = env.config.get_exec_port();
        let devices = [
            Device::virtio_fs(image.rootfs_path, ROOTFS_SHARE_TAG),
            Device::virtio_fs(image.runtime_fs_path, RUNTIME_FS_SHARE_TAG),
            Device::serial(serial_sink),
            Device::net(GUEST_MAC, NetBacking::DatagramSocket(guest_endpoint)),
            Device::vsock(exec_port, VsockDirection::GuestListens),
            Device::VirtioRng,
            Device::VirtioBalloon,
        ];
        let configuration = MachineConfigurationBuilder::new(config.vcpus, config.memory_bytes, bootloader)
            .apply_all(devices)
            .map_err(VmError::DeviceError)?
            .finalize();

        let hypervisor_config = env
            .hypervisor
            .build_config(configuration)
            .map_err(VmError::HypervisorError)?;
        if !env.hypervisor.validate(&hypervisor_config) {
            tracing::warn!(vm_id = %id, "hypervisor rejected the configuration");
            return Err(VmError::HypervisorRejected);
        }

        let machine = tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Canceled),
            machine = env.hypervisor.new_vm(&id, &workdir, hypervisor_config) => {
                Arc::new(machine.map_err(VmError::HypervisorError)?)
            }
        };
        if cancel.is_cancelled() {
            if let Err(err) = machine.stop().await {
                tracing::warn!(vm_id = %id, error = %err, "hard stop after create cancellation failed");
            }
            return Err(VmError::Canceled);
        }

        let states = machine.subscribe_state();
        let (outputs, state, faults) = relay::RelayOutputs::new(machine.current_state());
        let history = outputs.history.clone();
        let overruns = outputs.overruns.clone();
        let relay_cancel = CancellationToken::new();
        tokio::spawn(relay::run(
            id.clone(),
            machine.clone(),
            states,
            network.subscribe_failure(),
            outputs,
            relay_cancel.clone(),
        ));

        let connector_machine = machine.clone();
        let bridge = Arc::new(VsockBridge::new(
            exec_port,
            Box::new(move |port| {
                let machine = connector_machine.clone();
                async move { machine.vsock_connect(port).await.map(ExecChannel::new) }.boxed()
            }),
        ));
        let exec = GuestExecClient::new(bridge.clone());

        tracing::info!(vm_id = %id, "vm created");
        Ok(Self {
            id,
            workdir,
            retain_workdir: config.retain_workdir,
            runtime: env.config.clone(),
            machine,
            network,
            bridge,
            exec,
            state,
            history,
            overruns,
            faults: Mutex::new(Some(faults)),
            relay_cancel,
            dial_task: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &VmId {
        &self.id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn state(&self) -> VmState {
        *self.state.borrow()
    }

    /// Every state the VM has been observed in, oldest first.
    pub fn history(&self) -> Vec<VmState> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// How many times state notifications were dropped because the relay fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Take the receiver of fatal VM faults. It can be taken once.
    pub fn take_fault_receiver(&self) -> Option<mpsc::UnboundedReceiver<VmFault>> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<VmState> {
        self.state.clone()
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.bridge.state()
    }

    pub fn subscribe_bridge(&self) -> watch::Receiver<BridgeState> {
        self.bridge.subscribe()
    }

    /// The host port forwarded connections are accepted on, if the VM has forwards.
    pub fn forwarded_host_port(&self) -> Option<u16> {
        self.network.host_port()
    }

    pub fn exec_client(&self) -> &GuestExecClient<VsockStreamOf<H>> {
        &self.exec
    }

    /// Boot the VM and wait up to `timeout` for it to run. Only allowed in the `unknown` state. On timeout or
    /// cancellation the VM is hard-stopped. Once running, the exec bridge starts dialing in the background.
    pub async fn start(&self, timeout: Duration, cancel: &CancellationToken) -> Result<(), VmError> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current != VmState::Unknown {
            return Err(VmError::ExpectedState {
                operation: "start",
                actual: current,
            });
        }
        if cancel.is_cancelled() {
            return Err(VmError::Canceled);
        }

        tracing::info!(vm_id = %self.id, ?timeout, "starting vm");
        self.machine.start().await.map_err(VmError::HypervisorError)?;

        let reached = match self
            .await_state(timeout, cancel, |state| *state == VmState::Running || state.is_terminal())
            .await
        {
            Err(VmError::Canceled) => {
                tracing::warn!(vm_id = %self.id, "vm start canceled, stopping it");
                self.hard_stop("start cancellation").await;
                return Err(VmError::Canceled);
            }
            reached => reached?,
        };
        match reached {
            None => {
                tracing::warn!(vm_id = %self.id, ?timeout, "vm did not start in time, stopping it");
                self.hard_stop("start timeout").await;
                return Err(VmError::StartTimeout(timeout));
            }
            Some(VmState::Running) => {}
            Some(VmState::Error) => return Err(VmError::EnteredErrorState),
            Some(actual) => {
                return Err(VmError::ExpectedState {
                    operation: "start",
                    actual,
                });
            }
        }

        let bridge = self.bridge.clone();
        let dial_timeout = self.runtime.get_dial_timeout();
        let vm_id = self.id.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = bridge.dial(dial_timeout).await {
                tracing::warn!(%vm_id, error = %err, "exec bridge did not connect");
            }
        });
        if let Some(previous) = self
            .dial_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task)
        {
            previous.abort();
        }

        tracing::info!(vm_id = %self.id, "vm running");
        Ok(())
    }

    /// Bring the VM down and release its host-side resources. Stopping a stopped VM does nothing. The workdir is
    /// kept; see [Vm::cleanup].
    ///
    /// Canceling cuts a graceful wait short with a hard stop. Host-side resources are released either way, and the
    /// wait for the `stopped` state ends with [VmError::Canceled].
    pub async fn stop(&self, mode: StopMode, cancel: &CancellationToken) -> Result<(), VmError> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.state();
        if current == VmState::Stopped {
            tracing::debug!(vm_id = %self.id, "vm already stopped");
            return Ok(());
        }

        let needs_hypervisor = !matches!(current, VmState::Unknown | VmState::Error);
        tracing::info!(vm_id = %self.id, ?mode, state = %current, "stopping vm");

        if needs_hypervisor {
            let stop_timeout = self.runtime.get_stop_timeout();
            match mode {
                StopMode::Graceful => {
                    let stopped = match self.machine.request_stop().await {
                        Ok(()) => match self.await_state(stop_timeout, cancel, |state| state.is_terminal()).await {
                            Ok(reached) => reached.is_some(),
                            Err(VmError::Canceled) => {
                                tracing::info!(vm_id = %self.id, "graceful stop canceled");
                                false
                            }
                            Err(err) => return Err(err),
                        },
                        Err(err) => {
                            tracing::warn!(vm_id = %self.id, error = %err, "graceful stop request failed");
                            false
                        }
                    };
                    if !stopped {
                        tracing::warn!(vm_id = %self.id, "escalating to a hard stop");
                        self.machine.stop().await.map_err(VmError::HypervisorError)?;
                    }
                }
                StopMode::Hard => self.machine.stop().await.map_err(VmError::HypervisorError)?,
            }
        }

        self.exec.close();
        self.bridge.close().await;
        self.network.close().await;

        if needs_hypervisor {
            let stop_timeout = self.runtime.get_stop_timeout();
            match self.await_state(stop_timeout, cancel, |state| state.is_terminal()).await? {
                Some(VmState::Stopped) => {}
                Some(VmState::Error) => return Err(VmError::EnteredErrorState),
                _ => {
                    return Err(VmError::StateWaitTimeout {
                        expected: VmState::Stopped,
                        waited: stop_timeout,
                    });
                }
            }
        }

        tracing::info!(vm_id = %self.id, "vm stopped");
        Ok(())
    }

    /// Stop the VM if it's still live, then remove the workdir unless it was asked to be retained.
    pub async fn cleanup(&self) -> Result<(), VmError> {
        if !matches!(self.state(), VmState::Stopped | VmState::Error | VmState::Unknown) {
            self.stop(StopMode::Hard, &CancellationToken::new()).await?;
        } else {
            self.exec.close();
            self.bridge.close().await;
            self.network.close().await;
        }
        self.relay_cancel.cancel();

        if self.retain_workdir {
            tracing::debug!(vm_id = %self.id, workdir = %self.workdir.display(), "retaining workdir");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.workdir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(VmError::IoError(err)),
        }
        tracing::info!(vm_id = %self.id, "vm cleaned up");
        Ok(())
    }

    pub async fn pause(&self, cancel: &CancellationToken) -> Result<(), VmError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.transition("pause", VmState::Running, VmState::Paused, self.machine.pause(), cancel)
            .await
    }

    pub async fn resume(&self, cancel: &CancellationToken) -> Result<(), VmError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.transition("resume", VmState::Paused, VmState::Running, self.machine.resume(), cancel)
            .await
    }

    async fn transition(
        &self,
        operation: &'static str,
        from: VmState,
        to: VmState,
        request: impl Future<Output = Result<(), HypervisorError>>,
        cancel: &CancellationToken,
    ) -> Result<(), VmError> {
        let current = self.state();
        if current != from {
            return Err(VmError::ExpectedState {
                operation,
                actual: current,
            });
        }

        request.await.map_err(VmError::HypervisorError)?;
        let waited = self.runtime.get_stop_timeout();
        match self
            .await_state(waited, cancel, |state| *state == to || state.is_terminal())
            .await?
        {
            Some(reached) if reached == to => {
                tracing::info!(vm_id = %self.id, operation, "vm {to}");
                Ok(())
            }
            Some(VmState::Error) => Err(VmError::EnteredErrorState),
            Some(actual) => Err(VmError::ExpectedState { operation, actual }),
            None => Err(VmError::StateWaitTimeout { expected: to, waited }),
        }
    }

    /// Set the memory balloon's target size, in bytes.
    pub async fn set_balloon(&self, bytes: u64) -> Result<(), VmError> {
        tracing::debug!(vm_id = %self.id, bytes, "setting balloon target");
        self.machine
            .set_balloon_target(bytes)
            .await
            .map_err(VmError::HypervisorError)
    }

    /// The memory balloon's target size, in bytes.
    pub async fn balloon(&self) -> Result<u64, VmError> {
        self.machine.balloon_target().await.map_err(VmError::HypervisorError)
    }

    /// Wait up to `timeout` until the VM is in `expected`. Fails early if the VM reaches a different terminal state.
    pub async fn wait_for_state(
        &self,
        expected: VmState,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), VmError> {
        match self
            .await_state(timeout, cancel, |state| *state == expected || state.is_terminal())
            .await?
        {
            Some(reached) if reached == expected => Ok(()),
            Some(actual) => Err(VmError::ExpectedState {
                operation: "wait",
                actual,
            }),
            None => Err(VmError::StateWaitTimeout {
                expected,
                waited: timeout,
            }),
        }
    }

    /// Wait up to `timeout` until the exec bridge is connected. Returns at once if it already is.
    pub async fn wait_ready_to_exec(&self, timeout: Duration, cancel: &CancellationToken) -> Result<(), VmError> {
        let mut bridge = self.bridge.subscribe();
        let port = self.bridge.port();
        let wait = tokio::time::timeout(timeout, async move {
            bridge
                .wait_for(|state| matches!(state, BridgeState::Connected | BridgeState::Closed))
                .await
                .map(|state| *state)
        });
        let reached = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VmError::Canceled),
            reached = wait => reached,
        };

        match reached {
            Ok(Ok(BridgeState::Connected)) => Ok(()),
            Ok(_) => Err(VmError::VsockError(VsockError::Closed)),
            Err(_) => Err(VmError::VsockError(VsockError::Unavailable { port, waited: timeout })),
        }
    }

    /// Dial the exec bridge again after it dropped its connection.
    pub async fn reconnect_exec(&self) -> Result<(), VmError> {
        let current = self.state();
        if current != VmState::Running {
            return Err(VmError::ExpectedState {
                operation: "reconnect",
                actual: current,
            });
        }
        tracing::info!(vm_id = %self.id, "reconnecting exec bridge");
        self.bridge
            .dial(self.runtime.get_dial_timeout())
            .await
            .map_err(VmError::VsockError)
    }

    /// Run a command in the guest. The VM keeps running whatever the outcome.
    pub async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput, VmError> {
        self.exec.exec(command, cancel).await.map_err(VmError::ExecError)
    }

    /// A new connection to a guest vsock port, as a raw descriptor for another process.
    pub async fn vsock_fd(&self, port: u32) -> Result<OwnedFd, VmError> {
        let stream = self
            .machine
            .vsock_connect(port)
            .await
            .map_err(|err| VmError::HypervisorError(HypervisorError::IoError(err)))?;
        stream
            .into_owned_fd()
            .map_err(|err| VmError::HypervisorError(HypervisorError::IoError(err)))
    }

    /// Wait for a state accepted by `accept`. `None` means the timeout elapsed.
    async fn await_state(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        accept: impl FnMut(&VmState) -> bool,
    ) -> Result<Option<VmState>, VmError> {
        let mut state = self.state.clone();
        let wait = tokio::time::timeout(timeout, async move { state.wait_for(accept).await.map(|state| *state) });
        let reached = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VmError::Canceled),
            reached = wait => reached,
        };
        match reached {
            Err(_) => Ok(None),
            Ok(Ok(state)) => Ok(Some(state)),
            Ok(Err(_)) => Err(VmError::StateRelayGone),
        }
    }

    async fn hard_stop(&self, reason: &'static str) {
        if let Err(err) = self.machine.stop().await {
            tracing::warn!(vm_id = %self.id, error = %err, reason, "hard stop failed");
        }
    }
}

impl<H: Hypervisor> Drop for Vm<H> {
    fn drop(&mut self) {
        self.relay_cancel.cancel();
        if let Some(task) = self
            .dial_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
