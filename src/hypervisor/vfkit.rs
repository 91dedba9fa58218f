//! A [Hypervisor] backed by the `vfkit` binary, driven through its RESTful API over a unix socket.

use std::{
    collections::BTreeMap,
    os::fd::{AsRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_client_sockets::{connector::unix::UnixConnector, tokio::TokioBackend, uri::UnixUri};
use hyper_util::client::legacy::Client;
use serde::{Deserialize, Serialize};
use tokio::{net::UnixStream, process::Child, sync::broadcast};
use tokio_util::sync::CancellationToken;

use super::{HypervisorError, Hypervisor, STATE_CHANNEL_CAPACITY, VirtualMachine, run_pinned};
use crate::{
    bootloader::Bootloader,
    device::{
        DirectoryShare, InputKind, MachineConfiguration, NetBacking, SerialSink, StorageDevice, VirtioSerial,
        VsockDirection, VsockPort,
    },
    id::VmId,
    network::MAX_DATAGRAM_PATH_LEN,
    process_spawner::ProcessSpawner,
    vm::state::VmState,
};

/// How often the VM state is polled.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RESTFUL_SOCKET_FILE_NAME: &str = "vfkit.sock";
const MIB: u64 = 1024 * 1024;

/// A [hyper::rt::Executor] spawning onto the ambient Tokio runtime.
#[derive(Debug, Clone, Copy)]
struct TokioHyperExecutor;

impl<F> hyper::rt::Executor<F> for TokioHyperExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, future: F) {
        tokio::spawn(future);
    }
}

type ApiClient = Client<UnixConnector<TokioBackend>, Full<Bytes>>;

#[derive(Debug, Serialize, Deserialize)]
struct ReprState {
    state: String,
}

fn parse_state(state: &str) -> VmState {
    match state {
        "VirtualMachineStateRunning" => VmState::Running,
        "VirtualMachineStateStopped" => VmState::Stopped,
        "VirtualMachineStatePaused" => VmState::Paused,
        "VirtualMachineStateError" => VmState::Error,
        "VirtualMachineStateStarting" => VmState::Starting,
        "VirtualMachineStatePausing" => VmState::Pausing,
        "VirtualMachineStateResuming" => VmState::Resuming,
        "VirtualMachineStateStopping" => VmState::Stopping,
        _ => VmState::Unknown,
    }
}

/// A `vfkit` invocation prepared from a [MachineConfiguration]. Owns any descriptors the child inherits.
#[derive(Debug)]
pub struct VfkitConfig {
    arguments: Vec<String>,
    vsock_ports: Vec<VsockPort>,
    inherited_fds: Vec<OwnedFd>,
    vcpus: u32,
    memory_bytes: u64,
    macos_boot: bool,
}

impl VfkitConfig {
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

fn serial_argument(serial: &VirtioSerial) -> String {
    match serial.sink {
        SerialSink::Stdio => "virtio-serial,stdio".to_owned(),
        SerialSink::Pty => "virtio-serial,pty".to_owned(),
        SerialSink::File(ref path) | SerialSink::Fifo(ref path) => {
            format!("virtio-serial,logFilePath={}", path.display())
        }
    }
}

fn with_read_only(mut argument: String, read_only: bool) -> String {
    if read_only {
        argument.push_str(",readonly");
    }
    argument
}

fn inheritable(fd: OwnedFd) -> Result<OwnedFd, HypervisorError> {
    nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()))
        .map_err(|errno| HypervisorError::IoError(errno.into()))?;
    Ok(fd)
}

/// Launches VMs with `vfkit`.
#[derive(Debug)]
pub struct VfkitHypervisor<S: ProcessSpawner> {
    binary_path: PathBuf,
    spawner: Arc<S>,
}

impl<S: ProcessSpawner> VfkitHypervisor<S> {
    pub fn new(binary_path: impl Into<PathBuf>, spawner: S) -> Self {
        Self {
            binary_path: binary_path.into(),
            spawner: Arc::new(spawner),
        }
    }
}

impl<S: ProcessSpawner> Hypervisor for VfkitHypervisor<S> {
    type Config = VfkitConfig;
    type Machine = VfkitMachine<S>;

    fn build_config(&self, configuration: MachineConfiguration) -> Result<VfkitConfig, HypervisorError> {
        let mut arguments = vec![
            "--cpus".to_owned(),
            configuration.vcpus.to_string(),
            "--memory".to_owned(),
            (configuration.memory_bytes / MIB).to_string(),
        ];
        let mut inherited_fds = Vec::new();
        let mut macos_boot = false;
        let mut device = |argument: String| {
            arguments.push("--device".to_owned());
            arguments.push(argument);
        };

        let mut boot_arguments = Vec::new();
        match configuration.bootloader {
            Bootloader::Linux {
                kernel_path,
                initrd_path,
                cmdline,
            } => {
                boot_arguments.extend(["--kernel".to_owned(), kernel_path.display().to_string()]);
                if let Some(initrd_path) = initrd_path {
                    boot_arguments.extend(["--initrd".to_owned(), initrd_path.display().to_string()]);
                }
                boot_arguments.extend(["--kernel-cmdline".to_owned(), cmdline]);
            }
            Bootloader::Efi {
                variable_store_path,
                create_variable_store,
            } => {
                let mut argument = format!("efi,variable-store={}", variable_store_path.display());
                if create_variable_store {
                    argument.push_str(",create");
                }
                boot_arguments.extend(["--bootloader".to_owned(), argument]);
            }
            Bootloader::MacOs { .. } => macos_boot = true,
        }

        for storage in configuration.storage {
            device(match storage {
                StorageDevice::VirtioBlk(dev) => {
                    let mut argument = format!("virtio-blk,path={}", dev.image_path.display());
                    if let Some(id) = dev.device_id {
                        argument.push_str(&format!(",deviceId={id}"));
                    }
                    with_read_only(argument, dev.read_only)
                }
                StorageDevice::Nvme(dev) => with_read_only(format!("nvme,path={}", dev.image_path.display()), dev.read_only),
                StorageDevice::NetworkBlockDevice(dev) => with_read_only(
                    format!("nbd,uri={},timeout={}", dev.uri, dev.timeout.as_millis()),
                    dev.read_only,
                ),
                StorageDevice::UsbMassStorage(dev) => {
                    with_read_only(format!("usb-mass-storage,path={}", dev.image_path.display()), dev.read_only)
                }
            });
        }

        for share in configuration.directory_sharing {
            device(match share {
                DirectoryShare::VirtioFs(dev) => {
                    format!("virtio-fs,sharedDir={},mountTag={}", dev.host_path.display(), dev.tag)
                }
                DirectoryShare::Rosetta(dev) => format!("rosetta,mountTag={}", dev.tag),
            });
        }

        for net in configuration.network {
            let backing = match net.backing {
                NetBacking::Nat => "nat".to_owned(),
                NetBacking::UnixDatagramPath(path) => format!("unixSocketPath={}", path.display()),
                NetBacking::DatagramSocket(endpoint) => {
                    let fd = inheritable(endpoint.into_owned_fd())?;
                    let argument = format!("fd={}", fd.as_raw_fd());
                    inherited_fds.push(fd);
                    argument
                }
            };
            device(format!("virtio-net,{backing},mac={}", net.mac));
        }

        for serial in configuration.serial.iter().chain(configuration.console_ports.iter()) {
            device(serial_argument(serial));
        }
        if configuration.entropy > 0 {
            device("virtio-rng".to_owned());
        }
        for input in configuration.input {
            device(match input.kind {
                InputKind::Pointing => "virtio-input,pointing".to_owned(),
                InputKind::Keyboard => "virtio-input,keyboard".to_owned(),
            });
        }
        for gpu in configuration.graphics {
            device(format!("virtio-gpu,width={},height={}", gpu.width, gpu.height));
        }
        device("virtio-balloon".to_owned());

        arguments.extend(boot_arguments);
        Ok(VfkitConfig {
            arguments,
            vsock_ports: configuration.vsock.ports,
            inherited_fds,
            vcpus: configuration.vcpus,
            memory_bytes: configuration.memory_bytes,
            macos_boot,
        })
    }

    fn validate(&self, config: &VfkitConfig) -> bool {
        config.vcpus > 0 && config.memory_bytes >= MIB && config.memory_bytes % MIB == 0 && !config.macos_boot
    }

    async fn new_vm(&self, id: &VmId, workdir: &Path, mut config: VfkitConfig) -> Result<VfkitMachine<S>, HypervisorError> {
        let restful_socket_path = workdir.join(RESTFUL_SOCKET_FILE_NAME);
        let mut vsock_sockets = BTreeMap::new();
        let mut socket_paths = vec![restful_socket_path.clone()];
        let mut owned_socket_paths = vec![restful_socket_path.clone()];

        for port in config.vsock_ports.drain(..) {
            let socket_path = match port.socket_path.clone() {
                Some(path) => path,
                None => {
                    let path = workdir.join(format!("vsock-{}.sock", port.port));
                    owned_socket_paths.push(path.clone());
                    path
                }
            };
            let mut argument = format!("virtio-vsock,port={},socketURL={}", port.port, socket_path.display());
            if port.direction == VsockDirection::GuestConnects {
                argument.push_str(",listen");
            } else {
                vsock_sockets.insert(port.port, socket_path.clone());
            }
            config.arguments.push("--device".to_owned());
            config.arguments.push(argument);
            socket_paths.push(socket_path);
        }

        if let Some(path) = socket_paths
            .iter()
            .find(|path| path.as_os_str().len() >= MAX_DATAGRAM_PATH_LEN)
        {
            return Err(HypervisorError::Rejected(format!(
                "the socket path {} is too long for a unix socket",
                path.display()
            )));
        }

        // vfkit refuses to bind over sockets a previous run left in the workdir
        run_pinned(format!("harpoon-vfkit-{id}"), move || remove_stale_sockets(&owned_socket_paths))
            .await?
            .map_err(HypervisorError::IoError)?;

        config
            .arguments
            .extend(["--restful-uri".to_owned(), format!("unix://{}", restful_socket_path.display())]);

        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        tracing::debug!(vm_id = %id, arguments = ?config.arguments, "prepared vfkit invocation");

        Ok(VfkitMachine {
            id: id.clone(),
            binary_path: self.binary_path.clone(),
            spawner: self.spawner.clone(),
            pending: Mutex::new(Some(config)),
            restful_socket_path,
            vsock_sockets,
            shared: Arc::new(SharedState {
                state: Mutex::new(VmState::Unknown),
                events,
            }),
            client: Client::builder(TokioHyperExecutor).build(UnixConnector::new()),
            kill: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        })
    }
}

fn remove_stale_sockets(paths: &[PathBuf]) -> Result<(), std::io::Error> {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[derive(Debug)]
struct SharedState {
    state: Mutex<VmState>,
    events: broadcast::Sender<VmState>,
}

impl SharedState {
    fn current(&self) -> VmState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, next: VmState) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == next || state.is_terminal() {
            return;
        }
        *state = next;
        let _ = self.events.send(next);
    }
}

/// A VM run by a `vfkit` child process.
pub struct VfkitMachine<S: ProcessSpawner> {
    id: VmId,
    binary_path: PathBuf,
    spawner: Arc<S>,
    pending: Mutex<Option<VfkitConfig>>,
    restful_socket_path: PathBuf,
    vsock_sockets: BTreeMap<u32, PathBuf>,
    shared: Arc<SharedState>,
    client: ApiClient,
    kill: CancellationToken,
    shutdown: CancellationToken,
}

impl<S: ProcessSpawner> std::fmt::Debug for VfkitMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfkitMachine")
            .field("id", &self.id)
            .field("binary_path", &self.binary_path)
            .field("restful_socket_path", &self.restful_socket_path)
            .field("state", &self.shared.current())
            .finish_non_exhaustive()
    }
}

async fn fetch_state(client: &ApiClient, socket_path: &Path) -> Result<VmState, HypervisorError> {
    let response = send(client, socket_path, Method::GET, Full::new(Bytes::new())).await?;
    let body = response.into_body().collect().await.map_err(io_error)?.to_bytes();
    let repr: ReprState = serde_json::from_slice(&body).map_err(|err| HypervisorError::Runtime(err.to_string()))?;
    Ok(parse_state(&repr.state))
}

async fn send(
    client: &ApiClient,
    socket_path: &Path,
    method: Method,
    body: Full<Bytes>,
) -> Result<http::Response<hyper::body::Incoming>, HypervisorError> {
    let uri = Uri::unix(socket_path, "/vm/state").map_err(|err| HypervisorError::Runtime(err.to_string()))?;
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(body)
        .map_err(|err| HypervisorError::Runtime(err.to_string()))?;
    let response = client.request(request).await.map_err(io_error)?;
    if response.status() != StatusCode::OK && response.status() != StatusCode::ACCEPTED {
        return Err(HypervisorError::Runtime(format!(
            "the API responded with {}",
            response.status()
        )));
    }
    Ok(response)
}

fn io_error(err: impl std::error::Error + Send + Sync + 'static) -> HypervisorError {
    HypervisorError::IoError(std::io::Error::other(err))
}

async fn supervise(
    id: VmId,
    mut child: Child,
    client: ApiClient,
    socket_path: PathBuf,
    shared: Arc<SharedState>,
    kill: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut killed = false;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = child.start_kill();
                break;
            }
            _ = kill.cancelled(), if !killed => {
                killed = true;
                if let Err(err) = child.start_kill() {
                    tracing::warn!(vm_id = %id, error = %err, "killing vfkit failed");
                }
            }
            status = child.wait() => {
                let state = match status {
                    Ok(status) if status.success() || killed || shared.current() == VmState::Stopping => VmState::Stopped,
                    Ok(status) => {
                        tracing::error!(vm_id = %id, %status, "vfkit exited unexpectedly");
                        VmState::Error
                    }
                    Err(err) => {
                        tracing::error!(vm_id = %id, error = %err, "waiting on vfkit failed");
                        VmState::Error
                    }
                };
                shared.publish(state);
                break;
            }
            _ = tokio::time::sleep(STATE_POLL_INTERVAL) => {
                match fetch_state(&client, &socket_path).await {
                    Ok(VmState::Unknown) => {}
                    Ok(state) => shared.publish(state),
                    Err(err) => tracing::trace!(vm_id = %id, error = %err, "polling vfkit state failed"),
                }
            }
        }
    }
    tracing::debug!(vm_id = %id, "vfkit supervisor exited");
}

impl<S: ProcessSpawner> VfkitMachine<S> {
    async fn post_state(&self, state: &str) -> Result<(), HypervisorError> {
        let body = serde_json::to_vec(&ReprState {
            state: state.to_owned(),
        })
        .map_err(|err| HypervisorError::Runtime(err.to_string()))?;
        send(&self.client, &self.restful_socket_path, Method::POST, Full::new(Bytes::from(body)))
            .await
            .map(|_| ())
    }

    fn ensure_live(&self, operation: &'static str) -> Result<VmState, HypervisorError> {
        let state = self.shared.current();
        if matches!(state, VmState::Unknown) || state.is_terminal() {
            return Err(HypervisorError::InvalidState { operation, state });
        }
        Ok(state)
    }
}

impl<S: ProcessSpawner> VirtualMachine for VfkitMachine<S> {
    type VsockStream = UnixStream;

    async fn start(&self) -> Result<(), HypervisorError> {
        let config = {
            let state = self.shared.current();
            if state != VmState::Unknown {
                return Err(HypervisorError::InvalidState {
                    operation: "start",
                    state,
                });
            }
            self.pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
                .ok_or(HypervisorError::InvalidState {
                    operation: "start",
                    state,
                })?
        };

        self.shared.publish(VmState::Starting);
        let child = match self
            .spawner
            .spawn(&self.binary_path, config.arguments.clone(), true)
            .await
        {
            Ok(child) => child,
            Err(err) => {
                self.shared.publish(VmState::Error);
                return Err(HypervisorError::IoError(err));
            }
        };
        // the child holds its own copies now
        drop(config.inherited_fds);
        tracing::info!(vm_id = %self.id, pid = child.id(), "vfkit spawned");

        tokio::spawn(supervise(
            self.id.clone(),
            child,
            self.client.clone(),
            self.restful_socket_path.clone(),
            self.shared.clone(),
            self.kill.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    async fn request_stop(&self) -> Result<(), HypervisorError> {
        self.ensure_live("request-stop")?;
        self.post_state("Stop").await
    }

    async fn stop(&self) -> Result<(), HypervisorError> {
        let state = self.shared.current();
        if state.is_terminal() {
            return Ok(());
        }
        if state == VmState::Unknown {
            self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
            self.shared.publish(VmState::Stopped);
            return Ok(());
        }

        if let Err(err) = self.post_state("HardStop").await {
            tracing::warn!(vm_id = %self.id, error = %err, "hard stop request failed, killing vfkit");
            self.kill.cancel();
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), HypervisorError> {
        self.ensure_live("pause")?;
        self.post_state("Pause").await
    }

    async fn resume(&self) -> Result<(), HypervisorError> {
        self.ensure_live("resume")?;
        self.post_state("Resume").await
    }

    fn current_state(&self) -> VmState {
        self.shared.current()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<VmState> {
        self.shared.events.subscribe()
    }

    async fn vsock_connect(&self, port: u32) -> Result<UnixStream, std::io::Error> {
        let socket_path = self.vsock_sockets.get(&port).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no host socket is mapped to vsock port {port}"),
            )
        })?;
        UnixStream::connect(socket_path).await
    }

    async fn balloon_target(&self) -> Result<u64, HypervisorError> {
        Err(HypervisorError::Unsupported("balloon-target"))
    }

    async fn set_balloon_target(&self, _bytes: u64) -> Result<(), HypervisorError> {
        Err(HypervisorError::Unsupported("set-balloon-target"))
    }
}

impl<S: ProcessSpawner> Drop for VfkitMachine<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{VfkitHypervisor, parse_state};
    use crate::{
        bootloader::Bootloader,
        device::{Device, MachineConfigurationBuilder, NetBacking, SerialSink, VsockDirection},
        hypervisor::Hypervisor,
        id::VmId,
        network::{GUEST_MAC, socketpair::datagram_pair},
        process_spawner::DirectProcessSpawner,
        vm::state::VmState,
    };

    fn configuration(memory_bytes: u64) -> crate::device::MachineConfiguration {
        let (endpoint, _switch) = datagram_pair().unwrap();
        MachineConfigurationBuilder::new(
            2,
            memory_bytes,
            Bootloader::Linux {
                kernel_path: PathBuf::from("/w/vmlinux"),
                initrd_path: Some(PathBuf::from("/w/initramfs.cpio.gz")),
                cmdline: "console=hvc0".into(),
            },
        )
        .apply_all([
            Device::virtio_fs("/w/rootfs", "rootfs"),
            Device::serial(SerialSink::File(PathBuf::from("/w/console.log"))),
            Device::net(GUEST_MAC, NetBacking::DatagramSocket(endpoint)),
            Device::vsock(2019, VsockDirection::GuestListens),
        ])
        .unwrap()
        .finalize()
    }

    #[tokio::test]
    async fn machine_configuration_translates_to_arguments() {
        let hypervisor = VfkitHypervisor::new("/usr/local/bin/vfkit", DirectProcessSpawner);
        let config = hypervisor.build_config(configuration(512 * 1024 * 1024)).unwrap();
        assert!(hypervisor.validate(&config));

        let arguments = config.arguments().join(" ");
        assert!(arguments.starts_with("--cpus 2 --memory 512"));
        assert!(arguments.contains("--device virtio-fs,sharedDir=/w/rootfs,mountTag=rootfs"));
        assert!(arguments.contains("--device virtio-serial,logFilePath=/w/console.log"));
        assert!(arguments.contains(",mac=5a:94:ef:e4:0c:ee"));
        assert!(arguments.contains("--device virtio-net,fd="));
        assert!(arguments.contains("--device virtio-balloon"));
        assert!(arguments.contains("--kernel-cmdline console=hvc0"));

        let workdir = std::env::temp_dir().join(format!("hv-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        let machine = hypervisor
            .new_vm(&VmId::new("vm-vfkit-test").unwrap(), &workdir, config)
            .await
            .unwrap();
        let rendered = machine
            .pending
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .arguments()
            .join(" ");
        assert!(rendered.contains(&format!("virtio-vsock,port=2019,socketURL={}", workdir.join("vsock-2019.sock").display())));
        assert!(rendered.contains("--restful-uri unix://"));
    }

    #[tokio::test]
    async fn stale_sockets_are_removed_before_launch() {
        let hypervisor = VfkitHypervisor::new("/usr/local/bin/vfkit", DirectProcessSpawner);
        let config = hypervisor.build_config(configuration(512 * 1024 * 1024)).unwrap();
        let workdir = std::env::temp_dir().join(format!("hv-{}", &uuid::Uuid::new_v4().to_string()[..8]));
        std::fs::create_dir_all(&workdir).unwrap();
        for name in ["vfkit.sock", "vsock-2019.sock", "console.log"] {
            std::fs::write(workdir.join(name), b"").unwrap();
        }

        hypervisor
            .new_vm(&VmId::new("vm-vfkit-stale").unwrap(), &workdir, config)
            .await
            .unwrap();
        assert!(!workdir.join("vfkit.sock").exists());
        assert!(!workdir.join("vsock-2019.sock").exists());
        assert!(workdir.join("console.log").exists());
        std::fs::remove_dir_all(workdir).unwrap();
    }

    #[test]
    fn fractional_memory_is_rejected() {
        let hypervisor = VfkitHypervisor::new("/usr/local/bin/vfkit", DirectProcessSpawner);
        let config = hypervisor.build_config(configuration(512 * 1024 * 1024 + 1)).unwrap();
        assert!(!hypervisor.validate(&config));
    }

    #[test]
    fn vfkit_states_are_mapped() {
        assert_eq!(parse_state("VirtualMachineStateRunning"), VmState::Running);
        assert_eq!(parse_state("VirtualMachineStateStopped"), VmState::Stopped);
        assert_eq!(parse_state("bogus"), VmState::Unknown);
    }
}
