//! The capability boundary between the orchestrator and a hypervisor.
//!
//! A [Hypervisor] turns a [MachineConfiguration] into its own configuration type and instantiates
//! [VirtualMachine]s from it. State changes are published on a bounded broadcast channel; a receiver that falls
//! behind observes `Lagged` and is expected to re-read [VirtualMachine::current_state].

use std::{future::Future, os::fd::OwnedFd, path::Path};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};

use crate::{
    device::MachineConfiguration,
    error::{Classify, ErrorKind},
    id::VmId,
    vm::state::VmState,
};

#[cfg(feature = "vfkit-hypervisor")]
#[cfg_attr(docsrs, doc(cfg(feature = "vfkit-hypervisor")))]
pub mod vfkit;

/// The capacity of a hypervisor's state broadcast channel.
pub const STATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum HypervisorError {
    /// The hypervisor refused the configuration.
    Rejected(String),
    /// The hypervisor does not implement this operation.
    Unsupported(&'static str),
    /// The operation isn't allowed in the VM's current state.
    InvalidState { operation: &'static str, state: VmState },
    /// The hypervisor reported a failure at runtime.
    Runtime(String),
    IoError(std::io::Error),
    /// A call pinned to its own thread never returned.
    PinnedCallLost,
}

impl std::error::Error for HypervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HypervisorError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorError::Rejected(reason) => write!(f, "The hypervisor rejected the configuration: {reason}"),
            HypervisorError::Unsupported(operation) => {
                write!(f, "The hypervisor does not support the \"{operation}\" operation")
            }
            HypervisorError::InvalidState { operation, state } => {
                write!(f, "The \"{operation}\" operation is not allowed in the {state} state")
            }
            HypervisorError::Runtime(reason) => write!(f, "The hypervisor reported an error: {reason}"),
            HypervisorError::IoError(err) => write!(f, "An I/O operation against the hypervisor failed: {err}"),
            HypervisorError::PinnedCallLost => write!(f, "A pinned hypervisor call exited without a result"),
        }
    }
}

impl Classify for HypervisorError {
    fn kind(&self) -> ErrorKind {
        match self {
            HypervisorError::Rejected(_) => ErrorKind::HypervisorRejected,
            HypervisorError::InvalidState { .. } => ErrorKind::ConfigInvalid,
            _ => ErrorKind::HypervisorError,
        }
    }
}

/// A stream whose underlying descriptor can be handed to another process.
pub trait IntoOwnedFd {
    fn into_owned_fd(self) -> Result<OwnedFd, std::io::Error>;
}

impl IntoOwnedFd for tokio::net::UnixStream {
    fn into_owned_fd(self) -> Result<OwnedFd, std::io::Error> {
        Ok(self.into_std()?.into())
    }
}

/// A hypervisor able to host [VirtualMachine]s.
pub trait Hypervisor: Send + Sync + 'static {
    /// The hypervisor's native form of a [MachineConfiguration].
    type Config: Send + 'static;
    type Machine: VirtualMachine;

    /// Translate a validated [MachineConfiguration], taking ownership of any file descriptors it carries.
    fn build_config(&self, configuration: MachineConfiguration) -> Result<Self::Config, HypervisorError>;

    /// Whether the hypervisor would accept the configuration.
    fn validate(&self, config: &Self::Config) -> bool;

    /// Instantiate a VM in the `unknown` state. `workdir` may be used for sockets and logs.
    fn new_vm(
        &self,
        id: &VmId,
        workdir: &Path,
        config: Self::Config,
    ) -> impl Future<Output = Result<Self::Machine, HypervisorError>> + Send;
}

/// One VM instance of a [Hypervisor].
pub trait VirtualMachine: Send + Sync + 'static {
    type VsockStream: AsyncRead + AsyncWrite + Unpin + Send + IntoOwnedFd + 'static;

    fn start(&self) -> impl Future<Output = Result<(), HypervisorError>> + Send;

    /// Ask the guest to shut down. The VM may keep running.
    fn request_stop(&self) -> impl Future<Output = Result<(), HypervisorError>> + Send;

    /// Stop the VM immediately.
    fn stop(&self) -> impl Future<Output = Result<(), HypervisorError>> + Send;

    fn pause(&self) -> impl Future<Output = Result<(), HypervisorError>> + Send;

    fn resume(&self) -> impl Future<Output = Result<(), HypervisorError>> + Send;

    fn current_state(&self) -> VmState;

    /// Subscribe to state changes. Only changes after the call are delivered.
    fn subscribe_state(&self) -> broadcast::Receiver<VmState>;

    /// Open a connection to a vsock port the guest listens on.
    fn vsock_connect(&self, port: u32) -> impl Future<Output = Result<Self::VsockStream, std::io::Error>> + Send;

    fn balloon_target(&self) -> impl Future<Output = Result<u64, HypervisorError>> + Send;

    fn set_balloon_target(&self, bytes: u64) -> impl Future<Output = Result<(), HypervisorError>> + Send;
}

/// Run `function` on a dedicated, named OS thread and await its result. For SDK calls that must not migrate
/// between threads or block a runtime worker.
pub async fn run_pinned<T, F>(name: impl Into<String>, function: F) -> Result<T, HypervisorError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = futures_channel::oneshot::channel();
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let _ = sender.send(function());
        })
        .map_err(HypervisorError::IoError)?;

    receiver.await.map_err(|_| HypervisorError::PinnedCallLost)
}
