//! A thin facade for container shims, mapping their sandbox operations onto a single [Vm].

use std::{os::fd::OwnedFd, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    config::ImageConfig,
    error::{Classify, ErrorKind, ExitCode},
    exec::ExecOutput,
    hypervisor::Hypervisor,
    id::{VmId, VmIdError},
    image::ImageFetchConverter,
    vm::{StopMode, Vm, VmEnvironment, VmError},
};

const MIB: u64 = 1024 * 1024;

#[derive(Debug)]
pub enum ShimError {
    NotCreated,
    AlreadyCreated,
    InvalidId(VmIdError),
    VmError(VmError),
}

impl std::error::Error for ShimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShimError::InvalidId(err) => Some(err),
            ShimError::VmError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShimError::NotCreated => write!(f, "No VM has been created yet"),
            ShimError::AlreadyCreated => write!(f, "A VM has already been created by this shim"),
            ShimError::InvalidId(err) => write!(f, "The sandbox ID is not a valid VM ID: {err}"),
            ShimError::VmError(err) => write!(f, "{err}"),
        }
    }
}

impl Classify for ShimError {
    fn kind(&self) -> ErrorKind {
        match self {
            ShimError::VmError(err) => err.kind(),
            _ => ErrorKind::ConfigInvalid,
        }
    }
}

/// The facade exit code for a shim call's outcome.
pub fn exit_code<T, E: Classify>(result: &Result<T, E>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::Success,
        Err(err) => err.kind().exit_code(),
    }
}

/// The facade exit code for a guest command: the command's own failure, or the exec error's kind.
pub fn exec_exit_code(result: &Result<ExecOutput, ShimError>) -> ExitCode {
    match result {
        Ok(output) => output.facade_exit_code(),
        Err(err) => err.kind().exit_code(),
    }
}

/// One sandbox's VM, created on demand. Holds no VM logic of its own.
#[derive(Debug)]
pub struct Shim<H: Hypervisor, F: ImageFetchConverter> {
    env: VmEnvironment<H, F>,
    vm: std::sync::Mutex<Option<Arc<Vm<H>>>>,
    cancel: CancellationToken,
}

impl<H: Hypervisor, F: ImageFetchConverter> Shim<H, F> {
    pub fn new(env: VmEnvironment<H, F>) -> Self {
        Self {
            env,
            vm: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancels in-progress lifecycle calls. A canceled [Shim::start] hard-stops the VM; once canceled, later
    /// lifecycle calls fail with [VmError::Canceled].
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn vm(&self) -> Result<Arc<Vm<H>>, ShimError> {
        self.vm
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(ShimError::NotCreated)
    }

    pub async fn create(&self, id: &str, config: ImageConfig) -> Result<(), ShimError> {
        let id = VmId::new(id).map_err(ShimError::InvalidId)?;
        if self.vm.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).is_some() {
            return Err(ShimError::AlreadyCreated);
        }

        let vm = Vm::create_with_id(&self.env, id, config, &self.cancel)
            .await
            .map_err(ShimError::VmError)?;

        let mut slot = self.vm.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(ShimError::AlreadyCreated);
        }
        *slot = Some(Arc::new(vm));
        Ok(())
    }

    pub async fn start(&self, timeout: Duration) -> Result<(), ShimError> {
        self.vm()?
            .start(timeout, &self.cancel)
            .await
            .map_err(ShimError::VmError)
    }

    /// `wait_only` asks the guest to shut down and waits; otherwise the VM is stopped immediately.
    pub async fn stop(&self, wait_only: bool) -> Result<(), ShimError> {
        let mode = if wait_only { StopMode::Graceful } else { StopMode::Hard };
        self.vm()?.stop(mode, &self.cancel).await.map_err(ShimError::VmError)
    }

    pub async fn pause(&self) -> Result<(), ShimError> {
        self.vm()?.pause(&self.cancel).await.map_err(ShimError::VmError)
    }

    pub async fn resume(&self) -> Result<(), ShimError> {
        self.vm()?.resume(&self.cancel).await.map_err(ShimError::VmError)
    }

    /// Set the balloon to `mib` MiB and report the size the hypervisor settled on. If the size can't be read back,
    /// the requested size is reported.
    pub async fn resize_memory(&self, mib: u32) -> Result<u32, ShimError> {
        let vm = self.vm()?;
        vm.set_balloon(u64::from(mib) * MIB)
            .await
            .map_err(ShimError::VmError)?;

        match vm.balloon().await {
            Ok(bytes) => Ok(u32::try_from(bytes / MIB).unwrap_or(u32::MAX)),
            Err(err) => {
                tracing::debug!(vm_id = %vm.id(), error = %err, "balloon size unreadable, reporting the requested size");
                Ok(mib)
            }
        }
    }

    /// Tear the VM down and forget it.
    pub async fn cleanup(&self) -> Result<(), ShimError> {
        let vm = self.vm()?;
        vm.cleanup().await.map_err(ShimError::VmError)?;
        self.vm.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        Ok(())
    }

    pub async fn get_vsock_fd(&self, port: u32) -> Result<OwnedFd, ShimError> {
        self.vm()?.vsock_fd(port).await.map_err(ShimError::VmError)
    }

    pub async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput, ShimError> {
        self.vm()?.exec(command, cancel).await.map_err(ShimError::VmError)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{ShimError, exec_exit_code, exit_code};
    use crate::{
        error::ExitCode,
        exec::{ExecError, ExecOutput},
        vm::VmError,
    };

    #[test]
    fn outcomes_map_to_exit_codes() {
        assert_eq!(exit_code::<(), ShimError>(&Ok(())), ExitCode::Success);
        assert_eq!(
            exit_code::<(), _>(&Err(ShimError::VmError(VmError::StartTimeout(std::time::Duration::ZERO)))),
            ExitCode::Timeout
        );
        assert_eq!(exit_code::<(), _>(&Err(ShimError::NotCreated)), ExitCode::BootFailure);
        assert_eq!(
            exit_code::<(), _>(&Err(ShimError::VmError(VmError::ExecError(ExecError::Canceled)))),
            ExitCode::Canceled
        );
    }

    #[test]
    fn failed_guest_commands_exit_with_three() {
        let output = ExecOutput {
            stdout: Bytes::new(),
            stderr: Bytes::from_static(b"not found"),
            exit_code: 127,
        };
        assert_eq!(exec_exit_code(&Ok(output)).code(), 3);
    }
}
