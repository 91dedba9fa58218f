use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    device::SerialSink,
    error::{Classify, ErrorKind},
    network::forward::PortForward,
    platform::Platform,
};

/// The guest vsock port the guest init's exec server listens on.
pub const DEFAULT_EXEC_PORT: u32 = 2019;

/// Process-level configuration shared by every VM the orchestrator launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    cache_dir: PathBuf,
    vm_root_dir: PathBuf,
    start_timeout: Duration,
    stop_timeout: Duration,
    dial_timeout: Duration,
    exec_port: u32,
}

#[derive(Debug)]
pub enum ConfigError {
    NoCacheDirectory,
    InvalidEnvironmentVariable { name: &'static str, value: String },
}

impl std::error::Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NoCacheDirectory => {
                write!(f, "No per-user cache directory could be determined for this host")
            }
            ConfigError::InvalidEnvironmentVariable { name, value } => {
                write!(f, "The environment variable {name} has an invalid value: \"{value}\"")
            }
        }
    }
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigInvalid
    }
}

impl RuntimeConfig {
    /// Create a [RuntimeConfig] rooted at the given cache directory, with VMs placed under `<cache>/vms`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            vm_root_dir: cache_dir.join("vms"),
            cache_dir,
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            exec_port: DEFAULT_EXEC_PORT,
        }
    }

    /// Create a [RuntimeConfig] rooted at the per-user cache directory of the host.
    pub fn user_default() -> Result<Self, ConfigError> {
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::NoCacheDirectory)?;
        Ok(Self::new(cache_dir.join("harpoon")))
    }

    /// Start from [RuntimeConfig::user_default] (or `HARPOON_CACHE_DIR`) and apply overrides from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("HARPOON_CACHE_DIR") {
            Some(cache_dir) => Self::new(PathBuf::from(cache_dir)),
            None => Self::user_default()?,
        };

        if let Some(vm_root_dir) = std::env::var_os("HARPOON_VM_DIR") {
            config = config.vm_root_dir(PathBuf::from(vm_root_dir));
        }

        if let Some(secs) = env_secs("HARPOON_START_TIMEOUT_SECS")? {
            config = config.start_timeout(secs);
        }

        if let Some(secs) = env_secs("HARPOON_DIAL_TIMEOUT_SECS")? {
            config = config.dial_timeout(secs);
        }

        Ok(config)
    }

    pub fn vm_root_dir(mut self, vm_root_dir: impl Into<PathBuf>) -> Self {
        self.vm_root_dir = vm_root_dir.into();
        self
    }

    pub fn start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    pub fn stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn exec_port(mut self, exec_port: u32) -> Self {
        self.exec_port = exec_port;
        self
    }

    pub fn get_cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn get_vm_root_dir(&self) -> &Path {
        &self.vm_root_dir
    }

    pub fn get_start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn get_stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn get_dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn get_exec_port(&self) -> u32 {
        self.exec_port
    }
}

fn env_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidEnvironmentVariable { name, value }),
        Err(_) => Ok(None),
    }
}

/// The caller-supplied description of a single VM: which image to run and how to size and wire the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub(crate) image_ref: String,
    pub(crate) platform: Platform,
    pub(crate) memory_bytes: u64,
    pub(crate) vcpus: u32,
    pub(crate) serial_sink: Option<SerialSink>,
    pub(crate) kernel_args: Vec<String>,
    pub(crate) init_args: Vec<String>,
    pub(crate) forwards: Vec<PortForward>,
    pub(crate) retain_workdir: bool,
}

impl ImageConfig {
    /// Create an [ImageConfig] with the serial console captured to the workdir's `console.log` and SSH forwarded.
    pub fn new(image_ref: impl Into<String>, platform: Platform, memory_bytes: u64, vcpus: u32) -> Self {
        Self {
            image_ref: image_ref.into(),
            platform,
            memory_bytes,
            vcpus,
            serial_sink: None,
            kernel_args: Vec::new(),
            init_args: Vec::new(),
            forwards: vec![PortForward::ssh()],
            retain_workdir: false,
        }
    }

    /// Route the serial console somewhere other than the workdir's `console.log`.
    pub fn serial_sink(mut self, serial_sink: SerialSink) -> Self {
        self.serial_sink = Some(serial_sink);
        self
    }

    pub fn kernel_arg(mut self, arg: impl Into<String>) -> Self {
        self.kernel_args.push(arg.into());
        self
    }

    pub fn init_arg(mut self, arg: impl Into<String>) -> Self {
        self.init_args.push(arg.into());
        self
    }

    pub fn forward(mut self, forward: PortForward) -> Self {
        self.forwards.push(forward);
        self
    }

    pub fn no_forwards(mut self) -> Self {
        self.forwards.clear();
        self
    }

    pub fn retain_workdir(mut self, retain_workdir: bool) -> Self {
        self.retain_workdir = retain_workdir;
        self
    }

    pub fn get_image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn get_platform(&self) -> Platform {
        self.platform
    }

    pub fn get_memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn get_vcpus(&self) -> u32 {
        self.vcpus
    }
}
