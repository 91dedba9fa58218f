//! Error classification shared by every component of the crate.
//!
//! Each component has its own error enum. All of them implement [Classify], which sorts an error into one of the
//! stable [ErrorKind]s that callers (and the shim facade's exit codes) depend on.

/// The stable category of an error, independent of which component produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing paths, duplicate tags, unsupported platform, or an operation issued in the wrong state.
    ConfigInvalid,
    /// Network or registry failure while fetching an image or artifact.
    ImageFetchFailed,
    /// Layer extraction or rootfs synthesis failure.
    ImageConvertFailed,
    /// Checksum mismatch on an embedded blob or cached artifact.
    CacheCorrupt,
    /// The hypervisor refused the configuration.
    HypervisorRejected,
    /// The hypervisor reported a runtime error.
    HypervisorError,
    /// The VM did not reach the running state in time.
    StartTimeout,
    /// Switch init, socket pair or port reservation failed.
    NetworkSetupFailed,
    /// The vsock bridge could not connect before its deadline.
    VsockUnavailable,
    ExecNotReady,
    ExecProtocol,
    ExecCanceled,
    ExecConnectionLost,
    /// Caller-driven cancellation.
    Canceled,
}

impl ErrorKind {
    /// A short tag that never changes between releases.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config-invalid",
            ErrorKind::ImageFetchFailed => "image-fetch-failed",
            ErrorKind::ImageConvertFailed => "image-convert-failed",
            ErrorKind::CacheCorrupt => "cache-corrupt",
            ErrorKind::HypervisorRejected => "hypervisor-rejected",
            ErrorKind::HypervisorError => "hypervisor-error",
            ErrorKind::StartTimeout => "start-timeout",
            ErrorKind::NetworkSetupFailed => "network-setup-failed",
            ErrorKind::VsockUnavailable => "vsock-unavailable",
            ErrorKind::ExecNotReady => "exec-not-ready",
            ErrorKind::ExecProtocol => "exec-protocol",
            ErrorKind::ExecCanceled => "exec-canceled",
            ErrorKind::ExecConnectionLost => "exec-connection-lost",
            ErrorKind::Canceled => "canceled",
        }
    }

    /// The exit code the orchestrator facade reports for a failure of this kind.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ErrorKind::StartTimeout => ExitCode::Timeout,
            ErrorKind::Canceled | ErrorKind::ExecCanceled => ExitCode::Canceled,
            _ => ExitCode::BootFailure,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Exit codes of the orchestrator facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Success,
    BootFailure,
    Timeout,
    GuestExecFailed,
    Canceled,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::BootFailure => 1,
            ExitCode::Timeout => 2,
            ExitCode::GuestExecFailed => 3,
            ExitCode::Canceled => 4,
        }
    }
}

/// Sorts an error into its [ErrorKind].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Renders an error followed by every error in its [std::error::Error::source] chain, separated by ": ".
pub struct ErrorChain<'a>(pub &'a (dyn std::error::Error + 'static));

impl std::fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorChain, ErrorKind, ExitCode};

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "outer failed")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn error_chain_joins_sources() {
        let err = Outer(std::io::Error::other("disk on fire"));
        assert_eq!(ErrorChain(&err).to_string(), "outer failed: disk on fire");
    }

    #[test]
    fn exit_codes_follow_kinds() {
        assert_eq!(ErrorKind::StartTimeout.exit_code(), ExitCode::Timeout);
        assert_eq!(ErrorKind::Canceled.exit_code().code(), 4);
        assert_eq!(ErrorKind::HypervisorRejected.exit_code().code(), 1);
        assert_eq!(ExitCode::GuestExecFailed.code(), 3);
    }

    #[test]
    fn tags_are_kebab_case() {
        for kind in [
            ErrorKind::ConfigInvalid,
            ErrorKind::VsockUnavailable,
            ErrorKind::ExecConnectionLost,
        ] {
            assert!(kind.tag().chars().all(|c| c.is_ascii_lowercase() || c == '-'));
        }
    }
}
