use std::{future::Future, path::Path, process::Stdio};

use tokio::process::{Child, Command};

/// A [ProcessSpawner] launches hypervisor helper processes (such as `vfkit`) from a binary path and arguments.
/// Implementations may wrap the invocation, for example to run it under a sandbox profile or a different user.
pub trait ProcessSpawner: Send + Sync + 'static {
    /// Spawn the process. With `pipes_to_null` its standard streams are discarded, otherwise they're piped.
    fn spawn(
        &self,
        binary_path: &Path,
        arguments: Vec<String>,
        pipes_to_null: bool,
    ) -> impl Future<Output = Result<Child, std::io::Error>> + Send;
}

/// A [ProcessSpawner] that directly invokes the binary. The child is killed when its handle is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectProcessSpawner;

#[inline(always)]
fn get_stdio(pipes_to_null: bool) -> Stdio {
    if pipes_to_null {
        Stdio::null()
    } else {
        Stdio::piped()
    }
}

impl ProcessSpawner for DirectProcessSpawner {
    async fn spawn(&self, path: &Path, arguments: Vec<String>, pipes_to_null: bool) -> Result<Child, std::io::Error> {
        tracing::debug!(binary = %path.display(), arguments = arguments.len(), "spawning process");
        let mut command = Command::new(path);
        command
            .args(arguments)
            .stderr(get_stdio(pipes_to_null))
            .stdout(get_stdio(pipes_to_null))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command.spawn()
    }
}
