use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    error::{Classify, ErrorKind, ExitCode},
    vsock::{BridgeState, VsockBridge},
};

pub mod protocol;

pub use protocol::{ExecOutput, ExecProtocolViolation, ExecRequest};
use protocol::ExecCodec;

impl ExecOutput {
    /// The facade exit code for this command's outcome.
    pub fn facade_exit_code(&self) -> ExitCode {
        if self.success() {
            ExitCode::Success
        } else {
            ExitCode::GuestExecFailed
        }
    }
}

#[derive(Debug)]
pub enum ExecError {
    NotReady,
    Protocol(ExecProtocolViolation),
    Canceled,
    ConnectionLost(std::io::Error),
    Closed,
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Protocol(err) => Some(err),
            ExecError::ConnectionLost(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::NotReady => write!(f, "The guest exec channel is not connected yet"),
            ExecError::Protocol(err) => write!(f, "The guest sent a malformed exec response: {err}"),
            ExecError::Canceled => write!(f, "The exec request was canceled"),
            ExecError::ConnectionLost(err) => write!(f, "The exec connection failed mid-request: {err}"),
            ExecError::Closed => write!(f, "The exec client was closed"),
        }
    }
}

impl Classify for ExecError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExecError::NotReady => ErrorKind::ExecNotReady,
            ExecError::Protocol(_) => ErrorKind::ExecProtocol,
            ExecError::Canceled => ErrorKind::ExecCanceled,
            ExecError::ConnectionLost(_) | ExecError::Closed => ErrorKind::ExecConnectionLost,
        }
    }
}

/// A framed exec connection plus the bookkeeping that keeps it in sync across canceled requests.
#[derive(Debug)]
pub struct ExecChannel<S> {
    framed: Framed<S, ExecCodec>,
    pending_responses: usize,
    write_in_flight: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ExecChannel<S> {
    pub fn new(stream: S) -> Self {
        Self::with_codec(stream, ExecCodec::new())
    }

    pub fn with_codec(stream: S, codec: ExecCodec) -> Self {
        Self {
            framed: Framed::new(stream, codec),
            pending_responses: 0,
            write_in_flight: false,
        }
    }

    /// Read and throw away the responses to requests whose callers gave up.
    async fn resynchronize(&mut self) -> Result<(), ExecError> {
        while self.pending_responses > 0 {
            match self.framed.next().await {
                Some(Ok(_)) => self.pending_responses -= 1,
                Some(Err(err)) => return Err(ExecError::ConnectionLost(err)),
                None => return Err(ExecError::ConnectionLost(std::io::ErrorKind::UnexpectedEof.into())),
            }
        }
        Ok(())
    }

    async fn round_trip(&mut self, command: &str) -> Result<ExecOutput, ExecError> {
        self.resynchronize().await?;

        self.write_in_flight = true;
        self.framed
            .send(ExecRequest::new(command))
            .await
            .map_err(ExecError::ConnectionLost)?;
        self.write_in_flight = false;
        self.pending_responses += 1;

        match self.framed.next().await {
            Some(Ok(response)) => {
                self.pending_responses -= 1;
                response.map_err(ExecError::Protocol)
            }
            Some(Err(err)) => Err(ExecError::ConnectionLost(err)),
            None => Err(ExecError::ConnectionLost(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

/// Runs commands in the guest over the bridge's exec connection, one at a time in arrival order.
#[derive(Debug)]
pub struct GuestExecClient<S: Send + 'static> {
    bridge: Arc<VsockBridge<ExecChannel<S>>>,
    closed: CancellationToken,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> GuestExecClient<S> {
    pub fn new(bridge: Arc<VsockBridge<ExecChannel<S>>>) -> Self {
        Self {
            bridge,
            closed: CancellationToken::new(),
        }
    }

    pub fn bridge(&self) -> &Arc<VsockBridge<ExecChannel<S>>> {
        &self.bridge
    }

    /// Run `command` and return its complete output. Fails with [ExecError::NotReady] unless the bridge is
    /// connected, and with [ExecError::Canceled] if `cancel` fires first. A canceled request's response is
    /// discarded before the next request is sent.
    pub async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ExecOutput, ExecError> {
        if self.closed.is_cancelled() {
            return Err(ExecError::Closed);
        }
        if self.bridge.state() != BridgeState::Connected {
            return Err(ExecError::NotReady);
        }

        let mut lease = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Canceled),
            _ = self.closed.cancelled() => return Err(ExecError::Closed),
            lease = self.bridge.lease() => lease.map_err(|_| ExecError::NotReady)?,
        };

        if lease.stream().write_in_flight {
            // an abandoned request left a partial frame on the wire
            lease.mark_disconnected();
            return Err(ExecError::ConnectionLost(std::io::ErrorKind::BrokenPipe.into()));
        }

        let channel = lease.stream();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Canceled),
            _ = self.closed.cancelled() => Err(ExecError::Closed),
            _ = self.bridge.wait_closed() => Err(ExecError::Closed),
            result = channel.round_trip(command) => result,
        };

        let torn_write = lease.stream().write_in_flight;
        match result {
            Err(ExecError::Canceled) | Err(ExecError::Closed) if torn_write => {
                tracing::debug!(port = self.bridge.port(), "exec interrupted mid-write, dropping connection");
                let err = if self.closed.is_cancelled() { ExecError::Closed } else { ExecError::Canceled };
                lease.mark_disconnected();
                Err(err)
            }
            Err(ExecError::ConnectionLost(err)) => {
                tracing::warn!(port = self.bridge.port(), error = %err, "exec connection lost");
                lease.mark_disconnected();
                Err(ExecError::ConnectionLost(err))
            }
            Err(ExecError::Protocol(violation)) => {
                tracing::warn!(port = self.bridge.port(), error = %violation, "malformed exec response");
                if matches!(violation, ExecProtocolViolation::TruncatedStream { .. }) {
                    lease.mark_disconnected();
                }
                Err(ExecError::Protocol(violation))
            }
            other => {
                if let Ok(ref output) = other {
                    tracing::debug!(
                        command,
                        exit_code = output.exit_code,
                        stdout_len = output.stdout.len(),
                        stderr_len = output.stderr.len(),
                        "exec finished"
                    );
                }
                other
            }
        }
    }

    /// [GuestExecClient::exec] with a deadline instead of a token.
    pub async fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<ExecOutput, ExecError> {
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        tokio::select! {
            result = self.exec(command, &cancel) => result,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                Err(ExecError::Canceled)
            }
        }
    }

    /// Fail every current and future request with [ExecError::Closed].
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches::assert_matches;
    use futures_util::{FutureExt, SinkExt, StreamExt};
    use tokio::{
        io::{AsyncWriteExt, DuplexStream},
        sync::mpsc,
    };
    use tokio_util::{codec::Framed, sync::CancellationToken};

    use super::{ExecChannel, ExecError, ExecOutput, GuestExecClient, protocol::GuestCodec};
    use crate::vsock::{BridgeState, VsockBridge};

    /// A bridge whose every dial hands out one end of a fresh duplex pipe, the other end going to `guests`.
    fn duplex_bridge() -> (Arc<VsockBridge<ExecChannel<DuplexStream>>>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = VsockBridge::new(
            2019,
            Box::new(move |_port| {
                let (host, guest) = tokio::io::duplex(64 * 1024);
                let _ = tx.send(guest);
                async move { Ok(ExecChannel::new(host)) }.boxed()
            }),
        );
        (Arc::new(bridge), rx)
    }

    async fn echo_guest(stream: DuplexStream, delay: Duration) {
        let mut framed = Framed::new(stream, GuestCodec::new());
        while let Some(Ok(request)) = framed.next().await {
            tokio::time::sleep(delay).await;
            let output = ExecOutput {
                stdout: format!("{}\n", request.command).into_bytes().into(),
                stderr: bytes::Bytes::new(),
                exit_code: 0,
            };
            if framed.send(output).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn exec_before_connect_is_not_ready() {
        let (bridge, _guests) = duplex_bridge();
        let client = GuestExecClient::new(bridge);
        assert_matches!(
            client.exec("true", &CancellationToken::new()).await,
            Err(ExecError::NotReady)
        );
    }

    #[tokio::test]
    async fn canceled_request_does_not_leak_into_the_next() {
        let (bridge, mut guests) = duplex_bridge();
        bridge.dial(Duration::from_secs(1)).await.unwrap();
        tokio::spawn(echo_guest(guests.recv().await.unwrap(), Duration::from_millis(200)));
        let client = GuestExecClient::new(bridge);

        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });
        assert_matches!(client.exec("first", &cancel).await, Err(ExecError::Canceled));

        let output = client.exec("second", &CancellationToken::new()).await.unwrap();
        assert_eq!(&output.stdout[..], b"second\n");
        assert_eq!(client.bridge().state(), BridgeState::Connected);
    }

    #[tokio::test]
    async fn guest_hangup_loses_the_connection() {
        let (bridge, mut guests) = duplex_bridge();
        bridge.dial(Duration::from_secs(1)).await.unwrap();
        let mut guest = guests.recv().await.unwrap();
        let client = GuestExecClient::new(bridge.clone());

        let hangup = tokio::spawn(async move {
            guest.write_all(&[0, 0, 0, 9, 0, 0]).await.unwrap();
            drop(guest);
        });
        let result = client.exec("anything", &CancellationToken::new()).await;
        hangup.await.unwrap();
        assert_matches!(result, Err(ExecError::Protocol(_)) | Err(ExecError::ConnectionLost(_)));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        assert_matches!(
            client.exec("again", &CancellationToken::new()).await,
            Err(ExecError::NotReady)
        );
    }

    #[tokio::test]
    async fn closed_client_rejects_requests() {
        let (bridge, _guests) = duplex_bridge();
        let client = GuestExecClient::new(bridge);
        client.close();
        assert_matches!(
            client.exec("true", &CancellationToken::new()).await,
            Err(ExecError::Closed)
        );
    }
}
