use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use super::NetworkError;

const MATCH_TIMEOUT: Duration = Duration::from_secs(5);
const PEEK_INTERVAL: Duration = Duration::from_millis(10);
const PEEK_BUFFER_LEN: usize = 64;

/// How a host connection is recognized as belonging to a forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Matcher {
    /// The first bytes the client sends start with this literal.
    Prefix(Vec<u8>),
    /// Every connection.
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchOutcome {
    Match,
    NoMatch,
    NeedMore,
}

/// A forward from the reserved host port to a guest TCP port, chosen by the connection's first bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortForward {
    matcher: Matcher,
    guest_port: u16,
}

impl PortForward {
    pub fn new(matcher: Matcher, guest_port: u16) -> Self {
        Self { matcher, guest_port }
    }

    /// SSH clients announce themselves with `SSH-`; those connections go to the guest's port 22.
    pub fn ssh() -> Self {
        Self::new(Matcher::Prefix(b"SSH-".to_vec()), 22)
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn guest_port(&self) -> u16 {
        self.guest_port
    }

    fn check(&self, peeked: &[u8]) -> MatchOutcome {
        match &self.matcher {
            Matcher::Any => MatchOutcome::Match,
            Matcher::Prefix(prefix) => {
                let common = peeked.len().min(prefix.len());
                if peeked[..common] != prefix[..common] {
                    MatchOutcome::NoMatch
                } else if common == prefix.len() {
                    MatchOutcome::Match
                } else {
                    MatchOutcome::NeedMore
                }
            }
        }
    }
}

/// A host connection the switch should carry to a guest port.
#[derive(Debug)]
pub(crate) struct ForwardRequest {
    pub guest_port: u16,
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Accept host connections until canceled, handing each one that matches a forward to the switch.
pub(crate) async fn serve(
    listener: TcpListener,
    forwards: Arc<[PortForward]>,
    requests: mpsc::Sender<ForwardRequest>,
    cancel: CancellationToken,
) -> Result<(), NetworkError> {
    let mut demuxes = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = demuxes.join_next(), if !demuxes.is_empty() => continue,
            accepted = listener.accept() => accepted.map_err(NetworkError::AcceptFailed)?,
        };
        tracing::debug!(%peer, "accepted forwarded connection");
        demuxes.spawn(demux(stream, peer, forwards.clone(), requests.clone()));
    }

    demuxes.abort_all();
    Ok(())
}

async fn demux(stream: TcpStream, peer: SocketAddr, forwards: Arc<[PortForward]>, requests: mpsc::Sender<ForwardRequest>) {
    let guest_port = match select_forward(&stream, &forwards).await {
        Some(forward) => forward.guest_port,
        None => {
            tracing::debug!(%peer, "no forward matched the connection, closing it");
            return;
        }
    };

    if requests
        .send(ForwardRequest {
            guest_port,
            stream,
            peer,
        })
        .await
        .is_err()
    {
        tracing::debug!(%peer, "switch is gone, dropping forwarded connection");
    }
}

async fn select_forward<'a>(stream: &TcpStream, forwards: &'a [PortForward]) -> Option<&'a PortForward> {
    // a lone catch-all needn't wait for the client to speak
    if let [forward] = forwards {
        if forward.matcher == Matcher::Any {
            return Some(forward);
        }
    }

    let deadline = tokio::time::Instant::now() + MATCH_TIMEOUT;
    let mut buf = [0u8; PEEK_BUFFER_LEN];
    let mut last_len = 0;

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
            Ok(Ok(n)) => n,
        };

        let mut undecided = false;
        for forward in forwards {
            match forward.check(&buf[..n]) {
                MatchOutcome::Match => return Some(forward),
                MatchOutcome::NeedMore => undecided = true,
                MatchOutcome::NoMatch => {}
            }
        }
        if !undecided || n == buf.len() {
            return None;
        }

        if n == last_len {
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(PEEK_INTERVAL).await;
        }
        last_len = n;
    }
}
