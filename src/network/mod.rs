//! The guest's user-space network.
//!
//! The VM gets one end of a connected datagram socket pair, each datagram carrying one Ethernet frame. The other
//! end feeds an in-process smoltcp interface that acts as the guest's gateway: it hands out a static DHCP lease,
//! answers DNS for the local zones, NATs the host-virtual address onto loopback and forwards a reserved host TCP
//! port into the guest.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use cidr::Ipv4Cidr;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Classify, ErrorKind},
    port::reserve_port,
};

pub mod dhcp;
pub mod dns;
pub mod forward;
pub mod resolv;
pub mod socketpair;
mod switch;

use forward::PortForward;
use resolv::ResolverConfig;
use socketpair::GuestNetEndpoint;

pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 1);
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 2);
/// Guest connections to this address reach the host's loopback.
pub const HOST_VIRTUAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 254);
pub const SUBNET_PREFIX_LEN: u8 = 24;
pub const GUEST_MAC: MacAddress = MacAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee]);
pub const GATEWAY_MAC: MacAddress = MacAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd]);
pub const MTU: usize = 1500;
/// Unix socket paths of this many bytes or more cannot be bound on macOS.
pub const MAX_DATAGRAM_PATH_LEN: usize = 104;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The guest subnet, `192.168.127.0/24`.
pub fn subnet() -> Ipv4Cidr {
    Ipv4Cidr::new(Ipv4Addr::new(192, 168, 127, 0), SUBNET_PREFIX_LEN).unwrap_or_else(|_| Ipv4Cidr::new_host(GATEWAY_IP))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl std::str::FromStr for MacAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetworkError::InvalidMacAddress(s.to_owned()))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| NetworkError::InvalidMacAddress(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(NetworkError::InvalidMacAddress(s.to_owned()));
        }
        Ok(MacAddress(octets))
    }
}

#[derive(Debug)]
pub enum NetworkError {
    AlreadyBound,
    DatagramPathTooLong(PathBuf),
    InvalidMacAddress(String),
    SocketPairFailed(nix::Error),
    PortReservationFailed(std::io::Error),
    BindFailed(std::io::Error),
    AcceptFailed(std::io::Error),
    SwitchIoError(std::io::Error),
}

impl NetworkError {
    /// The short tag naming this failure.
    pub fn tag(&self) -> &'static str {
        match self {
            NetworkError::AlreadyBound => "network-already-bound",
            NetworkError::DatagramPathTooLong(_) => "dgram-path-too-long",
            NetworkError::AcceptFailed(_) => "switch-accept-failed",
            _ => "network-setup-failed",
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::SocketPairFailed(err) => Some(err),
            NetworkError::PortReservationFailed(err)
            | NetworkError::BindFailed(err)
            | NetworkError::AcceptFailed(err)
            | NetworkError::SwitchIoError(err) => Some(err),
            _ => None,
        }
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::AlreadyBound => write!(f, "The guest network endpoint was already handed to a VM"),
            NetworkError::DatagramPathTooLong(path) => write!(
                f,
                "The datagram socket path {} is {} bytes long, the limit is {} bytes",
                path.display(),
                path.as_os_str().len(),
                MAX_DATAGRAM_PATH_LEN - 1
            ),
            NetworkError::InvalidMacAddress(mac) => write!(f, "\"{mac}\" is not a valid MAC address"),
            NetworkError::SocketPairFailed(err) => write!(f, "Creating the datagram socket pair failed: {err}"),
            NetworkError::PortReservationFailed(err) => write!(f, "Reserving a host port failed: {err}"),
            NetworkError::BindFailed(err) => write!(f, "Binding the port-forwarding listener failed: {err}"),
            NetworkError::AcceptFailed(err) => write!(f, "The switch failed to accept a host connection: {err}"),
            NetworkError::SwitchIoError(err) => write!(f, "The switch's guest socket failed: {err}"),
        }
    }
}

impl Classify for NetworkError {
    fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::InvalidMacAddress(_) => ErrorKind::ConfigInvalid,
            _ => ErrorKind::NetworkSetupFailed,
        }
    }
}

/// Reject unix datagram socket paths the host cannot bind.
pub fn validate_datagram_path(path: &Path) -> Result<(), NetworkError> {
    if path.as_os_str().len() >= MAX_DATAGRAM_PATH_LEN {
        return Err(NetworkError::DatagramPathTooLong(path.to_owned()));
    }
    Ok(())
}

/// Settings for a [VirtualNetwork].
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    forwards: Vec<PortForward>,
    search_domains: Vec<String>,
    upstream_dns: Option<SocketAddr>,
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take search domains and the upstream nameserver from the host resolver configuration, clamping the search
    /// list to what the macOS resolver accepts.
    pub async fn from_host() -> Self {
        let resolver = ResolverConfig::from_host().await;
        let search_domains = if cfg!(target_os = "macos") {
            resolv::clamp_search_domains(
                &resolver.search,
                resolv::MACOS_MAX_SEARCH_DOMAINS,
                resolv::MACOS_MAX_SEARCH_CHARS,
            )
        } else {
            resolver.search.clone()
        };

        Self {
            forwards: Vec::new(),
            search_domains,
            upstream_dns: resolver.upstream(),
        }
    }

    pub fn forwards(mut self, forwards: impl IntoIterator<Item = PortForward>) -> Self {
        self.forwards.extend(forwards);
        self
    }

    pub fn search_domains(mut self, search_domains: Vec<String>) -> Self {
        self.search_domains = search_domains;
        self
    }

    pub fn upstream_dns(mut self, upstream_dns: SocketAddr) -> Self {
        self.upstream_dns = Some(upstream_dns);
        self
    }

    pub fn get_search_domains(&self) -> &[String] {
        &self.search_domains
    }
}

/// A running guest network: the switch task, the optional port-forwarding listener and the guest's end of the
/// socket pair until it's taken.
#[derive(Debug)]
pub struct VirtualNetwork {
    guest_endpoint: Mutex<Option<GuestNetEndpoint>>,
    host_port: Option<u16>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    failure: watch::Receiver<Option<Arc<NetworkError>>>,
}

impl VirtualNetwork {
    /// Create the socket pair, start the switch and, if any forwards are configured, reserve a host port and
    /// listen on it.
    pub async fn start(config: NetworkConfig) -> Result<Self, NetworkError> {
        let (guest_endpoint, switch_socket) = socketpair::datagram_pair()?;
        let cancel = CancellationToken::new();
        let (failure_tx, failure_rx) = watch::channel(None);
        let failure_tx = Arc::new(failure_tx);
        let (forward_tx, forward_rx) = tokio::sync::mpsc::channel(64);
        let mut tasks = JoinSet::new();

        let host_port = if config.forwards.is_empty() {
            None
        } else {
            let port = reserve_port()?;
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
                .await
                .map_err(NetworkError::BindFailed)?;
            let forwards: Arc<[PortForward]> = config.forwards.clone().into();
            let cancel = cancel.clone();
            let failure_tx = failure_tx.clone();
            tasks.spawn(async move {
                if let Err(err) = forward::serve(listener, forwards, forward_tx, cancel.clone()).await {
                    tracing::error!(error = %err, "port forwarder failed");
                    failure_tx.send_replace(Some(Arc::new(err)));
                    cancel.cancel();
                }
            });
            Some(port)
        };

        let switch = switch::Switch::new(
            switch_socket,
            forward_rx,
            dhcp::DhcpServer::new(GUEST_MAC, config.search_domains.clone()),
            dns::DnsServer::new(config.upstream_dns),
            cancel.clone(),
        );
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(err) = switch.run().await {
                    tracing::error!(error = %err, "switch failed");
                    failure_tx.send_replace(Some(Arc::new(err)));
                    cancel.cancel();
                }
            });
        }

        tracing::info!(
            host_port,
            search_domains = config.search_domains.len(),
            "virtual network started"
        );

        Ok(Self {
            guest_endpoint: Mutex::new(Some(guest_endpoint)),
            host_port,
            cancel,
            tasks: tokio::sync::Mutex::new(tasks),
            failure: failure_rx,
        })
    }

    /// Hand the guest's end of the socket pair over. It can be taken exactly once.
    pub fn take_guest_endpoint(&self) -> Result<GuestNetEndpoint, NetworkError> {
        self.guest_endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(NetworkError::AlreadyBound)
    }

    /// The reserved host port the forwarders listen on, if any forwards were configured.
    pub fn host_port(&self) -> Option<u16> {
        self.host_port
    }

    /// Observe switch failures. The value becomes `Some` once and stays that way.
    pub fn subscribe_failure(&self) -> watch::Receiver<Option<Arc<NetworkError>>> {
        self.failure.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the listener and the switch, then wait a bounded time for in-flight copies to drain.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("network tasks did not drain in time, aborting them");
            tasks.abort_all();
        }
        drop(self.take_guest_endpoint());
        tracing::debug!("virtual network closed");
    }
}

impl Drop for VirtualNetwork {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
