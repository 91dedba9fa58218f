//! The user-space gateway the guest's frames land on.
//!
//! Frames are taken from the datagram socket one at a time. DHCP and DNS are answered at the frame level; every
//! other frame is fed to a smoltcp interface that owns the gateway and host-virtual addresses and accepts traffic
//! for any destination. Guest TCP connections are terminated in smoltcp and spliced onto host sockets by relay
//! tasks; host connections from the port forwarder are carried the other way.

use std::{
    collections::{HashMap, VecDeque},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use smoltcp::{
    iface::{Config, Interface, SocketHandle, SocketSet},
    phy::{self, ChecksumCapabilities, DeviceCapabilities, Medium},
    socket::tcp,
    time::Instant as SmolInstant,
    wire::{
        EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, HardwareAddress, IpAddress, IpCidr,
        IpListenEndpoint, IpProtocol, Ipv4Packet, Ipv4Repr, TcpPacket, UdpPacket, UdpRepr,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UnixDatagram},
    sync::{
        Notify,
        mpsc::{
            self,
            error::{TryRecvError, TrySendError},
        },
    },
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use super::{
    GATEWAY_IP, GATEWAY_MAC, GUEST_IP, HOST_VIRTUAL_IP, MTU, MacAddress, NetworkError, SUBNET_PREFIX_LEN,
    dhcp::{self, DhcpServer},
    dns::{self, DnsServer, Resolution},
    forward::ForwardRequest,
};

const TCP_BUFFER_LEN: usize = 64 * 1024;
const RELAY_CHANNEL_DEPTH: usize = 32;
const READ_CHUNK_LEN: usize = 16 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const IDLE_POLL: Duration = Duration::from_secs(1);
const STALE_LISTEN: Duration = Duration::from_secs(10);
const MAX_POLL_ROUNDS: usize = 16;
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;
const ETHERNET_HEADER_LEN: usize = 14;
const BROADCAST_MAC: MacAddress = MacAddress([0xff; 6]);

/// In-memory frame queues standing in for the wire.
#[derive(Debug, Default)]
struct FrameQueues {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
}

struct RxToken(Vec<u8>);

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

struct TxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.push_back(frame);
        result
    }
}

impl phy::Device for FrameQueues {
    type RxToken<'a>
        = RxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((RxToken(frame), TxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut capabilities = DeviceCapabilities::default();
        capabilities.medium = Medium::Ethernet;
        capabilities.max_transmission_unit = MTU + ETHERNET_HEADER_LEN;
        capabilities
    }
}

/// What a relay task reports about the host side of a connection.
#[derive(Debug)]
enum Upstream {
    Data(Bytes),
    Reset,
}

type FlowKey = (SocketAddrV4, SocketAddrV4);

/// The switch's half of one spliced TCP connection.
#[derive(Debug)]
struct Connection {
    to_host: Option<mpsc::Sender<Bytes>>,
    from_host: mpsc::Receiver<Upstream>,
    pending: Option<Bytes>,
    flow: Option<FlowKey>,
    established: bool,
    host_done: bool,
    close_sent: bool,
    created: std::time::Instant,
}

/// The relay task's half of one spliced TCP connection.
#[derive(Debug)]
struct HostSide {
    to_host: mpsc::Receiver<Bytes>,
    from_host: mpsc::Sender<Upstream>,
}

impl Connection {
    fn pair(flow: Option<FlowKey>) -> (Connection, HostSide) {
        let (to_host_tx, to_host_rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);
        let (from_host_tx, from_host_rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);
        (
            Connection {
                to_host: Some(to_host_tx),
                from_host: from_host_rx,
                pending: None,
                flow,
                established: false,
                host_done: false,
                close_sent: false,
                created: std::time::Instant::now(),
            },
            HostSide {
                to_host: to_host_rx,
                from_host: from_host_tx,
            },
        )
    }

    /// Move whatever can move between the smoltcp socket and the relay channels. Returns whether anything did.
    fn pump(&mut self, socket: &mut tcp::Socket<'_>) -> bool {
        let mut progressed = false;
        if socket.state() == tcp::State::Established {
            self.established = true;
        }

        let mut host_gone = false;
        if let Some(to_host) = &self.to_host {
            while socket.can_recv() {
                match to_host.try_reserve() {
                    Ok(permit) => match socket.recv(|data| (data.len(), Bytes::copy_from_slice(data))) {
                        Ok(chunk) => {
                            permit.send(chunk);
                            progressed = true;
                        }
                        Err(_) => break,
                    },
                    Err(TrySendError::Full(())) => break,
                    Err(TrySendError::Closed(())) => {
                        host_gone = true;
                        break;
                    }
                }
            }
        }
        if host_gone {
            socket.abort();
            self.to_host = None;
            return true;
        }
        // the guest sent FIN: pass the half-close on
        if self.to_host.is_some() && self.established && !socket.may_recv() {
            self.to_host = None;
            progressed = true;
        }

        loop {
            if let Some(chunk) = self.pending.take() {
                if !socket.can_send() {
                    self.pending = Some(chunk);
                    break;
                }
                match socket.send_slice(&chunk) {
                    Ok(sent) => {
                        progressed |= sent > 0;
                        if sent < chunk.len() {
                            self.pending = Some(chunk.slice(sent..));
                            break;
                        }
                    }
                    Err(_) => {
                        self.pending = Some(chunk);
                        break;
                    }
                }
                continue;
            }

            if self.host_done {
                break;
            }
            match self.from_host.try_recv() {
                Ok(Upstream::Data(chunk)) => self.pending = Some(chunk),
                Ok(Upstream::Reset) => {
                    socket.abort();
                    self.host_done = true;
                    return true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.host_done = true;
                    progressed = true;
                }
            }
        }

        if self.host_done && self.pending.is_none() && !self.close_sent {
            socket.close();
            self.close_sent = true;
            progressed = true;
        }

        progressed
    }

    fn is_finished(&self, socket: &tcp::Socket<'_>) -> bool {
        match socket.state() {
            tcp::State::Closed => true,
            tcp::State::Listen => self.created.elapsed() > STALE_LISTEN,
            _ => false,
        }
    }
}

fn new_tcp_socket() -> tcp::Socket<'static> {
    tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0; TCP_BUFFER_LEN]),
        tcp::SocketBuffer::new(vec![0; TCP_BUFFER_LEN]),
    )
}

/// Build a complete Ethernet/IPv4/UDP frame around `payload`.
pub(crate) fn udp_frame(
    src_mac: MacAddress,
    dst_mac: MacAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let ip_repr = Ipv4Repr {
        src_addr: (*src.ip()).into(),
        dst_addr: (*dst.ip()).into(),
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac.octets()),
        dst_addr: EthernetAddress(dst_mac.octets()),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut buf = vec![0u8; eth_repr.buffer_len() + ip_repr.buffer_len() + ip_repr.payload_len];
    let checksums = ChecksumCapabilities::default();
    {
        let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
        eth_repr.emit(&mut frame);
        let mut packet = Ipv4Packet::new_unchecked(frame.payload_mut());
        ip_repr.emit(&mut packet, &checksums);
        let mut datagram = UdpPacket::new_unchecked(packet.payload_mut());
        udp_repr.emit(
            &mut datagram,
            &IpAddress::Ipv4(ip_repr.src_addr),
            &IpAddress::Ipv4(ip_repr.dst_addr),
            payload.len(),
            |buf| buf.copy_from_slice(payload),
            &checksums,
        );
    }
    buf
}

/// The switch task's inputs. [Switch::run] drives it until canceled or until the guest socket fails.
pub(crate) struct Switch {
    socket: UnixDatagram,
    forwards: mpsc::Receiver<ForwardRequest>,
    dhcp: DhcpServer,
    dns: Arc<DnsServer>,
    cancel: CancellationToken,
}

struct SwitchState {
    device: FrameQueues,
    iface: Interface,
    sockets: SocketSet<'static>,
    connections: HashMap<SocketHandle, Connection>,
    flows: HashMap<FlowKey, SocketHandle>,
    next_port: u16,
    dhcp: DhcpServer,
    dns: Arc<DnsServer>,
    notify: Arc<Notify>,
    injected: mpsc::Sender<Vec<u8>>,
    relays: JoinSet<()>,
}

impl Switch {
    pub(crate) fn new(
        socket: UnixDatagram,
        forwards: mpsc::Receiver<ForwardRequest>,
        dhcp: DhcpServer,
        dns: DnsServer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            forwards,
            dhcp,
            dns: Arc::new(dns),
            cancel,
        }
    }

    pub(crate) async fn run(self) -> Result<(), NetworkError> {
        let Switch {
            socket,
            mut forwards,
            dhcp,
            dns,
            cancel,
        } = self;
        let notify = Arc::new(Notify::new());
        let (injected_tx, mut injected_rx) = mpsc::channel(RELAY_CHANNEL_DEPTH);
        let mut state = SwitchState::new(dhcp, dns, notify.clone(), injected_tx);
        let mut buf = vec![0u8; 65536];
        let mut forwards_open = true;

        let result = loop {
            state.poll();
            if let Err(err) = state.flush(&socket).await {
                break Err(err);
            }
            let delay = state.poll_delay();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => state.handle_guest_frame(&buf[..len]),
                    Err(err) => break Err(NetworkError::SwitchIoError(err)),
                },
                Some(frame) = injected_rx.recv() => state.device.tx.push_back(frame),
                request = forwards.recv(), if forwards_open => match request {
                    Some(request) => state.open_forward(request),
                    None => forwards_open = false,
                },
                _ = notify.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        };

        state.shutdown().await;
        result
    }
}

impl SwitchState {
    fn new(dhcp: DhcpServer, dns: Arc<DnsServer>, notify: Arc<Notify>, injected: mpsc::Sender<Vec<u8>>) -> Self {
        let mut device = FrameQueues::default();
        let mut config = Config::new(HardwareAddress::Ethernet(EthernetAddress(GATEWAY_MAC.octets())));
        config.random_seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();

        let mut iface = Interface::new(config, &mut device, SmolInstant::now());
        iface.update_ip_addrs(|addrs| {
            for addr in [GATEWAY_IP, HOST_VIRTUAL_IP] {
                let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(addr.into()), SUBNET_PREFIX_LEN));
            }
        });
        // a default route through our own address makes smoltcp accept traffic for every destination
        iface.set_any_ip(true);
        let _ = iface.routes_mut().add_default_ipv4_route(GATEWAY_IP.into());

        Self {
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            connections: HashMap::new(),
            flows: HashMap::new(),
            next_port: *EPHEMERAL_PORTS.start(),
            dhcp,
            dns,
            notify,
            injected,
            relays: JoinSet::new(),
        }
    }

    fn poll(&mut self) {
        while self.relays.try_join_next().is_some() {}

        for _ in 0..MAX_POLL_ROUNDS {
            let changed = self.iface.poll(SmolInstant::now(), &mut self.device, &mut self.sockets);
            let serviced = self.service();
            if !changed && !serviced {
                break;
            }
        }
    }

    fn service(&mut self) -> bool {
        let mut progressed = false;
        let mut finished = Vec::new();

        for (handle, connection) in self.connections.iter_mut() {
            let socket = self.sockets.get_mut::<tcp::Socket>(*handle);
            progressed |= connection.pump(socket);
            if connection.is_finished(socket) {
                finished.push(*handle);
            }
        }

        for handle in finished {
            self.sockets.remove(handle);
            if let Some(connection) = self.connections.remove(&handle) {
                if let Some(flow) = connection.flow {
                    self.flows.remove(&flow);
                }
            }
        }

        progressed
    }

    fn poll_delay(&mut self) -> Duration {
        self.iface
            .poll_delay(SmolInstant::now(), &self.sockets)
            .map(|delay| Duration::from_micros(delay.total_micros()))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL)
    }

    async fn flush(&mut self, socket: &UnixDatagram) -> Result<(), NetworkError> {
        while let Some(frame) = self.device.tx.pop_front() {
            if let Err(err) = socket.send(&frame).await {
                match err.kind() {
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe => return Err(NetworkError::SwitchIoError(err)),
                    _ => tracing::trace!(error = %err, len = frame.len(), "dropped frame to guest"),
                }
            }
        }
        Ok(())
    }

    fn handle_guest_frame(&mut self, frame: &[u8]) {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            return;
        };

        if eth.ethertype() == EthernetProtocol::Ipv4 {
            if let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) {
                let src_ip = Ipv4Addr::from(ip.src_addr());
                let dst_ip = Ipv4Addr::from(ip.dst_addr());
                match ip.next_header() {
                    IpProtocol::Udp => {
                        if let Ok(udp) = UdpPacket::new_checked(ip.payload()) {
                            let src_mac = MacAddress(eth.src_addr().0);
                            let src = SocketAddrV4::new(src_ip, udp.src_port());
                            let dst = SocketAddrV4::new(dst_ip, udp.dst_port());
                            if self.intercept_udp(src_mac, src, dst, udp.payload()) {
                                return;
                            }
                        }
                    }
                    IpProtocol::Tcp => {
                        if let Ok(tcp) = TcpPacket::new_checked(ip.payload()) {
                            if tcp.syn() && !tcp.ack() {
                                self.prepare_inbound(
                                    SocketAddrV4::new(src_ip, tcp.src_port()),
                                    SocketAddrV4::new(dst_ip, tcp.dst_port()),
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.device.rx.push_back(frame.to_vec());
    }

    /// Answer DHCP and DNS directly. Returns whether the datagram was consumed.
    fn intercept_udp(&mut self, src_mac: MacAddress, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> bool {
        if dst.port() == dhcp::SERVER_PORT {
            if let Some(reply) = self.dhcp.handle(payload) {
                self.device.tx.push_back(udp_frame(
                    GATEWAY_MAC,
                    BROADCAST_MAC,
                    SocketAddrV4::new(GATEWAY_IP, dhcp::SERVER_PORT),
                    SocketAddrV4::new(Ipv4Addr::BROADCAST, dhcp::CLIENT_PORT),
                    &reply,
                ));
            }
            return true;
        }

        if *dst.ip() != GATEWAY_IP || dst.port() != dns::DNS_PORT {
            return false;
        }

        match self.dns.resolve_local(payload) {
            Resolution::Reply(reply) => {
                self.device.tx.push_back(udp_frame(GATEWAY_MAC, src_mac, dst, src, &reply));
            }
            Resolution::Forward => {
                let dns = self.dns.clone();
                let injected = self.injected.clone();
                let query = payload.to_vec();
                self.relays.spawn(async move {
                    if let Some(reply) = dns.forward(&query).await {
                        let _ = injected.send(udp_frame(GATEWAY_MAC, src_mac, dst, src, &reply)).await;
                    }
                });
            }
            Resolution::Drop => {}
        }
        true
    }

    /// Get a listening socket ready for a guest SYN and start dialing the host side.
    fn prepare_inbound(&mut self, src: SocketAddrV4, dst: SocketAddrV4) {
        if self.flows.contains_key(&(src, dst)) || *dst.ip() == GATEWAY_IP {
            return;
        }

        let target = if *dst.ip() == HOST_VIRTUAL_IP {
            SocketAddr::from((Ipv4Addr::LOCALHOST, dst.port()))
        } else {
            SocketAddr::V4(dst)
        };

        let mut socket = new_tcp_socket();
        let endpoint = IpListenEndpoint {
            addr: Some(IpAddress::Ipv4((*dst.ip()).into())),
            port: dst.port(),
        };
        if let Err(err) = socket.listen(endpoint) {
            tracing::debug!(%dst, error = ?err, "cannot accept guest connection");
            return;
        }

        let handle = self.sockets.add(socket);
        let (connection, host_side) = Connection::pair(Some((src, dst)));
        self.flows.insert((src, dst), handle);
        self.connections.insert(handle, connection);
        self.relays
            .spawn(dial_and_relay(target, host_side, self.notify.clone()));
        tracing::debug!(%src, %dst, %target, "guest opened a connection");
    }

    /// Connect to the guest on behalf of a forwarded host connection.
    fn open_forward(&mut self, request: ForwardRequest) {
        let local_port = self.next_ephemeral_port();
        let mut socket = new_tcp_socket();
        let remote = (IpAddress::Ipv4(GUEST_IP.into()), request.guest_port);
        let local = (IpAddress::Ipv4(GATEWAY_IP.into()), local_port);
        if let Err(err) = socket.connect(self.iface.context(), remote, local) {
            tracing::warn!(guest_port = request.guest_port, error = ?err, "cannot connect to guest");
            return;
        }

        let handle = self.sockets.add(socket);
        let (connection, host_side) = Connection::pair(None);
        self.connections.insert(handle, connection);
        self.relays
            .spawn(relay(request.stream, host_side, self.notify.clone()));
        tracing::debug!(peer = %request.peer, guest_port = request.guest_port, "forwarding host connection");
    }

    fn next_ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port == *EPHEMERAL_PORTS.end() {
            *EPHEMERAL_PORTS.start()
        } else {
            port + 1
        };
        port
    }

    async fn shutdown(&mut self) {
        // dropping the channels lets every relay finish its buffered copy and exit
        self.connections.clear();
        self.flows.clear();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while self.relays.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            self.relays.abort_all();
        }
        tracing::debug!("switch stopped");
    }
}

async fn dial_and_relay(target: SocketAddr, host_side: HostSide, notify: Arc<Notify>) {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => relay(stream, host_side, notify).await,
        Ok(Err(err)) => {
            tracing::debug!(%target, error = %err, "host side of guest connection failed");
            let _ = host_side.from_host.send(Upstream::Reset).await;
            notify.notify_one();
        }
        Err(_) => {
            tracing::debug!(%target, "host side of guest connection timed out");
            let _ = host_side.from_host.send(Upstream::Reset).await;
            notify.notify_one();
        }
    }
}

async fn relay(stream: TcpStream, host_side: HostSide, notify: Arc<Notify>) {
    let HostSide {
        mut to_host,
        from_host,
    } = host_side;
    let (mut reader, mut writer) = stream.into_split();

    let upstream = async {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_LEN);
        loop {
            buf.reserve(READ_CHUNK_LEN);
            tokio::select! {
                _ = from_host.closed() => break,
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        if from_host.send(Upstream::Data(buf.split().freeze())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::trace!(error = %err, "host read failed");
                        let _ = from_host.send(Upstream::Reset).await;
                        break;
                    }
                },
            }
            notify.notify_one();
        }
        drop(from_host);
        notify.notify_one();
    };

    let downstream = async {
        while let Some(chunk) = to_host.recv().await {
            notify.notify_one();
            if let Err(err) = writer.write_all(&chunk).await {
                tracing::trace!(error = %err, "host write failed");
                break;
            }
        }
        drop(to_host);
        notify.notify_one();
        let _ = writer.shutdown().await;
    };

    tokio::join!(upstream, downstream);
}
