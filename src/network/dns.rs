//! The gateway's DNS server: authoritative for the local zones, a forwarder for everything else.

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;

use super::{GATEWAY_IP, HOST_VIRTUAL_IP};

pub const DNS_PORT: u16 = 53;
pub const LOCAL_ZONES: [&str; 2] = ["containers.internal.", "docker.internal."];

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const LOCAL_TTL: u32 = 60;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE_LEN: usize = 4096;

const RCODE_NOERROR: u8 = 0;
const RCODE_SERVFAIL: u8 = 2;
const RCODE_NXDOMAIN: u8 = 3;

/// A parsed single-question query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Lowercased, with a trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// The raw question section, echoed into replies.
    raw_end: usize,
}

pub fn parse_question(query: &[u8]) -> Option<Question> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let is_response = query[2] & 0x80 != 0;
    let opcode = (query[2] >> 3) & 0x0f;
    let question_count = u16::from_be_bytes([query[4], query[5]]);
    if is_response || opcode != 0 || question_count != 1 {
        return None;
    }

    let mut name = String::new();
    let mut offset = HEADER_LEN;
    loop {
        let len = *query.get(offset)? as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        // compression pointers never appear in a question we accept
        if len > 63 {
            return None;
        }
        let label = query.get(offset..offset + len)?;
        name.push_str(&String::from_utf8_lossy(label).to_ascii_lowercase());
        name.push('.');
        offset += len;
    }
    if name.is_empty() {
        name.push('.');
    }

    let fixed = query.get(offset..offset + 4)?;
    Some(Question {
        name,
        qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
        qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        raw_end: offset + 4,
    })
}

/// The outcome of looking a name up in the local zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAnswer {
    /// The name is local and has this address.
    Address(Ipv4Addr),
    /// The name is local but has no record of the asked type.
    NoData,
    /// The name is inside a local zone but doesn't exist.
    NxDomain,
}

/// Look `name` (lowercase, trailing dot) up in the local zones. `None` means the name isn't local.
pub fn lookup_local(name: &str, qtype: u16) -> Option<LocalAnswer> {
    let zone = LOCAL_ZONES
        .iter()
        .find(|zone| name == **zone || name.ends_with(&format!(".{zone}")))?;
    let host = name.strip_suffix(zone).map(|host| host.trim_end_matches('.'));
    let address = match host {
        Some("gateway") => GATEWAY_IP,
        Some("host") => HOST_VIRTUAL_IP,
        Some("") => return Some(LocalAnswer::NoData),
        _ => return Some(LocalAnswer::NxDomain),
    };
    if qtype == TYPE_A || qtype == TYPE_ANY {
        Some(LocalAnswer::Address(address))
    } else {
        Some(LocalAnswer::NoData)
    }
}

fn build_reply(query: &[u8], question: &Question, rcode: u8, answer: Option<Ipv4Addr>, authoritative: bool) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(question.raw_end + 16);
    buf.put_slice(&query[..2]);
    let recursion_desired = query[2] & 0x01;
    let authoritative = if authoritative { 0x04 } else { 0 };
    buf.put_u8(0x80 | authoritative | recursion_desired);
    buf.put_u8(0x80 | (rcode & 0x0f));
    buf.put_u16(1);
    buf.put_u16(u16::from(answer.is_some()));
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_slice(&query[HEADER_LEN..question.raw_end]);
    if let Some(address) = answer {
        // pointer to the question name
        buf.put_u16(0xc000 | HEADER_LEN as u16);
        buf.put_u16(TYPE_A);
        buf.put_u16(CLASS_IN);
        buf.put_u32(LOCAL_TTL);
        buf.put_u16(4);
        buf.put_slice(&address.octets());
    }
    buf.to_vec()
}

/// What to do with a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A complete reply, answered locally.
    Reply(Vec<u8>),
    /// The query must be forwarded upstream.
    Forward,
    /// The query is malformed and gets no reply.
    Drop,
}

#[derive(Debug, Clone)]
pub struct DnsServer {
    upstream: Option<SocketAddr>,
}

impl DnsServer {
    pub fn new(upstream: Option<SocketAddr>) -> Self {
        Self { upstream }
    }

    pub fn upstream(&self) -> Option<SocketAddr> {
        self.upstream
    }

    /// Answer a query from the local zones when possible.
    pub fn resolve_local(&self, query: &[u8]) -> Resolution {
        let Some(question) = parse_question(query) else {
            return Resolution::Drop;
        };
        if question.qclass != CLASS_IN && question.qclass != TYPE_ANY {
            return Resolution::Forward;
        }

        match lookup_local(&question.name, question.qtype) {
            Some(LocalAnswer::Address(address)) => {
                tracing::trace!(name = question.name, %address, "answering local DNS name");
                Resolution::Reply(build_reply(query, &question, RCODE_NOERROR, Some(address), true))
            }
            Some(LocalAnswer::NoData) => Resolution::Reply(build_reply(query, &question, RCODE_NOERROR, None, true)),
            Some(LocalAnswer::NxDomain) => {
                Resolution::Reply(build_reply(query, &question, RCODE_NXDOMAIN, None, true))
            }
            None if self.upstream.is_none() => {
                Resolution::Reply(build_reply(query, &question, RCODE_SERVFAIL, None, false))
            }
            None => Resolution::Forward,
        }
    }

    /// Send a query to the upstream nameserver and return its reply, or a SERVFAIL if it can't be reached.
    pub async fn forward(&self, query: &[u8]) -> Option<Vec<u8>> {
        let question = parse_question(query)?;
        match self.try_forward(query).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                tracing::debug!(name = question.name, error = %err, "upstream DNS query failed");
                Some(build_reply(query, &question, RCODE_SERVFAIL, None, false))
            }
        }
    }

    async fn try_forward(&self, query: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let upstream = self
            .upstream
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no upstream nameserver"))?;
        let bind_addr: SocketAddr = match upstream {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_MESSAGE_LEN];
        tokio::time::timeout(UPSTREAM_TIMEOUT, async {
            loop {
                let n = socket.recv(&mut buf).await?;
                // stale replies for other ids are skipped
                if n >= HEADER_LEN && buf[..2] == query[..2] {
                    buf.truncate(n);
                    return Ok(buf);
                }
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream nameserver timed out"))?
    }
}

/// The gateway address the server answers on.
pub fn server_address() -> SocketAddr {
    (GATEWAY_IP, DNS_PORT).into()
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use assert_matches::assert_matches;
    use tokio::net::UdpSocket;

    use super::{DnsServer, LocalAnswer, Resolution, lookup_local, parse_question};
    use crate::network::{GATEWAY_IP, HOST_VIRTUAL_IP};

    fn query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
        let mut query = Vec::new();
        query.extend_from_slice(&id.to_be_bytes());
        query.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        for label in name.trim_end_matches('.').split('.') {
            query.push(label.len() as u8);
            query.extend_from_slice(label.as_bytes());
        }
        query.push(0);
        query.extend_from_slice(&qtype.to_be_bytes());
        query.extend_from_slice(&1u16.to_be_bytes());
        query
    }

    #[test]
    fn local_zones_resolve_case_insensitively() {
        let question = parse_question(&query(1, "Host.Docker.Internal", 1)).unwrap();
        assert_eq!(question.name, "host.docker.internal.");
        assert_eq!(
            lookup_local(&question.name, question.qtype),
            Some(LocalAnswer::Address(HOST_VIRTUAL_IP))
        );
        assert_eq!(
            lookup_local("gateway.containers.internal.", 1),
            Some(LocalAnswer::Address(GATEWAY_IP))
        );
        assert_eq!(lookup_local("gateway.containers.internal.", 28), Some(LocalAnswer::NoData));
        assert_eq!(lookup_local("db.containers.internal.", 1), Some(LocalAnswer::NxDomain));
        assert_eq!(lookup_local("example.com.", 1), None);
    }

    #[test]
    fn local_reply_carries_one_a_record() {
        let server = DnsServer::new(None);
        let query = query(0x1234, "gateway.docker.internal", 1);
        let Resolution::Reply(reply) = server.resolve_local(&query) else {
            panic!("expected a local reply");
        };
        assert_eq!(&reply[..2], &[0x12, 0x34]);
        assert_eq!(reply[2] & 0x80, 0x80);
        assert_eq!(reply[3] & 0x0f, 0);
        assert_eq!(&reply[6..8], &[0, 1]);
        assert_eq!(&reply[reply.len() - 4..], &GATEWAY_IP.octets());
    }

    #[test]
    fn foreign_names_need_an_upstream() {
        let query = query(7, "example.com", 1);
        let Resolution::Reply(reply) = DnsServer::new(None).resolve_local(&query) else {
            panic!("expected SERVFAIL");
        };
        assert_eq!(reply[3] & 0x0f, 2);

        let upstream: SocketAddr = (Ipv4Addr::LOCALHOST, 53).into();
        assert_eq!(DnsServer::new(Some(upstream)).resolve_local(&query), Resolution::Forward);
        assert_matches!(DnsServer::new(None).resolve_local(&[0u8; 4]), Resolution::Drop);
    }

    #[tokio::test]
    async fn forwards_to_upstream() {
        let upstream = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply[2] |= 0x80;
            upstream.send_to(&reply, peer).await.unwrap();
        });

        let server = DnsServer::new(Some(upstream_addr));
        let query = query(99, "example.com", 1);
        let reply = server.forward(&query).await.unwrap();
        assert_eq!(&reply[..2], &99u16.to_be_bytes());
        assert_eq!(reply[2] & 0x80, 0x80);
    }
}
