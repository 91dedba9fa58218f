//! A DHCP server with exactly one static lease.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::{GATEWAY_IP, GUEST_IP, MTU, MacAddress, subnet};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const BOOTP_HEADER_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const MIN_REPLY_LEN: usize = 300;
const LEASE_SECONDS: u32 = 3600;

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_MTU: u8 = 26;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_DOMAIN_SEARCH: u8 = 119;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
            MessageType::Inform => 8,
        }
    }
}

/// The fields of a client message the server looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientMessage<'a> {
    header: &'a [u8],
    client_mac: MacAddress,
    message_type: MessageType,
    requested_ip: Option<Ipv4Addr>,
}

fn parse_client_message(packet: &[u8]) -> Option<ClientMessage<'_>> {
    if packet.len() < BOOTP_HEADER_LEN + MAGIC_COOKIE.len() || packet[0] != OP_REQUEST {
        return None;
    }
    // ethernet hardware with 6-byte addresses only
    if packet[1] != 1 || packet[2] != 6 || packet[BOOTP_HEADER_LEN..BOOTP_HEADER_LEN + 4] != MAGIC_COOKIE {
        return None;
    }

    let mut client_mac = [0u8; 6];
    client_mac.copy_from_slice(&packet[28..34]);

    let mut message_type = None;
    let mut requested_ip = None;
    let mut options = &packet[BOOTP_HEADER_LEN + 4..];
    while let Some((&code, rest)) = options.split_first() {
        match code {
            OPT_PAD => {
                options = rest;
                continue;
            }
            OPT_END => break,
            _ => {}
        }
        let (&len, rest) = rest.split_first()?;
        let value = rest.get(..len as usize)?;
        match code {
            OPT_MESSAGE_TYPE if len == 1 => message_type = MessageType::from_u8(value[0]),
            OPT_REQUESTED_IP if len == 4 => requested_ip = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3])),
            _ => {}
        }
        options = &rest[len as usize..];
    }

    Some(ClientMessage {
        header: &packet[..BOOTP_HEADER_LEN],
        client_mac: MacAddress(client_mac),
        message_type: message_type?,
        requested_ip,
    })
}

/// Encode domain names as an RFC 1035 name sequence, the payload of option 119 (RFC 3397). No compression is
/// applied.
pub fn encode_search_domains(domains: &[String]) -> Vec<u8> {
    let mut encoded = Vec::new();
    for domain in domains {
        for label in domain.trim_end_matches('.').split('.').filter(|label| !label.is_empty()) {
            let label = &label.as_bytes()[..label.len().min(63)];
            encoded.push(label.len() as u8);
            encoded.extend_from_slice(label);
        }
        encoded.push(0);
    }
    encoded
}

fn put_option(buf: &mut BytesMut, code: u8, value: &[u8]) {
    // values over 255 bytes are split into consecutive instances (RFC 3396)
    for chunk in value.chunks(u8::MAX as usize) {
        buf.put_u8(code);
        buf.put_u8(chunk.len() as u8);
        buf.put_slice(chunk);
    }
}

/// Serves a single static lease of [GUEST_IP] to one MAC address, with the gateway as router and nameserver.
#[derive(Debug, Clone)]
pub struct DhcpServer {
    lease_mac: MacAddress,
    search_domains: Vec<String>,
}

impl DhcpServer {
    pub fn new(lease_mac: MacAddress, search_domains: Vec<String>) -> Self {
        Self {
            lease_mac,
            search_domains,
        }
    }

    /// Produce the reply to a client message, if it deserves one.
    pub fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let message = parse_client_message(packet)?;
        if message.client_mac != self.lease_mac {
            tracing::debug!(mac = %message.client_mac, "ignoring DHCP client without a lease");
            return None;
        }

        let reply_type = match message.message_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => match message.requested_ip {
                Some(ip) if ip != GUEST_IP => MessageType::Nak,
                _ => MessageType::Ack,
            },
            MessageType::Inform => MessageType::Ack,
            _ => return None,
        };
        tracing::debug!(request = ?message.message_type, reply = ?reply_type, "answering DHCP client");

        Some(self.build_reply(&message, reply_type))
    }

    fn build_reply(&self, message: &ClientMessage<'_>, reply_type: MessageType) -> Vec<u8> {
        let header = message.header;
        let mut buf = BytesMut::with_capacity(MIN_REPLY_LEN + 64);
        buf.put_u8(OP_REPLY);
        buf.put_u8(1);
        buf.put_u8(6);
        buf.put_u8(0);
        // xid, then secs zeroed, then the client's flags
        buf.put_slice(&header[4..8]);
        buf.put_u16(0);
        buf.put_slice(&header[10..12]);
        buf.put_slice(&header[12..16]);
        let your_ip = match reply_type {
            MessageType::Offer | MessageType::Ack if message.message_type != MessageType::Inform => GUEST_IP,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        buf.put_slice(&your_ip.octets());
        buf.put_slice(&GATEWAY_IP.octets());
        buf.put_slice(&header[24..28]);
        buf.put_slice(&header[28..44]);
        buf.put_bytes(0, 64 + 128);
        buf.put_slice(&MAGIC_COOKIE);

        put_option(&mut buf, OPT_MESSAGE_TYPE, &[reply_type.to_u8()]);
        put_option(&mut buf, OPT_SERVER_ID, &GATEWAY_IP.octets());
        if reply_type != MessageType::Nak {
            if message.message_type != MessageType::Inform {
                put_option(&mut buf, OPT_LEASE_TIME, &LEASE_SECONDS.to_be_bytes());
            }
            put_option(&mut buf, OPT_SUBNET_MASK, &subnet().mask().octets());
            put_option(&mut buf, OPT_ROUTER, &GATEWAY_IP.octets());
            put_option(&mut buf, OPT_DNS, &GATEWAY_IP.octets());
            put_option(&mut buf, OPT_MTU, &(MTU as u16).to_be_bytes());
            if !self.search_domains.is_empty() {
                put_option(&mut buf, OPT_DOMAIN_SEARCH, &encode_search_domains(&self.search_domains));
            }
        }
        buf.put_u8(OPT_END);
        if buf.len() < MIN_REPLY_LEN {
            let padding = MIN_REPLY_LEN - buf.len();
            buf.put_bytes(OPT_PAD, padding);
        }

        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::{DhcpServer, MAGIC_COOKIE, encode_search_domains};
    use crate::network::{GATEWAY_IP, GUEST_IP, GUEST_MAC, MacAddress};

    fn client_message(mac: MacAddress, message_type: u8, requested: Option<Ipv4Addr>) -> Vec<u8> {
        let mut packet = vec![0u8; 236];
        packet[0] = 1;
        packet[1] = 1;
        packet[2] = 6;
        packet[4..8].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        packet[10] = 0x80;
        packet[28..34].copy_from_slice(&mac.octets());
        packet.extend_from_slice(&MAGIC_COOKIE);
        packet.extend_from_slice(&[53, 1, message_type]);
        if let Some(ip) = requested {
            packet.extend_from_slice(&[50, 4]);
            packet.extend_from_slice(&ip.octets());
        }
        packet.push(255);
        packet
    }

    fn option(reply: &[u8], code: u8) -> Option<Vec<u8>> {
        let mut options = &reply[240..];
        let mut found: Option<Vec<u8>> = None;
        while let Some((&c, rest)) = options.split_first() {
            if c == 255 {
                break;
            }
            if c == 0 {
                options = rest;
                continue;
            }
            let len = rest[0] as usize;
            if c == code {
                found.get_or_insert_with(Vec::new).extend_from_slice(&rest[1..1 + len]);
            }
            options = &rest[1 + len..];
        }
        found
    }

    #[test]
    fn offers_and_acks_the_static_lease() {
        let server = DhcpServer::new(GUEST_MAC, vec!["corp.example".into()]);

        let offer = server.handle(&client_message(GUEST_MAC, 1, None)).unwrap();
        assert!(offer.len() >= 300);
        assert_eq!(offer[0], 2);
        assert_eq!(&offer[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&offer[16..20], &GUEST_IP.octets());
        assert_eq!(option(&offer, 53).unwrap(), vec![2]);
        assert_eq!(option(&offer, 3).unwrap(), GATEWAY_IP.octets().to_vec());
        assert_eq!(option(&offer, 6).unwrap(), GATEWAY_IP.octets().to_vec());
        assert_eq!(option(&offer, 1).unwrap(), vec![255, 255, 255, 0]);
        assert_eq!(option(&offer, 119).unwrap(), encode_search_domains(&["corp.example".into()]));

        let ack = server.handle(&client_message(GUEST_MAC, 3, Some(GUEST_IP))).unwrap();
        assert_eq!(option(&ack, 53).unwrap(), vec![5]);
    }

    #[test]
    fn naks_foreign_addresses_and_ignores_foreign_macs() {
        let server = DhcpServer::new(GUEST_MAC, Vec::new());
        let nak = server
            .handle(&client_message(GUEST_MAC, 3, Some(Ipv4Addr::new(10, 0, 0, 9))))
            .unwrap();
        assert_eq!(option(&nak, 53).unwrap(), vec![6]);
        assert!(option(&nak, 3).is_none());

        let stranger = MacAddress([2, 0, 0, 0, 0, 1]);
        assert!(server.handle(&client_message(stranger, 1, None)).is_none());
    }

    #[test]
    fn search_domains_use_label_encoding() {
        let encoded = encode_search_domains(&["a.example.".into(), "b".into()]);
        assert_eq!(encoded, b"\x01a\x07example\x00\x01b\x00".to_vec());
    }

    #[test]
    fn long_search_lists_span_several_options() {
        let domains = (0..20).map(|i| format!("domain-{i}.corp.example")).collect::<Vec<_>>();
        let server = DhcpServer::new(GUEST_MAC, domains.clone());
        let offer = server.handle(&client_message(GUEST_MAC, 1, None)).unwrap();
        assert_eq!(option(&offer, 119).unwrap(), encode_search_domains(&domains));
    }
}
