use pnet::packet::Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::signature::Signature;

/// Sentinel written in place of the header checksum for IPv6
pub const NO_CHECKSUM: &str = "null";

const IPV6_HEADER_WORDS: u8 = 10;
const IPV6_HEADER_BYTES: usize = 40;

/// Network-layer view of one captured frame
pub enum NetworkPacket<'a> {
    V4(Ipv4Packet<'a>),
    V6(Ipv6Packet<'a>),
}

impl<'a> NetworkPacket<'a> {
    pub fn parse_v4(data: &'a [u8]) -> Option<Self> {
        Ipv4Packet::new(data).map(NetworkPacket::V4)
    }

    pub fn parse_v6(data: &'a [u8]) -> Option<Self> {
        Ipv6Packet::new(data).map(NetworkPacket::V6)
    }

    /// Pick the decoder from the version nibble, for link types without an ethertype
    pub fn parse_raw(data: &'a [u8]) -> Option<Self> {
        match data.first().map(|b| b >> 4) {
            Some(4) => Self::parse_v4(data),
            Some(6) => Self::parse_v6(data),
            _ => None,
        }
    }
}

/// Flat feature record for one IP packet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedPacket {
    pub source_address: String,
    pub destination_address: String,
    pub ip_version: u8,
    /// Header length in 32-bit words
    pub header_length: u8,
    /// Total length in bytes, header included
    pub total_length: u32,
    pub identification: u16,
    pub fragment_offset: u16,
    /// TTL for IPv4, hop limit for IPv6
    pub time_to_live: u8,
    pub transport_protocol_id: u8,
    pub transport: String,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub header_checksum: String,
    pub payload_hex: String,
    /// Microseconds since the Unix epoch
    pub arrival_timestamp: i64,
    /// Milliseconds since the sandbox was started
    pub session_elapsed: i64,
    pub is_attack: bool,
}

/// Lowercase name of an IP protocol number, `unknown` when unmapped
pub fn protocol_name(id: u8) -> &'static str {
    match id {
        1 => "icmp",
        2 => "igmp",
        6 => "tcp",
        17 => "udp",
        41 => "ipv6",
        47 => "gre",
        50 => "esp",
        51 => "ah",
        58 => "icmpv6",
        132 => "sctp",
        _ => "unknown",
    }
}

fn transport_ports(protocol: u8, payload: &[u8]) -> (Option<u16>, Option<u16>) {
    if protocol == IpNextHeaderProtocols::Tcp.0 {
        if let Some(tcp) = TcpPacket::new(payload) {
            return (Some(tcp.get_source()), Some(tcp.get_destination()));
        }
    } else if protocol == IpNextHeaderProtocols::Udp.0 {
        if let Some(udp) = UdpPacket::new(payload) {
            return (Some(udp.get_source()), Some(udp.get_destination()));
        }
    }
    (None, None)
}

/// Build a record from a decoded packet.
///
/// Malformed headers yield `Error::Decode`; callers skip the frame.
pub fn extract(
    packet: &NetworkPacket<'_>,
    arrival_timestamp: i64,
    session_elapsed: i64,
    signature: &Signature,
) -> Result<CapturedPacket> {
    match packet {
        NetworkPacket::V4(ip) => {
            if ip.get_version() != 4 {
                return Err(Error::decode(format!(
                    "IPv4 header carries version {}",
                    ip.get_version()
                )));
            }
            let data = ip.packet();
            let header_bytes = ip.get_header_length() as usize * 4;
            if ip.get_header_length() < 5 || header_bytes > data.len() {
                return Err(Error::decode(format!(
                    "IPv4 header length {} words invalid for {} byte packet",
                    ip.get_header_length(),
                    data.len()
                )));
            }
            // Snapped captures may hold less than total_length
            let end = (ip.get_total_length() as usize).clamp(header_bytes, data.len());
            let payload = &data[header_bytes..end];
            let protocol = ip.get_next_level_protocol().0;
            let (source_port, destination_port) = transport_ports(protocol, payload);

            Ok(CapturedPacket {
                source_address: ip.get_source().to_string(),
                destination_address: ip.get_destination().to_string(),
                ip_version: 4,
                header_length: ip.get_header_length(),
                total_length: ip.get_total_length() as u32,
                identification: ip.get_identification(),
                fragment_offset: ip.get_fragment_offset(),
                time_to_live: ip.get_ttl(),
                transport_protocol_id: protocol,
                transport: protocol_name(protocol).to_string(),
                source_port,
                destination_port,
                header_checksum: format!("{:x}", ip.get_checksum()),
                payload_hex: hex::encode(payload),
                arrival_timestamp,
                session_elapsed,
                is_attack: signature.is_attack(payload),
            })
        }
        NetworkPacket::V6(ip) => {
            if ip.get_version() != 6 {
                return Err(Error::decode(format!(
                    "IPv6 header carries version {}",
                    ip.get_version()
                )));
            }
            let data = ip.packet();
            let end = (IPV6_HEADER_BYTES + ip.get_payload_length() as usize).min(data.len());
            let payload = &data[IPV6_HEADER_BYTES..end];
            let protocol = ip.get_next_header().0;
            let (source_port, destination_port) = transport_ports(protocol, payload);

            Ok(CapturedPacket {
                source_address: ip.get_source().to_string(),
                destination_address: ip.get_destination().to_string(),
                ip_version: 6,
                header_length: IPV6_HEADER_WORDS,
                total_length: IPV6_HEADER_BYTES as u32 + ip.get_payload_length() as u32,
                identification: 0,
                fragment_offset: 0,
                time_to_live: ip.get_hop_limit(),
                transport_protocol_id: protocol,
                transport: protocol_name(protocol).to_string(),
                source_port,
                destination_port,
                header_checksum: NO_CHECKSUM.to_string(),
                payload_hex: hex::encode(payload),
                arrival_timestamp,
                session_elapsed,
                is_attack: signature.is_attack(payload),
            })
        }
    }
}
