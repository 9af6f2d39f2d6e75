use async_trait::async_trait;
use byteorder::{BigEndian, WriteBytesExt};
use parking_lot::Mutex;
use pcap_file::DataLink;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{Error, Result, Stage};
use crate::sandbox::{ContainerEngine, ExecOutcome};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

#[derive(Debug, Clone)]
pub struct Ipv4Fields {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: u8,
    /// Computed when `None`
    pub checksum: Option<u16>,
}

impl Default for Ipv4Fields {
    fn default() -> Self {
        Self {
            source: Ipv4Addr::new(10, 0, 0, 1),
            destination: Ipv4Addr::new(10, 0, 0, 2),
            identification: 0,
            ttl: 64,
            protocol: 17,
            checksum: None,
        }
    }
}

pub fn udp_segment(src_port: u16, dst_port: u16, body: &[u8]) -> Vec<u8> {
    let mut segment = Vec::with_capacity(8 + body.len());
    segment.write_u16::<BigEndian>(src_port).unwrap();
    segment.write_u16::<BigEndian>(dst_port).unwrap();
    segment.write_u16::<BigEndian>(8 + body.len() as u16).unwrap();
    segment.write_u16::<BigEndian>(0x0000).unwrap();
    segment.extend_from_slice(body);
    segment
}

fn ip_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        let hi = (chunk[0] as u32) << 8;
        let lo = chunk.get(1).copied().unwrap_or(0) as u32;
        sum += hi + lo;
    }
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn ipv4_packet(fields: &Ipv4Fields, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(20 + payload.len());
    packet.push(0x45);
    packet.push(0x00);
    packet.write_u16::<BigEndian>(20 + payload.len() as u16).unwrap();
    packet.write_u16::<BigEndian>(fields.identification).unwrap();
    packet.write_u16::<BigEndian>(0x4000).unwrap();
    packet.push(fields.ttl);
    packet.push(fields.protocol);
    packet.write_u16::<BigEndian>(0x0000).unwrap();
    packet.extend_from_slice(&fields.source.octets());
    packet.extend_from_slice(&fields.destination.octets());

    let checksum = fields.checksum.unwrap_or_else(|| ip_checksum(&packet));
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());

    packet.extend_from_slice(payload);
    packet
}

/// IPv4 + UDP around `body`
pub fn ipv4_datagram(fields: &Ipv4Fields, src_port: u16, dst_port: u16, body: &[u8]) -> Vec<u8> {
    ipv4_packet(fields, &udp_segment(src_port, dst_port, body))
}

pub fn ipv6_packet(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    next_header: u8,
    hop_limit: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(40 + payload.len());
    packet.write_u32::<BigEndian>(0x6000_0000).unwrap();
    packet.write_u16::<BigEndian>(payload.len() as u16).unwrap();
    packet.push(next_header);
    packet.push(hop_limit);
    packet.extend_from_slice(&source.octets());
    packet.extend_from_slice(&destination.octets());
    packet.extend_from_slice(payload);
    packet
}

pub fn ethernet_frame(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    frame.extend_from_slice(&[0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    frame.write_u16::<BigEndian>(ethertype).unwrap();
    frame.extend_from_slice(payload);
    frame
}

/// Linux cooked capture (SLL) header around a network packet
pub fn sll_frame(protocol: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + payload.len());
    frame.write_u16::<BigEndian>(0).unwrap(); // packet type: to us
    frame.write_u16::<BigEndian>(1).unwrap(); // ARPHRD_ETHER
    frame.write_u16::<BigEndian>(6).unwrap();
    frame.extend_from_slice(&[0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x00, 0x00]);
    frame.write_u16::<BigEndian>(protocol).unwrap();
    frame.extend_from_slice(payload);
    frame
}

/// Linux cooked capture v2 (SLL2) header around a network packet
pub fn sll2_frame(protocol: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(20 + payload.len());
    frame.write_u16::<BigEndian>(protocol).unwrap();
    frame.write_u16::<BigEndian>(0).unwrap();
    frame.write_u32::<BigEndian>(2).unwrap(); // interface index
    frame.write_u16::<BigEndian>(1).unwrap();
    frame.push(0);
    frame.push(6);
    frame.extend_from_slice(&[0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x00, 0x00]);
    frame.extend_from_slice(payload);
    frame
}

/// In-memory pcap file holding `frames` stamped with their durations since the epoch
pub fn pcap_bytes(datalink: DataLink, frames: &[(Duration, Vec<u8>)]) -> Vec<u8> {
    let header = PcapHeader {
        datalink,
        ..Default::default()
    };
    let mut writer = PcapWriter::with_header(Vec::new(), header).unwrap();
    for (timestamp, data) in frames {
        writer
            .write_packet(&PcapPacket::new(*timestamp, data.len() as u32, data))
            .unwrap();
    }
    writer.into_writer()
}

pub fn tar_single_file(name: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
    builder.into_inner().unwrap()
}

fn now_since_epoch() -> Duration {
    let micros = chrono::Utc::now().timestamp_micros();
    Duration::from_micros(micros.max(0) as u64)
}

/// Scripted `ContainerEngine` that records every call.
///
/// With a traffic sink, `exec` plays the in-sandbox capture: it receives UDP
/// datagrams on a loopback socket and turns them into an Ethernet pcap that
/// `copy_archive` hands back.
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    image_present: bool,
    stale_container: bool,
    fail_pull: bool,
    fail_exec: bool,
    corrupt_capture: bool,
    exec_delay: Option<Duration>,
    address: IpAddr,
    sink: Mutex<Option<UdpSocket>>,
    sink_port: Option<u16>,
    capture: Mutex<Vec<u8>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            image_present: true,
            stale_container: false,
            fail_pull: false,
            fail_exec: false,
            corrupt_capture: false,
            exec_delay: None,
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            sink: Mutex::new(None),
            sink_port: None,
            capture: Mutex::new(pcap_bytes(DataLink::ETHERNET, &[])),
        }
    }

    pub fn without_image(mut self) -> Self {
        self.image_present = false;
        self
    }

    pub fn with_stale_container(mut self) -> Self {
        self.stale_container = true;
        self
    }

    pub fn with_failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    pub fn with_failing_exec(mut self) -> Self {
        self.fail_exec = true;
        self
    }

    /// `copy_archive` hands back a file that is not a pcap
    pub fn with_corrupt_capture(mut self) -> Self {
        self.corrupt_capture = true;
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    /// Listen on loopback and capture whatever arrives during `exec`
    pub fn with_traffic_sink(mut self) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_nonblocking(true).unwrap();
        self.sink_port = Some(socket.local_addr().unwrap().port());
        self.sink = Mutex::new(Some(socket));
        self
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn sink_port(&self) -> Option<u16> {
        self.sink_port
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }

    async fn capture_traffic(&self, socket: UdpSocket) -> Vec<u8> {
        let socket = tokio::net::UdpSocket::from_std(socket).unwrap();
        let local = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("sink binds IPv4"),
        };
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 65536];
        let mut wait = Duration::from_secs(5);

        while let Ok(Ok((len, SocketAddr::V4(peer)))) =
            tokio::time::timeout(wait, socket.recv_from(&mut buf)).await
        {
            let fields = Ipv4Fields {
                source: *peer.ip(),
                destination: *local.ip(),
                identification: frames.len() as u16,
                ..Ipv4Fields::default()
            };
            let packet = ipv4_datagram(&fields, peer.port(), local.port(), &buf[..len]);
            frames.push((now_since_epoch(), ethernet_frame(ETHERTYPE_IPV4, &packet)));
            wait = Duration::from_millis(300);
        }

        pcap_bytes(DataLink::ETHERNET, &frames)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn image_exists(&self, _image: &str) -> Result<bool> {
        self.record("image_exists");
        Ok(self.image_present)
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record("pull");
        if self.fail_pull {
            return Err(Error::Image {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn container_exists(&self, _name: &str) -> Result<bool> {
        self.record("container_exists");
        Ok(self.stale_container)
    }

    async fn create(&self, _image: &str, _name: &str) -> Result<String> {
        self.record("create");
        Ok("f00dcafe".to_string())
    }

    async fn start(&self, _name: &str) -> Result<()> {
        self.record("start");
        Ok(())
    }

    async fn exec(&self, _name: &str, _command: &str) -> Result<ExecOutcome> {
        self.record("exec");
        if let Some(delay) = self.exec_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_exec {
            return Err(Error::lifecycle(Stage::Exec, "scripted failure"));
        }
        let sink = self.sink.lock().take();
        if let Some(socket) = sink {
            let capture = self.capture_traffic(socket).await;
            *self.capture.lock() = capture;
        }
        Ok(ExecOutcome { exit_code: Some(0) })
    }

    async fn inspect_address(&self, _name: &str) -> Result<IpAddr> {
        self.record("inspect_address");
        Ok(self.address)
    }

    async fn copy_archive(&self, _name: &str, _path: &str) -> Result<Vec<u8>> {
        self.record("copy_archive");
        if self.corrupt_capture {
            return Ok(tar_single_file("capture.pcap", b"tcpdump: eth0: No such device"));
        }
        Ok(tar_single_file("capture.pcap", &self.capture.lock()))
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        self.record("stop");
        Ok(())
    }

    async fn remove(&self, _name: &str) -> Result<()> {
        self.record("remove");
        Ok(())
    }
}
