use pcap_file::pcap::PcapReader;
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use std::fs::File;
use std::io::BufReader;
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::packet::{self, NetworkPacket};
use crate::records::RecordSet;
use crate::signature::Signature;

const SLL_HEADER_LEN: usize = 16;
const SLL2_HEADER_LEN: usize = 20;
const VLAN_TAG_LEN: usize = 4;

/// Link-layer framing of a capture file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    LinuxSll2,
    RawIp,
    Other(u32),
}

impl From<u32> for LinkType {
    fn from(code: u32) -> Self {
        match code {
            1 => LinkType::Ethernet,
            113 => LinkType::LinuxSll,
            276 => LinkType::LinuxSll2,
            12 | 101 | 228 | 229 => LinkType::RawIp,
            other => LinkType::Other(other),
        }
    }
}

/// One captured frame, borrowed from the reader
#[derive(Debug)]
pub struct Frame<'a> {
    pub index: u64,
    pub link_type: LinkType,
    /// Time since the Unix epoch
    pub timestamp: Duration,
    pub data: &'a [u8],
}

fn dispatch_ethertype(ethertype: EtherType, data: &[u8]) -> Option<NetworkPacket<'_>> {
    if ethertype == EtherTypes::Ipv4 {
        NetworkPacket::parse_v4(data)
    } else if ethertype == EtherTypes::Ipv6 {
        NetworkPacket::parse_v6(data)
    } else {
        None
    }
}

impl<'a> Frame<'a> {
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.as_micros() as i64
    }

    /// Network-layer packet carried by this frame, `None` for non-IP frames
    pub fn network(&self) -> Option<NetworkPacket<'a>> {
        let data = self.data;
        match self.link_type {
            LinkType::Ethernet => {
                let ethernet = EthernetPacket::new(data)?;
                let mut offset = EthernetPacket::minimum_packet_size();
                let mut ethertype = ethernet.get_ethertype();
                // Single 802.1Q tag
                if ethertype == EtherTypes::Vlan {
                    let tag = data.get(offset + 2..offset + VLAN_TAG_LEN)?;
                    ethertype = EtherType(u16::from_be_bytes([tag[0], tag[1]]));
                    offset += VLAN_TAG_LEN;
                }
                dispatch_ethertype(ethertype, data.get(offset..)?)
            }
            LinkType::LinuxSll => {
                let proto = data.get(14..16)?;
                let ethertype = EtherType(u16::from_be_bytes([proto[0], proto[1]]));
                dispatch_ethertype(ethertype, data.get(SLL_HEADER_LEN..)?)
            }
            LinkType::LinuxSll2 => {
                let proto = data.get(0..2)?;
                let ethertype = EtherType(u16::from_be_bytes([proto[0], proto[1]]));
                dispatch_ethertype(ethertype, data.get(SLL2_HEADER_LEN..)?)
            }
            LinkType::RawIp => NetworkPacket::parse_raw(data),
            LinkType::Other(_) => None,
        }
    }
}

/// Sequential reader over a pcap capture file
pub struct CaptureReader {
    reader: PcapReader<BufReader<File>>,
    link_type: LinkType,
    path: String,
}

impl CaptureReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening capture file: {}", path.display());

        let file = File::open(path).map_err(|e| {
            Error::Capture(format!("failed to open {}: {}", path.display(), e))
        })?;
        let reader = PcapReader::new(BufReader::new(file)).map_err(|e| {
            Error::Capture(format!("{} is not a pcap file: {}", path.display(), e))
        })?;

        let link_type = LinkType::from(u32::from(reader.header().datalink));
        if let LinkType::Other(code) = link_type {
            warn!("Unsupported link type {} in {}, no frame will decode", code, path.display());
        }

        Ok(Self {
            reader,
            link_type,
            path: path.display().to_string(),
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Visit every frame in file order until the callback breaks.
    ///
    /// Returns the number of frames visited. A framing error ends the pass
    /// with whatever was read so far.
    pub fn for_each_frame<F>(mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(&Frame<'_>) -> ControlFlow<()>,
    {
        let mut index = 0u64;
        while let Some(packet) = self.reader.next_packet() {
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Stopped reading {} at frame #{}: {}", self.path, index + 1, e);
                    break;
                }
            };

            let frame = Frame {
                index,
                link_type: self.link_type,
                timestamp: packet.timestamp,
                data: &packet.data,
            };
            index += 1;

            if f(&frame).is_break() {
                break;
            }
        }
        Ok(index)
    }
}

pub struct IngestOptions<'a> {
    /// Wall-clock microseconds of the sandbox start. When absent the first
    /// frame is taken as the start.
    pub session_start_us: Option<i64>,
    pub signature: &'a Signature,
    pub max_records: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    pub frames: u64,
    pub records: usize,
    pub attacks: usize,
    pub non_ip: u64,
    pub decode_errors: u64,
    pub before_start: u64,
}

/// Decode and label every IP frame of a capture file
pub fn ingest<P: AsRef<Path>>(path: P, options: &IngestOptions<'_>) -> Result<RecordSet> {
    let path = path.as_ref();
    let reader = CaptureReader::open(path)?;
    let mut records = RecordSet::new();
    let mut stats = IngestStats::default();
    let mut session_start = options.session_start_us;
    let mut failure = None;

    let frames = reader.for_each_frame(|frame| {
        let arrival = frame.timestamp_micros();
        let start = *session_start.get_or_insert(arrival);
        if arrival < start {
            stats.before_start += 1;
            return ControlFlow::Continue(());
        }

        let Some(network) = frame.network() else {
            debug!("Skipping non-IP frame #{}", frame.index);
            stats.non_ip += 1;
            return ControlFlow::Continue(());
        };

        let elapsed_ms = (arrival - start) / 1000;
        match packet::extract(&network, arrival, elapsed_ms, options.signature) {
            Ok(record) => {
                if record.is_attack {
                    stats.attacks += 1;
                }
                records.push(record);
            }
            Err(e) if e.is_recoverable() => {
                debug!("Skipping frame #{}: {}", frame.index, e);
                stats.decode_errors += 1;
            }
            Err(e) => {
                failure = Some(e);
                return ControlFlow::Break(());
            }
        }

        match options.max_records {
            Some(limit) if records.len() >= limit => {
                info!("Reached record limit of {}", limit);
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        }
    })?;

    if let Some(e) = failure {
        return Err(e);
    }

    stats.frames = frames;
    stats.records = records.len();
    info!(
        "Ingested {}: {} frames, {} records ({} attack), {} non-IP, {} undecodable, {} before session start",
        path.display(),
        stats.frames,
        stats.records,
        stats.attacks,
        stats.non_ip,
        stats.decode_errors,
        stats.before_start
    );
    Ok(records)
}
