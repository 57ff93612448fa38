//! Packet capture
//!
//! Opens a datalink channel with `pnet` and decodes each frame down to the
//! network and transport headers. Anything beyond ports is ignored. Frames
//! that are not IPv4/IPv6 are skipped.

use crate::correlation::FlowTuple;
use crate::error::CaptureError;
use chrono::{DateTime, Local};
use log::{debug, info};
use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

// Extension headers are not walked; ports after them are reported as absent.
const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Other(u8),
}

impl Transport {
    fn from_next_header(proto: IpNextHeaderProtocol) -> Self {
        match proto {
            IpNextHeaderProtocols::Tcp => Transport::Tcp,
            IpNextHeaderProtocols::Udp => Transport::Udp,
            other => Transport::Other(other.0),
        }
    }
}

/// One captured packet, reduced to what attribution and reporting need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: DateTime<Local>,
    pub src: IpAddr,
    pub src_port: Option<u16>,
    pub dst: IpAddr,
    pub dst_port: Option<u16>,
    pub transport: Transport,
    pub length: usize,
}

impl PacketRecord {
    pub fn flow_tuple(&self) -> FlowTuple {
        FlowTuple {
            src: self.src,
            src_port: self.src_port,
            dst: self.dst,
            dst_port: self.dst_port,
        }
    }
}

pub trait PacketSource: Send {
    /// Blocks until a frame arrives or the read timeout passes. `Ok(None)`
    /// means nothing decodable was seen and the caller should poll again.
    fn next_packet(&mut self) -> Result<Option<PacketRecord>, CaptureError>;

    /// Re-establishes the capture after a transient read failure.
    fn reopen(&mut self) -> Result<(), CaptureError>;

    fn name(&self) -> &str;
}

/// Decodes an Ethernet frame into a `PacketRecord`.
pub fn decode_frame(frame: &[u8], timestamp: DateTime<Local>) -> Option<PacketRecord> {
    let eth = EthernetPacket::new(frame)?;
    let (src, dst, proto, payload): (IpAddr, IpAddr, IpNextHeaderProtocol, &[u8]) =
        match eth.get_ethertype() {
            EtherTypes::Ipv4 => {
                let ip = Ipv4Packet::new(eth.payload())?;
                let proto = ip.get_next_level_protocol();
                let offset = (ip.get_header_length() as usize * 4).min(eth.payload().len());
                let (src, dst) = (IpAddr::V4(ip.get_source()), IpAddr::V4(ip.get_destination()));
                (src, dst, proto, &eth.payload()[offset..])
            }
            EtherTypes::Ipv6 => {
                let ip = Ipv6Packet::new(eth.payload())?;
                let proto = ip.get_next_header();
                let (src, dst) = (IpAddr::V6(ip.get_source()), IpAddr::V6(ip.get_destination()));
                (src, dst, proto, &eth.payload()[IPV6_HEADER_LEN.min(eth.payload().len())..])
            }
            _ => return None,
        };

    let transport = Transport::from_next_header(proto);
    let (src_port, dst_port) = match transport {
        Transport::Tcp => TcpPacket::new(payload)
            .map(|tcp| (Some(tcp.get_source()), Some(tcp.get_destination())))
            .unwrap_or((None, None)),
        Transport::Udp => UdpPacket::new(payload)
            .map(|udp| (Some(udp.get_source()), Some(udp.get_destination())))
            .unwrap_or((None, None)),
        Transport::Other(_) => (None, None),
    };

    Some(PacketRecord {
        timestamp,
        src,
        src_port,
        dst,
        dst_port,
        transport,
        length: frame.len(),
    })
}

/// Live capture on a network interface.
pub struct PnetSource {
    iface: NetworkInterface,
    rx: Box<dyn DataLinkReceiver>,
    read_timeout: Duration,
}

impl PnetSource {
    /// Opens `name`, or the first interface that is up, not loopback and has
    /// an address when no name is given.
    pub fn open(name: Option<&str>, read_timeout: Duration) -> Result<Self, CaptureError> {
        let iface = select_interface(name)?;
        let rx = open_channel(&iface, read_timeout)?;
        info!("Capturing on {}", iface.name);
        Ok(PnetSource {
            iface,
            rx,
            read_timeout,
        })
    }
}

impl PacketSource for PnetSource {
    fn next_packet(&mut self) -> Result<Option<PacketRecord>, CaptureError> {
        match self.rx.next() {
            Ok(frame) => Ok(decode_frame(frame, Local::now())),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(source) => Err(CaptureError::Read {
                iface: self.iface.name.clone(),
                source,
            }),
        }
    }

    fn reopen(&mut self) -> Result<(), CaptureError> {
        debug!("Reopening capture on {}", self.iface.name);
        self.rx = open_channel(&self.iface, self.read_timeout)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.iface.name
    }
}

fn select_interface(name: Option<&str>) -> Result<NetworkInterface, CaptureError> {
    let interfaces = datalink::interfaces();
    match name {
        Some(wanted) => interfaces
            .into_iter()
            .find(|iface| iface.name == wanted)
            .ok_or_else(|| CaptureError::InterfaceNotFound(wanted.to_string())),
        None => interfaces
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
            .ok_or(CaptureError::NoDefaultInterface),
    }
}

fn open_channel(
    iface: &NetworkInterface,
    read_timeout: Duration,
) -> Result<Box<dyn DataLinkReceiver>, CaptureError> {
    let config = datalink::Config {
        read_timeout: Some(read_timeout),
        ..Default::default()
    };
    match datalink::channel(iface, config) {
        Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
        Ok(_) => Err(CaptureError::UnsupportedChannel(iface.name.clone())),
        Err(source) => Err(CaptureError::Open {
            iface: iface.name.clone(),
            source,
        }),
    }
}
