use crate::correlation::Attribution;
use crate::packet_sniffer::{PacketRecord, Transport};
use serde::Serialize;

/// Wire form of one observed packet as the collector expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEvent {
    pub time: String,
    pub src: String,
    pub src_port: Option<u16>,
    pub dst: String,
    pub dst_port: Option<u16>,
    pub proto: String,
    pub size: usize,
    /// Absent for unattributed flows, so neither `pid` nor `proc_name` is sent.
    #[serde(flatten)]
    pub process: Option<ProcessRef>,
}

/// Owning process of a flow. `proc_name` is sent as `null` when the name
/// could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRef {
    pub pid: u32,
    #[serde(rename = "proc_name")]
    pub name: Option<String>,
}

impl FlowEvent {
    pub fn build(packet: &PacketRecord, attribution: &Attribution) -> Self {
        FlowEvent {
            time: packet.timestamp.format("%H:%M:%S").to_string(),
            src: packet.src.to_string(),
            src_port: packet.src_port,
            dst: packet.dst.to_string(),
            dst_port: packet.dst_port,
            proto: proto_label(packet.transport),
            size: packet.length,
            process: attribution.pid().map(|pid| ProcessRef {
                pid,
                name: attribution.process_name().map(str::to_string),
            }),
        }
    }
}

fn proto_label(transport: Transport) -> String {
    match transport {
        Transport::Tcp => "TCP".to_string(),
        Transport::Udp => "UDP".to_string(),
        Transport::Other(number) => number.to_string(),
    }
}
