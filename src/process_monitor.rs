use crate::error::AttributionError;
use log::debug;
use netstat2::{get_sockets_info, AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo};
use std::net::IpAddr;
use sysinfo::{Pid, System};

/// One row of the host socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    pub local_addr: IpAddr,
    pub local_port: Option<u16>,
    pub remote_addr: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub pid: Option<u32>,
}

impl ConnectionEntry {
    /// Builds an entry with IPv4-mapped IPv6 addresses folded back to IPv4,
    /// which is how dual-stack sockets report IPv4 peers.
    pub fn new(
        local: (IpAddr, Option<u16>),
        remote: Option<(IpAddr, Option<u16>)>,
        pid: Option<u32>,
    ) -> Self {
        ConnectionEntry {
            local_addr: local.0.to_canonical(),
            local_port: local.1,
            remote_addr: remote.map(|(addr, _)| addr.to_canonical()),
            remote_port: remote.and_then(|(_, port)| port),
            pid,
        }
    }
}

/// Access to the host's connection table and process names. Both calls are
/// best effort.
pub trait ProcessTable: Send {
    fn connections(&mut self) -> Result<Vec<ConnectionEntry>, AttributionError>;

    fn process_name(&mut self, pid: u32) -> Option<String>;
}

/// `ProcessTable` over the live OS tables: `netstat2` for sockets and
/// `sysinfo` for names.
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        SystemProcessTable {
            system: System::new(),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn connections(&mut self) -> Result<Vec<ConnectionEntry>, AttributionError> {
        let af = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let proto = ProtocolFlags::TCP | ProtocolFlags::UDP;
        let sockets = get_sockets_info(af, proto)
            .map_err(|e| AttributionError::TableUnavailable(format!("{:?}", e)))?;

        let entries: Vec<ConnectionEntry> = sockets
            .into_iter()
            .map(|socket| {
                let pid = socket.associated_pids.first().copied();
                match socket.protocol_socket_info {
                    ProtocolSocketInfo::Tcp(tcp) => {
                        // Listening sockets report an all-zero peer.
                        let remote = if tcp.remote_addr.is_unspecified() && tcp.remote_port == 0 {
                            None
                        } else {
                            Some((tcp.remote_addr, Some(tcp.remote_port)))
                        };
                        ConnectionEntry::new((tcp.local_addr, Some(tcp.local_port)), remote, pid)
                    }
                    ProtocolSocketInfo::Udp(udp) => {
                        ConnectionEntry::new((udp.local_addr, Some(udp.local_port)), None, pid)
                    }
                }
            })
            .collect();

        debug!("Connection table: {} entries", entries.len());
        Ok(entries)
    }

    fn process_name(&mut self, pid: u32) -> Option<String> {
        let pid = Pid::from_u32(pid);
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(|p| p.name().to_string())
    }
}
