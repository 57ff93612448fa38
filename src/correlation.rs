//! Flow-to-process correlation
//!
//! Keeps a point-in-time copy of the host connection table and answers
//! "which process owns this flow" against it. The copy is refreshed lazily on
//! lookup once it is older than the TTL. A failed refresh leaves the previous
//! copy in place.
//!
//! Each lookup is a linear scan of the snapshot. Past roughly 10^4 live
//! connections per TTL window this wants an index keyed by local endpoint.

use crate::process_monitor::{ConnectionEntry, ProcessTable};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: IpAddr,
    pub src_port: Option<u16>,
    pub dst: IpAddr,
    pub dst_port: Option<u16>,
}

/// Immutable copy of the connection table. Replaced, never edited.
#[derive(Debug, Default)]
pub struct ConnectionSnapshot {
    entries: Vec<ConnectionEntry>,
    taken_at: Option<Instant>,
}

impl ConnectionSnapshot {
    pub fn new(entries: Vec<ConnectionEntry>, taken_at: Instant) -> Self {
        ConnectionSnapshot {
            entries,
            taken_at: Some(taken_at),
        }
    }

    pub fn entries(&self) -> &[ConnectionEntry] {
        &self.entries
    }

    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.taken_at
            .is_some_and(|taken| now.saturating_duration_since(taken) <= ttl)
    }

    /// First entry whose endpoints equal the tuple, in either orientation.
    pub fn find(&self, tuple: &FlowTuple) -> Option<&ConnectionEntry> {
        self.entries.iter().find(|entry| {
            let forward = entry.local_addr == tuple.src
                && entry.local_port == tuple.src_port
                && entry.remote_addr == Some(tuple.dst)
                && entry.remote_port == tuple.dst_port;
            let reverse = entry.local_addr == tuple.dst
                && entry.local_port == tuple.dst_port
                && entry.remote_addr == Some(tuple.src)
                && entry.remote_port == tuple.src_port;
            forward || reverse
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    NoMatch,
    /// A socket matched but the OS did not report its owner.
    Ownerless,
    /// `name` is `None` when the pid could not be resolved, usually because
    /// the process already exited.
    Process { pid: u32, name: Option<String> },
}

impl Attribution {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Attribution::Process { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    pub fn process_name(&self) -> Option<&str> {
        match self {
            Attribution::Process { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Fresh,
    Refreshed,
    /// The snapshot is past its TTL and could not be replaced.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub attribution: Attribution,
    pub snapshot: SnapshotState,
}

pub struct CorrelationCache<T> {
    table: T,
    ttl: Duration,
    snapshot: Arc<ConnectionSnapshot>,
    last_attempt: Option<Instant>,
    names: HashMap<u32, Option<String>>,
}

impl<T: ProcessTable> CorrelationCache<T> {
    pub fn new(table: T, ttl: Duration) -> Self {
        CorrelationCache {
            table,
            ttl,
            snapshot: Arc::new(ConnectionSnapshot::default()),
            last_attempt: None,
            names: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn lookup(&mut self, tuple: &FlowTuple) -> Lookup {
        self.lookup_at(tuple, Instant::now())
    }

    pub fn lookup_at(&mut self, tuple: &FlowTuple, now: Instant) -> Lookup {
        let snapshot = self.ensure_fresh(now);

        let matched = self.snapshot.find(tuple).map(|entry| entry.pid);
        let attribution = match matched {
            None => Attribution::NoMatch,
            Some(None) => Attribution::Ownerless,
            Some(Some(pid)) => Attribution::Process {
                pid,
                name: self.resolve_name(pid),
            },
        };

        Lookup {
            attribution,
            snapshot,
        }
    }

    /// At most one fetch per TTL window, counted from the last attempt so a
    /// failing table is not hammered on every packet.
    fn ensure_fresh(&mut self, now: Instant) -> SnapshotState {
        let attempted_recently = self
            .last_attempt
            .is_some_and(|last| now.saturating_duration_since(last) <= self.ttl);
        if attempted_recently {
            return if self.snapshot.is_fresh(now, self.ttl) {
                SnapshotState::Fresh
            } else {
                SnapshotState::Stale
            };
        }

        self.last_attempt = Some(now);
        match self.table.connections() {
            Ok(entries) => {
                debug!("Refreshed connection snapshot ({} entries)", entries.len());
                self.snapshot = Arc::new(ConnectionSnapshot::new(entries, now));
                self.names.clear();
                SnapshotState::Refreshed
            }
            Err(e) => {
                warn!("Keeping previous connection snapshot: {}", e);
                SnapshotState::Stale
            }
        }
    }

    fn resolve_name(&mut self, pid: u32) -> Option<String> {
        if let Some(known) = self.names.get(&pid) {
            return known.clone();
        }
        let name = self.table.process_name(pid);
        if name.is_none() {
            debug!("Process name unresolved for pid {}", pid);
        }
        self.names.insert(pid, name.clone());
        name
    }
}
