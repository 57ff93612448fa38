//! The capture loop: packet → attribution → event → dispatch.
//!
//! Runs on one blocking thread. Only the final hand-off touches the async
//! runtime, via `Dispatcher::send`, which never waits.

use crate::correlation::{CorrelationCache, SnapshotState};
use crate::dispatcher::Dispatcher;
use crate::error::CaptureError;
use crate::flow_event::FlowEvent;
use crate::log_flow;
use crate::packet_sniffer::PacketSource;
use crate::process_monitor::ProcessTable;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub print_events: bool,
    /// Packets attributed to this pid are not reported. Set to the agent's own
    /// pid so its POSTs to the collector do not turn into events themselves.
    pub ignore_pid: Option<u32>,
    pub max_reopen_attempts: u32,
    pub reopen_backoff: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            print_events: false,
            ignore_pid: None,
            max_reopen_attempts: 5,
            reopen_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub packets: u64,
    pub attributed: u64,
    pub stale_lookups: u64,
    pub own_traffic: u64,
    pub reopens: u64,
}

/// Processes packets until `stop` is set or capture fails for good.
pub fn run_capture<S, T>(
    source: &mut S,
    cache: &mut CorrelationCache<T>,
    dispatcher: &Dispatcher,
    options: &CaptureOptions,
    stop: &AtomicBool,
) -> Result<CaptureSummary, CaptureError>
where
    S: PacketSource + ?Sized,
    T: ProcessTable,
{
    let mut summary = CaptureSummary::default();
    let mut failures: u32 = 0;

    info!("Capture loop started on {}", source.name());
    while !stop.load(Ordering::SeqCst) {
        let packet = match source.next_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(e) if e.is_transient() => {
                failures += 1;
                if failures > options.max_reopen_attempts {
                    error!("Giving up on {} after {} reopen attempts: {}", source.name(), failures - 1, e);
                    return Err(e);
                }
                let backoff = backoff_for(options.reopen_backoff, failures);
                warn!(
                    "{} (attempt {}/{}), reopening in {:?}",
                    e, failures, options.max_reopen_attempts, backoff
                );
                std::thread::sleep(backoff);
                match source.reopen() {
                    Ok(()) => summary.reopens += 1,
                    Err(reopen) => warn!("Reopen failed: {}", reopen),
                }
                continue;
            }
            Err(e) => {
                error!("Capture failed: {}", e);
                return Err(e);
            }
        };
        failures = 0;

        let lookup = cache.lookup(&packet.flow_tuple());
        if lookup.snapshot == SnapshotState::Stale {
            summary.stale_lookups += 1;
        }
        let pid = lookup.attribution.pid();
        if pid.is_some() && pid == options.ignore_pid {
            summary.own_traffic += 1;
            continue;
        }
        if pid.is_some() {
            summary.attributed += 1;
        }

        let event = FlowEvent::build(&packet, &lookup.attribution);
        log_flow!(event);
        if options.print_events {
            if let Ok(pretty) = serde_json::to_string_pretty(&event) {
                println!("{}", pretty);
            }
        }
        dispatcher.send(event);
        summary.packets += 1;
    }

    info!(
        "Capture loop stopped: {} packets, {} attributed, {} stale lookups, {} own packets skipped, {} connections in last snapshot",
        summary.packets,
        summary.attributed,
        summary.stale_lookups,
        summary.own_traffic,
        cache.snapshot().entries().len()
    );
    Ok(summary)
}

fn backoff_for(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(MAX_BACKOFF)
}
