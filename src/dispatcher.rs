//! Event delivery
//!
//! `send` only enqueues. A single pump task drains the queue and spawns one
//! delivery task per event, optionally capped by a semaphore. Failures are
//! logged and the event is gone; nothing is retried.

use crate::error::DispatchError;
use crate::flow_event::FlowEvent;
use crate::log_drop;
use log::{debug, info};
use reqwest::{Certificate, Client, Identity, RequestBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;

pub const EVENT_PATH: &str = "/api/agent/event";

/// After the first rejection, only every Nth one is logged as a warning.
const REJECT_WARN_EVERY: u64 = 1000;

/// How the agent proves its identity to the collector. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    None,
    MutualTls {
        cert_path: PathBuf,
        key_path: PathBuf,
        ca_path: Option<PathBuf>,
    },
    BearerToken {
        token: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub request_timeout: Duration,
    /// 0 means no cap.
    pub max_in_flight: usize,
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            request_timeout: Duration::from_secs(10),
            max_in_flight: 256,
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Scheduled,
    /// Queue full or dispatcher shut down; the event was discarded.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub rejected: u64,
    pub outstanding: usize,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    outstanding: AtomicUsize,
}

struct Delivery {
    client: Client,
    endpoint: String,
    auth: AuthContext,
    counters: Arc<Counters>,
}

pub struct Dispatcher {
    queue: mpsc::Sender<FlowEvent>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Builds the HTTP client for `auth` and starts the delivery pump on
    /// `runtime`. mTLS material is read here so bad paths fail at startup.
    pub fn new(
        backend_url: &str,
        auth: AuthContext,
        settings: DispatchSettings,
        runtime: &Handle,
    ) -> Result<Self, DispatchError> {
        let client = build_client(&auth, settings.request_timeout)?;
        let endpoint = format!("{}{}", backend_url.trim_end_matches('/'), EVENT_PATH);
        info!("Dispatching events to {}", endpoint);

        let counters = Arc::new(Counters::default());
        let (queue, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let limit = (settings.max_in_flight > 0)
            .then(|| Arc::new(Semaphore::new(settings.max_in_flight)));

        let delivery = Arc::new(Delivery {
            client,
            endpoint,
            auth,
            counters: Arc::clone(&counters),
        });
        runtime.spawn(pump(rx, delivery, limit));

        Ok(Dispatcher { queue, counters })
    }

    /// Hands `event` off for delivery and returns without waiting on I/O.
    pub fn send(&self, event: FlowEvent) -> SendOutcome {
        self.counters.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.queue.try_send(event) {
            Ok(()) => SendOutcome::Scheduled,
            Err(TrySendError::Full(event)) => {
                self.reject("delivery queue full", &event);
                SendOutcome::Rejected
            }
            Err(TrySendError::Closed(event)) => {
                self.reject("dispatcher stopped", &event);
                SendOutcome::Rejected
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            outstanding: self.counters.outstanding.load(Ordering::SeqCst),
        }
    }

    /// Waits up to `grace` for queued and in-flight deliveries to finish.
    /// Whatever is still pending afterwards is abandoned.
    pub async fn drain(&self, grace: Duration) -> DispatchStats {
        let deadline = tokio::time::Instant::now() + grace;
        while self.counters.outstanding.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.stats()
    }

    // Called on the capture thread; `stats().rejected` holds the exact count.
    fn reject(&self, reason: &str, event: &FlowEvent) {
        let total = self.counters.rejected.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
        if warn_on_rejection(total) {
            log_drop!(format!("{} ({} rejected so far)", reason, total), event);
        } else {
            debug!("Dropped event {} -> {}: {}", event.src, event.dst, reason);
        }
    }
}

fn warn_on_rejection(total: u64) -> bool {
    total == 1 || total % REJECT_WARN_EVERY == 0
}

async fn pump(
    mut rx: mpsc::Receiver<FlowEvent>,
    delivery: Arc<Delivery>,
    limit: Option<Arc<Semaphore>>,
) {
    while let Some(event) = rx.recv().await {
        let permit = match &limit {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        let delivery = Arc::clone(&delivery);
        tokio::spawn(async move {
            let _permit = permit;
            delivery.deliver(event).await;
        });
    }
    debug!("Delivery pump stopped");
}

impl Delivery {
    async fn deliver(&self, event: FlowEvent) {
        let request = prepare_request(&self.client, &self.endpoint, &self.auth, &event);
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.counters.delivered.fetch_add(1, Ordering::SeqCst);
                debug!("sent {}", response.status());
            }
            Ok(response) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                log_drop!(format!("backend answered {}", response.status()), event);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                log_drop!(e, event);
            }
        }
        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// POST with a JSON body. Only a bearer token touches the headers; mTLS lives
/// entirely in the client's TLS config.
fn prepare_request(
    client: &Client,
    endpoint: &str,
    auth: &AuthContext,
    event: &FlowEvent,
) -> RequestBuilder {
    let request = client.post(endpoint).json(event);
    match auth {
        AuthContext::BearerToken { token } => request.bearer_auth(token),
        AuthContext::MutualTls { .. } | AuthContext::None => request,
    }
}

fn build_client(auth: &AuthContext, timeout: Duration) -> Result<Client, DispatchError> {
    let mut builder = Client::builder().use_rustls_tls().timeout(timeout);

    if let AuthContext::MutualTls {
        cert_path,
        key_path,
        ca_path,
    } = auth
    {
        let mut pem = read_credential(cert_path)?;
        pem.push(b'\n');
        pem.extend(read_credential(key_path)?);
        let identity = Identity::from_pem(&pem).map_err(DispatchError::Tls)?;
        builder = builder.identity(identity);

        // A pinned CA replaces the public roots rather than extending them.
        if let Some(ca_path) = ca_path {
            let ca = Certificate::from_pem(&read_credential(ca_path)?).map_err(DispatchError::Tls)?;
            builder = builder.tls_built_in_root_certs(false).add_root_certificate(ca);
        }
    }

    builder.build().map_err(DispatchError::Client)
}

fn read_credential(path: &Path) -> Result<Vec<u8>, DispatchError> {
    fs::read(path).map_err(|source| DispatchError::Credential {
        path: path.to_path_buf(),
        source,
    })
}
