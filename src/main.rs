mod agent;
mod config;
mod correlation;
mod dispatcher;
mod error;
mod flow_event;
mod logging;
mod packet_sniffer;
mod process_monitor;
#[cfg(test)]
mod test_support;

use crate::agent::{run_capture, CaptureOptions};
use crate::config::{Config, Overrides};
use crate::correlation::CorrelationCache;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::logging::setup_logging;
use crate::packet_sniffer::PnetSource;
use crate::process_monitor::SystemProcessTable;
use clap::Parser;
use log::{error, info, warn};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CAPTURE_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DISPATCH_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Parser)]
#[command(
    name = "flowtap-agent",
    about = "Capture traffic, attribute it to local processes, and forward flow events to a collector"
)]
struct Cli {
    /// Collector base URL, e.g. https://localhost:4000
    #[arg(long)]
    backend: Option<String>,
    /// Authenticate with a client certificate
    #[arg(long)]
    mtls: bool,
    #[arg(long)]
    mtls_cert: Option<PathBuf>,
    #[arg(long)]
    mtls_key: Option<PathBuf>,
    /// Custom root CA for the collector's certificate
    #[arg(long)]
    mtls_ca: Option<PathBuf>,
    /// Bearer token sent in the Authorization header
    #[arg(long)]
    jwt_token: Option<String>,
    /// Capture interface; defaults to the first active non-loopback one
    #[arg(long)]
    iface: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run in the foreground instead of as a Windows service
    #[arg(long)]
    console: bool,
    /// Echo each event to stdout as JSON
    #[arg(long)]
    print_events: bool,
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend.clone(),
            mtls: self.mtls,
            mtls_cert: self.mtls_cert.clone(),
            mtls_key: self.mtls_key.clone(),
            mtls_ca: self.mtls_ca.clone(),
            jwt_token: self.jwt_token.clone(),
            iface: self.iface.clone(),
            print_events: self.print_events,
        }
    }
}

/// Loads the config file, sets up logging from it, then layers CLI flags on top.
fn prepare(cli: &Cli, console_verbose: bool) -> Result<Config, Box<dyn std::error::Error>> {
    let path = cli.config.clone().unwrap_or_else(Config::locate);
    let (mut config, source) = Config::load_or_default(&path);
    setup_logging(&config.logging, console_verbose)?;
    source.log();
    config.apply(cli.overrides())?;
    Ok(config)
}

/// Wires the pipeline together and runs until `shutdown` resolves or capture
/// fails for good.
async fn run_agent(
    config: Config,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let auth = config.auth_context()?;
    let dispatcher = Arc::new(Dispatcher::new(
        config.backend_url()?,
        auth,
        DispatchSettings {
            request_timeout: config.request_timeout(),
            max_in_flight: config.backend.max_in_flight,
            queue_capacity: config.backend.queue_capacity,
        },
        &tokio::runtime::Handle::current(),
    )?);

    let mut source = PnetSource::open(config.capture.interface.as_deref(), config.read_timeout())?;
    let mut cache = CorrelationCache::new(SystemProcessTable::new(), config.ttl());
    let options = CaptureOptions {
        print_events: config.logging.print_events,
        ignore_pid: Some(std::process::id()),
        max_reopen_attempts: config.capture.max_reopen_attempts,
        ..CaptureOptions::default()
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut capture = {
        let stop = Arc::clone(&stop);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::task::spawn_blocking(move || {
            run_capture(&mut source, &mut cache, &dispatcher, &options, &stop)
        })
    };

    let outcome = tokio::select! {
        joined = &mut capture => joined,
        _ = shutdown => {
            info!("Shutdown signal received, stopping capture...");
            stop.store(true, Ordering::SeqCst);
            match tokio::time::timeout(CAPTURE_STOP_TIMEOUT, capture).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Capture loop did not stop within {:?}", CAPTURE_STOP_TIMEOUT);
                    return Ok(());
                }
            }
        }
    };

    let stats = dispatcher.drain(DISPATCH_GRACE).await;
    info!(
        "Dispatch: {} delivered, {} failed, {} rejected, {} abandoned",
        stats.delivered, stats.failed, stats.rejected, stats.outstanding
    );

    match outcome {
        Ok(Ok(summary)) => {
            info!("Captured {} packets", summary.packets);
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(format!("Capture task failed: {}", e).into()),
    }
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
}

fn run_console(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = prepare(cli, cli.verbose)?;
    info!("Starting capture, backend: {}", config.backend_url()?);

    let runtime = build_runtime()?;
    runtime.block_on(run_agent(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }))
}

#[cfg(windows)]
mod service {
    use super::{build_runtime, prepare, run_agent, Cli};
    use log::{error, info};
    use std::ffi::OsString;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use windows_service::{
        define_windows_service,
        service::{
            ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
            ServiceType,
        },
        service_control_handler::{self, ServiceControlHandlerResult},
        service_dispatcher,
    };

    const SERVICE_NAME: &str = "FlowTapAgent";

    static SERVICE_CLI: OnceLock<Cli> = OnceLock::new();

    define_windows_service!(ffi_service_main, service_main);

    pub fn start(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
        let _ = SERVICE_CLI.set(cli);
        service_dispatcher::start(SERVICE_NAME, ffi_service_main)?;
        Ok(())
    }

    fn service_main(_arguments: Vec<OsString>) {
        if let Err(e) = run_service() {
            error!("Service failed: {}", e);
        }
    }

    fn status(state: ServiceState, accept: ServiceControlAccept) -> ServiceStatus {
        ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: state,
            controls_accepted: accept,
            exit_code: ServiceExitCode::Win32(0),
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        }
    }

    fn run_service() -> Result<(), Box<dyn std::error::Error>> {
        let cli = SERVICE_CLI.get().cloned().ok_or("service started without arguments")?;
        let config = prepare(&cli, false)?;
        info!("Flow agent service starting...");

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        let status_handle = service_control_handler::register(SERVICE_NAME, move |control_event| {
            match control_event {
                ServiceControl::Stop | ServiceControl::Shutdown => {
                    info!("Received stop/shutdown signal");
                    let _ = shutdown_tx.send(());
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            }
        })?;

        status_handle.set_service_status(status(ServiceState::Running, ServiceControlAccept::STOP))?;

        let runtime = build_runtime()?;
        let result = runtime.block_on(run_agent(config, async move {
            let _ = shutdown_rx.recv().await;
        }));
        if let Err(e) = &result {
            error!("Agent stopped with error: {}", e);
        }

        status_handle.set_service_status(status(ServiceState::Stopped, ServiceControlAccept::empty()))?;
        info!("Flow agent service stopped");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    #[cfg(windows)]
    {
        if !cli.console {
            return service::start(cli);
        }
    }

    run_console(&cli)
}
