use crate::config::LoggingConfig;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

static INIT_RESULT: OnceLock<Result<(), String>> = OnceLock::new();

/// Installs the global logger once; later calls return the first outcome.
pub fn setup_logging(
    settings: &LoggingConfig,
    console_verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = INIT_RESULT.get_or_init(|| init(settings, console_verbose));
    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(msg.clone().into()),
    }
}

fn init(settings: &LoggingConfig, console_verbose: bool) -> Result<(), String> {
    let level = if console_verbose {
        LevelFilter::Debug
    } else {
        settings
            .log_level
            .parse::<LevelFilter>()
            .map_err(|_| format!("Unknown log level '{}'", settings.log_level))?
    };

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");

    if let Some(log_file) = &settings.log_file {
        if let Some(dir) = Path::new(log_file).parent() {
            fs::create_dir_all(dir).map_err(|e| format!("Failed to create log directory: {}", e))?;
        }
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .append(true)
            .build(log_file)
            .map_err(|e| format!("Failed to create log file: {}", e))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(logfile)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(level))
        .map_err(|e| format!("Failed to build log config: {}", e))?;

    log4rs::init_config(config).map_err(|e| format!("Logging initialization failed: {}", e))?;
    Ok(())
}

#[macro_export]
macro_rules! log_flow {
    ($event:expr) => {
        log::debug!(
            "Flow: {}:{} -> {}:{} {} {}B pid={}",
            $event.src,
            $event.src_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            $event.dst,
            $event.dst_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            $event.proto,
            $event.size,
            $event
                .process
                .as_ref()
                .map_or_else(|| "?".to_string(), |p| p.pid.to_string())
        );
    };
}

#[macro_export]
macro_rules! log_drop {
    ($reason:expr, $event:expr) => {
        log::warn!(
            "Dropped event {} -> {} ({}): {}",
            $event.src,
            $event.dst,
            $event.proto,
            $reason
        );
    };
}
