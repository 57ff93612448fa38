use crate::correlation::DEFAULT_TTL;
use crate::dispatcher::AuthContext;
use crate::error::ConfigError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.yaml";

#[cfg(windows)]
const SYSTEM_CONFIG: &str = "C:\\ProgramData\\FlowTap\\config.yaml";
#[cfg(not(windows))]
const SYSTEM_CONFIG: &str = "/etc/flowtap/config.yaml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub auth: AuthConfig,
    pub capture: CaptureConfig,
    pub correlation: CorrelationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub url: Option<String>,
    pub request_timeout_secs: u64,
    /// Upper bound on concurrent deliveries; 0 disables the cap.
    pub max_in_flight: usize,
    /// Events waiting for a delivery slot; further events are dropped.
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Mtls,
    Bearer,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub read_timeout_ms: u64,
    pub max_reopen_attempts: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorrelationConfig {
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<String>,
    pub log_level: String,
    pub print_events: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: None,
            request_timeout_secs: 10,
            max_in_flight: 256,
            queue_capacity: 1024,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: None,
            read_timeout_ms: 500,
            max_reopen_attempts: 5,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        CorrelationConfig {
            ttl_ms: DEFAULT_TTL.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: None,
            log_level: "info".to_string(),
            print_events: false,
        }
    }
}

#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(ConfigError),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Configuration loaded from {}", path.display()),
            ConfigSource::Missing(path) => {
                warn!("Config not found at {}, using defaults", path.display())
            }
            ConfigSource::Invalid(e) => warn!("Failed to load config ({}), using defaults", e),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub backend: Option<String>,
    pub mtls: bool,
    pub mtls_cert: Option<PathBuf>,
    pub mtls_key: Option<PathBuf>,
    pub mtls_ca: Option<PathBuf>,
    pub jwt_token: Option<String>,
    pub iface: Option<String>,
    pub print_events: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Picks the first config file that exists: next to the executable, the
    /// working directory, then the system location.
    pub fn locate() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));

        let candidates = exe_dir
            .map(|dir| dir.join(CONFIG_FILE))
            .into_iter()
            .chain([PathBuf::from(CONFIG_FILE), PathBuf::from(SYSTEM_CONFIG)]);

        for candidate in candidates {
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from(CONFIG_FILE)
    }

    /// Loads `path`, falling back to defaults when it is missing or invalid.
    /// Nothing is logged here since the logger is configured from the result.
    pub fn load_or_default(path: &Path) -> (Self, ConfigSource) {
        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path.to_path_buf()));
        }
        match Config::load(path) {
            Ok(cfg) => (cfg, ConfigSource::File(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(e)),
        }
    }

    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        if overrides.mtls && overrides.jwt_token.is_some() {
            return Err(ConfigError::ConflictingAuth);
        }

        if let Some(url) = overrides.backend {
            self.backend.url = Some(url);
        }
        if let Some(iface) = overrides.iface {
            self.capture.interface = Some(iface);
        }
        if overrides.print_events {
            self.logging.print_events = true;
        }

        if overrides.mtls {
            let auth = &mut self.auth;
            auth.mode = AuthMode::Mtls;
            auth.token = None;
            auth.cert_path = overrides
                .mtls_cert
                .or(auth.cert_path.take())
                .or_else(|| Some(PathBuf::from("client.crt")));
            auth.key_path = overrides
                .mtls_key
                .or(auth.key_path.take())
                .or_else(|| Some(PathBuf::from("client.key")));
            if overrides.mtls_ca.is_some() {
                auth.ca_path = overrides.mtls_ca;
            }
        } else if let Some(token) = overrides.jwt_token {
            self.auth = AuthConfig {
                mode: AuthMode::Bearer,
                token: Some(token),
                ..AuthConfig::default()
            };
        }
        Ok(())
    }

    pub fn backend_url(&self) -> Result<&str, ConfigError> {
        self.backend
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingBackend)
    }

    /// Resolves the single auth mode used for the lifetime of the process.
    pub fn auth_context(&self) -> Result<AuthContext, ConfigError> {
        let auth = &self.auth;
        match auth.mode {
            AuthMode::None => Ok(AuthContext::None),
            AuthMode::Mtls => {
                let cert_path = auth
                    .cert_path
                    .clone()
                    .ok_or(ConfigError::IncompleteAuth("mtls", "cert_path"))?;
                let key_path = auth
                    .key_path
                    .clone()
                    .ok_or(ConfigError::IncompleteAuth("mtls", "key_path"))?;
                Ok(AuthContext::MutualTls {
                    cert_path,
                    key_path,
                    ca_path: auth.ca_path.clone(),
                })
            }
            AuthMode::Bearer => {
                let token = auth
                    .token
                    .clone()
                    .filter(|t| !t.is_empty())
                    .ok_or(ConfigError::IncompleteAuth("bearer", "token"))?;
                Ok(AuthContext::BearerToken { token })
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.correlation.ttl_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }
}
