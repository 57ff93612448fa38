use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Both mTLS and a bearer token were requested; choose one auth mode")]
    ConflictingAuth,

    #[error("Auth mode '{0}' is missing {1}")]
    IncompleteAuth(&'static str, &'static str),

    #[error("Backend URL is not set")]
    MissingBackend,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("No usable capture interface (pass --iface)")]
    NoDefaultInterface,

    #[error("Unsupported datalink channel on {0}")]
    UnsupportedChannel(String),

    #[error("Failed to open {iface}: {source}")]
    Open {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Read error on {iface}: {source}")]
    Read {
        iface: String,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    /// Read failures may clear up after reopening the interface; everything
    /// else points at configuration and is fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Read { .. })
    }
}

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Connection table unavailable: {0}")]
    TableUnavailable(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to read credential {path}: {source}")]
    Credential {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TLS material: {0}")]
    Tls(#[source] reqwest::Error),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}
