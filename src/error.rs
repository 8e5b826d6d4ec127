use thiserror::Error;

/// Reasons a tracking session fails to come up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Camera stream {0} is not on a secure origin")]
    InsecureOrigin(String),

    #[error("Invalid camera url {url}: {reason}")]
    InvalidCameraUrl { url: String, reason: String },

    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("Camera produced no frame within {0:?}")]
    CameraNotReady(std::time::Duration),

    #[error("Failed to load face detector")]
    DetectorLoad(#[source] anyhow::Error),

    #[error("Startup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failures reported by a message bridge for a single send.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Receiver is not up yet. Worth retrying.
    #[error("Receiver {0} not ready")]
    NotReady(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to encode payload")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value: {field} - {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("Zenoh error {0:?}")]
    ZenohError(#[from] zenoh::Error),
}
