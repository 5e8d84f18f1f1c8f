//! Common error types shared by the service binaries

use thiserror::Error;

/// Errors raised while loading or validating service configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more required settings are absent. The service refuses to start
    /// rather than operate partially; the list names every missing setting so
    /// the operator can fix them in one pass.
    #[error("Missing configuration: {}", .0.join(", "))]
    ConfigMissing(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
