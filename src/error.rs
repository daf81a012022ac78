//! Error types shared by the domain and infrastructure layers.

use thiserror::Error;

/// Library-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Identity store I/O failed: {0}")]
    IdentityIo(#[from] std::io::Error),

    #[error("Identity store is corrupt: {0}")]
    IdentityFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the radio stack alongside an event.
///
/// Travels inside events and notifications, so it is cheap to clone and
/// comparable in tests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Operation timed out")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Peripheral unreachable")]
    Unreachable,

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("Platform error: {0}")]
    Platform(String),
}
