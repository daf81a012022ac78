//! BLE central core for a serial-bridge LED accessory.
//!
//! - [`domain`] - state machine, identity, framing and observer plumbing
//! - [`infrastructure`] - actor service, radio backend, file stores, logging
//! - [`presentation`] - console command parsing

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use error::{Error, RadioError, Result};
