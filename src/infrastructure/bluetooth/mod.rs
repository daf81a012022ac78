//! Bluetooth Module
//!
//! Runs the connection core against a concrete radio.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ControllerService                      │
//! │   (actor owning the ConnectionCore, public handle API)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ RadioAdapter / RadioEvent
//!                       ▼
//!                 ┌────────────┐
//!                 │ WinRtRadio │  (Windows only)
//!                 └─────┬──────┘
//!             ┌─────────┴─────────┐
//!             ▼                   ▼
//!       ┌───────────┐      ┌────────────┐
//!       │  Scanner  │      │ Connection │
//!       │ - adverts │      │ - GATT     │
//!       │ - RSSI    │      │ - writes   │
//!       └───────────┘      └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`service`] - Single-actor controller and its handle
//! - `radio` - WinRT radio adapter
//! - `scanner` - BLE advertisement watcher
//! - `connection` - Device links and GATT access

#[cfg(windows)]
mod connection;
#[cfg(windows)]
mod radio;
#[cfg(windows)]
mod scanner;
pub mod service;

#[cfg(windows)]
pub use radio::WinRtRadio;
pub use service::{ControllerHandle, ControllerService};
