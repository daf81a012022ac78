//! LED Accessory Protocol
//!
//! Wire format and identifiers for the serial-over-BLE LED receiver
//! (HM-10 style module in front of an APA102 strip driver).

use crate::domain::models::GattUuid;
use std::time::Duration;

/// HM-10 serial service
pub const SERVICE_UUID: &str = "FFE0";

/// HM-10 serial data characteristic, the only writable channel
pub const CHARACTERISTIC_UUID: &str = "FFE1";

/// First byte of every frame (0b0101_0101)
pub const START_MARKER: u8 = 0x55;

/// Last byte of every frame (0b1010_1010)
pub const END_MARKER: u8 = 0xAA;

/// Minimum spacing between two frames in milliseconds
pub const FRAME_COOLDOWN_MS: u64 = 200;

/// Brightness ceiling of the APA102 driver sketch
pub const MAX_BRIGHTNESS: u8 = 31;

/// Brightness used when the caller does not pick one
pub const DEFAULT_BRIGHTNESS: u8 = 10;

pub fn default_cooldown() -> Duration {
    Duration::from_millis(FRAME_COOLDOWN_MS)
}

pub fn default_service() -> GattUuid {
    GattUuid::from_u16(0xFFE0)
}

pub fn default_characteristic() -> GattUuid {
    GattUuid::from_u16(0xFFE1)
}

/// Wrap a payload into a frame
///
/// # Frame Structure
///
/// ```text
/// [0]       : START_MARKER (0x55)
/// [1..n+1]  : payload bytes, unescaped
/// [n+1]     : END_MARKER (0xAA)
/// ```
///
/// There is no length field and no checksum. The receiver scans for the
/// markers, so a payload byte equal to either marker is ambiguous on the
/// wire. See [`payload_contains_marker`].
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(START_MARKER);
    frame.extend_from_slice(payload);
    frame.push(END_MARKER);
    frame
}

/// True when the receiver could mistake a payload byte for a frame boundary
pub fn payload_contains_marker(payload: &[u8]) -> bool {
    payload
        .iter()
        .any(|&b| b == START_MARKER || b == END_MARKER)
}

/// One colour command for the strip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub brightness: u8,
}

impl LedColor {
    pub fn new(red: u8, green: u8, blue: u8, brightness: u8) -> Self {
        Self {
            red,
            green,
            blue,
            brightness: brightness.min(MAX_BRIGHTNESS),
        }
    }

    /// Build from unit-range channels (0.0..=1.0), truncating like the
    /// colour picker does.
    pub fn from_unit_rgb(red: f32, green: f32, blue: f32, brightness: u8) -> Self {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0) as u8;
        Self::new(channel(red), channel(green), channel(blue), brightness)
    }

    /// Payload bytes: `[r, g, b, brightness]`
    pub fn as_payload(&self) -> [u8; 4] {
        [self.red, self.green, self.blue, self.brightness]
    }
}
