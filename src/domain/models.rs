use crate::error::{Error, RadioError};
use std::fmt;
use std::str::FromStr;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Platform identifier of a peripheral (UUID on Apple stacks, MAC on others).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Service or characteristic identifier.
///
/// Accepts the 16-bit (`FFE0`), 32-bit and full 128-bit textual forms.
/// Short forms are expanded against the Bluetooth base UUID so that
/// `FFE0` and `0000FFE0-0000-1000-8000-00805F9B34FB` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattUuid(u128);

impl GattUuid {
    pub const fn from_u16(short: u16) -> Self {
        Self(BASE_UUID | ((short as u128) << 96))
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// The 16-bit alias, if this UUID is derived from the base UUID.
    pub fn short(&self) -> Option<u16> {
        let low_mask: u128 = (1 << 96) - 1;
        if self.0 & low_mask == BASE_UUID & low_mask && self.0 >> 112 == 0 {
            Some((self.0 >> 96) as u16)
        } else {
            None
        }
    }

    pub fn parse(text: &str) -> crate::error::Result<Self> {
        let hex = text.trim().replace('-', "");
        let invalid = || Error::InvalidUuid(text.to_string());

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        match hex.len() {
            4 | 8 => {
                let value = u32::from_str_radix(&hex, 16).map_err(|_| invalid())?;
                Ok(Self(BASE_UUID | ((value as u128) << 96)))
            }
            32 => u128::from_str_radix(&hex, 16)
                .map(Self)
                .map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl FromStr for GattUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for GattUuid {
    /// Short aliases print as 4 hex digits, everything else in the
    /// canonical 8-4-4-4-12 form. Both round-trip through `parse`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(short) = self.short() {
            return write!(f, "{:04X}", short);
        }
        let v = self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
    Unauthorized,
    Unsupported,
    Transitioning,
}

impl PowerState {
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The link dropped after connecting.
    LinkLost(Option<RadioError>),
    /// The radio never established the link.
    ConnectFailed(Option<RadioError>),
    /// The local radio left the powered-on state.
    RadioUnavailable(PowerState),
}

/// The single authoritative connection state owned by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnected(DisconnectReason),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Scanning => f.write_str("scanning"),
            Self::Connecting => f.write_str("connecting"),
            Self::DiscoveringServices => f.write_str("discovering services"),
            Self::DiscoveringCharacteristics => f.write_str("discovering characteristics"),
            Self::Ready => f.write_str("ready"),
            Self::Disconnected(reason) => write!(f, "disconnected ({:?})", reason),
        }
    }
}

/// How writes to the data characteristic are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Acknowledged,
    Unacknowledged,
}

/// The service/characteristic pair the core looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSelector {
    pub service: GattUuid,
    pub characteristic: GattUuid,
}

impl TargetSelector {
    pub fn new(service: GattUuid, characteristic: GattUuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    pub fn parse(service: &str, characteristic: &str) -> crate::error::Result<Self> {
        Ok(Self::new(
            GattUuid::parse(service)?,
            GattUuid::parse(characteristic)?,
        ))
    }
}

/// A candidate reported during a scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub id: PeripheralId,
    pub rssi: Option<i16>,
}

/// Properties advertised by a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: GattUuid,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicInfo {
    /// Acknowledged writes win when both are advertised.
    pub fn write_mode(&self) -> WriteMode {
        if self.write {
            WriteMode::Acknowledged
        } else {
            WriteMode::Unacknowledged
        }
    }
}

/// The resolved data channel of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub peripheral: PeripheralId,
    pub service: GattUuid,
    pub characteristic: GattUuid,
    pub mode: WriteMode,
}

/// Live link to the accessory, from connect request to disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedSession {
    pub peripheral: PeripheralId,
    /// Set once the write characteristic is resolved.
    pub write_target: Option<WriteTarget>,
}

impl ConnectedSession {
    pub fn new(peripheral: PeripheralId) -> Self {
        Self {
            peripheral,
            write_target: None,
        }
    }
}

/// The accessory that last proved usable end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastKnownAccessory {
    pub accessory: PeripheralId,
    pub target: TargetSelector,
}

/// Result of a `send` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Rejected(SendRejection),
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejection {
    NotReady,
    NoSession,
    CoolingDown,
}
