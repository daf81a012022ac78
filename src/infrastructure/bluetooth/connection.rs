//! BLE Connection Module
//!
//! One [`Link`] per connected accessory: the device handle, the GATT session
//! keeping it connected, and the GATT objects resolved during discovery.

use crate::domain::models::{CharacteristicInfo, GattUuid, PeripheralId, WriteMode};
use crate::domain::radio::RadioEvent;
use crate::error::RadioError;
use crate::infrastructure::bluetooth::scanner::{peripheral_address, to_guid};
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use windows::core::IInspectable;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties, GattCommunicationStatus,
    GattDeviceService, GattSession, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataWriter;
use windows_future::IAsyncOperation;

pub struct Link {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
    services: HashMap<GattUuid, GattDeviceService>,
    characteristics: HashMap<(GattUuid, GattUuid), GattCharacteristic>,
}

impl Link {
    /// Open the device and keep the link up.
    ///
    /// A drop of the link is reported as [`RadioEvent::Disconnected`].
    pub async fn open(
        peripheral: &PeripheralId,
        event_sender: mpsc::UnboundedSender<RadioEvent>,
    ) -> Result<Self> {
        let address = peripheral_address(peripheral)?;
        info!("Connecting to Bluetooth device: {:#X}", address);

        let opening: IAsyncOperation<BluetoothLEDevice> =
            BluetoothLEDevice::FromBluetoothAddressAsync(address)?;
        let device = opening.await?;

        let session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession for {}: {}", peripheral, e);
                None
            }
        };

        let id = peripheral.clone();
        let handler = TypedEventHandler::new(
            move |sender: windows::core::Ref<BluetoothLEDevice>,
                  _: windows::core::Ref<IInspectable>| {
                if let Some(device) = sender.as_ref() {
                    if device.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = event_sender.send(RadioEvent::Disconnected {
                            peripheral: id.clone(),
                            error: Some(RadioError::ConnectionLost),
                        });
                    }
                }
                Ok(())
            },
        );
        let status_token = device.ConnectionStatusChanged(&handler)?;

        Ok(Self {
            device,
            session,
            status_token,
            services: HashMap::new(),
            characteristics: HashMap::new(),
        })
    }

    async fn create_gatt_session(device: &BluetoothLEDevice) -> Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    pub fn device(&self) -> &BluetoothLEDevice {
        &self.device
    }

    pub fn service(&self, uuid: &GattUuid) -> Option<GattDeviceService> {
        self.services.get(uuid).cloned()
    }

    pub fn characteristic(
        &self,
        service: &GattUuid,
        characteristic: &GattUuid,
    ) -> Option<GattCharacteristic> {
        self.characteristics
            .get(&(*service, *characteristic))
            .cloned()
    }

    pub fn add_services(&mut self, services: Vec<(GattUuid, GattDeviceService)>) {
        self.services.extend(services);
    }

    pub fn add_characteristics(
        &mut self,
        service: GattUuid,
        characteristics: Vec<(GattUuid, GattCharacteristic)>,
    ) {
        for (uuid, characteristic) in characteristics {
            self.characteristics.insert((service, uuid), characteristic);
        }
    }

    /// Release every WinRT object held by the link.
    pub fn close(self) {
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        for service in self.services.values() {
            let _ = service.Close();
        }
        if let Some(session) = &self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}

fn status_error(status: GattCommunicationStatus) -> RadioError {
    if status == GattCommunicationStatus::Unreachable {
        RadioError::Unreachable
    } else {
        RadioError::Gatt(format!("{:?}", status))
    }
}

pub fn platform_error(e: impl std::fmt::Display) -> RadioError {
    RadioError::Platform(e.to_string())
}

/// Look up each of `wanted` on `device`.
pub async fn discover_services(
    device: &BluetoothLEDevice,
    wanted: &[GattUuid],
) -> std::result::Result<Vec<(GattUuid, GattDeviceService)>, RadioError> {
    let mut found = Vec::new();
    for uuid in wanted {
        let result = device
            .GetGattServicesForUuidAsync(to_guid(uuid))
            .map_err(platform_error)?
            .await
            .map_err(platform_error)?;

        let status = result.Status().map_err(platform_error)?;
        if status != GattCommunicationStatus::Success {
            return Err(status_error(status));
        }

        let services = result.Services().map_err(platform_error)?;
        for i in 0..services.Size().map_err(platform_error)? {
            found.push((*uuid, services.GetAt(i).map_err(platform_error)?));
        }
    }
    Ok(found)
}

/// Look up each of `wanted` on `service` together with its write properties.
pub async fn discover_characteristics(
    service: &GattDeviceService,
    wanted: &[GattUuid],
) -> std::result::Result<Vec<(CharacteristicInfo, GattCharacteristic)>, RadioError> {
    let mut found = Vec::new();
    for uuid in wanted {
        let result = service
            .GetCharacteristicsForUuidAsync(to_guid(uuid))
            .map_err(platform_error)?
            .await
            .map_err(platform_error)?;

        let status = result.Status().map_err(platform_error)?;
        if status != GattCommunicationStatus::Success {
            return Err(status_error(status));
        }

        let characteristics = result.Characteristics().map_err(platform_error)?;
        for i in 0..characteristics.Size().map_err(platform_error)? {
            let characteristic = characteristics.GetAt(i).map_err(platform_error)?;
            let properties = characteristic
                .CharacteristicProperties()
                .map_err(platform_error)?;
            let info = CharacteristicInfo {
                uuid: *uuid,
                write: properties.0 & GattCharacteristicProperties::Write.0 != 0,
                write_without_response: properties.0
                    & GattCharacteristicProperties::WriteWithoutResponse.0
                    != 0,
            };
            found.push((info, characteristic));
        }
    }
    Ok(found)
}

pub async fn write_value(
    characteristic: &GattCharacteristic,
    bytes: &[u8],
    mode: WriteMode,
) -> Result<()> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(bytes)?;
    let buffer = writer.DetachBuffer()?;

    let option = match mode {
        WriteMode::Acknowledged => GattWriteOption::WriteWithResponse,
        WriteMode::Unacknowledged => GattWriteOption::WriteWithoutResponse,
    };
    let status = characteristic
        .WriteValueWithOptionAsync(&buffer, option)?
        .await?;
    if status != GattCommunicationStatus::Success {
        anyhow::bail!("Write failed with status {:?}", status);
    }
    Ok(())
}
