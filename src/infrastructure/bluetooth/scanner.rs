//! BLE Scanner Module
//!
//! Advertisement watcher reporting peripherals that advertise one of the
//! requested services. The last RSSI of every sighting is cached, since
//! WinRT cannot read the signal strength of a connected device.

use crate::domain::models::{GattUuid, PeripheralId};
use crate::domain::radio::RadioEvent;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Address to the id reported upward
pub fn peripheral_id(address: u64) -> PeripheralId {
    PeripheralId::new(format!("{:012X}", address))
}

/// Inverse of [`peripheral_id`]
pub fn peripheral_address(peripheral: &PeripheralId) -> Result<u64> {
    u64::from_str_radix(peripheral.as_str(), 16)
        .map_err(|_| anyhow::anyhow!("Not a Bluetooth address: {}", peripheral))
}

pub fn to_guid(uuid: &GattUuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    event_sender: mpsc::UnboundedSender<RadioEvent>,
    rssi_cache: Arc<Mutex<HashMap<u64, i16>>>,
}

impl BleScanner {
    pub fn new(event_sender: mpsc::UnboundedSender<RadioEvent>) -> Self {
        Self {
            watcher: None,
            event_sender,
            rssi_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start (or restart) scanning for `services`.
    pub fn start(&mut self, services: &[GattUuid]) -> Result<()> {
        self.stop()?;

        info!("Starting BLE scan for services: {:?}", services);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.event_sender.clone();
        let cache = self.rssi_cache.clone();
        let wanted: Vec<GUID> = services.iter().map(to_guid).collect();

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let service_uuids = args.Advertisement()?.ServiceUuids()?;

                    let mut found = wanted.is_empty();
                    for i in 0..service_uuids.Size()? {
                        if wanted.contains(&service_uuids.GetAt(i)?) {
                            found = true;
                            break;
                        }
                    }

                    if found {
                        let address = args.BluetoothAddress()?;
                        let rssi = args.RawSignalStrengthInDBm()?;
                        if let Ok(mut cache) = cache.lock() {
                            cache.insert(address, rssi);
                        }
                        let _ = sender.send(RadioEvent::PeripheralDiscovered {
                            peripheral: peripheral_id(address),
                            rssi: Some(rssi),
                        });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            debug!("Stopping BLE scan");
            watcher.Stop()?;
        }
        Ok(())
    }

    /// Signal strength of the last advertisement seen from `address`.
    pub fn last_rssi(&self, address: u64) -> Option<i16> {
        self.rssi_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(&address).copied())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
