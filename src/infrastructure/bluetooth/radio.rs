//! WinRT implementation of [`RadioAdapter`].
//!
//! Commands return immediately; the WinRT calls run on the tokio runtime the
//! radio was opened on and report back through the [`RadioEvent`] channel.

use crate::domain::models::{GattUuid, PeripheralId, PowerState, WriteMode, WriteTarget};
use crate::domain::radio::{RadioAdapter, RadioEvent};
use crate::error::RadioError;
use crate::infrastructure::bluetooth::connection::{self, platform_error, Link};
use crate::infrastructure::bluetooth::scanner::{peripheral_address, BleScanner};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use windows::core::IInspectable;
use windows::Devices::Bluetooth::BluetoothAdapter;
use windows::Devices::Radios::{Radio, RadioAccessStatus, RadioState};
use windows::Foundation::TypedEventHandler;

type Links = Arc<Mutex<HashMap<PeripheralId, Link>>>;

fn power_from(state: RadioState) -> PowerState {
    match state {
        RadioState::On => PowerState::On,
        RadioState::Off | RadioState::Disabled => PowerState::Off,
        _ => PowerState::Transitioning,
    }
}

pub struct WinRtRadio {
    runtime: Handle,
    event_sender: mpsc::UnboundedSender<RadioEvent>,
    scanner: Mutex<BleScanner>,
    links: Links,
    /// Peripherals the core currently wants connected.
    wanted: Arc<Mutex<HashSet<PeripheralId>>>,
    power: Arc<Mutex<PowerState>>,
    radio: Option<(Radio, i64)>,
}

impl WinRtRadio {
    /// Bind to the default Bluetooth adapter and start tracking its power.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(event_sender: mpsc::UnboundedSender<RadioEvent>) -> Result<Self> {
        let power = Arc::new(Mutex::new(PowerState::Unsupported));
        let radio = match Self::bind_radio(&event_sender, &power).await {
            Ok(radio) => radio,
            Err(e) => {
                error!("No usable Bluetooth radio: {}", e);
                None
            }
        };

        Ok(Self {
            runtime: Handle::current(),
            scanner: Mutex::new(BleScanner::new(event_sender.clone())),
            event_sender,
            links: Arc::new(Mutex::new(HashMap::new())),
            wanted: Arc::new(Mutex::new(HashSet::new())),
            power,
            radio,
        })
    }

    async fn bind_radio(
        event_sender: &mpsc::UnboundedSender<RadioEvent>,
        power: &Arc<Mutex<PowerState>>,
    ) -> Result<Option<(Radio, i64)>> {
        let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
        if !adapter.IsLowEnergySupported()? {
            return Ok(None);
        }

        let radio = adapter.GetRadioAsync()?.await?;
        let access = Radio::RequestAccessAsync()?.await?;
        let initial = if access == RadioAccessStatus::Allowed {
            power_from(radio.State()?)
        } else {
            warn!("Radio access denied: {:?}", access);
            PowerState::Unauthorized
        };
        info!("Bluetooth radio is {:?}", initial);
        if let Ok(mut current) = power.lock() {
            *current = initial;
        }

        let sender = event_sender.clone();
        let tracked = power.clone();
        let handler = TypedEventHandler::new(
            move |radio: windows::core::Ref<Radio>, _: windows::core::Ref<IInspectable>| {
                if let Some(radio) = radio.as_ref() {
                    let state = power_from(radio.State()?);
                    let changed = match tracked.lock() {
                        Ok(mut current) if *current != state => {
                            *current = state;
                            true
                        }
                        _ => false,
                    };
                    if changed {
                        let _ = sender.send(RadioEvent::PowerStateChanged(state));
                    }
                }
                Ok(())
            },
        );
        let token = radio.StateChanged(&handler)?;

        Ok(Some((radio, token)))
    }

    fn send(&self, event: RadioEvent) {
        let _ = self.event_sender.send(event);
    }

    fn close_link(&self, peripheral: &PeripheralId) {
        let link = self
            .links
            .lock()
            .ok()
            .and_then(|mut links| links.remove(peripheral));
        if let Some(link) = link {
            debug!("Closing link to {}", peripheral);
            link.close();
        }
    }
}

impl RadioAdapter for WinRtRadio {
    fn power_state(&self) -> PowerState {
        self.power
            .lock()
            .map(|p| *p)
            .unwrap_or(PowerState::Unsupported)
    }

    fn scan(&self, services: &[GattUuid]) {
        let result = self
            .scanner
            .lock()
            .map_err(|_| anyhow::anyhow!("Scanner lock poisoned"))
            .and_then(|mut scanner| scanner.start(services));
        if let Err(e) = result {
            error!("Failed to start scan: {}", e);
        }
    }

    fn stop_scan(&self) {
        if let Ok(mut scanner) = self.scanner.lock() {
            if let Err(e) = scanner.stop() {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    fn connect(&self, peripheral: &PeripheralId) {
        if let Ok(mut wanted) = self.wanted.lock() {
            wanted.insert(peripheral.clone());
        }

        let peripheral = peripheral.clone();
        let sender = self.event_sender.clone();
        let links = self.links.clone();
        let wanted = self.wanted.clone();
        self.runtime.spawn(async move {
            match Link::open(&peripheral, sender.clone()).await {
                Ok(link) => {
                    let still_wanted = wanted
                        .lock()
                        .map(|w| w.contains(&peripheral))
                        .unwrap_or(false);
                    if !still_wanted {
                        debug!("Connect to {} cancelled while opening", peripheral);
                        link.close();
                        return;
                    }
                    if let Ok(mut links) = links.lock() {
                        if let Some(old) = links.insert(peripheral.clone(), link) {
                            old.close();
                        }
                    }
                    let _ = sender.send(RadioEvent::Connected { peripheral });
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", peripheral, e);
                    let _ = sender.send(RadioEvent::FailedToConnect {
                        peripheral,
                        error: Some(platform_error(e)),
                    });
                }
            }
        });
    }

    fn disconnect(&self, peripheral: &PeripheralId) {
        if let Ok(mut wanted) = self.wanted.lock() {
            wanted.remove(peripheral);
        }
        self.close_link(peripheral);
    }

    fn discover_services(&self, peripheral: &PeripheralId, services: &[GattUuid]) {
        let device = self
            .links
            .lock()
            .ok()
            .and_then(|links| links.get(peripheral).map(|l| l.device().clone()));
        let Some(device) = device else {
            self.send(RadioEvent::ServicesDiscovered {
                peripheral: peripheral.clone(),
                result: Err(RadioError::ConnectionLost),
            });
            return;
        };

        let peripheral = peripheral.clone();
        let wanted = services.to_vec();
        let sender = self.event_sender.clone();
        let links = self.links.clone();
        self.runtime.spawn(async move {
            let result = connection::discover_services(&device, &wanted)
                .await
                .map(|found| {
                    let uuids: Vec<GattUuid> = found.iter().map(|(uuid, _)| *uuid).collect();
                    if let Ok(mut links) = links.lock() {
                        if let Some(link) = links.get_mut(&peripheral) {
                            link.add_services(found);
                        }
                    }
                    uuids
                });
            let _ = sender.send(RadioEvent::ServicesDiscovered { peripheral, result });
        });
    }

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &GattUuid,
        characteristics: &[GattUuid],
    ) {
        let gatt_service = self
            .links
            .lock()
            .ok()
            .and_then(|links| links.get(peripheral).and_then(|l| l.service(service)));
        let Some(gatt_service) = gatt_service else {
            self.send(RadioEvent::CharacteristicsDiscovered {
                peripheral: peripheral.clone(),
                service: *service,
                result: Err(RadioError::Gatt(format!("service {} not resolved", service))),
            });
            return;
        };

        let peripheral = peripheral.clone();
        let service = *service;
        let wanted = characteristics.to_vec();
        let sender = self.event_sender.clone();
        let links = self.links.clone();
        self.runtime.spawn(async move {
            let result = connection::discover_characteristics(&gatt_service, &wanted)
                .await
                .map(|found| {
                    let infos = found.iter().map(|(info, _)| *info).collect();
                    if let Ok(mut links) = links.lock() {
                        if let Some(link) = links.get_mut(&peripheral) {
                            link.add_characteristics(
                                service,
                                found.into_iter().map(|(info, c)| (info.uuid, c)).collect(),
                            );
                        }
                    }
                    infos
                });
            let _ = sender.send(RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            });
        });
    }

    fn write_value(&self, target: &WriteTarget, bytes: &[u8], mode: WriteMode) {
        let characteristic = self.links.lock().ok().and_then(|links| {
            links
                .get(&target.peripheral)
                .and_then(|l| l.characteristic(&target.service, &target.characteristic))
        });
        let Some(characteristic) = characteristic else {
            warn!(
                "Write to {} dropped, characteristic {} not resolved",
                target.peripheral, target.characteristic
            );
            return;
        };

        let bytes = bytes.to_vec();
        let peripheral = target.peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = connection::write_value(&characteristic, &bytes, mode).await {
                warn!("Write to {} failed: {}", peripheral, e);
            }
        });
    }

    fn read_signal_strength(&self, peripheral: &PeripheralId) {
        let rssi = peripheral_address(peripheral).ok().and_then(|address| {
            self.scanner
                .lock()
                .ok()
                .and_then(|scanner| scanner.last_rssi(address))
        });
        let result = rssi.ok_or_else(|| RadioError::Platform("no advertisement seen".into()));
        self.send(RadioEvent::SignalStrengthRead {
            peripheral: peripheral.clone(),
            result,
        });
    }
}

impl Drop for WinRtRadio {
    fn drop(&mut self) {
        if let Some((radio, token)) = self.radio.take() {
            let _ = radio.RemoveStateChanged(token);
        }
        if let Ok(mut links) = self.links.lock() {
            for (_, link) in links.drain() {
                link.close();
            }
        }
    }
}
