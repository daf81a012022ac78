//! Abstract central-role radio.
//!
//! Commands are fire-and-forget: they return immediately and their
//! outcome arrives later as a [`RadioEvent`] on the channel the backend
//! was created with.

use crate::domain::models::{
    CharacteristicInfo, GattUuid, PeripheralId, PowerState, WriteMode, WriteTarget,
};
use crate::error::RadioError;

/// Events emitted by a radio backend, in the order it produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    PowerStateChanged(PowerState),
    PeripheralDiscovered {
        peripheral: PeripheralId,
        rssi: Option<i16>,
    },
    Connected {
        peripheral: PeripheralId,
    },
    FailedToConnect {
        peripheral: PeripheralId,
        error: Option<RadioError>,
    },
    Disconnected {
        peripheral: PeripheralId,
        error: Option<RadioError>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: Result<Vec<GattUuid>, RadioError>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: GattUuid,
        result: Result<Vec<CharacteristicInfo>, RadioError>,
    },
    SignalStrengthRead {
        peripheral: PeripheralId,
        result: Result<i16, RadioError>,
    },
}

/// Command side of the radio.
pub trait RadioAdapter: Send {
    fn power_state(&self) -> PowerState;

    fn scan(&self, services: &[GattUuid]);

    fn stop_scan(&self);

    /// Peripherals already connected at the OS level exposing any of
    /// `services`.
    fn retrieve_connected(&self, _services: &[GattUuid]) -> Vec<PeripheralId> {
        Vec::new()
    }

    fn connect(&self, peripheral: &PeripheralId);

    fn disconnect(&self, peripheral: &PeripheralId);

    fn discover_services(&self, peripheral: &PeripheralId, services: &[GattUuid]);

    fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: &GattUuid,
        characteristics: &[GattUuid],
    );

    fn write_value(&self, target: &WriteTarget, bytes: &[u8], mode: WriteMode);

    fn read_signal_strength(&self, peripheral: &PeripheralId);
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording radio used by the state machine tests.

    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum RadioCall {
        Scan(Vec<GattUuid>),
        StopScan,
        RetrieveConnected(Vec<GattUuid>),
        Connect(PeripheralId),
        Disconnect(PeripheralId),
        DiscoverServices(PeripheralId, Vec<GattUuid>),
        DiscoverCharacteristics(PeripheralId, GattUuid, Vec<GattUuid>),
        Write(WriteTarget, Vec<u8>, WriteMode),
        ReadRssi(PeripheralId),
    }

    #[derive(Clone)]
    pub struct MockRadio {
        pub calls: Arc<Mutex<Vec<RadioCall>>>,
        pub power: Arc<Mutex<PowerState>>,
        pub already_connected: Arc<Mutex<Vec<PeripheralId>>>,
    }

    impl MockRadio {
        pub fn new(power: PowerState) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                power: Arc::new(Mutex::new(power)),
                already_connected: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn take_calls(&self) -> Vec<RadioCall> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    RadioCall::Write(_, bytes, _) => Some(bytes.clone()),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: RadioCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl RadioAdapter for MockRadio {
        fn power_state(&self) -> PowerState {
            *self.power.lock().unwrap()
        }

        fn scan(&self, services: &[GattUuid]) {
            self.record(RadioCall::Scan(services.to_vec()));
        }

        fn stop_scan(&self) {
            self.record(RadioCall::StopScan);
        }

        fn retrieve_connected(&self, services: &[GattUuid]) -> Vec<PeripheralId> {
            self.record(RadioCall::RetrieveConnected(services.to_vec()));
            self.already_connected.lock().unwrap().clone()
        }

        fn connect(&self, peripheral: &PeripheralId) {
            self.record(RadioCall::Connect(peripheral.clone()));
        }

        fn disconnect(&self, peripheral: &PeripheralId) {
            self.record(RadioCall::Disconnect(peripheral.clone()));
        }

        fn discover_services(&self, peripheral: &PeripheralId, services: &[GattUuid]) {
            self.record(RadioCall::DiscoverServices(
                peripheral.clone(),
                services.to_vec(),
            ));
        }

        fn discover_characteristics(
            &self,
            peripheral: &PeripheralId,
            service: &GattUuid,
            characteristics: &[GattUuid],
        ) {
            self.record(RadioCall::DiscoverCharacteristics(
                peripheral.clone(),
                *service,
                characteristics.to_vec(),
            ));
        }

        fn write_value(&self, target: &WriteTarget, bytes: &[u8], mode: WriteMode) {
            self.record(RadioCall::Write(target.clone(), bytes.to_vec(), mode));
        }

        fn read_signal_strength(&self, peripheral: &PeripheralId) {
            self.record(RadioCall::ReadRssi(peripheral.clone()));
        }
    }
}
