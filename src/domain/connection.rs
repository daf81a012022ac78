//! Connection Core
//!
//! Owns the connection state machine, the single accessory session and the
//! framed transmitter. Every input is either an application command or a
//! [`RadioEvent`]; both must be fed from one sequential context (see
//! `infrastructure::bluetooth::service`).
//!
//! ```text
//!  Idle ──start_scan──▶ Scanning ──discover(last known)──▶ Connecting
//!                                                              │ connected
//!                                                              ▼
//!  Ready ◀──characteristic found── DiscoveringCharacteristics ◀─ DiscoveringServices
//!    │
//!    └──disconnected / failed──▶ Disconnected(reason) ──▶ Idle
//! ```

use crate::domain::identity::{IdentityRecord, IdentityStore};
use crate::domain::models::{
    CharacteristicInfo, ConnectedSession, ConnectionState, DisconnectReason, GattUuid,
    LastKnownAccessory, PeripheralId, PowerState, SendOutcome, SendRejection, TargetSelector,
    WriteTarget,
};
use crate::domain::observer::{ConnectionObserver, CoreEvent, ObserverId, ObserverRegistry};
use crate::domain::protocol;
use crate::domain::radio::{RadioAdapter, RadioEvent};
use crate::error::RadioError;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::transmitter::FrameTransmitter;

/// Tunables of the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Minimum spacing between two outbound frames
    pub cooldown: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cooldown: protocol::default_cooldown(),
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// The state machine driving one accessory link.
pub struct ConnectionCore<R: RadioAdapter, S: IdentityStore> {
    radio: R,
    identity: IdentityRecord<S>,
    observers: ObserverRegistry,
    transmitter: FrameTransmitter,

    state: ConnectionState,
    power: PowerState,
    target: Option<TargetSelector>,
    last_known: Option<LastKnownAccessory>,
    session: Option<ConnectedSession>,

    /// An explicit scan request is outstanding; replayed on power-on.
    scan_requested: bool,
    /// Peripheral to reconnect to once the radio is back.
    pending_reconnect: Option<PeripheralId>,
}

impl<R: RadioAdapter, S: IdentityStore> ConnectionCore<R, S> {
    /// Build the core and seed target and affinity from the store.
    pub fn new(radio: R, store: S, config: CoreConfig) -> Self {
        let identity = IdentityRecord::new(store);
        let restored = identity.restore();
        let power = radio.power_state();
        let transmitter = FrameTransmitter::new(config.cooldown);

        info!(
            "Connection core created (radio {:?}, target {:?}, last accessory {:?}, cooldown {:?})",
            power,
            restored.target,
            restored.last_known.as_ref().map(|a| &a.accessory),
            transmitter.cooldown()
        );

        Self {
            radio,
            identity,
            observers: ObserverRegistry::new(),
            transmitter,
            state: ConnectionState::Idle,
            power,
            target: restored.target,
            last_known: restored.last_known,
            session: None,
            scan_requested: false,
            pending_reconnect: None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    pub fn target(&self) -> Option<TargetSelector> {
        self.target
    }

    pub fn last_known(&self) -> Option<&LastKnownAccessory> {
        self.last_known.as_ref()
    }

    pub fn session(&self) -> Option<&ConnectedSession> {
        self.session.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
            && self.power.is_on()
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.write_target.is_some())
    }

    pub fn identity_store(&self) -> &S {
        self.identity.store()
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn register_observer(&mut self, observer: Box<dyn ConnectionObserver>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&mut self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    // ------------------------------------------------------------------
    // Application commands
    // ------------------------------------------------------------------

    /// Set the service/characteristic pair. Only accepted while idle.
    pub fn configure_target(&mut self, target: TargetSelector) -> bool {
        if self.state != ConnectionState::Idle {
            warn!(
                "Ignoring target change to {:?} while {}",
                target, self.state
            );
            return false;
        }
        info!(
            "Target set to service {} / characteristic {}",
            target.service, target.characteristic
        );
        self.target = Some(target);
        true
    }

    pub fn start_scan(&mut self) {
        let Some(target) = self.target else {
            debug!("Scan requested without a target selector, ignoring");
            return;
        };

        self.scan_requested = true;
        if !self.power.is_on() {
            info!("Radio is {:?}, scan deferred until powered on", self.power);
            return;
        }

        self.issue_scan(target);
    }

    pub fn stop_scan(&mut self) {
        self.scan_requested = false;
        self.radio.stop_scan();
        if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Idle);
        }
        info!("Scan stopped");
    }

    pub fn rescan(&mut self) {
        self.stop_scan();
        self.start_scan();
    }

    pub fn connect(&mut self, peripheral: PeripheralId) {
        if let Some(session) = &self.session {
            if session.peripheral == peripheral {
                debug!("Already connected/connecting to {}", peripheral);
                return;
            }
            self.teardown_session();
        }

        if !self.power.is_on() {
            info!(
                "Radio is {:?}, connect to {} deferred until powered on",
                self.power, peripheral
            );
            self.pending_reconnect = Some(peripheral);
            return;
        }

        self.issue_connect(peripheral);
    }

    /// Drop the remembered accessory. The target selector is kept.
    pub fn forget_last_device(&mut self) {
        info!("Forgetting last accessory {:?}", self.last_known.as_ref().map(|a| &a.accessory));
        self.last_known = None;
        self.pending_reconnect = None;
        self.clear_identity();
    }

    pub fn send(&mut self, payload: &[u8]) -> SendOutcome {
        if !self.is_ready() {
            let rejection = if self.session.is_none() {
                SendRejection::NoSession
            } else {
                SendRejection::NotReady
            };
            debug!("Send rejected: {:?}", rejection);
            return SendOutcome::Rejected(rejection);
        }

        let target = self.session.as_ref().and_then(|s| s.write_target.as_ref());
        self.transmitter.transmit(&self.radio, target, payload)
    }

    /// Release the radio: stop scanning and drop the live link.
    pub fn shutdown(&mut self) {
        info!("Shutting down connection core");
        self.scan_requested = false;
        self.pending_reconnect = None;
        self.radio.stop_scan();
        self.teardown_session();
        self.set_state(ConnectionState::Idle);
    }

    // ------------------------------------------------------------------
    // Radio events
    // ------------------------------------------------------------------

    pub fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::PowerStateChanged(power) => self.on_power_state(power),
            RadioEvent::PeripheralDiscovered { peripheral, rssi } => {
                self.on_discovered(peripheral, rssi)
            }
            RadioEvent::Connected { peripheral } => self.on_connected(peripheral),
            RadioEvent::FailedToConnect { peripheral, error } => {
                self.on_failed_to_connect(peripheral, error)
            }
            RadioEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(peripheral, error)
            }
            RadioEvent::ServicesDiscovered { peripheral, result } => {
                self.on_services(peripheral, result)
            }
            RadioEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => self.on_characteristics(peripheral, service, result),
            RadioEvent::SignalStrengthRead { peripheral, result } => match result {
                Ok(rssi) => self.observers.publish(CoreEvent::RssiUpdated {
                    id: peripheral,
                    rssi,
                }),
                Err(e) => debug!("RSSI read for {} failed: {}", peripheral, e),
            },
        }
    }

    fn on_power_state(&mut self, power: PowerState) {
        let previous = self.power;
        self.power = power;
        info!("Radio power {:?} -> {:?}", previous, power);
        self.observers.publish(CoreEvent::PowerStateChanged(power));

        if power.is_on() {
            if !previous.is_on() {
                self.recover_after_power_on();
            }
        } else {
            self.on_radio_unavailable(power);
        }
    }

    /// Radio outage: the link is gone but the accessory is not forgotten.
    fn on_radio_unavailable(&mut self, power: PowerState) {
        if let Some(session) = self.session.take() {
            info!(
                "Radio {:?}, session with {} suspended",
                power, session.peripheral
            );
            self.pending_reconnect = Some(session.peripheral);
            self.set_state(ConnectionState::Disconnected(
                DisconnectReason::RadioUnavailable(power),
            ));
            self.set_state(ConnectionState::Idle);
        } else if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Power-on recovery rule.
    ///
    /// Order: the suspended or deferred session target, then the last known
    /// accessory, then a scan if one was explicitly requested.
    fn recover_after_power_on(&mut self) {
        if self.session.is_some() {
            return;
        }

        let reconnect = self
            .pending_reconnect
            .take()
            .or_else(|| self.last_known.as_ref().map(|a| a.accessory.clone()));

        match (reconnect, self.target) {
            (Some(peripheral), Some(_)) => {
                info!("Radio back on, reconnecting to {}", peripheral);
                self.issue_connect(peripheral);
            }
            (_, Some(target)) if self.scan_requested => {
                info!("Radio back on, resuming scan");
                self.issue_scan(target);
            }
            _ => debug!("Radio back on, nothing to recover"),
        }
    }

    fn on_discovered(&mut self, peripheral: PeripheralId, rssi: Option<i16>) {
        if self.should_auto_connect(&peripheral) {
            info!("Discovered last known accessory {}, connecting", peripheral);
            self.issue_connect(peripheral.clone());
        }
        self.observers.publish(CoreEvent::PeripheralDiscovered {
            id: peripheral,
            rssi,
        });
    }

    /// Auto-reconnect rule: while scanning with no session, a sighting of
    /// the last known accessory connects without user input.
    fn should_auto_connect(&self, peripheral: &PeripheralId) -> bool {
        self.state == ConnectionState::Scanning
            && self.session.is_none()
            && self
                .last_known
                .as_ref()
                .is_some_and(|a| &a.accessory == peripheral)
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        if !self.is_session_peer(&peripheral) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connected event for {} in {}", peripheral, self.state);
            return;
        }

        let Some(target) = self.target else {
            warn!("Connected to {} without a target selector, parking", peripheral);
            return;
        };

        info!("Connected to {}, discovering service {}", peripheral, target.service);
        self.set_state(ConnectionState::DiscoveringServices);
        self.radio.discover_services(&peripheral, &[target.service]);
    }

    fn on_services(&mut self, peripheral: PeripheralId, result: Result<Vec<GattUuid>, RadioError>) {
        if !self.is_session_peer(&peripheral)
            || self.state != ConnectionState::DiscoveringServices
        {
            debug!("Ignoring services of {} in {}", peripheral, self.state);
            return;
        }
        let Some(target) = self.target else {
            return;
        };

        let services = match result {
            Ok(services) => services,
            Err(e) => {
                warn!("Service discovery on {} failed: {}", peripheral, e);
                return;
            }
        };

        let matching: Vec<GattUuid> = services
            .into_iter()
            .filter(|s| *s == target.service)
            .collect();
        if matching.is_empty() {
            warn!("{} does not expose service {}", peripheral, target.service);
            return;
        }

        self.set_state(ConnectionState::DiscoveringCharacteristics);
        for service in &matching {
            self.radio
                .discover_characteristics(&peripheral, service, &[target.characteristic]);
        }
    }

    fn on_characteristics(
        &mut self,
        peripheral: PeripheralId,
        service: GattUuid,
        result: Result<Vec<CharacteristicInfo>, RadioError>,
    ) {
        if !self.is_session_peer(&peripheral)
            || self.state != ConnectionState::DiscoveringCharacteristics
        {
            debug!("Ignoring characteristics of {} in {}", peripheral, self.state);
            return;
        }
        let Some(target) = self.target else {
            return;
        };

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!("Characteristic discovery on {} failed: {}", peripheral, e);
                return;
            }
        };

        let Some(found) = characteristics
            .iter()
            .find(|c| c.uuid == target.characteristic)
        else {
            warn!(
                "Service {} on {} has no characteristic {}",
                service, peripheral, target.characteristic
            );
            return;
        };

        let write_target = WriteTarget {
            peripheral: peripheral.clone(),
            service,
            characteristic: found.uuid,
            mode: found.write_mode(),
        };
        info!(
            "Write characteristic {} resolved on {} ({:?})",
            found.uuid, peripheral, write_target.mode
        );

        if let Some(session) = self.session.as_mut() {
            session.write_target = Some(write_target);
        }

        let accessory = LastKnownAccessory {
            accessory: peripheral.clone(),
            target,
        };
        if let Err(e) = self.identity.persist(&accessory) {
            error!("Failed to persist accessory identity: {}", e);
        }
        self.last_known = Some(accessory);

        self.set_state(ConnectionState::Ready);
        self.observers.publish(CoreEvent::Connected { id: peripheral });
    }

    fn on_failed_to_connect(&mut self, peripheral: PeripheralId, error: Option<RadioError>) {
        if !self.is_session_peer(&peripheral) {
            debug!("Ignoring connect failure of {}", peripheral);
            return;
        }
        warn!("Connection to {} failed: {:?}", peripheral, error);
        self.end_session(DisconnectReason::ConnectFailed(error.clone()));
        self.observers.publish(CoreEvent::ConnectFailed {
            id: peripheral,
            error,
        });
    }

    fn on_disconnected(&mut self, peripheral: PeripheralId, error: Option<RadioError>) {
        if !self.is_session_peer(&peripheral) {
            debug!("Ignoring disconnect of {}", peripheral);
            return;
        }
        info!("Disconnected from {}: {:?}", peripheral, error);
        self.end_session(DisconnectReason::LinkLost(error.clone()));
        self.observers.publish(CoreEvent::Disconnected {
            id: peripheral,
            error,
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn issue_scan(&mut self, target: TargetSelector) {
        info!("Scanning for service {}", target.service);
        self.radio.scan(&[target.service]);
        if self.state == ConnectionState::Idle {
            self.set_state(ConnectionState::Scanning);
        }

        for peripheral in self.radio.retrieve_connected(&[target.service]) {
            debug!("{} already connected at OS level", peripheral);
            self.observers.publish(CoreEvent::PeripheralDiscovered {
                id: peripheral.clone(),
                rssi: None,
            });
            self.radio.read_signal_strength(&peripheral);
        }
    }

    fn issue_connect(&mut self, peripheral: PeripheralId) {
        info!("Connecting to {}", peripheral);
        self.session = Some(ConnectedSession::new(peripheral.clone()));
        self.set_state(ConnectionState::Connecting);
        self.radio.connect(&peripheral);
    }

    /// Drop the session at our own initiative, without notifying.
    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Tearing down session with {}", session.peripheral);
            self.radio.disconnect(&session.peripheral);
        }
    }

    /// Common cleanup for disconnect and connect failure. The radio is told
    /// to drop the link as well so it stops maintaining it.
    fn end_session(&mut self, reason: DisconnectReason) {
        if let Some(session) = self.session.take() {
            self.radio.disconnect(&session.peripheral);
        }
        self.last_known = None;
        self.clear_identity();
        self.set_state(ConnectionState::Disconnected(reason));
        self.set_state(ConnectionState::Idle);
    }

    fn clear_identity(&mut self) {
        if let Err(e) = self.identity.clear() {
            error!("Failed to clear accessory identity: {}", e);
        }
    }

    fn is_session_peer(&self, peripheral: &PeripheralId) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| &s.peripheral == peripheral)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("State {} -> {}", self.state, state);
        self.state = state.clone();
        self.observers.publish(CoreEvent::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::{
        MemoryIdentityStore, LAST_CHARACTERISTIC_KEY, LAST_PERIPHERAL_KEY, LAST_SERVICE_KEY,
    };
    use crate::domain::models::WriteMode;
    use crate::domain::radio::mock::{MockRadio, RadioCall};
    use std::sync::{Arc, Mutex};

    type Core = ConnectionCore<MockRadio, MemoryIdentityStore>;

    fn ffe0() -> GattUuid {
        GattUuid::from_u16(0xFFE0)
    }

    fn ffe1() -> GattUuid {
        GattUuid::from_u16(0xFFE1)
    }

    fn selector() -> TargetSelector {
        TargetSelector::new(ffe0(), ffe1())
    }

    fn hm10(write: bool) -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: ffe1(),
            write,
            write_without_response: true,
        }
    }

    fn remembered_store(id: &str) -> MemoryIdentityStore {
        let mut store = MemoryIdentityStore::new();
        store.set(LAST_PERIPHERAL_KEY, id).unwrap();
        store.set(LAST_SERVICE_KEY, "FFE0").unwrap();
        store.set(LAST_CHARACTERISTIC_KEY, "FFE1").unwrap();
        store
    }

    fn core_with(
        power: PowerState,
        store: MemoryIdentityStore,
    ) -> (Core, MockRadio, Arc<Mutex<Vec<CoreEvent>>>) {
        let radio = MockRadio::new(power);
        let mut core = ConnectionCore::new(radio.clone(), store, CoreConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        core.register_observer(Box::new(move |e: &CoreEvent| {
            sink.lock().unwrap().push(e.clone())
        }));
        (core, radio, events)
    }

    /// Drive a fresh session on "X" all the way to Ready.
    fn make_ready(core: &mut Core, write: bool) {
        core.connect("X".into());
        core.handle_event(RadioEvent::Connected {
            peripheral: "X".into(),
        });
        core.handle_event(RadioEvent::ServicesDiscovered {
            peripheral: "X".into(),
            result: Ok(vec![ffe0()]),
        });
        core.handle_event(RadioEvent::CharacteristicsDiscovered {
            peripheral: "X".into(),
            service: ffe0(),
            result: Ok(vec![hm10(write)]),
        });
    }

    fn notifications(events: &Arc<Mutex<Vec<CoreEvent>>>) -> Vec<CoreEvent> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !matches!(e, CoreEvent::StateChanged(_)))
            .cloned()
            .collect()
    }

    #[test]
    fn scan_without_target_issues_nothing() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.start_scan();
        assert!(radio.take_calls().is_empty());
        assert_eq!(core.state(), &ConnectionState::Idle);
    }

    #[test]
    fn scan_with_target_enters_scanning() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        assert!(core.configure_target(selector()));
        core.start_scan();

        assert_eq!(
            radio.take_calls(),
            vec![
                RadioCall::Scan(vec![ffe0()]),
                RadioCall::RetrieveConnected(vec![ffe0()])
            ]
        );
        assert_eq!(core.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn scan_while_powered_off_is_replayed_on_power_on() {
        let (mut core, radio, _) = core_with(PowerState::Off, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.start_scan();
        assert!(radio.take_calls().is_empty());

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));
        assert_eq!(radio.take_calls()[0], RadioCall::Scan(vec![ffe0()]));
        assert_eq!(core.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn target_change_rejected_outside_idle() {
        let (mut core, _, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.start_scan();

        let other = TargetSelector::new(GattUuid::from_u16(0x1234), ffe1());
        assert!(!core.configure_target(other));
        assert_eq!(core.target(), Some(selector()));
    }

    #[test]
    fn already_connected_peripherals_are_reported_and_checked() {
        let (mut core, radio, events) = core_with(PowerState::On, MemoryIdentityStore::new());
        radio.already_connected.lock().unwrap().push("Z".into());
        core.configure_target(selector());
        core.start_scan();

        assert!(radio.take_calls().contains(&RadioCall::ReadRssi("Z".into())));
        core.handle_event(RadioEvent::SignalStrengthRead {
            peripheral: "Z".into(),
            result: Ok(-61),
        });
        assert_eq!(
            notifications(&events),
            vec![
                CoreEvent::PeripheralDiscovered {
                    id: "Z".into(),
                    rssi: None
                },
                CoreEvent::RssiUpdated {
                    id: "Z".into(),
                    rssi: -61
                },
            ]
        );
    }

    #[test]
    fn scenario_a_discovery_of_last_known_triggers_connect() {
        let (mut core, radio, events) = core_with(PowerState::On, remembered_store("X"));
        core.configure_target(selector());
        core.start_scan();
        radio.take_calls();

        core.handle_event(RadioEvent::PeripheralDiscovered {
            peripheral: "X".into(),
            rssi: Some(-50),
        });
        assert_eq!(radio.take_calls(), vec![RadioCall::Connect("X".into())]);
        assert_eq!(core.state(), &ConnectionState::Connecting);

        core.handle_event(RadioEvent::Connected {
            peripheral: "X".into(),
        });
        assert_eq!(
            radio.take_calls(),
            vec![RadioCall::DiscoverServices("X".into(), vec![ffe0()])]
        );
        core.handle_event(RadioEvent::ServicesDiscovered {
            peripheral: "X".into(),
            result: Ok(vec![ffe0()]),
        });
        assert_eq!(
            radio.take_calls(),
            vec![RadioCall::DiscoverCharacteristics(
                "X".into(),
                ffe0(),
                vec![ffe1()]
            )]
        );
        core.handle_event(RadioEvent::CharacteristicsDiscovered {
            peripheral: "X".into(),
            service: ffe0(),
            result: Ok(vec![hm10(false)]),
        });

        assert!(core.is_ready());
        assert_eq!(
            core.session().and_then(|s| s.write_target.as_ref()).map(|t| t.mode),
            Some(WriteMode::Unacknowledged)
        );
        let store = core.identity_store();
        assert_eq!(store.get(LAST_PERIPHERAL_KEY).as_deref(), Some("X"));
        assert_eq!(store.get(LAST_SERVICE_KEY).as_deref(), Some("FFE0"));
        assert_eq!(store.get(LAST_CHARACTERISTIC_KEY).as_deref(), Some("FFE1"));

        assert_eq!(
            notifications(&events),
            vec![
                CoreEvent::PeripheralDiscovered {
                    id: "X".into(),
                    rssi: Some(-50)
                },
                CoreEvent::Connected { id: "X".into() },
            ]
        );
    }

    #[test]
    fn discovery_of_other_peripheral_does_not_connect() {
        let (mut core, radio, events) = core_with(PowerState::On, remembered_store("X"));
        core.start_scan();
        radio.take_calls();

        core.handle_event(RadioEvent::PeripheralDiscovered {
            peripheral: "Y".into(),
            rssi: Some(-80),
        });
        assert!(radio.take_calls().is_empty());
        assert_eq!(core.state(), &ConnectionState::Scanning);
        assert_eq!(notifications(&events).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_second_send_within_cooldown_rejected() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        make_ready(&mut core, false);
        radio.take_calls();

        assert_eq!(core.send(&[10, 20, 30]), SendOutcome::Accepted);
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(
            core.send(&[10, 20, 30]),
            SendOutcome::Rejected(SendRejection::CoolingDown)
        );

        let calls = radio.take_calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            RadioCall::Write(target, bytes, mode) => {
                assert_eq!(bytes, &vec![0x55, 10, 20, 30, 0xAA]);
                assert_eq!(*mode, WriteMode::Unacknowledged);
                assert_eq!(target.characteristic, ffe1());
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_never_closer_than_cooldown() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        make_ready(&mut core, true);
        radio.take_calls();

        let mut accepted_at = Vec::new();
        for step in 0..40u8 {
            if core.send(&[step]).is_accepted() {
                accepted_at.push(tokio::time::Instant::now());
            }
            tokio::time::advance(Duration::from_millis(35)).await;
        }

        assert!(accepted_at.len() > 1);
        for pair in accepted_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(radio.writes().len(), accepted_at.len());
    }

    #[test]
    fn send_rejected_unless_ready() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        assert_eq!(
            core.send(&[1]),
            SendOutcome::Rejected(SendRejection::NoSession)
        );

        core.connect("X".into());
        assert_eq!(
            core.send(&[1]),
            SendOutcome::Rejected(SendRejection::NotReady)
        );
        assert!(radio.writes().is_empty());
    }

    #[test]
    fn scenario_c_disconnect_clears_everything() {
        let (mut core, _, events) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        make_ready(&mut core, true);
        assert!(core.is_ready());

        core.handle_event(RadioEvent::Disconnected {
            peripheral: "X".into(),
            error: Some(RadioError::Timeout),
        });

        assert!(!core.is_ready());
        assert_eq!(core.state(), &ConnectionState::Idle);
        assert!(core.session().is_none());
        assert!(core.last_known().is_none());
        assert!(core.identity_store().get(LAST_PERIPHERAL_KEY).is_none());
        assert_eq!(core.target(), Some(selector()));

        let all = events.lock().unwrap().clone();
        assert!(all.contains(&CoreEvent::StateChanged(ConnectionState::Disconnected(
            DisconnectReason::LinkLost(Some(RadioError::Timeout))
        ))));
        assert_eq!(
            notifications(&events).last(),
            Some(&CoreEvent::Disconnected {
                id: "X".into(),
                error: Some(RadioError::Timeout)
            })
        );
    }

    #[test]
    fn ended_session_releases_radio_link() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("X".into());
        core.handle_event(RadioEvent::Connected {
            peripheral: "X".into(),
        });
        core.handle_event(RadioEvent::Disconnected {
            peripheral: "X".into(),
            error: None,
        });
        core.connect("Y".into());

        assert_eq!(
            radio.take_calls(),
            vec![
                RadioCall::Connect("X".into()),
                RadioCall::DiscoverServices("X".into(), vec![ffe0()]),
                RadioCall::Disconnect("X".into()),
                RadioCall::Connect("Y".into()),
            ]
        );
    }

    #[test]
    fn failed_connect_releases_radio_link() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("X".into());
        core.handle_event(RadioEvent::FailedToConnect {
            peripheral: "X".into(),
            error: Some(RadioError::Timeout),
        });
        assert_eq!(radio.take_calls().last(), Some(&RadioCall::Disconnect("X".into())));
    }

    #[test]
    fn connect_failure_clears_identity_and_notifies() {
        let (mut core, _, events) = core_with(PowerState::On, remembered_store("X"));
        core.connect("X".into());
        core.handle_event(RadioEvent::FailedToConnect {
            peripheral: "X".into(),
            error: Some(RadioError::Unreachable),
        });

        assert!(!core.is_ready());
        assert_eq!(core.state(), &ConnectionState::Idle);
        assert!(core.identity_store().get(LAST_PERIPHERAL_KEY).is_none());
        assert_eq!(
            notifications(&events),
            vec![CoreEvent::ConnectFailed {
                id: "X".into(),
                error: Some(RadioError::Unreachable)
            }]
        );
    }

    #[test]
    fn p3_power_on_reconnects_last_known_without_scan() {
        let (mut core, radio, _) = core_with(PowerState::Off, remembered_store("X"));
        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));

        assert_eq!(radio.take_calls(), vec![RadioCall::Connect("X".into())]);
        assert_eq!(core.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn scenario_d_forget_then_power_on_does_nothing() {
        let (mut core, radio, _) = core_with(PowerState::Off, remembered_store("X"));
        core.forget_last_device();
        assert!(core.identity_store().get(LAST_PERIPHERAL_KEY).is_none());
        assert_eq!(core.target(), Some(selector()));

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));
        assert!(radio.take_calls().is_empty());
        assert_eq!(core.state(), &ConnectionState::Idle);
    }

    #[test]
    fn power_cycle_suspends_and_restores_session() {
        let (mut core, radio, events) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        make_ready(&mut core, true);
        radio.take_calls();

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::Off));
        assert!(!core.is_ready());
        assert_eq!(core.state(), &ConnectionState::Idle);
        // An outage is not a failure: affinity survives.
        assert!(core.last_known().is_some());
        assert!(!notifications(&events)
            .iter()
            .any(|e| matches!(e, CoreEvent::Disconnected { .. })));

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));
        assert_eq!(radio.take_calls(), vec![RadioCall::Connect("X".into())]);
        assert_eq!(core.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn connect_while_powered_off_is_deferred() {
        let (mut core, radio, _) = core_with(PowerState::Unauthorized, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("Y".into());
        assert!(radio.take_calls().is_empty());

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));
        assert_eq!(radio.take_calls(), vec![RadioCall::Connect("Y".into())]);
    }

    #[test]
    fn connect_to_same_peer_is_idempotent_and_other_peer_tears_down() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("X".into());
        core.connect("X".into());
        assert_eq!(radio.take_calls(), vec![RadioCall::Connect("X".into())]);

        core.connect("Y".into());
        assert_eq!(
            radio.take_calls(),
            vec![
                RadioCall::Disconnect("X".into()),
                RadioCall::Connect("Y".into())
            ]
        );
        assert_eq!(core.session().map(|s| s.peripheral.as_str()), Some("Y"));

        // The late disconnect of the old peer must not end the new session.
        core.handle_event(RadioEvent::Disconnected {
            peripheral: "X".into(),
            error: None,
        });
        assert_eq!(core.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn missing_characteristic_parks_in_discovery() {
        let (mut core, _, events) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("X".into());
        core.handle_event(RadioEvent::Connected {
            peripheral: "X".into(),
        });
        core.handle_event(RadioEvent::ServicesDiscovered {
            peripheral: "X".into(),
            result: Ok(vec![ffe0()]),
        });
        core.handle_event(RadioEvent::CharacteristicsDiscovered {
            peripheral: "X".into(),
            service: ffe0(),
            result: Ok(vec![CharacteristicInfo {
                uuid: GattUuid::from_u16(0xFFE2),
                write: true,
                write_without_response: false,
            }]),
        });

        assert_eq!(core.state(), &ConnectionState::DiscoveringCharacteristics);
        assert!(!core.is_ready());
        assert!(notifications(&events).is_empty());
    }

    #[test]
    fn service_discovery_error_parks_session() {
        let (mut core, radio, events) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("X".into());
        core.handle_event(RadioEvent::Connected {
            peripheral: "X".into(),
        });
        radio.take_calls();

        core.handle_event(RadioEvent::ServicesDiscovered {
            peripheral: "X".into(),
            result: Err(RadioError::Gatt("ProtocolError".into())),
        });
        assert_eq!(core.state(), &ConnectionState::DiscoveringServices);
        assert!(radio.take_calls().is_empty());
        assert!(!core.is_ready());
        assert!(notifications(&events).is_empty());
    }

    #[test]
    fn missing_service_parks_session() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.connect("X".into());
        core.handle_event(RadioEvent::Connected {
            peripheral: "X".into(),
        });
        radio.take_calls();

        core.handle_event(RadioEvent::ServicesDiscovered {
            peripheral: "X".into(),
            result: Ok(vec![GattUuid::from_u16(0x180F)]),
        });
        assert_eq!(core.state(), &ConnectionState::DiscoveringServices);
        assert!(radio.take_calls().is_empty());
        assert_eq!(
            core.send(&[1]),
            SendOutcome::Rejected(SendRejection::NotReady)
        );
    }

    #[test]
    fn power_loss_while_scanning_resumes_scan_on_power_on() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.start_scan();
        radio.take_calls();

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::Off));
        assert_eq!(core.state(), &ConnectionState::Idle);

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));
        assert_eq!(radio.take_calls()[0], RadioCall::Scan(vec![ffe0()]));
        assert_eq!(core.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn stop_scan_returns_to_idle_and_cancels_replay() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.start_scan();
        core.stop_scan();
        assert_eq!(core.state(), &ConnectionState::Idle);

        core.handle_event(RadioEvent::PowerStateChanged(PowerState::Off));
        radio.take_calls();
        core.handle_event(RadioEvent::PowerStateChanged(PowerState::On));
        assert!(radio.take_calls().is_empty());
    }

    #[test]
    fn rescan_restarts_scan() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        core.start_scan();
        radio.take_calls();

        core.rescan();
        let calls = radio.take_calls();
        assert_eq!(calls[0], RadioCall::StopScan);
        assert_eq!(calls[1], RadioCall::Scan(vec![ffe0()]));
        assert_eq!(core.state(), &ConnectionState::Scanning);
    }

    #[test]
    fn shutdown_releases_session() {
        let (mut core, radio, _) = core_with(PowerState::On, MemoryIdentityStore::new());
        core.configure_target(selector());
        make_ready(&mut core, true);
        radio.take_calls();

        core.shutdown();
        assert_eq!(
            radio.take_calls(),
            vec![RadioCall::StopScan, RadioCall::Disconnect("X".into())]
        );
        assert_eq!(core.state(), &ConnectionState::Idle);
        assert!(!core.is_ready());
    }
}
