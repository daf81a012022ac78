//! Notifications published by the connection core.
//!
//! Delivery is fire-and-forget: observers get a snapshot of each event and
//! must not block. [`ChannelObserver`] hands events to an unbounded tokio
//! channel so slow consumers never stall the core.

use crate::domain::models::{ConnectionState, DiscoveredPeripheral, PeripheralId, PowerState};
use crate::error::RadioError;
use tokio::sync::mpsc;
use tracing::trace;

/// One notification from the core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    PowerStateChanged(PowerState),
    StateChanged(ConnectionState),
    PeripheralDiscovered {
        id: PeripheralId,
        rssi: Option<i16>,
    },
    RssiUpdated {
        id: PeripheralId,
        rssi: i16,
    },
    Connected {
        id: PeripheralId,
    },
    Disconnected {
        id: PeripheralId,
        error: Option<RadioError>,
    },
    ConnectFailed {
        id: PeripheralId,
        error: Option<RadioError>,
    },
}

/// Receiver of core notifications.
pub trait ConnectionObserver: Send {
    fn notify(&self, event: &CoreEvent);
}

impl<F> ConnectionObserver for F
where
    F: Fn(&CoreEvent) + Send,
{
    fn notify(&self, event: &CoreEvent) {
        self(event)
    }
}

/// Forwards events into a channel.
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<CoreEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self { sender }
    }

    /// Observer plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl ConnectionObserver for ChannelObserver {
    fn notify(&self, event: &CoreEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.sender.send(event.clone());
    }
}

/// Handle returned by [`ObserverRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers. Empty is a valid state: events are then dropped.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(ObserverId, Box<dyn ConnectionObserver>)>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Box<dyn ConnectionObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn publish(&self, event: CoreEvent) {
        if self.observers.is_empty() {
            trace!("No observers for {:?}", event);
            return;
        }
        for (_, observer) in &self.observers {
            observer.notify(&event);
        }
    }
}

/// Change applied to a [`PeripheralList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    Added(usize),
    Updated(usize),
}

/// Discovery list kept by a consumer of notifications.
///
/// A repeated sighting of the same identifier refreshes its signal
/// strength instead of adding a second row.
#[derive(Debug, Default, Clone)]
pub struct PeripheralList {
    entries: Vec<DiscoveredPeripheral>,
}

impl PeripheralList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[DiscoveredPeripheral] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&DiscoveredPeripheral> {
        self.entries.get(index)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn apply(&mut self, event: &CoreEvent) -> Option<ListChange> {
        match event {
            CoreEvent::PeripheralDiscovered { id, rssi } => match self.position(id) {
                Some(index) => {
                    if rssi.is_some() {
                        self.entries[index].rssi = *rssi;
                    }
                    Some(ListChange::Updated(index))
                }
                None => {
                    self.entries.push(DiscoveredPeripheral {
                        id: id.clone(),
                        rssi: *rssi,
                    });
                    Some(ListChange::Added(self.entries.len() - 1))
                }
            },
            CoreEvent::RssiUpdated { id, rssi } => {
                let index = self.position(id)?;
                self.entries[index].rssi = Some(*rssi);
                Some(ListChange::Updated(index))
            }
            _ => None,
        }
    }

    fn position(&self, id: &PeripheralId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.id == id)
    }
}
