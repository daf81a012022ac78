//! Controller Service Module
//!
//! Runs the [`ConnectionCore`] as a single actor task. Application commands
//! and radio events are consumed by one `select!` loop, so no two state
//! transitions are ever evaluated concurrently.

use crate::domain::connection::ConnectionCore;
use crate::domain::identity::IdentityStore;
use crate::domain::models::{ConnectionState, PeripheralId, SendOutcome, TargetSelector};
use crate::domain::observer::{ConnectionObserver, ObserverId};
use crate::domain::radio::{RadioAdapter, RadioEvent};
use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Requests accepted by the actor
enum ControllerCommand {
    ConfigureTarget(TargetSelector, oneshot::Sender<bool>),
    StartScan,
    StopScan,
    Rescan,
    Connect(PeripheralId),
    ForgetLastDevice,
    Send(Vec<u8>, oneshot::Sender<SendOutcome>),
    IsReady(oneshot::Sender<bool>),
    State(oneshot::Sender<ConnectionState>),
    Target(oneshot::Sender<Option<TargetSelector>>),
    Subscribe(Box<dyn ConnectionObserver>, oneshot::Sender<ObserverId>),
    Unsubscribe(ObserverId, oneshot::Sender<bool>),
    Shutdown,
}

/// Cloneable front door to the running controller
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControllerCommand>,
}

impl ControllerHandle {
    fn post(&self, command: ControllerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Controller has stopped"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.post(build(tx))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Controller dropped the request"))
    }

    pub async fn configure_target(&self, target: TargetSelector) -> Result<bool> {
        self.request(|tx| ControllerCommand::ConfigureTarget(target, tx))
            .await
    }

    pub fn start_scan(&self) -> Result<()> {
        self.post(ControllerCommand::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.post(ControllerCommand::StopScan)
    }

    pub fn rescan(&self) -> Result<()> {
        self.post(ControllerCommand::Rescan)
    }

    pub fn connect(&self, peripheral: PeripheralId) -> Result<()> {
        self.post(ControllerCommand::Connect(peripheral))
    }

    pub fn forget_last_device(&self) -> Result<()> {
        self.post(ControllerCommand::ForgetLastDevice)
    }

    pub async fn send(&self, payload: Vec<u8>) -> Result<SendOutcome> {
        self.request(|tx| ControllerCommand::Send(payload, tx)).await
    }

    pub async fn is_ready(&self) -> Result<bool> {
        self.request(ControllerCommand::IsReady).await
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        self.request(ControllerCommand::State).await
    }

    pub async fn target(&self) -> Result<Option<TargetSelector>> {
        self.request(ControllerCommand::Target).await
    }

    pub async fn subscribe(&self, observer: Box<dyn ConnectionObserver>) -> Result<ObserverId> {
        self.request(|tx| ControllerCommand::Subscribe(observer, tx))
            .await
    }

    /// Returns once the observer is gone; no event is delivered to it after.
    pub async fn unsubscribe(&self, id: ObserverId) -> Result<bool> {
        self.request(|tx| ControllerCommand::Unsubscribe(id, tx))
            .await
    }

    /// Keep the target restored from the identity store; otherwise apply
    /// `fallback`. Returns the selector in effect.
    pub async fn configure_default_target(
        &self,
        fallback: TargetSelector,
    ) -> Result<Option<TargetSelector>> {
        if let Some(restored) = self.target().await? {
            info!("Keeping restored target selector {:?}", restored);
            return Ok(Some(restored));
        }
        if self.configure_target(fallback).await? {
            Ok(Some(fallback))
        } else {
            Ok(self.target().await?)
        }
    }

    /// Ask the actor to release the radio and stop.
    pub fn shutdown(&self) -> Result<()> {
        self.post(ControllerCommand::Shutdown)
    }
}

/// Owner of the connection core
pub struct ControllerService<R: RadioAdapter, S: IdentityStore> {
    core: ConnectionCore<R, S>,
    commands: mpsc::UnboundedReceiver<ControllerCommand>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
}

impl<R, S> ControllerService<R, S>
where
    R: RadioAdapter + 'static,
    S: IdentityStore + 'static,
{
    /// Wrap `core`; `radio_events` must be the channel its radio reports on.
    pub fn new(
        core: ConnectionCore<R, S>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> (Self, ControllerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            core,
            commands: rx,
            radio_events,
        };
        (service, ControllerHandle { commands: tx })
    }

    /// Spawn the actor on the current runtime.
    pub fn spawn(
        core: ConnectionCore<R, S>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (service, handle) = Self::new(core, radio_events);
        (handle, tokio::spawn(service.run()))
    }

    /// Process commands and events until shutdown or until every handle is
    /// dropped. Pending commands are taken before pending radio events.
    pub async fn run(mut self) {
        info!("Controller service started");
        let mut radio_open = true;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(ControllerCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                event = self.radio_events.recv(), if radio_open => {
                    match event {
                        Some(event) => {
                            debug!("Radio event: {:?}", event);
                            self.core.handle_event(event);
                        }
                        None => {
                            info!("Radio event stream closed");
                            radio_open = false;
                        }
                    }
                }
            }
        }

        self.core.shutdown();
        info!("Controller service stopped");
    }

    fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::ConfigureTarget(target, reply) => {
                let _ = reply.send(self.core.configure_target(target));
            }
            ControllerCommand::StartScan => self.core.start_scan(),
            ControllerCommand::StopScan => self.core.stop_scan(),
            ControllerCommand::Rescan => self.core.rescan(),
            ControllerCommand::Connect(peripheral) => self.core.connect(peripheral),
            ControllerCommand::ForgetLastDevice => self.core.forget_last_device(),
            ControllerCommand::Send(payload, reply) => {
                let _ = reply.send(self.core.send(&payload));
            }
            ControllerCommand::IsReady(reply) => {
                let _ = reply.send(self.core.is_ready());
            }
            ControllerCommand::State(reply) => {
                let _ = reply.send(self.core.state().clone());
            }
            ControllerCommand::Target(reply) => {
                let _ = reply.send(self.core.target());
            }
            ControllerCommand::Subscribe(observer, reply) => {
                let _ = reply.send(self.core.register_observer(observer));
            }
            ControllerCommand::Unsubscribe(id, reply) => {
                let _ = reply.send(self.core.unregister_observer(id));
            }
            ControllerCommand::Shutdown => {}
        }
    }
}
