// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BLE link state machine runtime.
//!
//! A single driver task owns the [`LinkMachine`] and the transport
//! subscriptions. Local operations and transport events are both delivered
//! to it as messages, so phase transitions happen one at a time in the order
//! they are received. Characteristic writes run on a separate writer task
//! in submission order, so phase handling never waits on a peripheral
//! acknowledgement.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::config::{EVENT_CHANNEL_CAPACITY, POLL_INTERVAL};
use super::ble_constants::{SERVICE_UUID, VOLTAGE_UUID};
use super::phase::{BleConnectionPhase, Effect, LinkMachine, PhaseEvent, Step};
use super::telemetry;
use super::transport::{
    AdapterSubscription, BondedPeer, GattTransport, PeerAddress, PeripheralEvent,
};
use crate::error::{BleError, ErrorDescriptor};
use crate::state::{LinkSnapshot, StateStore, Versioned};

/// Callback invoked with each value of a subscribed characteristic.
pub type ValueHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Link settings.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub service: Uuid,
    pub voltage_characteristic: Uuid,
    /// Subscribe to voltage notifications while connected.
    pub notifications: bool,
    /// Poll the voltage characteristic while connected.
    pub polling: bool,
    pub poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            voltage_characteristic: VOLTAGE_UUID,
            notifications: true,
            polling: true,
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// A phase change, as delivered by [`BleLink::transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: BleConnectionPhase,
    pub to: BleConnectionPhase,
}

type Reply<T> = oneshot::Sender<Result<T, BleError>>;

/// A characteristic write waiting for the writer task.
struct PendingWrite {
    service: Uuid,
    characteristic: Uuid,
    value: Vec<u8>,
    reply: Reply<()>,
}

enum LinkCommand {
    Connect {
        address: PeerAddress,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Dismiss {
        reply: Reply<()>,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    Read {
        service: Uuid,
        characteristic: Uuid,
        reply: Reply<Vec<u8>>,
    },
    Subscribe {
        service: Uuid,
        characteristic: Uuid,
        handler: ValueHandler,
        reply: Reply<()>,
    },
    Unsubscribe {
        service: Uuid,
        characteristic: Uuid,
        reply: Reply<()>,
    },
    /// Value produced by the poll task.
    Polled {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Shutdown,
}

/// Handle to the BLE link. Cheap to clone.
#[derive(Clone)]
pub struct BleLink {
    commands: mpsc::Sender<LinkCommand>,
    state: Arc<StateStore<LinkSnapshot>>,
    transitions: broadcast::Sender<PhaseTransition>,
    transport: Arc<dyn GattTransport>,
    driver: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl BleLink {
    /// Start the driver task.
    ///
    /// `events` must be the receiving end of the channel the transport was
    /// created with.
    pub fn spawn(
        transport: Arc<dyn GattTransport>,
        events: mpsc::Receiver<PeripheralEvent>,
        config: LinkConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(StateStore::new(LinkSnapshot::default()));
        let (transitions, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!("Starting BLE link ({} backend)", transport.backend_name());

        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writes(transport.clone(), state.clone(), writes_rx));

        let driver = Driver {
            machine: LinkMachine::new(),
            transport: transport.clone(),
            config,
            state: state.clone(),
            transitions: transitions.clone(),
            commands: commands_tx.downgrade(),
            handlers: HashMap::new(),
            subscribed: HashSet::new(),
            poll: None,
            writes: writes_tx,
            writer,
        };
        let handle = tokio::spawn(driver.run(commands_rx, events));

        Self {
            commands: commands_tx,
            state,
            transitions,
            transport,
            driver: Arc::new(parking_lot::Mutex::new(Some(handle))),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Versioned<LinkSnapshot> {
        self.state.snapshot()
    }

    /// Observe snapshots.
    pub fn watch(&self) -> watch::Receiver<Versioned<LinkSnapshot>> {
        self.state.subscribe()
    }

    /// Observe phase changes.
    pub fn transitions(&self) -> broadcast::Receiver<PhaseTransition> {
        self.transitions.subscribe()
    }

    pub fn phase(&self) -> BleConnectionPhase {
        self.state.snapshot().phase
    }

    /// Connected and service discovery complete.
    pub fn can_send_message(&self) -> bool {
        self.state.snapshot().can_send_message()
    }

    /// Start connecting to `address`. Rejected unless `Idle`.
    pub async fn connect(&self, address: PeerAddress) -> Result<(), BleError> {
        self.request(|reply| LinkCommand::Connect { address, reply }).await
    }

    /// Cancel a connection attempt or close the link.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.request(|reply| LinkCommand::Disconnect { reply }).await
    }

    /// Return to `Idle` after `FailedToConnect` or `DisconnectedByPeer`.
    pub async fn dismiss(&self) -> Result<(), BleError> {
        self.request(|reply| LinkCommand::Dismiss { reply }).await
    }

    /// Write a characteristic value.
    ///
    /// Writes are submitted in call order. Returns once the transport has
    /// taken the write; delivery to the peripheral is not confirmed. A write
    /// still queued when the link stops being writable fails with
    /// [`BleError::NotReady`].
    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), BleError> {
        self.request(|reply| LinkCommand::Write {
            service,
            characteristic,
            value,
            reply,
        })
        .await
    }

    pub async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        self.request(|reply| LinkCommand::Read {
            service,
            characteristic,
            reply,
        })
        .await
    }

    /// Register `handler` for notifications of a characteristic.
    ///
    /// The subscription is dropped automatically when the link leaves
    /// `Connected`.
    pub async fn subscribe_characteristic<F>(
        &self,
        service: Uuid,
        characteristic: Uuid,
        handler: F,
    ) -> Result<(), BleError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let handler: ValueHandler = Arc::new(handler);
        self.request(|reply| LinkCommand::Subscribe {
            service,
            characteristic,
            handler,
            reply,
        })
        .await
    }

    pub async fn unsubscribe_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        self.request(|reply| LinkCommand::Unsubscribe {
            service,
            characteristic,
            reply,
        })
        .await
    }

    /// Devices remembered by the adapter.
    pub async fn bonded_peers(&self) -> Result<Vec<BondedPeer>, BleError> {
        self.transport.bonded_peers().await
    }

    /// Start forwarding adapter power changes into the link snapshot.
    pub async fn watch_adapter(&self) -> Result<AdapterSubscription, BleError> {
        self.transport.watch_adapter().await
    }

    /// Stop the driver, disconnecting first if needed.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(LinkCommand::Shutdown).await;
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("BLE link driver ended abnormally: {}", e);
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> LinkCommand,
    ) -> Result<T, BleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| BleError::Closed)?;
        rx.await.map_err(|_| BleError::Closed)?
    }
}

struct Driver {
    machine: LinkMachine,
    transport: Arc<dyn GattTransport>,
    config: LinkConfig,
    state: Arc<StateStore<LinkSnapshot>>,
    transitions: broadcast::Sender<PhaseTransition>,
    commands: mpsc::WeakSender<LinkCommand>,
    handlers: HashMap<(Uuid, Uuid), ValueHandler>,
    subscribed: HashSet<(Uuid, Uuid)>,
    poll: Option<JoinHandle<()>>,
    writes: mpsc::UnboundedSender<PendingWrite>,
    writer: JoinHandle<()>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut events: mpsc::Receiver<PeripheralEvent>,
    ) {
        match self.transport.adapter_enabled().await {
            Ok(enabled) => self.state.update(|s| s.adapter_enabled = enabled),
            Err(e) => warn!("Could not query adapter state: {}", e),
        }

        let mut events_open = true;
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Transport event channel closed");
                        events_open = false;
                    }
                },
            }
        }

        self.stop().await;
        info!("BLE link stopped");
    }

    async fn stop(&mut self) {
        self.writer.abort();
        match self.machine.phase() {
            BleConnectionPhase::Connected => {
                self.stop_telemetry().await;
                self.close_connection().await;
            }
            BleConnectionPhase::Connecting
            | BleConnectionPhase::CancelConnecting
            | BleConnectionPhase::Disconnecting => self.close_connection().await,
            _ => {}
        }

        let step = self.machine.reset();
        self.publish(&step);
        self.state.update(|s| s.voltage = None);
    }

    async fn handle_command(&mut self, cmd: LinkCommand) {
        match cmd {
            LinkCommand::Connect { address, reply } => {
                info!("Connecting to {}", address);
                let result = self.machine.connect(address);
                let _ = reply.send(self.apply(result).await);
            }
            LinkCommand::Disconnect { reply } => {
                let result = self.machine.disconnect();
                let _ = reply.send(self.apply(result).await);
            }
            LinkCommand::Dismiss { reply } => {
                let result = self.machine.dismiss();
                let _ = reply.send(self.apply(result).await);
            }
            LinkCommand::Write {
                service,
                characteristic,
                value,
                reply,
            } => {
                if let Err(e) = self.ensure_ready() {
                    let _ = reply.send(Err(e));
                    return;
                }
                debug!("Queueing {} byte write to {}", value.len(), characteristic);
                let write = PendingWrite {
                    service,
                    characteristic,
                    value,
                    reply,
                };
                if let Err(mpsc::error::SendError(write)) = self.writes.send(write) {
                    let _ = write.reply.send(Err(BleError::Closed));
                }
            }
            LinkCommand::Read {
                service,
                characteristic,
                reply,
            } => {
                let result = match self.ensure_ready() {
                    Ok(()) => self.transport.read(service, characteristic).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            LinkCommand::Subscribe {
                service,
                characteristic,
                handler,
                reply,
            } => {
                let result = match self.ensure_ready() {
                    Ok(()) => self.subscribe(service, characteristic, handler).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            LinkCommand::Unsubscribe {
                service,
                characteristic,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(service, characteristic).await);
            }
            LinkCommand::Polled {
                service,
                characteristic,
                value,
            } => self.deliver(service, characteristic, &value),
            LinkCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::ConnectionChanged { connected } => {
                debug!("Transport reports connected={}", connected);
                let event = if connected {
                    PhaseEvent::PeripheralConnected
                } else {
                    PhaseEvent::PeripheralDisconnected
                };
                self.on_peripheral(event).await;
            }
            PeripheralEvent::ServicesDiscovered { success } => {
                debug!("Service discovery finished, success={}", success);
                let event = if success {
                    PhaseEvent::ServicesDiscovered
                } else {
                    PhaseEvent::DiscoveryFailed
                };
                self.on_peripheral(event).await;
            }
            PeripheralEvent::ConnectFailed(err) => {
                warn!("Connection attempt failed: {}", err);
                if self.machine.phase() == BleConnectionPhase::Connecting {
                    self.record_error(&err);
                }
                self.on_peripheral(PhaseEvent::PeripheralDisconnected).await;
            }
            PeripheralEvent::Notification {
                service,
                characteristic,
                value,
            } => self.deliver(service, characteristic, &value),
            PeripheralEvent::AdapterPowered(enabled) => {
                info!("Bluetooth adapter {}", if enabled { "enabled" } else { "disabled" });
                self.state.update(|s| s.adapter_enabled = enabled);
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), BleError> {
        if self.machine.can_send_message() {
            Ok(())
        } else {
            Err(BleError::NotReady)
        }
    }

    async fn on_peripheral(&mut self, event: PhaseEvent) {
        match self.machine.on_peripheral(event) {
            Some(step) => {
                self.publish(&step);
                self.run_effects(step.effects).await;
            }
            None => debug!("Ignoring {:?} while {}", event, self.machine.phase()),
        }
    }

    async fn apply(&mut self, result: Result<Step, BleError>) -> Result<(), BleError> {
        match result {
            Ok(step) => {
                self.publish(&step);
                self.run_effects(step.effects).await;
                Ok(())
            }
            Err(e) => {
                debug!("Rejected: {}", e);
                Err(e)
            }
        }
    }

    fn publish(&self, step: &Step) {
        let discovered = self.machine.service_discovered();
        let peer = self.machine.peer().cloned();
        let to = step.to;
        self.state.update(|s| {
            if step.from == BleConnectionPhase::Idle && to == BleConnectionPhase::Connecting {
                s.last_error = None;
            }
            s.phase = to;
            s.service_discovered = discovered;
            s.peer = peer;
        });

        if step.changed() {
            info!("BLE link: {} -> {}", step.from.as_str(), to.as_str());
            let _ = self.transitions.send(PhaseTransition {
                from: step.from,
                to,
            });
        }
    }

    /// Execute effects, including those of transitions the effects cause.
    async fn run_effects(&mut self, effects: Vec<Effect>) {
        let mut pending: VecDeque<Effect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            if let Some(step) = self.run_effect(effect).await {
                self.publish(&step);
                pending.extend(step.effects);
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) -> Option<Step> {
        match effect {
            Effect::OpenConnection(address) => {
                if let Err(e) = self.transport.connect(&address).await {
                    warn!("Connect to {} failed: {}", address, e);
                    self.record_error(&e);
                    return self.machine.on_peripheral(PhaseEvent::PeripheralDisconnected);
                }
                None
            }
            Effect::CloseConnection => {
                if let Err(e) = self.close_transport().await {
                    // Nothing will report the disconnect; assume it happened.
                    warn!("Disconnect failed: {}", e);
                    return self.machine.on_peripheral(PhaseEvent::PeripheralDisconnected);
                }
                None
            }
            Effect::DiscoverServices => {
                if let Err(e) = self.transport.discover_services().await {
                    warn!("Service discovery failed: {}", e);
                    self.record_error(&e);
                    return self.machine.on_peripheral(PhaseEvent::DiscoveryFailed);
                }
                None
            }
            Effect::StartTelemetry => {
                self.start_telemetry().await;
                None
            }
            Effect::StopTelemetry => {
                self.stop_telemetry().await;
                None
            }
        }
    }

    async fn close_transport(&self) -> Result<(), BleError> {
        self.transport.disconnect().await
    }

    async fn close_connection(&self) {
        if let Err(e) = self.close_transport().await {
            warn!("Disconnect failed: {}", e);
        }
    }

    fn record_error(&self, err: &BleError) {
        let desc = ErrorDescriptor::from(err);
        self.state.update(|s| s.last_error = Some(desc));
    }

    async fn subscribe(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        handler: ValueHandler,
    ) -> Result<(), BleError> {
        let key = (service, characteristic);
        if !self.subscribed.contains(&key) {
            self.transport.subscribe(service, characteristic).await?;
            self.subscribed.insert(key);
        }
        self.handlers.insert(key, handler);
        info!("Subscribed to {}", characteristic);
        Ok(())
    }

    async fn unsubscribe(&mut self, service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        let key = (service, characteristic);
        self.handlers.remove(&key);
        if self.subscribed.remove(&key) {
            self.transport.unsubscribe(service, characteristic).await?;
        }
        Ok(())
    }

    fn deliver(&self, service: Uuid, characteristic: Uuid, value: &[u8]) {
        if self.machine.phase() != BleConnectionPhase::Connected {
            debug!("Dropping value of {} while {}", characteristic, self.machine.phase());
            return;
        }
        match self.handlers.get(&(service, characteristic)) {
            Some(handler) => handler(value),
            None => debug!("No handler for {}", characteristic),
        }
    }

    async fn start_telemetry(&mut self) {
        let service = self.config.service;
        let characteristic = self.config.voltage_characteristic;

        let state = self.state.clone();
        let handler: ValueHandler = Arc::new(move |bytes: &[u8]| {
            if let Some(voltage) = telemetry::decode_voltage(bytes) {
                debug!("Voltage: {}", voltage);
                state.update(|s| s.voltage = Some(voltage));
            }
        });
        self.handlers.insert((service, characteristic), handler);

        if self.config.notifications {
            match self.transport.subscribe(service, characteristic).await {
                Ok(()) => {
                    self.subscribed.insert((service, characteristic));
                }
                Err(e) => warn!("Voltage notifications unavailable: {}", e),
            }
        }

        if self.config.polling {
            let commands = self.commands.clone();
            self.poll = Some(telemetry::spawn_poll(
                self.transport.clone(),
                service,
                characteristic,
                self.config.poll_interval,
                move |value| {
                    let Some(commands) = commands.upgrade() else {
                        return false;
                    };
                    match commands.try_send(LinkCommand::Polled {
                        service,
                        characteristic,
                        value,
                    }) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    }
                },
            ));
        }
    }

    /// Cancel notification handlers and the poll together.
    async fn stop_telemetry(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.abort();
        }
        self.handlers.clear();
        for (service, characteristic) in std::mem::take(&mut self.subscribed) {
            if let Err(e) = self.transport.unsubscribe(service, characteristic).await {
                debug!("Unsubscribe from {} failed: {}", characteristic, e);
            }
        }
        self.state.update(|s| s.voltage = None);
    }
}

/// Perform queued writes one at a time.
async fn run_writes(
    transport: Arc<dyn GattTransport>,
    state: Arc<StateStore<LinkSnapshot>>,
    mut writes: mpsc::UnboundedReceiver<PendingWrite>,
) {
    while let Some(write) = writes.recv().await {
        if !state.snapshot().can_send_message() {
            debug!("Link no longer writable, dropping write to {}", write.characteristic);
            let _ = write.reply.send(Err(BleError::NotReady));
            continue;
        }
        let result = transport
            .write(write.service, write.characteristic, &write.value)
            .await;
        if let Err(e) = &result {
            warn!("Write to {} failed: {}", write.characteristic, e);
        }
        let _ = write.reply.send(result);
    }
}
