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

//! BlueZ GATT central transport.

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{
    AdapterSubscription, BondState, BondedPeer, GattTransport, PeerAddress, PeripheralEvent,
};
use crate::error::BleError;

impl From<bluer::Error> for BleError {
    fn from(err: bluer::Error) -> Self {
        BleError::Transport(err.to_string())
    }
}

#[derive(Default)]
struct DeviceTasks {
    connect: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    notify: HashMap<(Uuid, Uuid), JoinHandle<()>>,
}

impl DeviceTasks {
    fn abort_all(&mut self) {
        for task in self
            .connect
            .take()
            .into_iter()
            .chain(self.watcher.take())
            .chain(self.notify.drain().map(|(_, t)| t))
        {
            task.abort();
        }
    }
}

/// GATT central backed by the default BlueZ adapter.
pub struct BluezTransport {
    adapter: Adapter,
    event_tx: mpsc::Sender<PeripheralEvent>,
    device: parking_lot::Mutex<Option<Device>>,
    tasks: parking_lot::Mutex<DeviceTasks>,
    writes: mpsc::UnboundedSender<(Characteristic, Vec<u8>)>,
    writer: JoinHandle<()>,
}

impl BluezTransport {
    /// Open a BlueZ session on the default adapter.
    pub async fn new(event_tx: mpsc::Sender<PeripheralEvent>) -> Result<Self, BleError> {
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let (writes, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writes(queued));

        Ok(Self {
            adapter,
            event_tx,
            device: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(DeviceTasks::default()),
            writes,
            writer,
        })
    }

    fn current_device(&self) -> Result<Device, BleError> {
        self.device.lock().clone().ok_or(BleError::NotReady)
    }

    async fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, BleError> {
        let device = self.current_device()?;
        for s in device.services().await? {
            if s.uuid().await? != service {
                continue;
            }
            for c in s.characteristics().await? {
                if c.uuid().await? == characteristic {
                    return Ok(c);
                }
            }
        }
        Err(BleError::NotFound {
            service,
            characteristic,
        })
    }

    /// Forward link and discovery changes of `device` as events.
    async fn spawn_watcher(&self, device: &Device) -> Result<JoinHandle<()>, BleError> {
        let events = device.events().await?;
        let tx = self.event_tx.clone();
        Ok(tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
                let event = match property {
                    DeviceProperty::Connected(false) => {
                        PeripheralEvent::ConnectionChanged { connected: false }
                    }
                    DeviceProperty::ServicesResolved(true) => {
                        PeripheralEvent::ServicesDiscovered { success: true }
                    }
                    _ => continue,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }))
    }
}

/// Perform acknowledged writes in the order they were handed over.
async fn run_writes(mut queued: mpsc::UnboundedReceiver<(Characteristic, Vec<u8>)>) {
    while let Some((c, value)) = queued.recv().await {
        if let Err(e) = c.write(&value).await {
            warn!("GATT write failed: {}", e);
        }
    }
}

impl Drop for BluezTransport {
    fn drop(&mut self) {
        self.tasks.lock().abort_all();
        self.writer.abort();
    }
}

#[async_trait]
impl GattTransport for BluezTransport {
    fn backend_name(&self) -> &'static str {
        "BlueZ"
    }

    async fn adapter_enabled(&self) -> Result<bool, BleError> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn watch_adapter(&self) -> Result<AdapterSubscription, BleError> {
        let events = self.adapter.events().await?;
        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    if tx.send(PeripheralEvent::AdapterPowered(powered)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(AdapterSubscription::new(task))
    }

    async fn bonded_peers(&self) -> Result<Vec<BondedPeer>, BleError> {
        let mut peers = Vec::new();

        for addr in self.adapter.device_addresses().await? {
            let device = self.adapter.device(addr)?;
            if device.is_paired().await? {
                let name = device.alias().await.unwrap_or_else(|_| addr.to_string());
                peers.push(BondedPeer {
                    name,
                    address: PeerAddress::new(addr.to_string()),
                    bond_state: BondState::Bonded,
                });
            }
        }

        Ok(peers)
    }

    async fn connect(&self, address: &PeerAddress) -> Result<(), BleError> {
        let addr: Address = address
            .as_str()
            .parse()
            .map_err(|_| BleError::InvalidAddress(address.to_string()))?;
        let device = self.adapter.device(addr)?;
        let watcher = self.spawn_watcher(&device).await?;

        let tx = self.event_tx.clone();
        let dev = device.clone();
        let connect = tokio::spawn(async move {
            let event = match dev.connect().await {
                Ok(()) => PeripheralEvent::ConnectionChanged { connected: true },
                Err(e) => {
                    warn!("BlueZ connect failed: {}", e);
                    PeripheralEvent::ConnectFailed(e.into())
                }
            };
            let _ = tx.send(event).await;
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.abort_all();
            tasks.watcher = Some(watcher);
            tasks.connect = Some(connect);
        }
        *self.device.lock() = Some(device);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let device = self.current_device()?;
        let was_connected = device.is_connected().await.unwrap_or(false);

        {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.connect.take() {
                task.abort();
            }
            for (_, task) in tasks.notify.drain() {
                task.abort();
            }
        }

        if let Err(e) = device.disconnect().await {
            debug!("BlueZ disconnect: {}", e);
        }
        if !was_connected {
            // No property change will follow for a link that never came up.
            let _ = self
                .event_tx
                .send(PeripheralEvent::ConnectionChanged { connected: false })
                .await;
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        // BlueZ resolves services on its own; report it if already done,
        // otherwise the watcher reports the ServicesResolved change.
        let device = self.current_device()?;
        if device.is_services_resolved().await? {
            let _ = self
                .event_tx
                .send(PeripheralEvent::ServicesDiscovered { success: true })
                .await;
        }
        Ok(())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        let c = self.find_characteristic(service, characteristic).await?;
        Ok(c.read().await?)
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        let c = self.find_characteristic(service, characteristic).await?;
        let flags = c.flags().await?;
        if !flags.write && !flags.write_without_response {
            return Err(BleError::Unsupported("write"));
        }
        // Acknowledgement is awaited by the writer task.
        self.writes
            .send((c, value.to_vec()))
            .map_err(|_| BleError::Closed)
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        let c = self.find_characteristic(service, characteristic).await?;
        let flags = c.flags().await?;
        if !flags.notify && !flags.indicate {
            return Err(BleError::Unsupported("notify"));
        }
        let values = c.notify().await?;
        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let mut values = Box::pin(values);
            while let Some(value) = values.next().await {
                let event = PeripheralEvent::Notification {
                    service,
                    characteristic,
                    value,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        if let Some(old) = self.tasks.lock().notify.insert((service, characteristic), task) {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        if let Some(task) = self.tasks.lock().notify.remove(&(service, characteristic)) {
            task.abort();
        }
        Ok(())
    }
}
