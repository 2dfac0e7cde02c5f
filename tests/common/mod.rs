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

//! Shared test helpers: an in-memory GATT transport.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use videostreamer_link::bluetooth::ble_constants::{SERVICE_UUID, SWITCH_UUID, VOLTAGE_UUID};
use videostreamer_link::bluetooth::{
    AdapterSubscription, BleLink, BondState, BondedPeer, GattTransport, LinkConfig, PeerAddress,
    PeripheralEvent,
};
use videostreamer_link::state::LinkSnapshot;
use videostreamer_link::BleError;

pub const TIMEOUT: Duration = Duration::from_secs(2);
pub const PEER: &str = "AA:BB:CC:DD:EE:FF";

/// Operation recorded by [`FakeTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    WatchAdapter,
    Connect(PeerAddress),
    Disconnect,
    DiscoverServices,
    Read(Uuid),
    Write(Uuid, Uuid, Vec<u8>),
    Subscribe(Uuid),
    Unsubscribe(Uuid),
}

/// Transport that records calls and lets the test inject events.
pub struct FakeTransport {
    events: mpsc::Sender<PeripheralEvent>,
    calls: parking_lot::Mutex<Vec<Call>>,
    values: parking_lot::Mutex<HashMap<Uuid, Vec<u8>>>,
    bonded: Vec<BondedPeer>,
    write_delay: parking_lot::Mutex<Duration>,
    connect_error: parking_lot::Mutex<Option<BleError>>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PeripheralEvent>) {
        let (events, rx) = mpsc::channel(32);
        let fake = Arc::new(Self {
            events,
            calls: parking_lot::Mutex::new(Vec::new()),
            values: parking_lot::Mutex::new(HashMap::new()),
            bonded: vec![BondedPeer {
                name: "Arduino".to_string(),
                address: PeerAddress::new(PEER),
                bond_state: BondState::Bonded,
            }],
            write_delay: parking_lot::Mutex::new(Duration::ZERO),
            connect_error: parking_lot::Mutex::new(None),
        });
        (fake, rx)
    }

    /// Deliver an event as if the platform reported it.
    pub async fn emit(&self, event: PeripheralEvent) {
        self.events.send(event).await.unwrap();
    }

    pub fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.values.lock().insert(characteristic, value);
    }

    /// Hold every write for `delay` after recording it.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Make the next `connect` calls fail with `err`.
    pub fn fail_connect(&self, err: BleError) {
        *self.connect_error.lock() = Some(err);
    }

    pub fn fail_connect_clear(&self) {
        *self.connect_error.lock() = None;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn writes(&self) -> Vec<(Uuid, Uuid, Vec<u8>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Write(s, ch, v) => Some((*s, *ch, v.clone())),
                _ => None,
            })
            .collect()
    }

    /// Wait until a recorded call matches `pred`.
    pub async fn wait_for_call(&self, pred: impl Fn(&Call) -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            while !self.calls.lock().iter().any(&pred) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected transport call was not made");
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check(service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        if service == SERVICE_UUID && (characteristic == VOLTAGE_UUID || characteristic == SWITCH_UUID)
        {
            Ok(())
        } else {
            Err(BleError::NotFound {
                service,
                characteristic,
            })
        }
    }
}

#[async_trait]
impl GattTransport for FakeTransport {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn adapter_enabled(&self) -> Result<bool, BleError> {
        Ok(true)
    }

    async fn watch_adapter(&self) -> Result<AdapterSubscription, BleError> {
        self.record(Call::WatchAdapter);
        Ok(AdapterSubscription::new(tokio::spawn(std::future::pending())))
    }

    async fn bonded_peers(&self) -> Result<Vec<BondedPeer>, BleError> {
        Ok(self.bonded.clone())
    }

    async fn connect(&self, address: &PeerAddress) -> Result<(), BleError> {
        self.record(Call::Connect(address.clone()));
        match self.connect_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.record(Call::Disconnect);
        Ok(())
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        self.record(Call::DiscoverServices);
        Ok(())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, BleError> {
        Self::check(service, characteristic)?;
        self.record(Call::Read(characteristic));
        Ok(self
            .values
            .lock()
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        Self::check(service, characteristic)?;
        if characteristic == VOLTAGE_UUID {
            return Err(BleError::Unsupported("write"));
        }
        self.record(Call::Write(service, characteristic, value.to_vec()));
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        Self::check(service, characteristic)?;
        self.record(Call::Subscribe(characteristic));
        Ok(())
    }

    async fn unsubscribe(&self, _service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        self.record(Call::Unsubscribe(characteristic));
        Ok(())
    }
}

/// Link settings without the voltage poll.
pub fn quiet_config() -> LinkConfig {
    LinkConfig {
        polling: false,
        ..LinkConfig::default()
    }
}

pub fn spawn_link(config: LinkConfig) -> (BleLink, Arc<FakeTransport>) {
    let (fake, events) = FakeTransport::new();
    let link = BleLink::spawn(fake.clone(), events, config);
    (link, fake)
}

/// Wait until the link snapshot satisfies `pred`.
pub async fn wait_for_link(link: &BleLink, pred: impl FnMut(&LinkSnapshot) -> bool) {
    let mut pred = pred;
    let mut rx = link.watch();
    tokio::time::timeout(TIMEOUT, rx.wait_for(|s| pred(&**s)))
        .await
        .expect("link did not reach expected state")
        .expect("link state channel closed");
}

/// Drive a fresh link to `Connected` with discovery complete.
pub async fn connected_link(config: LinkConfig) -> (BleLink, Arc<FakeTransport>) {
    let (link, fake) = spawn_link(config);
    link.connect(PeerAddress::new(PEER)).await.unwrap();
    fake.emit(PeripheralEvent::ConnectionChanged { connected: true })
        .await;
    fake.wait_for_call(|c| *c == Call::DiscoverServices).await;
    fake.emit(PeripheralEvent::ServicesDiscovered { success: true })
        .await;
    wait_for_link(&link, |s| s.can_send_message()).await;
    (link, fake)
}
