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

//! Platform GATT transport abstraction.
//!
//! A transport performs the raw BLE operations. Asynchronous outcomes
//! (link up/down, discovery completion, notifications, adapter power) are
//! pushed as [`PeripheralEvent`]s into the channel handed to the transport
//! when it is created.

use async_trait::async_trait;
use std::fmt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BleError;

/// Opaque peer identifier (a MAC address on Linux).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_string())
    }

    /// Like [`PeerAddress::new`] but rejects empty input.
    pub fn parse(address: &str) -> Result<Self, BleError> {
        let address = Self::new(address);
        if address.0.is_empty() {
            return Err(BleError::InvalidAddress("empty address".to_string()));
        }
        Ok(address)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pairing state of a remembered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// A device remembered by the local adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedPeer {
    pub name: String,
    pub address: PeerAddress,
    pub bond_state: BondState,
}

/// Asynchronous notifications from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    /// Low-level link state changed.
    ConnectionChanged { connected: bool },
    /// A connection attempt failed before the link came up.
    ConnectFailed(BleError),
    /// Service discovery finished.
    ServicesDiscovered { success: bool },
    /// A subscribed characteristic changed value.
    Notification {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Local adapter was powered on or off.
    AdapterPowered(bool),
}

/// Keeps adapter power notifications flowing until released or dropped.
#[derive(Debug)]
pub struct AdapterSubscription {
    task: Option<JoinHandle<()>>,
}

impl AdapterSubscription {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A subscription with nothing behind it.
    pub fn inactive() -> Self {
        Self { task: None }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivering adapter events.
    pub fn release(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AdapterSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Raw BLE central operations provided by the platform.
///
/// `connect` only starts the attempt; completion is reported through
/// [`PeripheralEvent::ConnectionChanged`]. Likewise `discover_services`
/// reports through [`PeripheralEvent::ServicesDiscovered`]. `write` should
/// return once the write has been handed to the stack, not when the
/// peripheral acknowledges it; writes are never issued concurrently.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    async fn adapter_enabled(&self) -> Result<bool, BleError>;

    /// Start forwarding adapter power changes as events.
    async fn watch_adapter(&self) -> Result<AdapterSubscription, BleError>;

    async fn bonded_peers(&self) -> Result<Vec<BondedPeer>, BleError>;

    async fn connect(&self, address: &PeerAddress) -> Result<(), BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;

    async fn discover_services(&self) -> Result<(), BleError>;

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, BleError>;

    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8])
        -> Result<(), BleError>;

    /// Enable notifications; values arrive as [`PeripheralEvent::Notification`].
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError>;

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError>;
}
