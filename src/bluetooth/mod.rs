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

//! Bluetooth LE module.
//!
//! Manages the GATT client link to the danger-signal peripheral: connection
//! phases, service discovery, characteristic I/O and voltage telemetry.

pub mod ble_constants;
#[cfg(feature = "bluez")]
mod bluez;
mod link;
mod phase;
mod telemetry;
mod transport;

#[cfg(feature = "bluez")]
pub use bluez::BluezTransport;
pub use link::{BleLink, LinkConfig, PhaseTransition, ValueHandler};
pub use phase::{BleConnectionPhase, Effect, LinkMachine, PhaseEvent, Step};
pub use telemetry::decode_voltage;
pub use transport::{
    AdapterSubscription, BondState, BondedPeer, GattTransport, PeerAddress, PeripheralEvent,
};
