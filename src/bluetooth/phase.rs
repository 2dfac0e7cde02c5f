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

//! BLE connection phases and their transitions.
//!
//! Transitions are pure: [`BleConnectionPhase::next`] maps a phase and an
//! event to the following phase. [`LinkMachine`] adds the discovery flag on
//! top and reports which side effects the driver must perform.

use std::fmt;

use super::transport::PeerAddress;
use crate::error::BleError;

/// Phase of the BLE link, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BleConnectionPhase {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    CancelConnecting,
    FailedToConnect,
    DisconnectedByPeer,
}

impl BleConnectionPhase {
    pub const ALL: [BleConnectionPhase; 7] = [
        BleConnectionPhase::Idle,
        BleConnectionPhase::Connecting,
        BleConnectionPhase::Connected,
        BleConnectionPhase::Disconnecting,
        BleConnectionPhase::CancelConnecting,
        BleConnectionPhase::FailedToConnect,
        BleConnectionPhase::DisconnectedByPeer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BleConnectionPhase::Idle => "Idle",
            BleConnectionPhase::Connecting => "Connecting...",
            BleConnectionPhase::Connected => "Connected",
            BleConnectionPhase::Disconnecting => "Disconnecting...",
            BleConnectionPhase::CancelConnecting => "Cancelling...",
            BleConnectionPhase::FailedToConnect => "Failed to connect",
            BleConnectionPhase::DisconnectedByPeer => "Disconnected by device",
        }
    }

    /// Phase reached from `self` on `event`, or `None` if the event does not
    /// apply.
    pub fn next(self, event: PhaseEvent) -> Option<BleConnectionPhase> {
        use BleConnectionPhase::*;
        use PhaseEvent as E;

        match (self, event) {
            (Idle, E::Connect) => Some(Connecting),
            // Transport link is up but services are not known yet.
            (Connecting, E::PeripheralConnected) => Some(Connecting),
            (Connecting, E::ServicesDiscovered) => Some(Connected),
            (Connecting, E::PeripheralDisconnected | E::DiscoveryFailed) => Some(FailedToConnect),
            (Connecting, E::Disconnect) => Some(CancelConnecting),
            (CancelConnecting, E::PeripheralDisconnected) => Some(Idle),
            (Connected, E::Disconnect) => Some(Disconnecting),
            (Connected, E::PeripheralDisconnected) => Some(DisconnectedByPeer),
            (Disconnecting, E::PeripheralDisconnected) => Some(Idle),
            (FailedToConnect | DisconnectedByPeer, E::Dismiss) => Some(Idle),
            _ => None,
        }
    }
}

impl fmt::Display for BleConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Local request to connect.
    Connect,
    /// Local request to disconnect.
    Disconnect,
    /// Local acknowledgement of a failure dialog.
    Dismiss,
    /// Transport reports the link is up.
    PeripheralConnected,
    /// Service discovery completed successfully.
    ServicesDiscovered,
    /// Service discovery failed.
    DiscoveryFailed,
    /// Transport reports the link is down.
    PeripheralDisconnected,
}

/// Work the driver has to do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenConnection(PeerAddress),
    CloseConnection,
    DiscoverServices,
    /// Subscribe to and poll the voltage characteristic.
    StartTelemetry,
    /// Cancel subscription and poll together.
    StopTelemetry,
}

/// Outcome of an applied event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub from: BleConnectionPhase,
    pub to: BleConnectionPhase,
    pub effects: Vec<Effect>,
}

impl Step {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Phase plus the discovery flag that gates writes.
#[derive(Debug, Clone)]
pub struct LinkMachine {
    phase: BleConnectionPhase,
    service_discovered: bool,
    transport_connected: bool,
    peer: Option<PeerAddress>,
}

impl Default for LinkMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMachine {
    pub fn new() -> Self {
        Self {
            phase: BleConnectionPhase::Idle,
            service_discovered: false,
            transport_connected: false,
            peer: None,
        }
    }

    pub fn phase(&self) -> BleConnectionPhase {
        self.phase
    }

    pub fn service_discovered(&self) -> bool {
        self.service_discovered
    }

    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.as_ref()
    }

    /// Writes are allowed only when connected and discovery has completed.
    pub fn can_send_message(&self) -> bool {
        self.phase == BleConnectionPhase::Connected && self.service_discovered
    }

    /// Start connecting. Only valid from `Idle`.
    pub fn connect(&mut self, address: PeerAddress) -> Result<Step, BleError> {
        let step = self.apply_local(PhaseEvent::Connect, vec![Effect::OpenConnection(address.clone())])?;
        self.peer = Some(address);
        self.transport_connected = false;
        self.service_discovered = false;
        Ok(step)
    }

    /// Disconnect. Cancels a pending attempt or closes an established link.
    pub fn disconnect(&mut self) -> Result<Step, BleError> {
        let effects = match self.phase {
            BleConnectionPhase::Connected => vec![Effect::StopTelemetry, Effect::CloseConnection],
            _ => vec![Effect::CloseConnection],
        };
        let step = self.apply_local(PhaseEvent::Disconnect, effects)?;
        self.service_discovered = false;
        Ok(step)
    }

    /// Acknowledge `FailedToConnect` or `DisconnectedByPeer`.
    pub fn dismiss(&mut self) -> Result<Step, BleError> {
        let step = self.apply_local(PhaseEvent::Dismiss, Vec::new())?;
        self.peer = None;
        Ok(step)
    }

    /// Forget the link and return to `Idle`, whatever the current phase.
    ///
    /// Used when the driver stops; the transport has already been closed.
    pub fn reset(&mut self) -> Step {
        let from = self.phase;
        *self = Self::new();
        Step {
            from,
            to: BleConnectionPhase::Idle,
            effects: Vec::new(),
        }
    }

    fn apply_local(&mut self, event: PhaseEvent, effects: Vec<Effect>) -> Result<Step, BleError> {
        let from = self.phase;
        let to = from.next(event).ok_or(BleError::InvalidPhase(from))?;
        self.phase = to;
        Ok(Step { from, to, effects })
    }

    /// Apply a transport-reported event. Returns `None` when ignored.
    pub fn on_peripheral(&mut self, event: PhaseEvent) -> Option<Step> {
        match event {
            PhaseEvent::PeripheralConnected => self.transport_connected = true,
            PhaseEvent::PeripheralDisconnected => {
                self.transport_connected = false;
                self.service_discovered = false;
            }
            PhaseEvent::ServicesDiscovered if !self.transport_connected => return None,
            _ => {}
        }

        let from = self.phase;
        let to = from.next(event)?;

        let effects = match (from, event) {
            (BleConnectionPhase::Connecting, PhaseEvent::PeripheralConnected) => {
                vec![Effect::DiscoverServices]
            }
            (_, PhaseEvent::ServicesDiscovered) => {
                self.service_discovered = true;
                vec![Effect::StartTelemetry]
            }
            (_, PhaseEvent::DiscoveryFailed) => vec![Effect::CloseConnection],
            (BleConnectionPhase::Connected, PhaseEvent::PeripheralDisconnected) => {
                vec![Effect::StopTelemetry]
            }
            _ => Vec::new(),
        };

        self.phase = to;
        if to == BleConnectionPhase::Idle {
            self.peer = None;
        }
        Some(Step { from, to, effects })
    }
}
