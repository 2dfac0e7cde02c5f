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

//! Application state snapshots.
//!
//! Every component publishes its state as an immutable, versioned value.
//! Updates clone the current value, mutate the copy, and swap it in, so a
//! snapshot held by an observer never changes underneath it.

use std::sync::Arc;
use tokio::sync::watch;

use crate::bluetooth::{BleConnectionPhase, PeerAddress};
use crate::error::ErrorDescriptor;

/// A snapshot together with its version number.
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: Arc<T>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: self.value.clone(),
        }
    }
}

impl<T> std::ops::Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Copy-on-write holder for one component's state.
#[derive(Debug)]
pub struct StateStore<T> {
    tx: watch::Sender<Versioned<T>>,
}

impl<T: Clone> StateStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(Versioned {
            version: 0,
            value: Arc::new(initial),
        });
        Self { tx }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Versioned<T> {
        self.tx.borrow().clone()
    }

    /// Apply `f` to a copy of the current value and publish it.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(|current| {
            let mut next = (*current.value).clone();
            f(&mut next);
            *current = Versioned {
                version: current.version + 1,
                value: Arc::new(next),
            };
        });
    }

    /// Observe future snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Versioned<T>> {
        self.tx.subscribe()
    }
}

/// State of the TCP streaming session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamingSessionState {
    pub connected: bool,
    pub last_error: Option<ErrorDescriptor>,
    /// Frames written to the socket since the session was created.
    pub frames_sent: u64,
    /// Frames replaced in the queue by a newer one before being written.
    pub frames_superseded: u64,
}

/// State of the BLE link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub phase: BleConnectionPhase,
    pub service_discovered: bool,
    pub peer: Option<PeerAddress>,
    /// Last voltage reported by the peripheral while connected.
    pub voltage: Option<f32>,
    pub adapter_enabled: bool,
    pub last_error: Option<ErrorDescriptor>,
}

impl Default for LinkSnapshot {
    fn default() -> Self {
        Self {
            phase: BleConnectionPhase::Idle,
            service_discovered: false,
            peer: None,
            voltage: None,
            adapter_enabled: false,
            last_error: None,
        }
    }
}

impl LinkSnapshot {
    /// Whether a characteristic write is currently permitted.
    pub fn can_send_message(&self) -> bool {
        self.phase == BleConnectionPhase::Connected && self.service_discovered
    }
}
