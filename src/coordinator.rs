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

//! Link coordinator.
//!
//! Relays classification bytes received on the streaming session to the
//! switch characteristic of the BLE peripheral. Values that arrive while a
//! write is in progress are coalesced; only the newest one is relayed.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bluetooth::{AdapterSubscription, BleLink};
use crate::error::BleError;
use crate::state::{StreamingSessionState, Versioned};
use crate::stream::{InboundValues, StreamingSession};

/// Decision derived from one classification byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerSignal {
    Safe,
    Danger,
}

impl DangerSignal {
    /// Zero means safe, anything else means danger.
    pub fn from_classification(value: u8) -> Self {
        if value == 0 {
            DangerSignal::Safe
        } else {
            DangerSignal::Danger
        }
    }

    /// Value written to the switch characteristic.
    pub fn as_byte(self) -> u8 {
        match self {
            DangerSignal::Safe => 0,
            DangerSignal::Danger => 1,
        }
    }
}

impl fmt::Display for DangerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DangerSignal::Safe => f.write_str("safe"),
            DangerSignal::Danger => f.write_str("danger"),
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Signals handed to the BLE link.
    pub relayed: u64,
    /// Signals dropped because the link was not writable.
    pub dropped: u64,
    /// Signals replaced by a newer one before they could be relayed.
    pub superseded: u64,
    /// Most recent signal received, relayed or not.
    pub last_signal: Option<DangerSignal>,
}

/// Writes signals to the switch characteristic.
struct Relay {
    link: BleLink,
    service: Uuid,
    characteristic: Uuid,
    stats: parking_lot::Mutex<CoordinatorStats>,
}

impl Relay {
    async fn relay(&self, value: u8) -> Result<(), BleError> {
        let signal = DangerSignal::from_classification(value);
        self.stats.lock().last_signal = Some(signal);

        if !self.link.can_send_message() {
            debug!("BLE link not ready, dropping {} signal", signal);
            self.stats.lock().dropped += 1;
            return Err(BleError::NotReady);
        }

        // Returns once the link has queued the write; no peripheral ack.
        match self
            .link
            .write(self.service, self.characteristic, vec![signal.as_byte()])
            .await
        {
            Ok(()) => {
                debug!("Relayed {} signal", signal);
                self.stats.lock().relayed += 1;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to relay {} signal: {}", signal, e);
                self.stats.lock().dropped += 1;
                Err(e)
            }
        }
    }
}

/// Couples the streaming session's inbound values to the BLE switch.
pub struct LinkCoordinator {
    session: StreamingSession,
    relay: Arc<Relay>,
    adapter: parking_lot::Mutex<Option<AdapterSubscription>>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LinkCoordinator {
    /// Acquire the adapter subscription and start consuming inbound values.
    ///
    /// If the session is already connected, its inbound values are claimed
    /// before this returns.
    pub async fn start(
        session: StreamingSession,
        link: BleLink,
        switch_service: Uuid,
        switch_characteristic: Uuid,
    ) -> Self {
        let adapter = match link.watch_adapter().await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Adapter notifications unavailable: {}", e);
                AdapterSubscription::inactive()
            }
        };

        let relay = Arc::new(Relay {
            link,
            service: switch_service,
            characteristic: switch_characteristic,
            stats: parking_lot::Mutex::new(CoordinatorStats::default()),
        });

        let state = session.watch();
        let initial = session.inbound_values();
        let consumer = tokio::spawn(consume(session.clone(), relay.clone(), state, initial));
        info!("Link coordinator started");

        Self {
            session,
            relay,
            adapter: parking_lot::Mutex::new(Some(adapter)),
            consumer: parking_lot::Mutex::new(Some(consumer)),
        }
    }

    /// Relay one classification value now.
    ///
    /// Returns [`BleError::NotReady`] if the signal was dropped because the
    /// link is not writable.
    pub async fn relay(&self, value: u8) -> Result<(), BleError> {
        self.relay.relay(value).await
    }

    /// Hand an encoded camera frame to the streaming session.
    pub fn send_frame(&self, width: u32, height: u32, payload: &[u8]) {
        self.session.send_frame(width, height, payload);
    }

    pub fn stats(&self) -> CoordinatorStats {
        *self.relay.stats.lock()
    }

    pub fn session(&self) -> &StreamingSession {
        &self.session
    }

    pub fn link(&self) -> &BleLink {
        &self.relay.link
    }

    /// Release the adapter subscription, stop consuming, and close both links.
    pub async fn shutdown(&self) {
        info!("Shutting down link coordinator");

        if let Some(adapter) = self.adapter.lock().take() {
            adapter.release();
        }

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.abort();
            if let Err(e) = consumer.await {
                if !e.is_cancelled() {
                    error!("Coordinator task ended abnormally: {}", e);
                }
            }
        }

        self.session.close().await;
        self.relay.link.shutdown().await;
    }
}

/// Consume inbound values of each connection the session makes.
async fn consume(
    session: StreamingSession,
    relay: Arc<Relay>,
    mut state: watch::Receiver<Versioned<StreamingSessionState>>,
    mut values: Option<InboundValues>,
) {
    loop {
        if let Some(mut current) = values.take() {
            while let Some(mut value) = current.next_value().await {
                while let Some(newer) = current.try_next_value() {
                    relay.stats.lock().superseded += 1;
                    value = newer;
                }
                let _ = relay.relay(value).await;
            }
            debug!("Inbound values ended");
        }

        if state.changed().await.is_err() {
            break;
        }
        if state.borrow_and_update().connected {
            values = session.inbound_values();
        }
    }
}
