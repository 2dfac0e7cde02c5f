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

//! Voltage telemetry.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use super::transport::GattTransport;

/// Decode a voltage reading (little-endian f32).
///
/// Extra trailing bytes are ignored.
pub fn decode_voltage(bytes: &[u8]) -> Option<f32> {
    match bytes {
        [a, b, c, d, ..] => Some(f32::from_le_bytes([*a, *b, *c, *d])),
        _ => {
            warn!("Voltage value too short: {} bytes", bytes.len());
            None
        }
    }
}

/// Periodically read a characteristic and pass each value to `on_value`.
///
/// The first read happens one `interval` after start. The task ends when
/// `on_value` returns `false` or when it is aborted.
pub fn spawn_poll<F>(
    transport: Arc<dyn GattTransport>,
    service: Uuid,
    characteristic: Uuid,
    interval: Duration,
    on_value: F,
) -> JoinHandle<()>
where
    F: Fn(Vec<u8>) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        debug!("Poll of {} started ({:?})", characteristic, interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match transport.read(service, characteristic).await {
                Ok(value) => {
                    if !on_value(value) {
                        break;
                    }
                }
                Err(e) => debug!("Poll read of {} failed: {}", characteristic, e),
            }
        }
        debug!("Poll of {} stopped", characteristic);
    })
}
