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

//! VideoStreamer link daemon.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use videostreamer_link::bluetooth::ble_constants::config::EVENT_CHANNEL_CAPACITY;
use videostreamer_link::bluetooth::{BleLink, BluezTransport, PeerAddress, PeripheralEvent};
use videostreamer_link::{Config, LinkCoordinator, StreamingSession};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("videostreamer_link=info".parse()?),
        )
        .init();

    info!(
        "Starting VideoStreamer link v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Initialize BLE transport and link
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<PeripheralEvent>(EVENT_CHANNEL_CAPACITY);
    let transport = Arc::new(BluezTransport::new(event_tx).await?);
    let link = BleLink::spawn(transport, event_rx, config.bluetooth.link_config());

    match link.bonded_peers().await {
        Ok(peers) => {
            for peer in peers {
                info!("Bonded peer: {} ({})", peer.name, peer.address);
            }
        }
        Err(e) => warn!("Could not list bonded peers: {}", e),
    }

    let session = StreamingSession::new();
    let coordinator = LinkCoordinator::start(
        session.clone(),
        link.clone(),
        config.bluetooth.service_uuid,
        config.bluetooth.switch_uuid,
    )
    .await;

    if let Err(e) = session
        .connect(
            &config.stream.host,
            &config.stream.port,
            config.stream.connect_timeout(),
        )
        .await
    {
        warn!("Stream unavailable: {}", e);
    }

    match config.bluetooth.device_address.as_deref().map(PeerAddress::parse) {
        Some(Ok(address)) => {
            if let Err(e) = link.connect(address).await {
                warn!("BLE connect rejected: {}", e);
            }
        }
        Some(Err(e)) => warn!("Invalid device address: {}", e),
        None => info!("No BLE device configured"),
    }

    info!("Ready. Press Ctrl+C to exit.");

    let mut transitions = link.transitions();
    let mut snapshots = link.watch();
    let mut last_voltage = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            transition = transitions.recv() => match transition {
                Ok(t) => info!("BLE phase: {} -> {}", t.from, t.to),
                Err(RecvError::Lagged(n)) => warn!("Missed {} phase transitions", n),
                Err(RecvError::Closed) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let voltage = snapshots.borrow_and_update().voltage;
                if voltage != last_voltage {
                    if let Some(v) = voltage {
                        info!("Peripheral voltage: {:.2} V", v);
                    }
                    last_voltage = voltage;
                }
            }
        }
    }

    // Cleanup
    coordinator.shutdown().await;
    let stats = coordinator.stats();
    info!(
        "Shutting down: {} signals relayed, {} dropped",
        stats.relayed, stats.dropped
    );

    Ok(())
}
