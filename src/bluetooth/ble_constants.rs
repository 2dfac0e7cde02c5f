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

//! BLE service and characteristic UUIDs of the switch peripheral.

use uuid::Uuid;

/// Peripheral GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x19b10000_e8f2_537e_4f6c_d104768a1214);

/// Voltage characteristic UUID.
/// Properties: Read, Notify. Value: little-endian f32.
pub const VOLTAGE_UUID: Uuid = Uuid::from_u128(0x19b10001_e8f2_537e_4f6c_d104768a1214);

/// Switch characteristic UUID.
/// Properties: Write. Value: one byte, 0 = safe, anything else = danger.
pub const SWITCH_UUID: Uuid = Uuid::from_u128(0x19b10001_e8f2_537e_4f6c_d104768a1215);

/// Link timing constants.
pub mod config {
    use std::time::Duration;

    /// Default interval of the voltage poll.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Capacity of the peripheral event channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 32;
}
