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

//! Frame wire format.
//!
//! One message is `BE-u32 width | BE-u32 height | BE-u32 length | payload`.
//! The payload is opaque (whatever the camera encoder produced) and at most
//! `u32::MAX` bytes long.

use crate::error::{DecodeError, EncodeError};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 12;

/// A decoded frame message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub width: u32,
    pub height: u32,
    pub payload_length: u32,
    pub payload: Vec<u8>,
}

/// Encode a frame into a length-prefixed wire message.
pub fn encode(width: u32, height: u32, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let payload_length = length_field(payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&payload_length.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

fn length_field(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::PayloadTooLarge { len, max: u32::MAX })
}

/// Decode one complete wire message.
///
/// Trailing bytes after the declared payload are ignored.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }

    let width = read_be_u32(&bytes[0..4]);
    let height = read_be_u32(&bytes[4..8]);
    let payload_length = read_be_u32(&bytes[8..12]);

    let needed = HEADER_LEN + payload_length as usize;
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: bytes.len(),
        });
    }

    Ok(WireMessage {
        width,
        height,
        payload_length,
        payload: bytes[HEADER_LEN..needed].to_vec(),
    })
}

fn read_be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
