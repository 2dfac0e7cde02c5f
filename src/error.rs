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

//! Error types.
//!
//! Loops never propagate these past their own boundary. Failures are turned
//! into an [`ErrorDescriptor`] and published through the state snapshots.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::bluetooth::BleConnectionPhase;

/// Failure to open a streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Host or port could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The connection attempt did not complete in time.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    /// Connection refused, reset, or any other socket error.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Failure to decode a wire message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes than the header or the declared payload length.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Failure to encode a wire message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The payload length does not fit the 32-bit length field.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: u32 },
}

/// BLE link failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// Link is not connected or service discovery has not completed.
    #[error("link not ready (connected and discovered required)")]
    NotReady,

    /// The peripheral does not expose the requested service/characteristic.
    #[error("characteristic {characteristic} of service {service} not found")]
    NotFound { service: Uuid, characteristic: Uuid },

    /// The platform transport cannot perform the operation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The operation is not valid in the current phase.
    #[error("operation not allowed while {0}")]
    InvalidPhase(BleConnectionPhase),

    /// Peer address could not be parsed.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// Platform transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The link driver has shut down.
    #[error("link closed")]
    Closed,
}

/// Direction of a failed socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => f.write_str("read"),
            IoOp::Write => f.write_str("write"),
        }
    }
}

/// Read/write failure on an established session.
#[derive(Debug, Error)]
#[error("socket {op} failed: {source}")]
pub struct TransportIoError {
    pub op: IoOp,
    #[source]
    pub source: std::io::Error,
}

/// Category of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidAddress,
    Timeout,
    Transport,
    Io,
    Ble,
}

/// Snapshot-friendly error record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&ConnectError> for ErrorDescriptor {
    fn from(err: &ConnectError) -> Self {
        let kind = match err {
            ConnectError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            ConnectError::Timeout(_) => ErrorKind::Timeout,
            ConnectError::Transport(_) => ErrorKind::Transport,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<&TransportIoError> for ErrorDescriptor {
    fn from(err: &TransportIoError) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: err.to_string(),
        }
    }
}

impl From<&BleError> for ErrorDescriptor {
    fn from(err: &BleError) -> Self {
        Self {
            kind: ErrorKind::Ble,
            message: err.to_string(),
        }
    }
}
