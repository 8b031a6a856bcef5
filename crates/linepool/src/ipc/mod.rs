//! Inter-process communication between the pool and its workers.
//!
//! Frames are rkyv-encoded (see [`protocol`]); structured payloads inside
//! them are JSON.

pub mod broker;
pub mod protocol;

pub use broker::{Broker, ProcessInfo, Readiness, WorkerChannel, WorkerSlot};
pub use protocol::{ControlSignal, WorkerCommand, WorkerResponse, read_message, write_message};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{PoolError, Result};

/// Encode a payload carried inside a frame.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| PoolError::Serialization(format!("Failed to encode payload: {e}")))
}

/// Decode a payload carried inside a frame.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PoolError::Serialization(format!("Failed to decode payload: {e}")))
}
