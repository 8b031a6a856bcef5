//! IPC protocol messages between the pool, its workers and the fork server.
//!
//! Uses length-prefixed rkyv messages over the broker's TCP connections and
//! the fork server's stdin.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{Read, Write};

use rkyv::api::high::{HighDeserializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Frames larger than this are rejected.
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Command sent from the pool to a worker.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Handshake reply: the executor recipe (JSON `FlowCreateArgs`).
    Init { flow_json: Vec<u8> },

    /// Execute one line.
    Execute {
        run_id: String,
        line_index: u64,
        /// JSON object of line inputs.
        inputs_json: Vec<u8>,
        /// Effective timeout for this line.
        timeout_ms: u64,
    },

    /// Finish and exit.
    Terminate,

    Ping,
}

/// Message sent from a worker to the pool.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// First frame on a new connection.
    Hello {
        token: String,
        slot: u64,
        generation: u64,
        pid: u32,
    },

    /// Executor built; the worker accepts `Execute`.
    Ready,

    /// Intermediate node run record (JSON `RunInfo`).
    NodeRun { run_info_json: Vec<u8> },

    /// Intermediate flow run record (JSON `FlowRunInfo`).
    FlowRun { run_info_json: Vec<u8> },

    /// Final result of a line (JSON `LineResult`).
    LineResult { result_json: Vec<u8> },

    /// Worker-side failure outside of a line.
    Error { message: String },

    Pong,
}

/// Instruction from the pool to the fork server, sent over its stdin.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum ControlSignal {
    /// Sent once, before any `Start`.
    Configure {
        broker_addr: String,
        token: String,
        flow_json: Vec<u8>,
    },

    /// Fork a worker for `slot`.
    Start { slot: u64, generation: u64 },

    Shutdown,
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| PoolError::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| PoolError::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| PoolError::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| PoolError::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// Frames are validated before they are deserialized; the broker reads the
/// first frame of a connection before it has seen a token.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, HighDeserializer<rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| PoolError::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(PoolError::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(bytes.as_mut_slice())
        .map_err(|e| PoolError::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    let message = rkyv::from_bytes::<T, rkyv::rancor::Error>(&bytes)
        .map_err(|e| PoolError::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_execute_command_roundtrip() {
        let cmd = WorkerCommand::Execute {
            run_id: "batch".to_string(),
            line_index: 7,
            inputs_json: br#"{"text":"hi"}"#.to_vec(),
            timeout_ms: 2500,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerCommand::Execute {
                run_id,
                line_index,
                inputs_json,
                timeout_ms,
            } => {
                assert_eq!(run_id, "batch");
                assert_eq!(line_index, 7);
                assert_eq!(inputs_json, br#"{"text":"hi"}"#.to_vec());
                assert_eq!(timeout_ms, 2500);
            }
            _ => panic!("Wrong command type"),
        }
    }

    #[test]
    fn test_frames_read_in_order() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &WorkerResponse::Hello {
                token: "t".to_string(),
                slot: 1,
                generation: 2,
                pid: 42,
            },
        )
        .unwrap();
        write_message(&mut buf, &WorkerResponse::Ready).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: WorkerResponse = read_message(&mut cursor).unwrap();
        assert!(matches!(first, WorkerResponse::Hello { slot: 1, generation: 2, pid: 42, .. }));
        let second: WorkerResponse = read_message(&mut cursor).unwrap();
        assert!(matches!(second, WorkerResponse::Ready));
        assert!(read_message::<_, WorkerResponse>(&mut cursor).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        let err = read_message::<_, ControlSignal>(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut buf = Vec::new();
        write_message(&mut buf, &ControlSignal::Start { slot: 0, generation: 1 }).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_message::<_, ControlSignal>(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_corrupted_frame_is_error() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &WorkerResponse::Hello {
                token: "secret".to_string(),
                slot: 0,
                generation: 1,
                pid: 7,
            },
        )
        .unwrap();
        let end = buf.len();
        buf[end - 32..].fill(0x7f);

        let err = read_message::<_, WorkerResponse>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, PoolError::Serialization(_)), "got {err:?}");
    }
}
