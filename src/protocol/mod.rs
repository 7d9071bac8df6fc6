//! Wire protocol for client/server and pool/worker links
//!
//! Frames are a single type byte followed by a little-endian u32 length
//! and a JSON payload; every connection opens with an 8-byte magic. The
//! same framing carries estimation traffic (submit, poll-status,
//! retrieve-results, cancel) and the queue pool's unit distribution.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{EstimatorError, Result};
use crate::model::{ForceFieldSource, PropertyItem, RequestState};
use crate::schema::RequestOptions;

/// Magic bytes for protocol identification
pub const PROTOCOL_MAGIC: &[u8; 8] = b"PROPSRV1";

/// Upper bound on a single frame's payload
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Message types on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client submits a request
    Submit = 1,
    /// Server acknowledges a submission with a request id
    SubmitAck = 2,
    /// Client polls a request's state
    Status = 3,
    /// Server replies with state and progress
    StatusReply = 4,
    /// Client retrieves results (optionally blocking until completion)
    Retrieve = 5,
    /// Server replies with a result set or snapshot
    Results = 6,
    /// Client cancels a request
    Cancel = 7,
    /// Server acknowledges a cancellation
    CancelAck = 8,
    /// Server reports an error for the preceding message
    Error = 9,
    /// Ping/keepalive
    Ping = 10,
    /// Pong response
    Pong = 11,
    /// Remote worker announces itself to the pool distributor
    WorkerHello = 20,
    /// Distributor assigns a calculation unit
    UnitAssign = 21,
    /// Remote worker reports a unit outcome
    UnitResult = 22,
    /// Distributor tells the worker to exit
    WorkerShutdown = 23,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Submit),
            2 => Some(Self::SubmitAck),
            3 => Some(Self::Status),
            4 => Some(Self::StatusReply),
            5 => Some(Self::Retrieve),
            6 => Some(Self::Results),
            7 => Some(Self::Cancel),
            8 => Some(Self::CancelAck),
            9 => Some(Self::Error),
            10 => Some(Self::Ping),
            11 => Some(Self::Pong),
            20 => Some(Self::WorkerHello),
            21 => Some(Self::UnitAssign),
            22 => Some(Self::UnitResult),
            23 => Some(Self::WorkerShutdown),
            _ => None,
        }
    }
}

/// Write the protocol magic at connection start
pub fn write_magic<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(PROTOCOL_MAGIC)?;
    writer.flush()?;
    Ok(())
}

/// Read and verify the protocol magic at connection start
pub fn read_magic<R: Read>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|e| EstimatorError::protocol(format!("failed to read magic: {}", e)))?;

    if &magic != PROTOCOL_MAGIC {
        return Err(EstimatorError::protocol("invalid protocol magic"));
    }

    Ok(())
}

/// Write one frame: type byte, length, JSON payload
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message_type: MessageType,
    payload: &T,
) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(EstimatorError::protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    writer.write_all(&[message_type as u8])?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, returning its type and raw payload bytes
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(MessageType, Vec<u8>)> {
    let mut type_buf = [0u8; 1];
    reader.read_exact(&mut type_buf)?;

    let message_type = MessageType::from_u8(type_buf[0])
        .ok_or_else(|| EstimatorError::protocol(format!("unknown message type {}", type_buf[0])))?;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(EstimatorError::protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    Ok((message_type, body))
}

/// Decode a frame payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Body of a `Submit` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPayload {
    /// Items to estimate, in order
    pub items: Vec<PropertyItem>,
    /// Opaque force-field reference
    pub force_field: ForceFieldSource,
    /// Layers and schema overrides
    pub options: RequestOptions,
}

/// Body of a `SubmitAck` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAck {
    /// Server-assigned request id
    pub request_id: String,
}

/// Body of `Status` and `Cancel` frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestQuery {
    /// Request id to operate on
    pub request_id: String,
}

/// Body of a `StatusReply` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    /// Request id
    pub request_id: String,
    /// Lifecycle state at reply time
    pub state: RequestState,
    /// Items with a terminal result so far
    pub completed_items: usize,
    /// Items submitted
    pub total_items: usize,
}

/// Body of a `Retrieve` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveQuery {
    /// Request id to retrieve
    pub request_id: String,
    /// Block server-side until the request is terminal
    pub synchronous: bool,
}

/// Body of an `Error` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ErrorReply {
    /// Build a wire error from a server-side error
    pub fn from_error(error: &EstimatorError) -> Self {
        let code = match error {
            EstimatorError::Validation(_) => "validation",
            EstimatorError::Provisioning { .. } => "provisioning",
            EstimatorError::WorkerFailure(_) => "worker_failure",
            EstimatorError::Connection { .. } => "connection",
            EstimatorError::Calculation { .. } => "calculation",
            EstimatorError::Cancelled => "cancelled",
            EstimatorError::Protocol(_) => "protocol",
            _ => "internal",
        };

        Self {
            code: code.to_string(),
            message: error.to_string(),
        }
    }

    /// Reconstruct a client-side error from the wire
    pub fn into_error(self) -> EstimatorError {
        match self.code.as_str() {
            "validation" => EstimatorError::Validation(self.message),
            "provisioning" => EstimatorError::provisioning("server", self.message),
            "worker_failure" => EstimatorError::WorkerFailure(self.message),
            "cancelled" => EstimatorError::Cancelled,
            _ => EstimatorError::Protocol(format!("{}: {}", self.code, self.message)),
        }
    }
}

/// Body of a `WorkerHello` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHello {
    /// Hostname the worker runs on
    pub hostname: String,
    /// Worker process id
    pub pid: u32,
}
