//! Estimation client
//!
//! Submits requests to a running estimation server and retrieves results,
//! either blocking until completion (the wait is delegated to the server,
//! not polled locally) or as an immediate snapshot. Transport and
//! validation failures come back as errors, never panics; callers check
//! the result before using the handle.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::config::ConnectionOptions;
use crate::error::{EstimatorError, Result};
use crate::model::{ForceFieldSource, PropertyItem, ResultSet};
use crate::protocol::{
    self, ErrorReply, MessageType, RequestQuery, RetrieveQuery, StatusReply, SubmitAck,
    SubmitPayload,
};
use crate::schema::RequestOptions;

/// Lightweight handle to a submitted request
///
/// Carries the request id and the connection options, so results can be
/// fetched later without keeping the client around.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    /// Server-assigned request id
    pub id: String,
    options: ConnectionOptions,
}

impl RequestHandle {
    /// Rebuild a handle from a stored request id
    pub fn new(id: impl Into<String>, options: ConnectionOptions) -> Self {
        Self {
            id: id.into(),
            options,
        }
    }

    /// Retrieve the request's results
    ///
    /// With `synchronous` the server holds the reply until the request is
    /// terminal; otherwise the current snapshot comes back immediately.
    pub fn results(&self, synchronous: bool) -> Result<ResultSet> {
        EstimationClient::new(self.options.clone()).retrieve(self, synchronous)
    }
}

/// Client for a remote estimation server
pub struct EstimationClient {
    options: ConnectionOptions,
}

impl EstimationClient {
    /// Create a client for the given connection options
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }

    /// Submit a batch of items for estimation
    pub fn request_estimate(
        &self,
        items: Vec<PropertyItem>,
        force_field: ForceFieldSource,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        let payload = SubmitPayload {
            items,
            force_field,
            options,
        };

        let (message_type, body) = self.round_trip(MessageType::Submit, &payload)?;
        match message_type {
            MessageType::SubmitAck => {
                let ack: SubmitAck = protocol::decode(&body)?;
                tracing::info!(request = %ack.request_id, "request accepted");
                Ok(RequestHandle {
                    id: ack.request_id,
                    options: self.options.clone(),
                })
            }
            other => Err(self.unexpected(other, &body)),
        }
    }

    /// Poll a request's state without blocking
    pub fn status(&self, handle: &RequestHandle) -> Result<StatusReply> {
        let query = RequestQuery {
            request_id: handle.id.clone(),
        };

        let (message_type, body) = self.round_trip(MessageType::Status, &query)?;
        match message_type {
            MessageType::StatusReply => protocol::decode(&body),
            other => Err(self.unexpected(other, &body)),
        }
    }

    /// Retrieve results; `synchronous` blocks until the request is terminal
    pub fn retrieve(&self, handle: &RequestHandle, synchronous: bool) -> Result<ResultSet> {
        let query = RetrieveQuery {
            request_id: handle.id.clone(),
            synchronous,
        };

        let (message_type, body) = self.round_trip(MessageType::Retrieve, &query)?;
        match message_type {
            MessageType::Results => protocol::decode(&body),
            other => Err(self.unexpected(other, &body)),
        }
    }

    /// Cancel an in-flight request; best-effort once units are executing
    pub fn cancel(&self, handle: &RequestHandle) -> Result<()> {
        let query = RequestQuery {
            request_id: handle.id.clone(),
        };

        let (message_type, body) = self.round_trip(MessageType::Cancel, &query)?;
        match message_type {
            MessageType::CancelAck => Ok(()),
            other => Err(self.unexpected(other, &body)),
        }
    }

    /// Measure round-trip latency to the server
    pub fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let (message_type, body) = self.round_trip(MessageType::Ping, &())?;
        match message_type {
            MessageType::Pong => Ok(start.elapsed()),
            other => Err(self.unexpected(other, &body)),
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let address = self.options.address();
        let mut stream = TcpStream::connect(&address)
            .map_err(|e| EstimatorError::connection(&address, e.to_string()))?;
        protocol::write_magic(&mut stream)?;
        Ok(stream)
    }

    /// One request/response exchange on a fresh connection
    fn round_trip<T: serde::Serialize>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> Result<(MessageType, Vec<u8>)> {
        let mut stream = self.connect()?;
        protocol::write_frame(&mut stream, message_type, payload)?;
        protocol::read_frame(&mut stream)
    }

    /// Turn an unexpected reply into an error, unwrapping server errors
    fn unexpected(&self, message_type: MessageType, body: &[u8]) -> EstimatorError {
        if message_type == MessageType::Error {
            match protocol::decode::<ErrorReply>(body) {
                Ok(reply) => reply.into_error(),
                Err(e) => e,
            }
        } else {
            EstimatorError::protocol(format!("unexpected reply {:?}", message_type))
        }
    }
}
