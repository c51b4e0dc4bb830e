//! Stream client for one switch connection.
//!
//! The bidirectional stream is split between two owners: a writer task that
//! exclusively holds the send half, and whoever calls [`ClientSession::receive`]
//! (the session's dispatch loop) for the receive half. Both are tied to one
//! cancellation token so closing either side stops both.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use switch_transport::{
    Code, Connectivity, Connector, Credentials, ReadRequest, ReadResponse, RpcChannel,
    StreamRequest, StreamResponse, StreamSink, StreamSource, TelemetryClient, TransportError,
    UnaryRequest, UnaryResponse,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_DEPTH: usize = 64;

/// Failure of one update inside a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubError {
    pub code: Code,
    pub message: String,
    pub space: String,
    pub error_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// The switch answered with a non-OK status.
    Status,
    /// The channel failed or was closed.
    Transport,
    /// The stream carried something it must not (for example ended early).
    Protocol,
    Timeout,
}

/// Structured failure of a client operation.
#[derive(Debug, Clone, Error)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub code: Code,
    pub message: String,
    /// Sparse map from update index to its failure, for batched writes.
    pub sub_errors: BTreeMap<usize, SubError>,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if !self.sub_errors.is_empty() {
            write!(f, " [")?;
            for (position, (index, sub)) in self.sub_errors.iter().enumerate() {
                if position > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "#{index} {}: {}", sub.code, sub.message)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, code: Code, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            sub_errors: BTreeMap::new(),
        }
    }

    pub fn closed() -> Self {
        Self::new(ClientErrorKind::Transport, Code::Unavailable, "channel closed")
    }

    fn end_of_stream() -> Self {
        Self::new(
            ClientErrorKind::Protocol,
            Code::Unavailable,
            "stream ended unexpectedly",
        )
    }

    /// Map a transport failure. Write requests additionally get their per-update
    /// details folded into `sub_errors`.
    pub fn from_transport(err: TransportError, request: Option<&UnaryRequest>) -> Self {
        match err {
            TransportError::Status(status) => {
                let mut error = Self::new(ClientErrorKind::Status, status.code, status.message);
                if matches!(request, Some(UnaryRequest::Write(_))) {
                    error.sub_errors = status
                        .details
                        .into_iter()
                        .enumerate()
                        .filter(|(_, detail)| detail.canonical_code != Code::Ok)
                        .map(|(index, detail)| {
                            (
                                index,
                                SubError {
                                    code: detail.canonical_code,
                                    message: detail.message,
                                    space: detail.space,
                                    error_code: detail.code,
                                },
                            )
                        })
                        .collect();
                }
                error
            }
            TransportError::Timeout { elapsed_ms } => Self::new(
                ClientErrorKind::Timeout,
                Code::DeadlineExceeded,
                format!("no reply after {elapsed_ms}ms"),
            ),
            other => {
                let code = other.code();
                Self::new(ClientErrorKind::Transport, code, other.to_string())
            }
        }
    }

    /// Another connection already claimed our election id.
    pub fn is_election_id_used(&self) -> bool {
        self.code == Code::InvalidArgument
            && self.message.to_ascii_lowercase().contains("election id")
            && self.message.to_ascii_lowercase().contains("already")
    }

    /// The switch has no forwarding program installed yet.
    pub fn is_pipeline_missing(&self) -> bool {
        self.code == Code::FailedPrecondition
            && self
                .message
                .to_ascii_lowercase()
                .contains("no forwarding pipeline config")
    }

    /// Every failed update in the batch failed with NOT_FOUND.
    pub fn is_not_found_only(&self) -> bool {
        if self.sub_errors.is_empty() {
            return self.code == Code::NotFound;
        }
        self.sub_errors
            .values()
            .all(|sub| sub.code == Code::NotFound)
    }

    pub fn is_unavailable(&self) -> bool {
        self.code == Code::Unavailable
    }

    pub fn is_unimplemented(&self) -> bool {
        self.code == Code::Unimplemented
    }
}

type Outbound = (StreamRequest, oneshot::Sender<Result<(), TransportError>>);

/// One opened channel: stream halves plus the unary/stream RPC helpers.
pub struct ClientSession {
    address: String,
    rpc: Arc<dyn RpcChannel>,
    outbound: mpsc::Sender<Outbound>,
    source: AsyncMutex<Box<dyn StreamSource>>,
    closing: CancellationToken,
    writer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("address", &self.address)
            .field("connectivity", &self.connectivity())
            .field("closing", &self.closing.is_cancelled())
            .finish()
    }
}

impl ClientSession {
    pub async fn open(
        connector: &dyn Connector,
        address: &str,
        credentials: Option<&Credentials>,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let connection = connector
            .open(address, credentials)
            .await
            .map_err(|err| ClientError::from_transport(err, None))?;

        let closing = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let writer = tokio::spawn(run_writer(
            address.to_string(),
            connection.sink,
            outbound_rx,
            closing.clone(),
        ));

        debug!(
            target: "switchyard::client",
            %address,
            tls = credentials.is_some(),
            connectivity = ?connection.rpc.connectivity(),
            "channel opened"
        );

        Ok(Self {
            address: address.to_string(),
            rpc: connection.rpc,
            outbound,
            source: AsyncMutex::new(connection.source),
            closing,
            writer: parking_lot::Mutex::new(Some(writer)),
            request_timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connectivity(&self) -> Connectivity {
        self.rpc.connectivity()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Close both stream halves and wait for the writer to finish.
    pub async fn close(&self) {
        self.closing.cancel();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
            debug!(target: "switchyard::client", address = %self.address, "channel closed");
        }
    }

    pub async fn send(&self, request: StreamRequest) -> Result<(), ClientError> {
        if self.closing.is_cancelled() {
            return Err(ClientError::closed());
        }
        trace!(
            target: "switchyard::client",
            address = %self.address,
            kind = request.kind(),
            size = wire_size(&request),
            connectivity = ?self.connectivity(),
            "stream send"
        );
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send((request, ack_tx))
            .await
            .map_err(|_| ClientError::closed())?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ClientError::from_transport(err, None)),
            Err(_) => Err(ClientError::closed()),
        }
    }

    /// Next stream message. End-of-stream is reported as a protocol error.
    pub async fn receive(&self) -> Result<StreamResponse, ClientError> {
        let mut source = self.source.lock().await;
        let next = tokio::select! {
            _ = self.closing.cancelled() => return Err(ClientError::closed()),
            next = source.receive() => next,
        };
        match next {
            Ok(Some(response)) => {
                trace!(
                    target: "switchyard::client",
                    address = %self.address,
                    kind = response.kind(),
                    size = wire_size(&response),
                    connectivity = ?self.connectivity(),
                    "stream receive"
                );
                Ok(response)
            }
            Ok(None) => Err(ClientError::end_of_stream()),
            Err(err) => Err(ClientError::from_transport(err, None)),
        }
    }

    /// Unary request with the per-call timeout.
    pub async fn request(&self, request: UnaryRequest) -> Result<UnaryResponse, ClientError> {
        if self.closing.is_cancelled() {
            return Err(ClientError::closed());
        }
        let method = request.method();
        trace!(
            target: "switchyard::client",
            address = %self.address,
            method,
            size = wire_size(&request),
            connectivity = ?self.connectivity(),
            "unary request"
        );
        let call = self.rpc.unary(request.clone(), self.request_timeout);
        let reply = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Timeout {
                elapsed_ms: self.request_timeout.as_millis() as u64,
            }),
        };
        match reply {
            Ok(response) => {
                trace!(
                    target: "switchyard::client",
                    address = %self.address,
                    method,
                    size = wire_size(&response),
                    "unary reply"
                );
                Ok(response)
            }
            Err(err) => {
                let error = ClientError::from_transport(err, Some(&request));
                debug!(
                    target: "switchyard::client",
                    address = %self.address,
                    method,
                    error = %error,
                    "unary request failed"
                );
                Err(error)
            }
        }
    }

    /// Server-streaming read.
    pub async fn request_stream(
        &self,
        request: ReadRequest,
    ) -> Result<BoxStream<'static, Result<ReadResponse, ClientError>>, ClientError> {
        if self.closing.is_cancelled() {
            return Err(ClientError::closed());
        }
        trace!(
            target: "switchyard::client",
            address = %self.address,
            size = wire_size(&request),
            "read request"
        );
        let stream = self
            .rpc
            .server_stream(request, self.request_timeout)
            .await
            .map_err(|err| ClientError::from_transport(err, None))?;
        Ok(stream
            .map(|item| item.map_err(|err| ClientError::from_transport(err, None)))
            .boxed())
    }

    pub async fn open_telemetry(&self) -> Result<Arc<dyn TelemetryClient>, ClientError> {
        self.rpc
            .open_telemetry()
            .await
            .map_err(|err| ClientError::from_transport(err, None))
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.closing.cancel();
    }
}

async fn run_writer(
    address: String,
    mut sink: Box<dyn StreamSink>,
    mut outbound: mpsc::Receiver<Outbound>,
    closing: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = closing.cancelled() => break,
            next = outbound.recv() => next,
        };
        let Some((request, ack)) = next else {
            break;
        };
        let result = sink.send(request).await;
        let failed = result.is_err();
        let _ = ack.send(result);
        if failed {
            closing.cancel();
            break;
        }
    }
    sink.close().await;
    trace!(target: "switchyard::client", %address, "writer stopped");
}

pub(crate) fn wire_size<T: Serialize>(message: &T) -> u64 {
    bincode::serialized_size(message).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switch_transport::{Status, StatusDetail, Update, UpdateKind, WireEntity, WriteRequest};

    fn write_request() -> UnaryRequest {
        UnaryRequest::Write(WriteRequest {
            device_id: 1,
            role: None,
            election_id: Some(10),
            updates: vec![Update {
                kind: UpdateKind::Delete,
                entity: WireEntity::new(switch_transport::EntityKind::TableEntry, &b"x"[..]),
            }],
            atomicity: Default::default(),
        })
    }

    #[test]
    fn write_details_become_sparse_sub_errors() {
        let status = Status::new(Code::Unknown, "write failed").with_details(vec![
            StatusDetail::ok(),
            StatusDetail::new(Code::NotFound, "entry missing"),
            StatusDetail::ok(),
            StatusDetail::new(Code::NotFound, "entry missing"),
        ]);
        let err = ClientError::from_transport(TransportError::Status(status), Some(&write_request()));
        assert_eq!(err.sub_errors.len(), 2);
        assert!(err.sub_errors.contains_key(&1));
        assert!(err.sub_errors.contains_key(&3));
        assert!(err.is_not_found_only());
    }

    #[test]
    fn mixed_sub_errors_are_not_not_found_only() {
        let status = Status::new(Code::Unknown, "write failed").with_details(vec![
            StatusDetail::new(Code::NotFound, "entry missing"),
            StatusDetail::new(Code::InvalidArgument, "bad match"),
        ]);
        let err = ClientError::from_transport(TransportError::Status(status), Some(&write_request()));
        assert!(!err.is_not_found_only());
        let rendered = err.to_string();
        assert!(rendered.contains("#1 INVALID_ARGUMENT"), "{rendered}");
    }

    #[test]
    fn recognizes_well_known_conditions() {
        let used = ClientError::from_transport(
            TransportError::status(
                Code::InvalidArgument,
                "Election ID is already used by another connection",
            ),
            None,
        );
        assert!(used.is_election_id_used());

        let missing = ClientError::from_transport(
            TransportError::status(
                Code::FailedPrecondition,
                "No forwarding pipeline config set for this device",
            ),
            None,
        );
        assert!(missing.is_pipeline_missing());
        assert!(!missing.is_election_id_used());
    }

    #[test]
    fn non_write_requests_keep_no_sub_errors() {
        let status = Status::new(Code::Unknown, "boom")
            .with_details(vec![StatusDetail::new(Code::NotFound, "x")]);
        let err = ClientError::from_transport(TransportError::Status(status), None);
        assert!(err.sub_errors.is_empty());
        assert!(!err.is_not_found_only());
    }
}
