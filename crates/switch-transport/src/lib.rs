//! Transport contract consumed by switch control-plane sessions.
//!
//! A [`Connector`] opens a [`Connection`] to one switch. The connection is
//! already split: the bidirectional stream's send half ([`StreamSink`]) and
//! receive half ([`StreamSource`]) are owned independently, while unary and
//! server-streaming calls go through the shared [`RpcChannel`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod credentials;
pub mod error;
pub mod message;
pub mod status;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use credentials::{CallCredentials, Credentials, Identity};
pub use error::{TransportError, TransportResult};
pub use message::*;
pub use status::{Code, Status, StatusDetail};

/// Send half of the control stream.
#[async_trait]
pub trait StreamSink: Send {
    async fn send(&mut self, request: StreamRequest) -> TransportResult<()>;

    /// Half-close the stream. Idempotent.
    async fn close(&mut self);
}

/// Receive half of the control stream.
#[async_trait]
pub trait StreamSource: Send {
    /// `Ok(None)` is the transport's end-of-stream marker.
    async fn receive(&mut self) -> TransportResult<Option<StreamResponse>>;
}

/// Telemetry client multiplexed over the same authenticated channel. Used
/// only for port operational status.
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    async fn get_ports(&self) -> TransportResult<Vec<PortStatus>>;

    async fn subscribe_ports(&self)
        -> TransportResult<BoxStream<'static, TransportResult<PortStatus>>>;
}

#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn unary(&self, request: UnaryRequest, timeout: Duration)
        -> TransportResult<UnaryResponse>;

    async fn server_stream(
        &self,
        request: ReadRequest,
        timeout: Duration,
    ) -> TransportResult<BoxStream<'static, TransportResult<ReadResponse>>>;

    async fn open_telemetry(&self) -> TransportResult<Arc<dyn TelemetryClient>>;

    fn connectivity(&self) -> Connectivity;
}

/// An opened channel to one switch.
pub struct Connection {
    pub sink: Box<dyn StreamSink>,
    pub source: Box<dyn StreamSource>,
    pub rpc: Arc<dyn RpcChannel>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel. `credentials: None` opens an insecure channel.
    async fn open(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> TransportResult<Connection>;
}
