//! In-memory transport backed by a scripted fake switch, for tests and local
//! wiring before a real channel is available.
//!
//! [`loopback`] returns the connector handed to sessions plus a
//! [`LoopbackSwitch`] the test drives: every `open` produces a [`SwitchEnd`]
//! that sees the session's stream requests and pushes stream responses back.
//! Unary calls are answered from a shared [`DeviceState`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::{
    ArbitrationRequest, ArbitrationResponse, Code, Connection, Connectivity, Connector,
    Credentials, DeviceId, ElectionId, ForwardingPipelineConfig, PipelineResponseType,
    PortStatus, ReadRequest, ReadResponse, RpcChannel, Status, StreamRequest, StreamResponse,
    StreamSink, StreamSource, TelemetryClient, TransportError, TransportResult, UnaryRequest,
    UnaryResponse, UpdateKind, WireEntity,
};

pub const DEFAULT_API_VERSION: &str = "1.3.0";

/// Mutable state of the fake switch shared by every connection.
pub struct DeviceState {
    pub pipeline: Option<ForwardingPipelineConfig>,
    pub entities: Vec<WireEntity>,
    pub journal: Vec<UnaryRequest>,
    pub write_failures: VecDeque<Status>,
    pub api_version: Option<String>,
    pub stall_unary: bool,
    telemetry: Option<TelemetryState>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            pipeline: None,
            entities: Vec::new(),
            journal: Vec::new(),
            write_failures: VecDeque::new(),
            api_version: Some(DEFAULT_API_VERSION.to_string()),
            stall_unary: false,
            telemetry: None,
        }
    }
}

struct TelemetryState {
    ports: Vec<PortStatus>,
    updates: broadcast::Sender<PortStatus>,
}

struct Shared {
    accept_tx: mpsc::UnboundedSender<SwitchEnd>,
    device: Mutex<DeviceState>,
    refusals: AtomicUsize,
    opened: AtomicUsize,
}

/// Connector half handed to sessions.
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

/// Test half: accepts one [`SwitchEnd`] per opened channel.
pub struct LoopbackSwitch {
    accept_rx: mpsc::UnboundedReceiver<SwitchEnd>,
}

pub fn loopback() -> (LoopbackConnector, LoopbackSwitch) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accept_tx,
        device: Mutex::new(DeviceState::default()),
        refusals: AtomicUsize::new(0),
        opened: AtomicUsize::new(0),
    });
    (LoopbackConnector { shared }, LoopbackSwitch { accept_rx })
}

impl LoopbackConnector {
    /// Run `f` against the fake switch's state.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.shared.device.lock())
    }

    pub fn set_pipeline(&self, pipeline: Option<ForwardingPipelineConfig>) {
        self.with_device(|device| device.pipeline = pipeline);
    }

    pub fn pipeline(&self) -> Option<ForwardingPipelineConfig> {
        self.with_device(|device| device.pipeline.clone())
    }

    pub fn journal(&self) -> Vec<UnaryRequest> {
        self.with_device(|device| device.journal.clone())
    }

    pub fn fail_next_write(&self, status: Status) {
        self.with_device(|device| device.write_failures.push_back(status));
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) {
        self.shared.refusals.store(count, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Serve port status over the telemetry client. Without this the
    /// telemetry RPCs answer `UNIMPLEMENTED`.
    pub fn enable_telemetry(&self, ports: Vec<PortStatus>) {
        let (updates, _) = broadcast::channel(64);
        self.with_device(|device| device.telemetry = Some(TelemetryState { ports, updates }));
    }

    /// Push a port status change to every telemetry subscriber.
    pub fn publish_port(&self, port: PortStatus) -> bool {
        self.with_device(|device| match device.telemetry.as_mut() {
            Some(telemetry) => {
                if let Some(existing) = telemetry.ports.iter_mut().find(|p| p.id == port.id) {
                    *existing = port.clone();
                } else {
                    telemetry.ports.push(port.clone());
                }
                telemetry.updates.send(port).is_ok()
            }
            None => false,
        })
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> TransportResult<Connection> {
        let refused = self
            .shared
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed(format!(
                "{address}: connection refused"
            )));
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let end = SwitchEnd {
            address: address.to_string(),
            requests: request_rx,
            responses: Some(response_tx),
        };
        self.shared
            .accept_tx
            .send(end)
            .map_err(|_| TransportError::ConnectionFailed(format!("{address}: switch gone")))?;
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            target: "switch_transport::loopback",
            %address,
            tls = credentials.is_some(),
            "loopback channel opened"
        );

        Ok(Connection {
            sink: Box::new(LoopbackSink {
                tx: Some(request_tx),
                closed: closed.clone(),
            }),
            source: Box::new(LoopbackSource { rx: response_rx }),
            rpc: Arc::new(LoopbackRpc {
                shared: self.shared.clone(),
                closed,
            }),
        })
    }
}

impl LoopbackSwitch {
    pub async fn accept(&mut self) -> Option<SwitchEnd> {
        self.accept_rx.recv().await
    }

    pub fn try_accept(&mut self) -> Option<SwitchEnd> {
        self.accept_rx.try_recv().ok()
    }
}

/// Switch side of one opened channel.
pub struct SwitchEnd {
    address: String,
    requests: mpsc::UnboundedReceiver<StreamRequest>,
    responses: Option<mpsc::UnboundedSender<TransportResult<StreamResponse>>>,
}

impl SwitchEnd {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next stream request, or `None` once the client closed its send half.
    pub async fn next_request(&mut self) -> Option<StreamRequest> {
        self.requests.recv().await
    }

    /// Next arbitration bid, skipping any other stream traffic.
    pub async fn next_arbitration(&mut self) -> Option<ArbitrationRequest> {
        while let Some(request) = self.requests.recv().await {
            if let StreamRequest::Arbitration(bid) = request {
                return Some(bid);
            }
        }
        None
    }

    pub fn respond(&self, response: StreamResponse) -> bool {
        self.responses
            .as_ref()
            .map(|tx| tx.send(Ok(response)).is_ok())
            .unwrap_or(false)
    }

    pub fn respond_arbitration(
        &self,
        device_id: DeviceId,
        election_id: ElectionId,
        code: Code,
    ) -> bool {
        self.respond(StreamResponse::Arbitration(ArbitrationResponse {
            device_id,
            election_id,
            role: None,
            status: Status::new(code, ""),
        }))
    }

    /// Terminate the stream with an error, as a transport failure would.
    pub fn fail(&self, error: TransportError) -> bool {
        self.responses
            .as_ref()
            .map(|tx| tx.send(Err(error)).is_ok())
            .unwrap_or(false)
    }

    /// Close the response direction; the client observes end-of-stream.
    pub fn hang_up(&mut self) {
        self.responses = None;
    }

    /// Answer every bid by granting primary at the bid's election id, until
    /// the client closes the stream.
    pub fn spawn_auto_primary(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.next_request().await {
                if let StreamRequest::Arbitration(bid) = request {
                    let election_id = bid.election_id.unwrap_or_default();
                    let code = if election_id == 0 {
                        Code::NotFound
                    } else {
                        Code::Ok
                    };
                    self.respond_arbitration(bid.device_id, election_id, code);
                }
            }
        })
    }
}

struct LoopbackSink {
    tx: Option<mpsc::UnboundedSender<StreamRequest>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StreamSink for LoopbackSink {
    async fn send(&mut self, request: StreamRequest) -> TransportResult<()> {
        match self.tx.as_ref() {
            Some(tx) => tx.send(request).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct LoopbackSource {
    rx: mpsc::UnboundedReceiver<TransportResult<StreamResponse>>,
}

#[async_trait]
impl StreamSource for LoopbackSource {
    async fn receive(&mut self) -> TransportResult<Option<StreamResponse>> {
        match self.rx.recv().await {
            Some(Ok(response)) => Ok(Some(response)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

struct LoopbackRpc {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

impl LoopbackRpc {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::status(Code::Unavailable, "channel closed"))
        } else {
            Ok(())
        }
    }

    fn answer(&self, request: UnaryRequest) -> TransportResult<UnaryResponse> {
        let mut device = self.shared.device.lock();
        device.journal.push(request.clone());
        match request {
            UnaryRequest::Write(write) => {
                if let Some(status) = device.write_failures.pop_front() {
                    return Err(TransportError::Status(status));
                }
                for update in write.updates {
                    match update.kind {
                        UpdateKind::Insert => device.entities.push(update.entity),
                        UpdateKind::Modify => {
                            if let Some(slot) = device
                                .entities
                                .iter_mut()
                                .find(|e| e.kind == update.entity.kind)
                            {
                                *slot = update.entity;
                            }
                        }
                        UpdateKind::Delete => device.entities.retain(|e| *e != update.entity),
                    }
                }
                Ok(UnaryResponse::Write)
            }
            UnaryRequest::SetPipelineConfig(set) => {
                device.pipeline = Some(set.config);
                Ok(UnaryResponse::SetPipelineConfig)
            }
            UnaryRequest::GetPipelineConfig(get) => {
                let Some(installed) = device.pipeline.clone() else {
                    return Err(TransportError::status(
                        Code::FailedPrecondition,
                        "No forwarding pipeline config set for this device",
                    ));
                };
                let config = match get.response_type {
                    PipelineResponseType::All => installed,
                    PipelineResponseType::CookieOnly => ForwardingPipelineConfig {
                        cookie: installed.cookie,
                        ..Default::default()
                    },
                    PipelineResponseType::P4InfoAndCookie => ForwardingPipelineConfig {
                        p4info: installed.p4info,
                        cookie: installed.cookie,
                        ..Default::default()
                    },
                    PipelineResponseType::DeviceConfigAndCookie => ForwardingPipelineConfig {
                        device_config: installed.device_config,
                        cookie: installed.cookie,
                        ..Default::default()
                    },
                };
                Ok(UnaryResponse::GetPipelineConfig(config))
            }
            UnaryRequest::Capabilities => match device.api_version.clone() {
                Some(api_version) => Ok(UnaryResponse::Capabilities { api_version }),
                None => Err(TransportError::status(
                    Code::Unimplemented,
                    "Capabilities not implemented",
                )),
            },
        }
    }
}

#[async_trait]
impl RpcChannel for LoopbackRpc {
    async fn unary(
        &self,
        request: UnaryRequest,
        timeout: Duration,
    ) -> TransportResult<UnaryResponse> {
        self.ensure_open()?;
        let stalled = self.shared.device.lock().stall_unary;
        if stalled {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            });
        }
        self.answer(request)
    }

    async fn server_stream(
        &self,
        request: ReadRequest,
        _timeout: Duration,
    ) -> TransportResult<BoxStream<'static, TransportResult<ReadResponse>>> {
        self.ensure_open()?;
        let entities: Vec<WireEntity> = {
            let device = self.shared.device.lock();
            device
                .entities
                .iter()
                .filter(|entity| request.entities.iter().any(|q| q.kind == entity.kind))
                .cloned()
                .collect()
        };
        // One response per entity, the way a switch streams large reads.
        let responses: Vec<TransportResult<ReadResponse>> = entities
            .into_iter()
            .map(|entity| {
                Ok(ReadResponse {
                    entities: vec![entity],
                })
            })
            .collect();
        Ok(stream::iter(responses).boxed())
    }

    async fn open_telemetry(&self) -> TransportResult<Arc<dyn TelemetryClient>> {
        self.ensure_open()?;
        let available = self.shared.device.lock().telemetry.is_some();
        if !available {
            return Err(TransportError::status(
                Code::Unimplemented,
                "telemetry service not implemented",
            ));
        }
        Ok(Arc::new(LoopbackTelemetry {
            shared: self.shared.clone(),
        }))
    }

    fn connectivity(&self) -> Connectivity {
        if self.closed.load(Ordering::SeqCst) {
            Connectivity::Shutdown
        } else {
            Connectivity::Ready
        }
    }
}

struct LoopbackTelemetry {
    shared: Arc<Shared>,
}

#[async_trait]
impl TelemetryClient for LoopbackTelemetry {
    async fn get_ports(&self) -> TransportResult<Vec<PortStatus>> {
        let device = self.shared.device.lock();
        device
            .telemetry
            .as_ref()
            .map(|t| t.ports.clone())
            .ok_or_else(|| TransportError::status(Code::Unimplemented, "telemetry disabled"))
    }

    async fn subscribe_ports(
        &self,
    ) -> TransportResult<BoxStream<'static, TransportResult<PortStatus>>> {
        let rx = {
            let device = self.shared.device.lock();
            match device.telemetry.as_ref() {
                Some(t) => t.updates.subscribe(),
                None => {
                    return Err(TransportError::status(
                        Code::Unimplemented,
                        "telemetry disabled",
                    ))
                }
            }
        };
        let updates = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(port) => return Some((Ok(port), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(updates.boxed())
    }
}
