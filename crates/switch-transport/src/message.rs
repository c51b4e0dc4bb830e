//! Typed control-plane messages exchanged with a switch.
//!
//! Entities are carried as opaque [`WireEntity`] payloads; turning them into
//! table entries, meters and friends is the job of an external codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::status::Status;

pub type DeviceId = u64;
pub type ElectionId = u128;

/// Role-specific configuration attached to an arbitration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoleConfig {
    /// Shape known to the schema provider, keyed by its type URL.
    Structured {
        type_url: String,
        value: serde_json::Value,
    },
    /// Uninterpreted payload forwarded as-is.
    Opaque(Bytes),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub config: Option<RoleConfig>,
}

impl Role {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }
}

/// Arbitration bid. `election_id: None` asks for backup-only participation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationRequest {
    pub device_id: DeviceId,
    pub election_id: Option<ElectionId>,
    pub role: Option<Role>,
}

/// Arbitration update pushed by the switch, either as the answer to a bid or
/// unsolicited when the primary changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationResponse {
    pub device_id: DeviceId,
    /// Highest election id the switch knows about (the primary's).
    pub election_id: ElectionId,
    pub role: Option<Role>,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketMetadata {
    pub id: u32,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketOut {
    pub payload: Bytes,
    pub metadata: Vec<PacketMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketIn {
    pub payload: Bytes,
    pub metadata: Vec<PacketMetadata>,
}

impl PacketIn {
    pub fn metadata_value(&self, id: u32) -> Option<&Bytes> {
        self.metadata
            .iter()
            .find(|meta| meta.id == id)
            .map(|meta| &meta.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestList {
    pub digest_id: u32,
    pub list_id: u64,
    pub data: Vec<Bytes>,
    pub timestamp: i64,
}

impl DigestList {
    pub fn ack(&self) -> DigestListAck {
        DigestListAck {
            digest_id: self.digest_id,
            list_id: self.list_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestListAck {
    pub digest_id: u32,
    pub list_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleTimeoutNotification {
    pub entities: Vec<WireEntity>,
    pub timestamp: i64,
}

/// Stream-level error reported by the switch (for example a rejected packet-out).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamErrorReport {
    pub status: Status,
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamRequest {
    Arbitration(ArbitrationRequest),
    Packet(PacketOut),
    DigestAck(DigestListAck),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamResponse {
    Arbitration(ArbitrationResponse),
    Packet(PacketIn),
    Digest(DigestList),
    IdleTimeout(IdleTimeoutNotification),
    Error(StreamErrorReport),
}

impl StreamResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamResponse::Arbitration(_) => "arbitration",
            StreamResponse::Packet(_) => "packet",
            StreamResponse::Digest(_) => "digest",
            StreamResponse::IdleTimeout(_) => "idle_timeout",
            StreamResponse::Error(_) => "error",
        }
    }
}

impl StreamRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamRequest::Arbitration(_) => "arbitration",
            StreamRequest::Packet(_) => "packet",
            StreamRequest::DigestAck(_) => "digest_ack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    TableEntry,
    ActionProfileMember,
    ActionProfileGroup,
    MeterEntry,
    DirectMeterEntry,
    CounterEntry,
    DirectCounterEntry,
    MulticastGroupEntry,
    CloneSessionEntry,
    ValueSetEntry,
    RegisterEntry,
    DigestEntry,
    ExternEntry,
}

/// Encoded entity; produced and consumed by an external codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntity {
    pub kind: EntityKind,
    pub payload: Bytes,
}

impl WireEntity {
    pub fn new(kind: EntityKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Insert,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub kind: UpdateKind,
    pub entity: WireEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Atomicity {
    #[default]
    ContinueOnError,
    RollbackOnError,
    DataplaneAtomic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub device_id: DeviceId,
    pub role: Option<String>,
    pub election_id: Option<ElectionId>,
    pub updates: Vec<Update>,
    pub atomicity: Atomicity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub device_id: DeviceId,
    pub role: Option<String>,
    pub entities: Vec<WireEntity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub entities: Vec<WireEntity>,
}

/// Forwarding program as installed on (or pushed to) a switch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForwardingPipelineConfig {
    pub p4info: Option<Bytes>,
    pub device_config: Bytes,
    pub cookie: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineAction {
    Verify,
    VerifyAndSave,
    VerifyAndCommit,
    Commit,
    ReconcileAndCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPipelineConfigRequest {
    pub device_id: DeviceId,
    pub role: Option<String>,
    pub election_id: Option<ElectionId>,
    pub action: PipelineAction,
    pub config: ForwardingPipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineResponseType {
    All,
    CookieOnly,
    P4InfoAndCookie,
    DeviceConfigAndCookie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPipelineConfigRequest {
    pub device_id: DeviceId,
    pub response_type: PipelineResponseType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryRequest {
    Write(WriteRequest),
    SetPipelineConfig(SetPipelineConfigRequest),
    GetPipelineConfig(GetPipelineConfigRequest),
    Capabilities,
}

impl UnaryRequest {
    pub fn method(&self) -> &'static str {
        match self {
            UnaryRequest::Write(_) => "Write",
            UnaryRequest::SetPipelineConfig(_) => "SetForwardingPipelineConfig",
            UnaryRequest::GetPipelineConfig(_) => "GetForwardingPipelineConfig",
            UnaryRequest::Capabilities => "Capabilities",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryResponse {
    Write,
    SetPipelineConfig,
    GetPipelineConfig(ForwardingPipelineConfig),
    Capabilities { api_version: String },
}

/// Operational state of a switch port as reported by the telemetry client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperStatus {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub id: u64,
    pub name: String,
    pub oper_status: OperStatus,
}

/// Connectivity state of the underlying channel, reported alongside each
/// logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}
