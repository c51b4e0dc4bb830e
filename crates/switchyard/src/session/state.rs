use std::fmt;
use std::sync::Arc;

use switch_transport::PortStatus;
use thiserror::Error;

use crate::arbitrator::ArbitrationError;
use crate::client::{ClientError, ClientSession};
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::queues::QueueError;
use crate::supervisor::{SupervisorError, TaskSupervisor};

/// Where a session is in its connect/serve cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Arbitrating,
    CapabilityCheck,
    PipelineSync,
    TelemetryAttach,
    Ready,
    Dispatching,
    Teardown,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Arbitrating => "arbitrating",
            SessionPhase::CapabilityCheck => "capability_check",
            SessionPhase::PipelineSync => "pipeline_sync",
            SessionPhase::TelemetryAttach => "telemetry_attach",
            SessionPhase::Ready => "ready",
            SessionPhase::Dispatching => "dispatching",
            SessionPhase::Teardown => "teardown",
            SessionPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' is not connected")]
    NotConnected(String),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Arbitration(#[from] ArbitrationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("job '{task}' failed: {message}")]
    JobFailed { task: String, message: String },
    /// A supervised job failed under fail-fast; the session stops for good.
    #[error("fail-fast: {0}")]
    FailFast(#[source] SupervisorError),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::FailFast(_))
    }

    pub fn is_unavailable(&self) -> bool {
        match self {
            SessionError::Client(err) => err.is_unavailable(),
            SessionError::Arbitration(ArbitrationError::Client(err)) => err.is_unavailable(),
            _ => false,
        }
    }

    pub(crate) fn cause(&self) -> &'static str {
        match self {
            SessionError::NotConnected(_) => "not_connected",
            SessionError::Client(_) => "client",
            SessionError::Arbitration(_) => "arbitration",
            SessionError::Codec(_) => "codec",
            SessionError::Queue(_) => "queue",
            SessionError::Config(_) => "config",
            SessionError::JobFailed { .. } => "job",
            SessionError::FailFast(_) => "fail_fast",
        }
    }
}

/// Per-connection state. Reset on every connect attempt.
#[derive(Default)]
pub(crate) struct SessionState {
    pub channel: Option<Arc<ClientSession>>,
    pub supervisor: Option<TaskSupervisor>,
    pub api_version: Option<String>,
    pub ports: Vec<PortStatus>,
}

impl SessionState {
    pub fn is_channel_up(&self) -> bool {
        self.channel.as_ref().is_some_and(|channel| !channel.is_closed())
    }

    /// Replace the entry for `port.id`; returns the previous entry.
    pub fn upsert_port(&mut self, port: PortStatus) -> Option<PortStatus> {
        match self.ports.iter_mut().find(|known| known.id == port.id) {
            Some(known) => Some(std::mem::replace(known, port)),
            None => {
                self.ports.push(port);
                None
            }
        }
    }
}
