//! Switchyard: control-plane sessions for programmable switches.
//!
//! Responsibilities:
//! - one self-healing session per switch, with primary/backup election
//! - forwarding program synchronization keyed by a content cookie
//! - fan-out of packets, digests and idle-timeout notifications to bounded queues
//! - supervision of per-connection jobs with optional fail-fast escalation
//! - a controller that owns a dynamic set of sessions

pub mod arbitrator;
pub mod client;
pub mod codec;
pub mod config;
pub mod controller;
pub mod countdown;
pub mod election;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod queues;
pub mod session;
pub mod supervisor;

pub use arbitrator::{
    ArbitrationError, ArbitrationQuirks, Arbitrator, ElectionSnapshot, ElectionState,
    RoleTransition,
};
pub use client::{ClientError, ClientErrorKind, ClientSession, SubError};
pub use codec::{CodecError, EntityCodec, RawCodec};
pub use config::{ConfigError, ControllerSettings, ReadyHook, SessionConfig, SessionSettings};
pub use controller::{Controller, ControllerError, Removal, FAIL_FAST_EXIT_CODE};
pub use countdown::Countdown;
pub use election::ElectionIdGenerator;
pub use events::{EventKind, EventRegistry, SwitchEvent};
pub use pipeline::{pipeline_cookie, MapSchema, PipelineSource, SchemaProvider};
pub use queues::{Consumer, QueueError};
pub use session::{SessionError, SessionPhase, SwitchSession};
pub use supervisor::{SupervisorError, TaskHandle, TaskSupervisor};
