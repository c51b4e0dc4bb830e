#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use switch_transport::loopback::{LoopbackConnector, LoopbackSwitch, SwitchEnd};
use switch_transport::{Code, Connector, ElectionId, SetPipelineConfigRequest, UnaryRequest};
use switchyard::{MapSchema, SchemaProvider, SessionConfig, SessionError, SessionPhase, SessionSettings, SwitchSession};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Timings short enough for real-clock tests.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        request_timeout: Duration::from_secs(2),
        min_uptime: Duration::from_millis(50),
        reconnect_cooldown: Duration::from_millis(10),
        role_settle: Duration::from_millis(1),
        ..SessionSettings::default()
    }
}

pub fn fabric_schema() -> Arc<dyn SchemaProvider> {
    Arc::new(
        MapSchema::new("fabric", "p4info:fabric:v1")
            .with_table("ingress.acl", 33_554_433)
            .with_action("ingress.drop", 16_777_217)
            .with_digest("mac_learn", 7),
    )
}

pub fn session_on(
    name: &str,
    config: Arc<SessionConfig>,
    connector: &LoopbackConnector,
    settings: SessionSettings,
) -> SwitchSession {
    let connector: Arc<dyn Connector> = Arc::new(connector.clone());
    SwitchSession::builder(name, format!("{name}:9559"), config, connector)
        .settings(settings)
        .build()
}

/// A session's `run` loop executing on its own task.
pub struct Running {
    token: CancellationToken,
    handle: JoinHandle<Result<(), SessionError>>,
}

impl Running {
    pub fn start(session: &SwitchSession) -> Self {
        let token = CancellationToken::new();
        let session = session.clone();
        let shutdown = token.clone();
        let handle = tokio::spawn(async move { session.run(shutdown).await });
        Self { token, handle }
    }

    pub async fn stop(self) -> Result<(), SessionError> {
        self.token.cancel();
        self.handle.await.expect("run task panicked")
    }

    pub async fn join(self) -> Result<(), SessionError> {
        self.handle.await.expect("run task panicked")
    }
}

/// Accept the bid on `end` and make the bidder primary at its own id.
pub async fn grant_primary(end: &mut SwitchEnd) -> ElectionId {
    let bid = end.next_arbitration().await.expect("arbitration bid");
    let election_id = bid.election_id.expect("bid carries an election id");
    end.respond_arbitration(bid.device_id, election_id, Code::Ok);
    election_id
}

/// Answer every connection on `switch` by granting primary.
pub fn serve_auto_primary(mut switch: LoopbackSwitch) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(end) = switch.accept().await {
            end.spawn_auto_primary();
        }
    })
}

pub async fn wait_for_phase(session: &SwitchSession, phase: SessionPhase) {
    let mut phases = session.phases();
    phases
        .wait_for(|current| *current == phase)
        .await
        .expect("session dropped");
}

pub fn pipeline_pushes(connector: &LoopbackConnector) -> Vec<SetPipelineConfigRequest> {
    connector
        .journal()
        .into_iter()
        .filter_map(|request| match request {
            UnaryRequest::SetPipelineConfig(set) => Some(set),
            _ => None,
        })
        .collect()
}
