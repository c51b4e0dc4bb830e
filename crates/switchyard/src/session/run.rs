use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use switch_transport::{
    OperStatus, PortStatus, TransportError, TransportResult, UnaryRequest, UnaryResponse,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{SessionError, SessionPhase, SessionState};
use super::SwitchSession;
use crate::arbitrator::Arbitrator;
use crate::client::{ClientError, ClientSession};
use crate::events::SwitchEvent;
use crate::metrics;
use crate::pipeline::{self, DesiredPipeline, PipelineOutcome};
use crate::supervisor::TaskSupervisor;

/// Everything owned by one connect attempt; discarded on teardown.
pub(super) struct Attempt {
    pub client: Option<Arc<ClientSession>>,
    pub arbitrator: Arbitrator,
    pub supervisor: TaskSupervisor,
    pub desired: Option<DesiredPipeline>,
}

/// Why the dispatch loop stopped without an error.
pub(super) enum Break {
    StreamError,
}

impl SwitchSession {
    /// Connect, serve and reconnect until `shutdown` fires. Returns an error
    /// only when a supervised job fails under fail-fast.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SessionError> {
        info!(
            target: "switchyard::session",
            session = %self.name(),
            address = %self.address(),
            device_id = self.device_id(),
            "session starting"
        );
        self.emit(SwitchEvent::SessionStart {
            session: self.clone(),
        });

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }
            metrics::CONNECT_ATTEMPTS
                .with_label_values(&[self.name()])
                .inc();
            let started = Instant::now();
            let mut attempt = self.new_attempt();

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                outcome = self.connect_and_serve(&mut attempt) => Some(outcome),
            };
            self.teardown(&mut attempt).await;

            match outcome {
                None => break Ok(()),
                Some(Ok(Break::StreamError)) => {
                    metrics::SESSION_FAILURES
                        .with_label_values(&[self.name(), "stream_error"])
                        .inc();
                }
                Some(Err(err)) if err.is_fatal() => {
                    error!(
                        target: "switchyard::session",
                        session = %self.name(),
                        error = %err,
                        "session stopping after fail-fast job failure"
                    );
                    break Err(err);
                }
                Some(Err(err)) => {
                    metrics::SESSION_FAILURES
                        .with_label_values(&[self.name(), err.cause()])
                        .inc();
                    if err.is_unavailable() {
                        warn!(target: "switchyard::session", session = %self.name(), error = %err, "switch unavailable");
                    } else {
                        error!(target: "switchyard::session", session = %self.name(), error = %err, "session attempt failed");
                    }
                }
            }

            let ran = started.elapsed();
            if ran < self.inner.settings.min_uptime {
                debug!(
                    target: "switchyard::session",
                    session = %self.name(),
                    ran_ms = ran.as_millis() as u64,
                    cooldown_ms = self.inner.settings.reconnect_cooldown.as_millis() as u64,
                    "throttling reconnect"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(self.inner.settings.reconnect_cooldown) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        };

        self.set_phase(SessionPhase::Stopped);
        self.emit(SwitchEvent::SessionStop {
            session: self.clone(),
        });
        info!(target: "switchyard::session", session = %self.name(), "session stopped");
        result
    }

    pub(super) fn set_phase(&self, phase: SessionPhase) {
        let previous = self.inner.phase.send_replace(phase);
        if previous != phase {
            debug!(target: "switchyard::session", session = %self.name(), %phase, "phase");
        }
    }

    fn new_attempt(&self) -> Attempt {
        let config = &self.inner.config;
        Attempt {
            client: None,
            arbitrator: Arbitrator::new(
                config.device_id(),
                config.initial_election_id(),
                config.role().cloned(),
                self.inner.settings.quirks,
                self.inner.election.clone(),
            ),
            supervisor: TaskSupervisor::new(self.name(), config.fail_fast()),
            desired: None,
        }
    }

    async fn connect_and_serve(&self, attempt: &mut Attempt) -> Result<Break, SessionError> {
        self.set_phase(SessionPhase::Connecting);
        let config = self.inner.config.clone();
        let client = Arc::new(
            ClientSession::open(
                self.inner.connector.as_ref(),
                self.address(),
                config.credentials(),
                self.inner.settings.request_timeout,
            )
            .await?,
        );
        attempt.client = Some(client.clone());
        {
            let mut state = self.inner.state.write();
            *state = SessionState::default();
            state.channel = Some(client.clone());
            state.supervisor = Some(attempt.supervisor.clone());
        }
        self.emit(SwitchEvent::ChannelUp {
            session: self.clone(),
        });

        self.set_phase(SessionPhase::Arbitrating);
        attempt.arbitrator.handshake(client.as_ref(), false).await?;

        self.set_phase(SessionPhase::CapabilityCheck);
        self.check_capabilities(&client).await?;

        self.set_phase(SessionPhase::PipelineSync);
        if let Some(schema) = config.schema() {
            attempt.desired =
                Some(DesiredPipeline::load(schema.clone(), config.program()).await?);
        }
        self.sync_pipeline(attempt, &client).await?;

        self.set_phase(SessionPhase::TelemetryAttach);
        self.attach_telemetry(attempt, &client).await?;

        self.set_phase(SessionPhase::Ready);
        info!(
            target: "switchyard::session",
            session = %self.name(),
            is_primary = attempt.arbitrator.is_primary(),
            election_id = %attempt.arbitrator.election_id(),
            api_version = ?self.api_version(),
            "channel ready"
        );
        self.emit(SwitchEvent::ChannelReady {
            session: self.clone(),
        });
        self.spawn_ready_hook(attempt);

        self.set_phase(SessionPhase::Dispatching);
        self.dispatch(attempt, &client).await
    }

    async fn check_capabilities(&self, client: &ClientSession) -> Result<(), SessionError> {
        match client.request(UnaryRequest::Capabilities).await {
            Ok(UnaryResponse::Capabilities { api_version }) => {
                debug!(target: "switchyard::session", session = %self.name(), %api_version, "capabilities");
                self.inner.state.write().api_version = Some(api_version);
                Ok(())
            }
            Ok(other) => Err(pipeline::unexpected_reply("Capabilities", &other).into()),
            Err(err) if err.is_unimplemented() => {
                debug!(target: "switchyard::session", session = %self.name(), "switch does not report capabilities");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Primary pushes when the cookie differs; backup only compares.
    pub(super) async fn sync_pipeline(
        &self,
        attempt: &Attempt,
        client: &ClientSession,
    ) -> Result<(), SessionError> {
        let Some(desired) = attempt.desired.as_ref() else {
            debug!(target: "switchyard::session", session = %self.name(), "no schema configured; skipping pipeline sync");
            return Ok(());
        };
        let outcome = if attempt.arbitrator.is_primary() {
            pipeline::sync_primary(
                client,
                &attempt.arbitrator.snapshot(),
                self.device_id(),
                desired,
                self.inner.config.force_reload(),
            )
            .await?
        } else {
            pipeline::check_backup(client, self.device_id(), desired).await?
        };
        debug!(target: "switchyard::session", session = %self.name(), ?outcome, "pipeline sync done");
        if outcome == PipelineOutcome::Mismatch {
            debug!(target: "switchyard::session", session = %self.name(), "continuing as backup with a foreign pipeline");
        }
        Ok(())
    }

    /// Port status is optional: a switch without telemetry is tolerated, an
    /// unreachable one is not.
    async fn attach_telemetry(
        &self,
        attempt: &Attempt,
        client: &ClientSession,
    ) -> Result<(), SessionError> {
        let telemetry = match client.open_telemetry().await {
            Ok(telemetry) => telemetry,
            Err(err) if err.is_unavailable() => return Err(err.into()),
            Err(err) => {
                warn!(target: "switchyard::session", session = %self.name(), error = %err, "telemetry not available; no port status");
                return Ok(());
            }
        };

        match telemetry.get_ports().await {
            Ok(ports) => {
                debug!(target: "switchyard::session", session = %self.name(), ports = ports.len(), "port list");
                self.inner.state.write().ports = ports;
            }
            Err(err) => tolerate(self, err, "port list")?,
        }

        match telemetry.subscribe_ports().await {
            Ok(updates) => {
                let session = self.clone();
                attempt
                    .supervisor
                    .spawn("port-status", true, async move { session.watch_ports(updates).await });
            }
            Err(err) => tolerate(self, err, "port subscription")?,
        }
        Ok(())
    }

    async fn watch_ports(
        self,
        mut updates: BoxStream<'static, TransportResult<PortStatus>>,
    ) -> anyhow::Result<()> {
        while let Some(update) = updates.next().await {
            let port = update.map_err(|err| ClientError::from_transport(err, None))?;
            let previous = self.inner.state.write().upsert_port(port.clone());
            let changed = previous.map_or(true, |previous| previous.oper_status != port.oper_status);
            if !changed {
                continue;
            }
            match port.oper_status {
                OperStatus::Up => {
                    info!(target: "switchyard::session", session = %self.name(), port = %port.name, "port up");
                    self.emit(SwitchEvent::PortUp {
                        session: self.clone(),
                        port,
                    });
                }
                OperStatus::Down => {
                    info!(target: "switchyard::session", session = %self.name(), port = %port.name, "port down");
                    self.emit(SwitchEvent::PortDown {
                        session: self.clone(),
                        port,
                    });
                }
                OperStatus::Unknown => {}
            }
        }
        Ok(())
    }

    pub(super) fn spawn_ready_hook(&self, attempt: &Attempt) {
        if let Some(hook) = self.inner.config.ready_hook() {
            attempt.supervisor.spawn("ready", false, hook(self.clone()));
        }
    }

    async fn teardown(&self, attempt: &mut Attempt) {
        self.set_phase(SessionPhase::Teardown);
        let was_up = attempt.client.is_some();
        if let Some(client) = attempt.client.take() {
            client.close().await;
        }
        attempt.supervisor.shutdown().await;
        attempt.arbitrator.reset();
        {
            let mut state = self.inner.state.write();
            state.channel = None;
            state.supervisor = None;
        }
        if was_up {
            self.emit(SwitchEvent::ChannelDown {
                session: self.clone(),
            });
        }
    }
}

fn tolerate(session: &SwitchSession, err: TransportError, what: &str) -> Result<(), SessionError> {
    if err.is_unavailable() {
        return Err(ClientError::from_transport(err, None).into());
    }
    warn!(target: "switchyard::session", session = %session.name(), error = %err, "{what} unavailable");
    Ok(())
}
