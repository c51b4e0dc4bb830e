use switch_transport::StreamResponse;
use tracing::{debug, error, info, trace};

use super::run::{Attempt, Break};
use super::state::SessionError;
use super::SwitchSession;
use crate::arbitrator::RoleTransition;
use crate::client::ClientSession;
use crate::events::SwitchEvent;
use crate::metrics;

impl SwitchSession {
    /// Single reader for the stream: classify every inbound message in
    /// arrival order until the connection breaks or a job fails.
    pub(super) async fn dispatch(
        &self,
        attempt: &mut Attempt,
        client: &ClientSession,
    ) -> Result<Break, SessionError> {
        loop {
            let received = tokio::select! {
                failure = attempt.supervisor.failed() => {
                    if let Some(err) = attempt.supervisor.escalation() {
                        return Err(SessionError::FailFast(err));
                    }
                    return Err(SessionError::JobFailed {
                        task: failure.task,
                        message: failure.message,
                    });
                }
                received = client.receive() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(err) if err.is_election_id_used() => {
                    info!(
                        target: "switchyard::session",
                        session = %self.name(),
                        election_id = %attempt.arbitrator.election_id(),
                        "election id claimed by another connection; re-arbitrating"
                    );
                    let was_primary = attempt.arbitrator.is_primary();
                    attempt.arbitrator.handshake(client, true).await?;
                    let transition = match (was_primary, attempt.arbitrator.is_primary()) {
                        (false, true) => RoleTransition::BecamePrimary,
                        (true, false) => RoleTransition::BecameBackup,
                        _ => RoleTransition::Unchanged,
                    };
                    self.change_role(attempt, client, transition).await?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match message {
                StreamResponse::Arbitration(update) => {
                    let transition = attempt.arbitrator.update(client, &update).await?;
                    self.change_role(attempt, client, transition).await?;
                }
                StreamResponse::Packet(packet) => {
                    let delivered = self.inner.queues.dispatch_packet(packet);
                    trace!(target: "switchyard::session", session = %self.name(), delivered, "packet in");
                }
                StreamResponse::Digest(digest) => {
                    self.inner.queues.dispatch_digest(digest);
                }
                StreamResponse::IdleTimeout(notification) => {
                    self.inner.queues.dispatch_idle_timeout(notification);
                }
                StreamResponse::Error(report) => {
                    error!(
                        target: "switchyard::session",
                        session = %self.name(),
                        status = %report.status,
                        context = ?report.context,
                        "stream error from switch"
                    );
                    self.emit(SwitchEvent::StreamError {
                        session: self.clone(),
                        report,
                    });
                    return Ok(Break::StreamError);
                }
            }
        }
    }

    /// Restart role-specific work: foreground jobs stop, the pipeline is
    /// re-checked for the new role and the ready hook runs again.
    async fn change_role(
        &self,
        attempt: &mut Attempt,
        client: &ClientSession,
        transition: RoleTransition,
    ) -> Result<(), SessionError> {
        let (event, role) = match transition {
            RoleTransition::Unchanged => return Ok(()),
            RoleTransition::BecamePrimary => (
                SwitchEvent::BecomePrimary {
                    session: self.clone(),
                },
                "primary",
            ),
            RoleTransition::BecameBackup => (
                SwitchEvent::BecomeBackup {
                    session: self.clone(),
                },
                "backup",
            ),
        };
        info!(
            target: "switchyard::session",
            session = %self.name(),
            role,
            election_id = %attempt.arbitrator.election_id(),
            primary_id = %attempt.arbitrator.primary_id(),
            "role changed"
        );
        metrics::ROLE_TRANSITIONS
            .with_label_values(&[self.name(), role])
            .inc();

        attempt.supervisor.cancel_foreground();
        tokio::time::sleep(self.inner.settings.role_settle).await;
        self.sync_pipeline(attempt, client).await?;
        self.emit(event);
        self.spawn_ready_hook(attempt);
        debug!(target: "switchyard::session", session = %self.name(), tasks = ?attempt.supervisor.task_names(), "role-specific tasks restarted");
        Ok(())
    }
}
